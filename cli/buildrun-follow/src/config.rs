//! Configuration loaded from environment variables.

use crate::error::FollowError;
use pod_reactor::HandlerErrorPolicy;
use std::env;
use std::time::Duration;

/// Settings for following one BuildRun.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowConfig {
    /// BuildRun whose pods are followed (`BUILDRUN_NAME`)
    pub build_run: String,
    /// Namespace of the BuildRun (`WATCH_NAMESPACE`, default `default`)
    pub namespace: String,
    /// Follow timeout (`FOLLOW_TIMEOUT_SECONDS`, unset or `0` for none)
    pub timeout: Option<Duration>,
    /// Handler error policy (`HANDLER_ERROR_POLICY`, `continue` or `abort`)
    pub handler_error_policy: HandlerErrorPolicy,
}

impl FollowConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, FollowError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FollowError> {
        let build_run = lookup("BUILDRUN_NAME")
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                FollowError::InvalidConfig("BUILDRUN_NAME environment variable is required".to_string())
            })?;
        let namespace = lookup("WATCH_NAMESPACE").unwrap_or_else(|| "default".to_string());

        let timeout = match lookup("FOLLOW_TIMEOUT_SECONDS") {
            None => None,
            Some(raw) => {
                let seconds: u64 = raw.trim().parse().map_err(|e| {
                    FollowError::InvalidConfig(format!("FOLLOW_TIMEOUT_SECONDS={raw:?}: {e}"))
                })?;
                (seconds > 0).then(|| Duration::from_secs(seconds))
            }
        };

        let handler_error_policy = match lookup("HANDLER_ERROR_POLICY") {
            None => HandlerErrorPolicy::default(),
            Some(raw) => raw.parse()?,
        };

        Ok(Self {
            build_run: build_run.trim().to_string(),
            namespace,
            timeout,
            handler_error_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<FollowConfig, FollowError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        FollowConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("BUILDRUN_NAME", "sample-run")]).unwrap();
        assert_eq!(config.build_run, "sample-run");
        assert_eq!(config.namespace, "default");
        assert_eq!(config.timeout, None);
        assert_eq!(config.handler_error_policy, HandlerErrorPolicy::LogAndContinue);
    }

    #[test]
    fn test_all_variables() {
        let config = load(&[
            ("BUILDRUN_NAME", "sample-run"),
            ("WATCH_NAMESPACE", "builds"),
            ("FOLLOW_TIMEOUT_SECONDS", "90"),
            ("HANDLER_ERROR_POLICY", "abort"),
        ])
        .unwrap();
        assert_eq!(config.namespace, "builds");
        assert_eq!(config.timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.handler_error_policy, HandlerErrorPolicy::Abort);
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let config = load(&[("BUILDRUN_NAME", "r"), ("FOLLOW_TIMEOUT_SECONDS", "0")]).unwrap();
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(load(&[]), Err(FollowError::InvalidConfig(_))));
        assert!(matches!(load(&[("BUILDRUN_NAME", "  ")]), Err(FollowError::InvalidConfig(_))));
        assert!(matches!(
            load(&[("BUILDRUN_NAME", "r"), ("FOLLOW_TIMEOUT_SECONDS", "soon")]),
            Err(FollowError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("BUILDRUN_NAME", "r"), ("HANDLER_ERROR_POLICY", "retry")]),
            Err(FollowError::Reactor(_))
        ));
    }
}
