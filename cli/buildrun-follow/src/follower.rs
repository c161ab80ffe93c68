//! Follows the pods of one BuildRun on top of a [`PodWatcher`].

use crate::config::FollowConfig;
use crate::error::FollowError;
use k8s_openapi::api::core::v1::Pod;
use pod_reactor::{
    PodClientTrait, PodSnapshot, PodWatcher, TerminationReason, TimeoutCause, WatchContext,
    WatchSelector, WatcherHandle,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Label Shipwright puts on every pod it creates for a BuildRun.
pub const BUILDRUN_LABEL: &str = "buildrun.shipwright.io/name";

/// Pod lifecycle phase as reported in `status.phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    /// Accepted but not all containers are running yet; also used when no phase is set
    Pending,
    /// Bound to a node with at least one container running
    Running,
    /// All containers exited successfully
    Succeeded,
    /// All containers exited and at least one failed
    Failed,
    /// A phase this tool does not know
    Unknown,
}

impl PodPhase {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(phase)
    }
}

/// Reads the pod's phase; a pod without status is Pending.
pub fn pod_phase(pod: &Pod) -> PodPhase {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Pending") | None => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        Some(_) => PodPhase::Unknown,
    }
}

/// Describes why a pod failed.
///
/// Prefers the terminated containers (init containers first, as they run
/// first), then the pod-level reason and message.
pub fn failure_reason(pod: &Pod) -> String {
    let Some(status) = pod.status.as_ref() else {
        return "unknown reason".to_string();
    };

    let containers = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    for container in containers {
        let Some(terminated) = container.state.as_ref().and_then(|s| s.terminated.as_ref()) else {
            continue;
        };
        if terminated.exit_code == 0 {
            continue;
        }
        let mut reason = format!(
            "container {} exited with code {}",
            container.name, terminated.exit_code
        );
        if let Some(r) = terminated.reason.as_deref() {
            reason.push_str(&format!(" ({r})"));
        }
        if let Some(message) = terminated.message.as_deref().filter(|m| !m.is_empty()) {
            reason.push_str(&format!(": {}", message.trim()));
        }
        return reason;
    }

    match (status.reason.as_deref(), status.message.as_deref()) {
        (Some(reason), Some(message)) => format!("{reason}: {message}"),
        (Some(reason), None) => reason.to_string(),
        (None, Some(message)) => message.to_string(),
        (None, None) => "unknown reason".to_string(),
    }
}

/// How following a BuildRun ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowOutcome {
    /// The build pod succeeded
    Succeeded {
        /// Pod name
        pod: String,
    },
    /// The build pod failed
    Failed {
        /// Pod name
        pod: String,
        /// See [`failure_reason`]
        reason: String,
    },
    /// The build pod was deleted before it finished
    PodDeleted {
        /// Pod name
        pod: String,
    },
    /// The follow timeout or context deadline passed; carries the cause
    TimedOut(String),
    /// Cancelled from outside, e.g. by Ctrl-C
    Interrupted,
}

impl FollowOutcome {
    /// Maps failed, deleted and timed out runs to errors.
    pub fn into_result(self, build_run: &str) -> Result<(), FollowError> {
        match self {
            Self::Succeeded { .. } | Self::Interrupted => Ok(()),
            Self::Failed { pod, reason } => Err(FollowError::BuildRunFailed {
                build_run: build_run.to_string(),
                pod,
                reason,
            }),
            Self::PodDeleted { pod } => Err(FollowError::PodDeleted {
                build_run: build_run.to_string(),
                pod,
            }),
            Self::TimedOut(message) => Err(FollowError::TimedOut(message)),
        }
    }
}

#[derive(Debug, Default)]
struct FollowState {
    phases: HashMap<String, PodPhase>,
    outcome: Option<FollowOutcome>,
}

/// Tracks the pods of one BuildRun; clones share state.
#[derive(Debug, Clone)]
pub struct Follower {
    build_run: String,
    state: Arc<Mutex<FollowState>>,
}

impl Follower {
    /// Creates a follower for the BuildRun named `build_run`.
    pub fn new(build_run: &str) -> Self {
        Self {
            build_run: build_run.to_string(),
            state: Arc::new(Mutex::new(FollowState::default())),
        }
    }

    /// Label selector matching this BuildRun's pods.
    pub fn selector(&self) -> WatchSelector {
        WatchSelector::default().labels(&format!("{BUILDRUN_LABEL}={}", self.build_run))
    }

    /// Whether the pod carries this BuildRun's label.
    pub fn belongs(&self, pod: &Pod) -> bool {
        pod.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(BUILDRUN_LABEL))
            .is_some_and(|name| *name == self.build_run)
    }

    /// The first terminal outcome observed, if any.
    pub fn outcome(&self) -> Option<FollowOutcome> {
        self.state().outcome.clone()
    }

    fn state(&self) -> MutexGuard<'_, FollowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the pod's phase. Returns true once the pod is terminal.
    fn observe(&self, pod: &Pod) -> anyhow::Result<bool> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("pod without a name"))?;
        let phase = pod_phase(pod);

        let mut state = self.state();
        if state.phases.insert(name.clone(), phase) != Some(phase) {
            info!("Pod {} of BuildRun {} is {}", name, self.build_run, phase);
        }
        match phase {
            PodPhase::Succeeded => {
                state.outcome.get_or_insert(FollowOutcome::Succeeded { pod: name });
            }
            PodPhase::Failed => {
                let reason = failure_reason(pod);
                state
                    .outcome
                    .get_or_insert(FollowOutcome::Failed { pod: name, reason });
            }
            _ => {}
        }
        Ok(phase.is_terminal())
    }

    fn on_pod_event(&self, pod: &Pod, handle: &WatcherHandle) -> anyhow::Result<()> {
        if self.observe(pod)? {
            handle.stop();
        }
        Ok(())
    }

    fn on_pod_deleted(&self, pod: &Pod, handle: &WatcherHandle) -> anyhow::Result<()> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("pod without a name"))?;
        warn!("Pod {} of BuildRun {} was deleted", name, self.build_run);
        self.state()
            .outcome
            .get_or_insert(FollowOutcome::PodDeleted { pod: name });
        handle.stop();
        Ok(())
    }

    fn on_no_events_yet(&self, snapshot: &PodSnapshot, handle: &WatcherHandle) {
        let mut terminal = false;
        for pod in snapshot.items.iter().filter(|pod| self.belongs(pod)) {
            match self.observe(pod) {
                Ok(done) => terminal |= done,
                Err(e) => warn!("Ignoring listed pod: {}", e),
            }
        }
        if terminal {
            handle.stop();
        } else if snapshot.items.is_empty() {
            info!("Waiting for BuildRun {} to start a pod", self.build_run);
        }
    }

    /// Registers this follower's callbacks on `watcher`.
    ///
    /// A timeout caused by cancelling `ctx` is an interrupt and is logged at info.
    pub fn attach<C: PodClientTrait>(&self, watcher: PodWatcher<C>, ctx: &WatchContext) -> PodWatcher<C> {
        let handle = watcher.handle();

        let skip = self.clone();
        let added = (self.clone(), handle.clone());
        let modified = (self.clone(), handle.clone());
        let deleted = (self.clone(), handle.clone());
        let quiet = (self.clone(), handle);
        let interrupt = ctx.clone();

        watcher
            .with_skip_pod_fn(move |pod| {
                let other = !skip.belongs(pod);
                if other {
                    debug!("Skipping pod {:?}", pod.metadata.name);
                }
                other
            })
            .with_on_pod_added_fn(move |pod| added.0.on_pod_event(pod, &added.1))
            .with_on_pod_modified_fn(move |pod| modified.0.on_pod_event(pod, &modified.1))
            .with_on_pod_deleted_fn(move |pod| deleted.0.on_pod_deleted(pod, &deleted.1))
            .with_timeout_fn(move |message| {
                if interrupt.is_cancelled() {
                    info!("{}", message);
                } else {
                    warn!("{}", message);
                }
            })
            .with_no_pod_events_yet_fn(move |snapshot| quiet.0.on_no_events_yet(snapshot, &quiet.1))
    }
}

/// Follows the BuildRun named in `config` until its pod finishes.
pub async fn follow<C: PodClientTrait>(
    ctx: WatchContext,
    client: C,
    config: &FollowConfig,
) -> Result<FollowOutcome, FollowError> {
    let follower = Follower::new(&config.build_run);
    let watcher = PodWatcher::new(ctx.clone(), config.timeout, client, &config.namespace)?
        .with_handler_error_policy(config.handler_error_policy);
    let outcome = follower.attach(watcher, &ctx).start(follower.selector()).await?;
    debug!(
        "Watch ended at resource version {} after {} events",
        outcome.resource_version, outcome.events
    );

    Ok(follower.outcome().unwrap_or(match outcome.reason {
        TerminationReason::Stopped | TerminationReason::TimedOut(TimeoutCause::ContextCancelled) => {
            FollowOutcome::Interrupted
        }
        TerminationReason::TimedOut(cause) => FollowOutcome::TimedOut(cause.to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };
    use pod_reactor::{HandlerErrorPolicy, MockPodClient, test_pod};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn config(timeout: Option<Duration>) -> FollowConfig {
        FollowConfig {
            build_run: "sample-run".to_string(),
            namespace: "builds".to_string(),
            timeout,
            handler_error_policy: HandlerErrorPolicy::LogAndContinue,
        }
    }

    fn build_pod(build_run: &str, name: &str, phase: &str) -> Pod {
        let mut pod = test_pod("builds", name);
        pod.metadata.labels = Some(BTreeMap::from([(
            BUILDRUN_LABEL.to_string(),
            build_run.to_string(),
        )]));
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        pod
    }

    fn failed_pod(name: &str) -> Pod {
        let mut pod = build_pod("sample-run", name, "Failed");
        if let Some(status) = pod.status.as_mut() {
            status.container_statuses = Some(vec![ContainerStatus {
                name: "step-build".to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 1,
                        reason: Some("Error".to_string()),
                        message: Some("compile failed\n".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }
        pod
    }

    fn spawn_follow(
        ctx: WatchContext,
        client: &MockPodClient,
    ) -> tokio::task::JoinHandle<Result<FollowOutcome, FollowError>> {
        let client = client.clone();
        tokio::spawn(async move { follow(ctx, client, &config(None)).await })
    }

    async fn wait_for_watch(client: &MockPodClient) {
        while client.active_watches() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_pod_phase() {
        assert_eq!(pod_phase(&test_pod("builds", "p")), PodPhase::Pending);
        assert_eq!(pod_phase(&build_pod("r", "p", "Running")), PodPhase::Running);
        assert_eq!(pod_phase(&build_pod("r", "p", "Succeeded")), PodPhase::Succeeded);
        assert_eq!(pod_phase(&build_pod("r", "p", "Evicted")), PodPhase::Unknown);
    }

    #[test]
    fn test_failure_reason() {
        assert_eq!(
            failure_reason(&failed_pod("p")),
            "container step-build exited with code 1 (Error): compile failed"
        );

        let mut evicted = build_pod("r", "p", "Failed");
        if let Some(status) = evicted.status.as_mut() {
            status.reason = Some("Evicted".to_string());
            status.message = Some("node was low on memory".to_string());
        }
        assert_eq!(failure_reason(&evicted), "Evicted: node was low on memory");
        assert_eq!(failure_reason(&test_pod("builds", "p")), "unknown reason");
    }

    #[test]
    fn test_belongs() {
        let follower = Follower::new("sample-run");
        assert!(follower.belongs(&build_pod("sample-run", "p", "Running")));
        assert!(!follower.belongs(&build_pod("other-run", "p", "Running")));
        assert!(!follower.belongs(&test_pod("builds", "p")));
        assert_eq!(
            follower.selector().label_selector.as_deref(),
            Some("buildrun.shipwright.io/name=sample-run")
        );
    }

    #[test]
    fn test_outcome_into_result() {
        assert!(FollowOutcome::Succeeded { pod: "p".into() }.into_result("r").is_ok());
        assert!(FollowOutcome::Interrupted.into_result("r").is_ok());
        assert!(matches!(
            FollowOutcome::PodDeleted { pod: "p".into() }.into_result("r"),
            Err(FollowError::PodDeleted { .. })
        ));
        assert!(matches!(
            FollowOutcome::TimedOut("late".into()).into_result("r"),
            Err(FollowError::TimedOut(_))
        ));
    }

    #[tokio::test]
    async fn test_follow_pod_already_succeeded() {
        let client = MockPodClient::new();
        client.set_list_reactor(|_, _| vec![build_pod("sample-run", "sample-run-pod", "Succeeded")]);

        let outcome = follow(WatchContext::background(), client, &config(None))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FollowOutcome::Succeeded {
                pod: "sample-run-pod".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_follow_pod_fails() {
        let client = MockPodClient::new();
        let task = spawn_follow(WatchContext::background(), &client);
        wait_for_watch(&client).await;

        client
            .create_pod(build_pod("sample-run", "sample-run-pod", "Pending"))
            .unwrap();
        client
            .update_pod(build_pod("sample-run", "sample-run-pod", "Running"))
            .unwrap();
        client.update_pod(failed_pod("sample-run-pod")).unwrap();

        let outcome = task.await.unwrap().unwrap();
        let FollowOutcome::Failed { pod, reason } = outcome else {
            panic!("expected a failed outcome, got {outcome:?}");
        };
        assert_eq!(pod, "sample-run-pod");
        assert!(reason.contains("step-build"));
    }

    #[tokio::test]
    async fn test_follow_pod_deleted() {
        let client = MockPodClient::new();
        client
            .create_pod(build_pod("sample-run", "sample-run-pod", "Running"))
            .unwrap();
        let task = spawn_follow(WatchContext::background(), &client);
        wait_for_watch(&client).await;

        client.delete_pod("builds", "sample-run-pod").unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            FollowOutcome::PodDeleted {
                pod: "sample-run-pod".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_follow_ignores_other_build_runs() {
        let client = MockPodClient::new();
        let task = spawn_follow(WatchContext::background(), &client);
        wait_for_watch(&client).await;

        client
            .create_pod(build_pod("other-run", "other-run-pod", "Succeeded"))
            .unwrap();
        client
            .create_pod(build_pod("sample-run", "sample-run-pod", "Succeeded"))
            .unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            FollowOutcome::Succeeded {
                pod: "sample-run-pod".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_times_out() {
        let client = MockPodClient::new();
        let outcome = follow(
            WatchContext::background(),
            client,
            &config(Some(Duration::from_secs(30))),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, FollowOutcome::TimedOut(message) if message.contains("30s")));
    }

    #[tokio::test]
    async fn test_follow_interrupted() {
        let client = MockPodClient::new();
        let ctx = WatchContext::background();
        let task = spawn_follow(ctx.clone(), &client);
        wait_for_watch(&client).await;

        ctx.cancel();
        assert_eq!(task.await.unwrap().unwrap(), FollowOutcome::Interrupted);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    async fn follow_with_logs(ctx: WatchContext, config: FollowConfig) -> (FollowOutcome, String) {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let outcome = follow(ctx, MockPodClient::new(), &config).await.unwrap();
        let text = String::from_utf8_lossy(&logs.0.lock().unwrap()).into_owned();
        (outcome, text)
    }

    #[tokio::test]
    async fn test_interrupt_is_not_logged_as_warning() {
        let ctx = WatchContext::background();
        ctx.cancel();

        let (outcome, logs) = follow_with_logs(ctx, config(None)).await;

        assert_eq!(outcome, FollowOutcome::Interrupted);
        assert!(logs.contains("watch context cancelled"), "{logs}");
        assert!(!logs.contains("WARN"), "{logs}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_logged_as_warning() {
        let (outcome, logs) =
            follow_with_logs(WatchContext::background(), config(Some(Duration::from_secs(30)))).await;

        assert!(matches!(outcome, FollowOutcome::TimedOut(_)));
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("watch timeout of 30s elapsed"), "{logs}");
    }

    #[tokio::test]
    async fn test_follow_invalid_namespace() {
        let mut config = config(None);
        config.namespace = "Not_A_Namespace".to_string();
        let result = follow(WatchContext::background(), MockPodClient::new(), &config).await;
        assert!(matches!(result, Err(FollowError::Reactor(_))));
    }
}
