//! Pod reactor errors

use crate::pod_watcher::EventKind;
use thiserror::Error;

/// Errors that can end a pod watch session
///
/// Timeouts and stop requests are not errors; they are reported through
/// [`crate::WatchOutcome`].
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Invalid watcher configuration (e.g. empty namespace)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubernetes API error while listing or opening the watch
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// API error reported by a non-kube client implementation
    #[error("API error: {0}")]
    Api(String),

    /// The watch delivered an error event
    #[error("Watch error: {0}")]
    Watch(String),

    /// The watch stream failed after the event loop started
    #[error("Pod watch failed at resource version {resource_version:?}: {message}")]
    StreamFailed {
        /// Last resource version observed before the failure
        resource_version: String,
        /// Error reported by the stream
        message: String,
    },

    /// The watch stream ended while the session was still running
    #[error("Pod watch closed unexpectedly at resource version {resource_version:?}")]
    StreamClosed {
        /// Last resource version observed before the stream ended
        resource_version: String,
    },

    /// A pod event handler failed and the session aborts on handler errors
    #[error("{kind} handler failed for pod {pod}: {message}")]
    Handler {
        /// Event kind whose handler failed
        kind: EventKind,
        /// Name of the pod being handled
        pod: String,
        /// Rendered handler error chain
        message: String,
    },
}
