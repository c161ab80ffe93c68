//! Follower error types.

use pod_reactor::ReactorError;
use thiserror::Error;

/// Errors that end `buildrun-follow` with a non-zero exit status.
#[derive(Debug, Error)]
pub enum FollowError {
    /// Pod watcher error
    #[error("Pod watcher error: {0}")]
    Reactor(#[from] ReactorError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A BuildRun pod finished in the Failed phase
    #[error("BuildRun {build_run} failed in pod {pod}: {reason}")]
    BuildRunFailed {
        /// BuildRun being followed
        build_run: String,
        /// Pod that failed
        pod: String,
        /// Failure reason collected from the pod status
        reason: String,
    },

    /// The BuildRun pod was deleted before it finished
    #[error("BuildRun {build_run} pod {pod} was deleted before it finished")]
    PodDeleted {
        /// BuildRun being followed
        build_run: String,
        /// Pod that was deleted
        pod: String,
    },

    /// The watch timed out before the BuildRun finished
    #[error("Timed out following BuildRun: {0}")]
    TimedOut(String),
}
