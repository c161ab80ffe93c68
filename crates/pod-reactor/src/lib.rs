//! Pod Reactor
//!
//! Watches the pods that back a BuildRun and reacts to their lifecycle.
//!
//! A [`PodWatcher`] lists the matching pods, opens a watch from the listed
//! resource version and dispatches Added, Modified and Deleted events to the
//! callbacks registered on it. Two independent timeouts bound the session: the
//! ambient [`WatchContext`] (cancellation plus optional deadline) and a duration
//! measured from watcher construction. When no event is available on the first
//! loop iteration the listed snapshot is reported once, so callers can spot pods
//! that already finished before the watch was opened.
//!
//! # Example
//!
//! ```no_run
//! use pod_reactor::{KubePodClient, PodWatcher, WatchContext, WatchSelector};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubePodClient::try_default().await?;
//! let watcher = PodWatcher::new(
//!     WatchContext::background(),
//!     Some(Duration::from_secs(600)),
//!     client,
//!     "default",
//! )?
//! .with_on_pod_modified_fn(|pod| {
//!     println!("pod modified: {:?}", pod.metadata.name);
//!     Ok(())
//! })
//! .with_timeout_fn(|msg| eprintln!("{msg}"));
//!
//! let handle = watcher.handle();
//! let task = tokio::spawn(watcher.start(WatchSelector::default().labels("app=build")));
//! handle.stop();
//! let outcome = task.await??;
//! println!("stopped at resource version {}", outcome.resource_version);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod context;
pub mod error;
pub mod pod_watcher;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;


pub use client::{KubePodClient, PodClientTrait, PodEvent, PodEventStream, PodSnapshot, WatchSelector};
pub use context::WatchContext;
pub use error::ReactorError;
pub use pod_watcher::{
    EventKind, HandlerErrorPolicy, PodWatcher, TerminationReason, TimeoutCause, WatchOutcome,
    WatcherHandle,
};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockPodClient, test_pod};
