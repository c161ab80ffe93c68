//! Pod watcher.
//!
//! Lists the pods matching a selector, watches them from the listed resource
//! version and dispatches lifecycle events to the registered callbacks.
//!
//! The session ends when:
//! - [`WatcherHandle::stop`] is called
//! - the ambient [`WatchContext`] is cancelled or its deadline passes
//! - the configured timeout, measured from [`PodWatcher::new`], elapses
//! - the watch stream fails or closes
//!
//! Only the last case is an error. On the first loop iteration, if the watch
//! has no event ready, the listed snapshot is handed to the no-events-yet
//! callback exactly once: pods that completed before the watch was opened will
//! never produce an event, so this is the caller's only chance to see them.

use crate::client::{PodClientTrait, PodEvent, PodSnapshot, WatchSelector};
use crate::context::WatchContext;
use crate::error::ReactorError;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decides whether an event for the given pod is dropped before dispatch.
pub type SkipPodFn = Box<dyn FnMut(&Pod) -> bool + Send>;
/// Handles an Added, Modified or Deleted pod.
pub type PodEventFn = Box<dyn FnMut(&Pod) -> anyhow::Result<()> + Send>;
/// Receives a message describing why the session timed out.
pub type TimeoutFn = Box<dyn FnMut(&str) + Send>;
/// Receives the listed snapshot when no event was ready on the first iteration.
pub type NoPodEventsYetFn = Box<dyn FnMut(&PodSnapshot) + Send>;

/// Kind of a dispatched pod event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Pod was created
    Added,
    /// Pod was updated
    Modified,
    /// Pod was deleted
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => f.write_str("Added"),
            Self::Modified => f.write_str("Modified"),
            Self::Deleted => f.write_str("Deleted"),
        }
    }
}

/// What to do when an Added, Modified or Deleted handler returns an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerErrorPolicy {
    /// Log a warning and keep watching
    #[default]
    LogAndContinue,
    /// End the session with [`ReactorError::Handler`]
    Abort,
}

impl FromStr for HandlerErrorPolicy {
    type Err = ReactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" | "log-and-continue" => Ok(Self::LogAndContinue),
            "abort" => Ok(Self::Abort),
            other => Err(ReactorError::InvalidConfig(format!(
                "unknown handler error policy {other:?}, expected \"continue\" or \"abort\""
            ))),
        }
    }
}

/// Which timeout ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    /// The ambient context was cancelled
    ContextCancelled,
    /// The ambient context deadline passed
    ContextDeadline,
    /// The configured duration elapsed since the watcher was created
    Elapsed(Duration),
}

impl fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextCancelled => f.write_str("watch context cancelled"),
            Self::ContextDeadline => f.write_str("watch context deadline exceeded"),
            Self::Elapsed(timeout) => write!(f, "watch timeout of {timeout:?} elapsed"),
        }
    }
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// [`WatcherHandle::stop`] was called
    Stopped,
    /// A timeout fired
    TimedOut(TimeoutCause),
}

/// Result of a session that ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOutcome {
    /// Last resource version observed, from the list or the latest event
    pub resource_version: String,
    /// Why the session ended
    pub reason: TerminationReason,
    /// Number of Added, Modified and Deleted events received, skipped ones included
    pub events: u64,
}

/// Cloneable handle to stop a running watcher and observe its completion.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    stop: CancellationToken,
    done: CancellationToken,
}

impl WatcherHandle {
    /// Requests the watcher to stop. Idempotent and non-blocking.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Waits until the watcher has returned; no callback fires afterwards.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    /// Whether the watcher has returned.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }
}

#[derive(Default)]
struct Callbacks {
    skip: Option<SkipPodFn>,
    on_added: Option<PodEventFn>,
    on_modified: Option<PodEventFn>,
    on_deleted: Option<PodEventFn>,
    on_timeout: Option<TimeoutFn>,
    on_no_events_yet: Option<NoPodEventsYetFn>,
}

impl Callbacks {
    fn handler_for(&mut self, kind: EventKind) -> Option<&mut PodEventFn> {
        match kind {
            EventKind::Added => self.on_added.as_mut(),
            EventKind::Modified => self.on_modified.as_mut(),
            EventKind::Deleted => self.on_deleted.as_mut(),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("skip", &self.skip.is_some())
            .field("on_added", &self.on_added.is_some())
            .field("on_modified", &self.on_modified.is_some())
            .field("on_deleted", &self.on_deleted.is_some())
            .field("on_timeout", &self.on_timeout.is_some())
            .field("on_no_events_yet", &self.on_no_events_yet.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline {
    at: Instant,
    cause: TimeoutCause,
}

/// Earliest of the ambient deadline and `created_at + timeout`.
fn effective_deadline(
    ambient: Option<Instant>,
    created_at: Instant,
    timeout: Option<Duration>,
) -> Option<Deadline> {
    let ambient = ambient.map(|at| Deadline {
        at,
        cause: TimeoutCause::ContextDeadline,
    });
    let configured = timeout.and_then(|timeout| {
        created_at.checked_add(timeout).map(|at| Deadline {
            at,
            cause: TimeoutCause::Elapsed(timeout),
        })
    });
    match (ambient, configured) {
        (Some(ambient), Some(configured)) if configured.at < ambient.at => Some(configured),
        (Some(ambient), _) => Some(ambient),
        (None, configured) => configured,
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Watches the pods of one namespace and dispatches their lifecycle events.
pub struct PodWatcher<C> {
    ctx: WatchContext,
    timeout: Option<Duration>,
    created_at: Instant,
    client: C,
    namespace: String,
    callbacks: Callbacks,
    handler_error_policy: HandlerErrorPolicy,
    stop: CancellationToken,
    done: CancellationToken,
}

impl<C> fmt::Debug for PodWatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodWatcher")
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .field("deadline", &self.ctx.deadline())
            .field("callbacks", &self.callbacks)
            .field("handler_error_policy", &self.handler_error_policy)
            .finish_non_exhaustive()
    }
}

impl<C: PodClientTrait> PodWatcher<C> {
    /// Creates a watcher for the pods in `namespace`.
    ///
    /// `timeout` is measured from this call; `None` disables it. No request is
    /// sent until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::InvalidConfig`] when `namespace` is not a valid
    /// Kubernetes namespace name.
    pub fn new(
        ctx: WatchContext,
        timeout: Option<Duration>,
        client: C,
        namespace: &str,
    ) -> Result<Self, ReactorError> {
        validate_namespace(namespace)?;
        Ok(Self {
            ctx,
            timeout,
            created_at: Instant::now(),
            client,
            namespace: namespace.to_string(),
            callbacks: Callbacks::default(),
            handler_error_policy: HandlerErrorPolicy::default(),
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    /// Registers the skip predicate; a skipped event reaches no handler.
    #[must_use]
    pub fn with_skip_pod_fn(mut self, f: impl FnMut(&Pod) -> bool + Send + 'static) -> Self {
        self.callbacks.skip = Some(Box::new(f));
        self
    }

    /// Registers the handler for Added events.
    #[must_use]
    pub fn with_on_pod_added_fn(
        mut self,
        f: impl FnMut(&Pod) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.callbacks.on_added = Some(Box::new(f));
        self
    }

    /// Registers the handler for Modified events.
    #[must_use]
    pub fn with_on_pod_modified_fn(
        mut self,
        f: impl FnMut(&Pod) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.callbacks.on_modified = Some(Box::new(f));
        self
    }

    /// Registers the handler for Deleted events.
    #[must_use]
    pub fn with_on_pod_deleted_fn(
        mut self,
        f: impl FnMut(&Pod) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.callbacks.on_deleted = Some(Box::new(f));
        self
    }

    /// Registers the handler called when a timeout ends the session.
    #[must_use]
    pub fn with_timeout_fn(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.callbacks.on_timeout = Some(Box::new(f));
        self
    }

    /// Registers the handler for the listed snapshot when the watch has no
    /// event ready on the first loop iteration.
    #[must_use]
    pub fn with_no_pod_events_yet_fn(
        mut self,
        f: impl FnMut(&PodSnapshot) + Send + 'static,
    ) -> Self {
        self.callbacks.on_no_events_yet = Some(Box::new(f));
        self
    }

    /// Sets what happens when an event handler returns an error.
    #[must_use]
    pub fn with_handler_error_policy(mut self, policy: HandlerErrorPolicy) -> Self {
        self.handler_error_policy = policy;
        self
    }

    /// Returns a handle for stopping the watcher from another task.
    #[must_use]
    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            stop: self.stop.clone(),
            done: self.done.clone(),
        }
    }

    /// Runs the session until it is stopped, times out or the watch fails.
    ///
    /// # Errors
    ///
    /// - the initial list or the watch request fails
    /// - the watch stream reports an error or closes ([`ReactorError::StreamFailed`],
    ///   [`ReactorError::StreamClosed`])
    /// - a handler fails under [`HandlerErrorPolicy::Abort`]
    pub async fn start(self, selector: WatchSelector) -> Result<WatchOutcome, ReactorError> {
        let Self {
            ctx,
            timeout,
            created_at,
            client,
            namespace,
            callbacks,
            handler_error_policy,
            stop,
            done,
        } = self;
        // Fires the done signal on every return path, setup failures included.
        let _done = done.drop_guard();

        let deadline = effective_deadline(ctx.deadline(), created_at, timeout);
        let expired = wait_for_deadline(deadline.map(|d| d.at));
        tokio::pin!(expired);

        let ambient = ctx.token().clone();
        let mut dispatcher = Dispatcher {
            namespace,
            callbacks,
            policy: handler_error_policy,
        };

        let listed = interruptible(
            client.list_pods(&dispatcher.namespace, &selector),
            &stop,
            &ambient,
            expired.as_mut(),
            deadline,
        )
        .await?;
        let snapshot = match listed {
            Ok(snapshot) => snapshot,
            Err(reason) => return Ok(dispatcher.finish(reason, String::new(), 0)),
        };
        let mut resource_version = snapshot.resource_version.clone();
        debug!(
            "Listed {} pods in {} at resource version {}",
            snapshot.items.len(),
            dispatcher.namespace,
            resource_version
        );

        let opened = interruptible(
            client.watch_pods(&dispatcher.namespace, &selector, &resource_version),
            &stop,
            &ambient,
            expired.as_mut(),
            deadline,
        )
        .await?;
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(reason) => return Ok(dispatcher.finish(reason, resource_version, 0)),
        };
        info!(
            "Watching pods in {} from resource version {}",
            dispatcher.namespace, resource_version
        );

        // Present until quiescence is decided, i.e. only during the first iteration.
        let mut pending_snapshot = Some(snapshot);
        let mut events = 0u64;

        loop {
            tokio::select! {
                biased;

                () = stop.cancelled() => {
                    return Ok(dispatcher.finish(TerminationReason::Stopped, resource_version, events));
                }
                () = ambient.cancelled() => {
                    let reason = TerminationReason::TimedOut(TimeoutCause::ContextCancelled);
                    return Ok(dispatcher.finish(reason, resource_version, events));
                }
                () = &mut expired => {
                    let reason = TerminationReason::TimedOut(expiry_cause(deadline));
                    return Ok(dispatcher.finish(reason, resource_version, events));
                }
                next = stream.next() => {
                    pending_snapshot = None;
                    match next {
                        Some(Ok(event)) => {
                            if dispatcher.dispatch(event, &mut resource_version)? {
                                events += 1;
                            }
                        }
                        Some(Err(err)) => {
                            warn!("Pod watch in {} failed: {}", dispatcher.namespace, err);
                            return Err(ReactorError::StreamFailed {
                                resource_version,
                                message: err.to_string(),
                            });
                        }
                        None => {
                            warn!("Pod watch in {} closed by the server", dispatcher.namespace);
                            return Err(ReactorError::StreamClosed { resource_version });
                        }
                    }
                }
                () = std::future::ready(()), if pending_snapshot.is_some() => {
                    if let Some(snapshot) = pending_snapshot.take() {
                        dispatcher.report_no_events_yet(&snapshot);
                    }
                }
            }
        }
    }
}

fn expiry_cause(deadline: Option<Deadline>) -> TimeoutCause {
    deadline.map_or(TimeoutCause::ContextDeadline, |d| d.cause)
}

/// Runs a setup request unless stop, ambient cancellation or the deadline
/// comes first, in which case the request is dropped and the reason returned.
async fn interruptible<T>(
    request: impl Future<Output = Result<T, ReactorError>>,
    stop: &CancellationToken,
    ambient: &CancellationToken,
    expired: Pin<&mut impl Future<Output = ()>>,
    deadline: Option<Deadline>,
) -> Result<Result<T, TerminationReason>, ReactorError> {
    tokio::select! {
        biased;

        () = stop.cancelled() => Ok(Err(TerminationReason::Stopped)),
        () = ambient.cancelled() => Ok(Err(TerminationReason::TimedOut(TimeoutCause::ContextCancelled))),
        () = expired => Ok(Err(TerminationReason::TimedOut(expiry_cause(deadline)))),
        result = request => result.map(Ok),
    }
}

/// Callback state owned by the event loop once the session starts.
struct Dispatcher {
    namespace: String,
    callbacks: Callbacks,
    policy: HandlerErrorPolicy,
}

impl Dispatcher {
    /// Dispatches one event; returns whether it was a pod lifecycle event.
    fn dispatch(&mut self, event: PodEvent, resource_version: &mut String) -> Result<bool, ReactorError> {
        let (kind, pod) = match event {
            PodEvent::Added(pod) => (EventKind::Added, pod),
            PodEvent::Modified(pod) => (EventKind::Modified, pod),
            PodEvent::Deleted(pod) => (EventKind::Deleted, pod),
            PodEvent::Bookmark(version) => {
                debug!("Bookmark at resource version {}", version);
                *resource_version = version;
                return Ok(false);
            }
        };

        if let Some(version) = pod.resource_version() {
            *resource_version = version;
        }
        let name = pod.name_any();

        if let Some(skip) = self.callbacks.skip.as_mut() {
            if skip(&pod) {
                debug!("Skipping {} event for pod {}", kind, name);
                return Ok(true);
            }
        }

        let Some(handler) = self.callbacks.handler_for(kind) else {
            return Ok(true);
        };
        if let Err(err) = handler(&pod) {
            match self.policy {
                HandlerErrorPolicy::LogAndContinue => {
                    warn!("{} handler failed for pod {}: {:#}", kind, name, err);
                }
                HandlerErrorPolicy::Abort => {
                    return Err(ReactorError::Handler {
                        kind,
                        pod: name,
                        message: format!("{err:#}"),
                    });
                }
            }
        }
        Ok(true)
    }

    fn report_no_events_yet(&mut self, snapshot: &PodSnapshot) {
        debug!(
            "No pod events yet in {}, reporting {} listed pods",
            self.namespace,
            snapshot.items.len()
        );
        if let Some(on_no_events_yet) = self.callbacks.on_no_events_yet.as_mut() {
            on_no_events_yet(snapshot);
        }
    }

    /// Builds the outcome of a session that ended without error, firing the
    /// timeout handler when a timeout ended it.
    fn finish(&mut self, reason: TerminationReason, resource_version: String, events: u64) -> WatchOutcome {
        match reason {
            TerminationReason::Stopped => info!("Pod watcher in {} stopped", self.namespace),
            TerminationReason::TimedOut(cause) => self.time_out(cause),
        }
        WatchOutcome {
            resource_version,
            reason,
            events,
        }
    }

    fn time_out(&mut self, cause: TimeoutCause) {
        let message = format!("pod watcher in namespace {} timed out: {}", self.namespace, cause);
        info!("{}", message);
        if let Some(on_timeout) = self.callbacks.on_timeout.as_mut() {
            on_timeout(&message);
        }
    }
}

/// Namespaces must be RFC 1123 labels.
fn validate_namespace(namespace: &str) -> Result<(), ReactorError> {
    if namespace.is_empty() {
        return Err(ReactorError::InvalidConfig("namespace must not be empty".to_string()));
    }
    if namespace.len() > 63 {
        return Err(ReactorError::InvalidConfig(format!(
            "namespace {namespace:?} is longer than 63 characters"
        )));
    }
    let valid_chars = namespace
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || namespace.starts_with('-') || namespace.ends_with('-') {
        return Err(ReactorError::InvalidConfig(format!(
            "namespace {namespace:?} is not a valid RFC 1123 label"
        )));
    }
    Ok(())
}
