//! Mock pod client for unit testing
//!
//! This module provides an in-memory implementation of [`PodClientTrait`] that
//! behaves like a fake clientset: pods created, updated or deleted through it
//! bump a resource version and are broadcast to every open watch whose
//! namespace and label selector match. Watches only see changes made after they
//! were opened. An update that moves a pod into or out of a watch's label
//! selector reaches that watch as Added or Deleted, as the API server does.
//!
//! Field selectors are accepted but not evaluated.

use crate::client::{PodClientTrait, PodEvent, PodEventStream, PodSnapshot, WatchSelector};
use crate::error::ReactorError;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Overrides the result of `list_pods`, like a prepended fake-clientset reactor.
type ListReactor = Box<dyn Fn(&str, &WatchSelector) -> Vec<Pod> + Send + Sync>;

struct MockWatch {
    namespace: String,
    selector: WatchSelector,
    tx: UnboundedSender<Result<PodEvent, ReactorError>>,
}

#[derive(Default)]
struct MockState {
    pods: BTreeMap<(String, String), Pod>,
    resource_version: u64,
    watches: Vec<MockWatch>,
    list_reactor: Option<ListReactor>,
    list_failure: Option<String>,
    watch_failure: Option<String>,
    list_calls: usize,
    watch_resource_versions: Vec<String>,
}

/// Mock pod client for testing
///
/// Cloning shares the underlying store, so tests keep a clone to mutate pods
/// while the watcher owns another.
#[derive(Clone, Default)]
pub struct MockPodClient {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockPodClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MockPodClient")
            .field("pods", &state.pods.len())
            .field("resource_version", &state.resource_version)
            .field("watches", &state.watches.len())
            .finish_non_exhaustive()
    }
}

/// Builds a bare pod with the given namespace and name (for test setup).
#[must_use]
pub fn test_pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

impl MockPodClient {
    /// Create a new, empty mock client
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `list_pods` return the reactor's pods instead of the stored ones.
    ///
    /// Mimics pods that exist before the watch opens without producing events.
    pub fn set_list_reactor(
        &self,
        reactor: impl Fn(&str, &WatchSelector) -> Vec<Pod> + Send + Sync + 'static,
    ) {
        self.state().list_reactor = Some(Box::new(reactor));
    }

    /// Makes every subsequent `list_pods` call fail with `message`.
    pub fn fail_list(&self, message: impl Into<String>) {
        self.state().list_failure = Some(message.into());
    }

    /// Makes every subsequent `watch_pods` call fail with `message`.
    pub fn fail_watch_requests(&self, message: impl Into<String>) {
        self.state().watch_failure = Some(message.into());
    }

    /// Creates a pod and broadcasts an Added event.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Api`] when the pod has no namespace or name, or
    /// already exists.
    pub fn create_pod(&self, mut pod: Pod) -> Result<Pod, ReactorError> {
        let key = pod_key(&pod)?;
        let mut state = self.state();
        if state.pods.contains_key(&key) {
            return Err(ReactorError::Api(format!("pods {:?} already exists", key.1)));
        }
        pod.metadata.resource_version = Some(state.next_resource_version());
        state.pods.insert(key, pod.clone());
        state.broadcast(&pod, PodEvent::Added(pod.clone()), None);
        Ok(pod)
    }

    /// Replaces an existing pod and broadcasts a Modified event.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Api`] when the pod does not exist.
    pub fn update_pod(&self, mut pod: Pod) -> Result<Pod, ReactorError> {
        let key = pod_key(&pod)?;
        let mut state = self.state();
        let Some(previous) = state.pods.get(&key) else {
            return Err(ReactorError::Api(format!("pods {:?} not found", key.1)));
        };
        let previous_labels = previous.metadata.labels.clone().unwrap_or_default();
        pod.metadata.resource_version = Some(state.next_resource_version());
        state.pods.insert(key, pod.clone());
        state.broadcast(&pod, PodEvent::Modified(pod.clone()), Some(&previous_labels));
        Ok(pod)
    }

    /// Deletes a pod and broadcasts a Deleted event.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Api`] when the pod does not exist.
    pub fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ReactorError> {
        let mut state = self.state();
        let Some(mut pod) = state.pods.remove(&(namespace.to_string(), name.to_string())) else {
            return Err(ReactorError::Api(format!("pods {name:?} not found")));
        };
        pod.metadata.resource_version = Some(state.next_resource_version());
        state.broadcast(&pod, PodEvent::Deleted(pod.clone()), None);
        Ok(())
    }

    /// Sends a bookmark at the current resource version to every open watch.
    pub fn send_bookmark(&self) {
        let mut state = self.state();
        let version = state.resource_version.to_string();
        state
            .watches
            .retain(|watch| watch.tx.unbounded_send(Ok(PodEvent::Bookmark(version.clone()))).is_ok());
    }

    /// Delivers an error to every open watch.
    pub fn fail_watches(&self, message: &str) {
        let mut state = self.state();
        state.watches.retain(|watch| {
            watch
                .tx
                .unbounded_send(Err(ReactorError::Watch(message.to_string())))
                .is_ok()
        });
    }

    /// Ends every open watch stream.
    pub fn close_watches(&self) {
        self.state().watches.clear();
    }

    /// Number of watches whose receiver is still alive.
    #[must_use]
    pub fn active_watches(&self) -> usize {
        let mut state = self.state();
        state.watches.retain(|watch| !watch.tx.is_closed());
        state.watches.len()
    }

    /// Number of `list_pods` calls so far.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    /// Resource versions passed to `watch_pods`, in call order.
    #[must_use]
    pub fn watch_resource_versions(&self) -> Vec<String> {
        self.state().watch_resource_versions.clone()
    }
}

impl MockState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    /// Sends `event` to the matching watches. With `previous_labels`, a pod
    /// entering a watch's selector is sent as Added and one leaving it as Deleted.
    fn broadcast(
        &mut self,
        pod: &Pod,
        event: PodEvent,
        previous_labels: Option<&BTreeMap<String, String>>,
    ) {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let empty = BTreeMap::new();
        let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
        self.watches.retain(|watch| {
            if watch.namespace != namespace {
                return !watch.tx.is_closed();
            }
            let matches = selector_matches(&watch.selector, labels);
            let matched = previous_labels.map_or(matches, |previous| selector_matches(&watch.selector, previous));
            let event = match (matched, matches) {
                (true, true) => event.clone(),
                (false, true) => PodEvent::Added(pod.clone()),
                (true, false) => PodEvent::Deleted(pod.clone()),
                (false, false) => return !watch.tx.is_closed(),
            };
            watch.tx.unbounded_send(Ok(event)).is_ok()
        });
    }
}

fn pod_key(pod: &Pod) -> Result<(String, String), ReactorError> {
    match (&pod.metadata.namespace, &pod.metadata.name) {
        (Some(namespace), Some(name)) => Ok((namespace.clone(), name.clone())),
        _ => Err(ReactorError::Api("pod requires a namespace and a name".to_string())),
    }
}

/// Evaluates equality-based label selectors: `k=v`, `k==v`, `k!=v`, `k`, `!k`.
fn selector_matches(selector: &WatchSelector, labels: &BTreeMap<String, String>) -> bool {
    let Some(expr) = selector.label_selector.as_deref() else {
        return true;
    };
    expr.split(',')
        .map(str::trim)
        .filter(|requirement| !requirement.is_empty())
        .all(|requirement| {
            if let Some((key, value)) = requirement.split_once("!=") {
                labels.get(key.trim()).map(String::as_str) != Some(value.trim())
            } else if let Some((key, value)) = requirement
                .split_once("==")
                .or_else(|| requirement.split_once('='))
            {
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            } else if let Some(key) = requirement.strip_prefix('!') {
                !labels.contains_key(key.trim())
            } else {
                labels.contains_key(requirement)
            }
        })
}

#[async_trait::async_trait]
impl PodClientTrait for MockPodClient {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &WatchSelector,
    ) -> Result<PodSnapshot, ReactorError> {
        let mut state = self.state();
        state.list_calls += 1;
        if let Some(message) = &state.list_failure {
            return Err(ReactorError::Api(message.clone()));
        }
        let items = match &state.list_reactor {
            Some(reactor) => reactor(namespace, selector),
            None => state
                .pods
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, pod)| pod)
                .filter(|pod| {
                    let empty = BTreeMap::new();
                    selector_matches(selector, pod.metadata.labels.as_ref().unwrap_or(&empty))
                })
                .cloned()
                .collect(),
        };
        Ok(PodSnapshot {
            items,
            resource_version: state.resource_version.to_string(),
        })
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &WatchSelector,
        resource_version: &str,
    ) -> Result<PodEventStream, ReactorError> {
        let mut state = self.state();
        state.watch_resource_versions.push(resource_version.to_string());
        if let Some(message) = &state.watch_failure {
            return Err(ReactorError::Api(message.clone()));
        }
        let (tx, rx) = unbounded();
        state.watches.push(MockWatch {
            namespace: namespace.to_string(),
            selector: selector.clone(),
            tx,
        });
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labelled(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_selector_matches() {
        let labels = labelled(&[("app", "build"), ("tier", "worker")]);
        let sel = |expr: &str| WatchSelector::default().labels(expr);

        assert!(selector_matches(&WatchSelector::default(), &labels));
        assert!(selector_matches(&sel("app=build"), &labels));
        assert!(selector_matches(&sel("app==build,tier=worker"), &labels));
        assert!(selector_matches(&sel("app!=deploy"), &labels));
        assert!(selector_matches(&sel("tier"), &labels));
        assert!(selector_matches(&sel("!missing"), &labels));
        assert!(!selector_matches(&sel("app=deploy"), &labels));
        assert!(!selector_matches(&sel("!app"), &labels));
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace_and_labels() {
        let client = MockPodClient::new();
        let mut pod = test_pod("default", "a");
        pod.metadata.labels = Some(labelled(&[("app", "build")]));
        client.create_pod(pod).unwrap();
        client.create_pod(test_pod("default", "b")).unwrap();
        client.create_pod(test_pod("other", "c")).unwrap();

        let all = client.list_pods("default", &WatchSelector::default()).await.unwrap();
        assert_eq!(all.items.len(), 2);
        assert_eq!(all.resource_version, "3");

        let selected = client
            .list_pods("default", &WatchSelector::default().labels("app=build"))
            .await
            .unwrap();
        assert_eq!(selected.items.len(), 1);
        assert_eq!(selected.items[0].metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_watch_receives_only_later_changes() {
        let client = MockPodClient::new();
        client.create_pod(test_pod("default", "before")).unwrap();

        let mut stream = client
            .watch_pods("default", &WatchSelector::default(), "1")
            .await
            .unwrap();
        client.create_pod(test_pod("default", "after")).unwrap();
        client.create_pod(test_pod("other", "elsewhere")).unwrap();

        match stream.next().await {
            Some(Ok(PodEvent::Added(pod))) => {
                assert_eq!(pod.metadata.name.as_deref(), Some("after"));
                assert_eq!(pod.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        client.close_watches();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_relabel_moves_pod_across_selector() {
        let client = MockPodClient::new();
        client.create_pod(test_pod("default", "pod")).unwrap();
        let stream = client
            .watch_pods("default", &WatchSelector::default().labels("app=build"), "1")
            .await
            .unwrap();

        let mut pod = test_pod("default", "pod");
        pod.metadata.labels = Some(labelled(&[("app", "build")]));
        client.update_pod(pod.clone()).unwrap();
        client.update_pod(pod).unwrap();
        client.update_pod(test_pod("default", "pod")).unwrap();
        client.update_pod(test_pod("default", "pod")).unwrap();
        client.close_watches();

        let kinds: Vec<&str> = stream
            .map(|event| match event {
                Ok(PodEvent::Added(_)) => "added",
                Ok(PodEvent::Modified(_)) => "modified",
                Ok(PodEvent::Deleted(_)) => "deleted",
                _ => "other",
            })
            .collect()
            .await;
        assert_eq!(kinds, ["added", "modified", "deleted"]);
    }

    #[test]
    fn test_duplicate_and_missing_pods_are_rejected() {
        let client = MockPodClient::new();
        client.create_pod(test_pod("default", "pod")).unwrap();
        assert!(client.create_pod(test_pod("default", "pod")).is_err());
        assert!(client.update_pod(test_pod("default", "ghost")).is_err());
        assert!(client.delete_pod("default", "ghost").is_err());
        assert!(client.create_pod(Pod::default()).is_err());
    }
}
