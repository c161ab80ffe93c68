//! Pod list/watch client abstraction
//!
//! The watcher only needs two operations from the cluster: list the pods that
//! match a selector, and watch them from a resource version onwards. This trait
//! abstracts them so the watcher can run against the Kubernetes API or an
//! in-memory mock in unit tests.

use crate::error::ReactorError;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, Client};
use std::fmt;
use std::future::Future;
use tracing::debug;

/// Label and field selectors shared by the initial list and the watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSelector {
    /// Label selector, e.g. `buildrun.shipwright.io/name=my-run`
    pub label_selector: Option<String>,
    /// Field selector, e.g. `metadata.name=my-pod`
    pub field_selector: Option<String>,
}

impl WatchSelector {
    /// Sets the label selector.
    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    /// Sets the field selector.
    #[must_use]
    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    /// Parameters for the initial list call.
    #[must_use]
    pub fn to_list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = &self.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        params
    }

    /// Parameters for the watch call, carrying the same filters as the list.
    #[must_use]
    pub fn to_watch_params(&self) -> WatchParams {
        let mut params = WatchParams::default();
        if let Some(labels) = &self.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        params
    }
}

/// Pods captured by the initial list, plus the resource version to watch from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodSnapshot {
    /// Pods matching the selector at list time
    pub items: Vec<Pod>,
    /// Resource version of the list response
    pub resource_version: String,
}

/// A single event delivered by the pod watch.
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    /// Pod was created
    Added(Pod),
    /// Pod was updated
    Modified(Pod),
    /// Pod was deleted; carries its last observed state
    Deleted(Pod),
    /// Progress marker carrying only a resource version
    Bookmark(String),
}

/// Stream of pod events; ends when the server closes the watch.
pub type PodEventStream = BoxStream<'static, Result<PodEvent, ReactorError>>;

/// Trait for the pod list/watch operations the watcher depends on
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait PodClientTrait: Send + Sync {
    /// Lists the pods in `namespace` matching `selector`.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &WatchSelector,
    ) -> Result<PodSnapshot, ReactorError>;

    /// Watches the pods in `namespace` matching `selector`, starting after
    /// `resource_version`.
    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &WatchSelector,
        resource_version: &str,
    ) -> Result<PodEventStream, ReactorError>;
}

/// [`PodClientTrait`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubePodClient {
    client: Client,
}

impl fmt::Debug for KubePodClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubePodClient").finish_non_exhaustive()
    }
}

impl KubePodClient {
    /// Wraps an existing Kubernetes client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the in-cluster config or the local kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Kube`] when no usable configuration is found.
    pub async fn try_default() -> Result<Self, ReactorError> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl PodClientTrait for KubePodClient {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &WatchSelector,
    ) -> Result<PodSnapshot, ReactorError> {
        let list = self.pods(namespace).list(&selector.to_list_params()).await?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(
            "Listed {} pods in {} at resource version {}",
            list.items.len(),
            namespace,
            resource_version
        );
        Ok(PodSnapshot {
            items: list.items,
            resource_version,
        })
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &WatchSelector,
        resource_version: &str,
    ) -> Result<PodEventStream, ReactorError> {
        let api = self.pods(namespace);
        let params = selector.to_watch_params();
        let first = api.watch(&params, resource_version).await?.boxed();
        let reopen = move |version: String| {
            let api = api.clone();
            let params = params.clone();
            async move { api.watch(&params, &version).await.map(|events| events.boxed()) }
        };
        Ok(resume_on_expiry(first, resource_version.to_string(), reopen))
    }
}

type RawWatch = BoxStream<'static, kube::Result<WatchEvent<Pod>>>;

struct Resumable<F> {
    events: Option<RawWatch>,
    resource_version: String,
    reopen: F,
}

/// Turns a series of server-bounded watches into one stream.
///
/// The API server ends every watch after its `timeoutSeconds`. When that
/// happens the watch is reopened from the last resource version seen. An
/// error event, or a failure to reopen, is yielded and then ends the stream.
fn resume_on_expiry<F, Fut>(first: RawWatch, resource_version: String, reopen: F) -> PodEventStream
where
    F: FnMut(String) -> Fut + Send + 'static,
    Fut: Future<Output = kube::Result<RawWatch>> + Send + 'static,
{
    let state = Resumable {
        events: Some(first),
        resource_version,
        reopen,
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            let events = state.events.as_mut()?;
            if let Some(event) = events.next().await {
                let event = convert_watch_event(event);
                match &event {
                    Ok(PodEvent::Added(pod) | PodEvent::Modified(pod) | PodEvent::Deleted(pod)) => {
                        if let Some(version) = &pod.metadata.resource_version {
                            state.resource_version.clone_from(version);
                        }
                    }
                    Ok(PodEvent::Bookmark(version)) => state.resource_version.clone_from(version),
                    Err(_) => state.events = None,
                }
                return Some((event, state));
            }

            debug!("Pod watch expired, resuming from resource version {}", state.resource_version);
            match (state.reopen)(state.resource_version.clone()).await {
                Ok(events) => state.events = Some(events),
                Err(err) => {
                    state.events = None;
                    return Some((Err(err.into()), state));
                }
            }
        }
    })
    .boxed()
}

fn convert_watch_event(event: kube::Result<WatchEvent<Pod>>) -> Result<PodEvent, ReactorError> {
    match event? {
        WatchEvent::Added(pod) => Ok(PodEvent::Added(pod)),
        WatchEvent::Modified(pod) => Ok(PodEvent::Modified(pod)),
        WatchEvent::Deleted(pod) => Ok(PodEvent::Deleted(pod)),
        WatchEvent::Bookmark(bookmark) => Ok(PodEvent::Bookmark(bookmark.metadata.resource_version)),
        WatchEvent::Error(status) => Err(ReactorError::Watch(format!("{status:?}"))),
    }
}
