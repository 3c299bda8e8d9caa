//! NatsCluster API access
//!
//! The reconciler reads desired state and writes status through
//! [`ClusterStore`]; the watch multiplexer subscribes through
//! [`ClusterWatcher`]. Both are implemented for the Kubernetes API server by
//! [`KubeClusterClient`].

use crate::crd::{ClusterDesiredState, ClusterKey, NatsCluster, NatsClusterStatus};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tracing::{debug, warn};

/// Server-side timeout of each watch request. The watcher resumes from the
/// last resource version, so expiry does not replay existing clusters.
const WATCH_TIMEOUT_SECONDS: u32 = 290;

/// One change notification for a NatsCluster
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    Added(ClusterDesiredState),
    Modified(ClusterDesiredState),
    Deleted(ClusterDesiredState),
}

impl ClusterEvent {
    /// Cluster state carried by the event
    pub fn cluster(&self) -> &ClusterDesiredState {
        match self {
            ClusterEvent::Added(c) | ClusterEvent::Modified(c) | ClusterEvent::Deleted(c) => c,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClusterEvent::Added(_) => "Added",
            ClusterEvent::Modified(_) => "Modified",
            ClusterEvent::Deleted(_) => "Deleted",
        }
    }
}

/// Lazy, possibly endless sequence of cluster events
pub type ClusterEventStream = BoxStream<'static, Result<ClusterEvent>>;

/// Desired-state reads and status writes for NatsClusters
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch the current desired state; `None` when the cluster is gone
    async fn get(&self, key: &ClusterKey) -> Result<Option<ClusterDesiredState>>;

    /// Overwrite the status subresource
    async fn update_status(&self, key: &ClusterKey, status: &NatsClusterStatus) -> Result<()>;
}

/// Change notifications for NatsClusters
#[async_trait]
pub trait ClusterWatcher: Send + Sync {
    /// Subscribe to changes in `namespace` (`None` for all namespaces).
    ///
    /// The stream starts with an `Added` event for every existing cluster
    /// and ends, or yields an error, when the transport is interrupted.
    async fn watch(&self, namespace: Option<&str>) -> Result<ClusterEventStream>;
}

/// NatsCluster access through the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: Option<&str>) -> Api<NatsCluster> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Map a watcher failure onto the operator's error classes
fn watcher_error(err: watcher::Error) -> OperatorError {
    match err {
        watcher::Error::InitialListFailed(e)
        | watcher::Error::WatchStartFailed(e)
        | watcher::Error::WatchFailed(e) => OperatorError::KubeError(e),
        watcher::Error::WatchError(resp) => {
            warn!(code = resp.code, reason = %resp.reason, "Watch reported an error");
            OperatorError::KubeError(kube::Error::Api(resp))
        }
        other => OperatorError::WatchFailed(other.to_string()),
    }
}

/// Decode one watcher event. List markers and undecodable objects yield `None`.
fn decode_event(
    event: std::result::Result<Event<NatsCluster>, watcher::Error>,
) -> Option<Result<ClusterEvent>> {
    match event {
        Ok(Event::InitApply(c)) => Some(Ok(ClusterEvent::Added((&c).into()))),
        Ok(Event::Apply(c)) => Some(Ok(ClusterEvent::Modified((&c).into()))),
        Ok(Event::Delete(c)) => Some(Ok(ClusterEvent::Deleted((&c).into()))),
        Ok(Event::Init) | Ok(Event::InitDone) => None,
        Err(watcher::Error::WatchFailed(kube::Error::SerdeError(e))) => {
            warn!(error = %e, "Skipping undecodable watch event");
            None
        }
        Err(e) => Some(Err(watcher_error(e))),
    }
}

#[async_trait]
impl ClusterStore for KubeClusterClient {
    async fn get(&self, key: &ClusterKey) -> Result<Option<ClusterDesiredState>> {
        let cluster = self.api(Some(&key.namespace)).get_opt(&key.name).await?;
        Ok(cluster.as_ref().map(ClusterDesiredState::from))
    }

    async fn update_status(&self, key: &ClusterKey, status: &NatsClusterStatus) -> Result<()> {
        debug!(cluster = %key, phase = %status.phase, size = status.size, "Updating cluster status");

        let patch = serde_json::json!({
            "status": status
        });

        let patch_params = PatchParams::default();
        self.api(Some(&key.namespace))
            .patch_status(&key.name, &patch_params, &Patch::Merge(&patch))
            .await
            .map_err(OperatorError::from)?;

        Ok(())
    }
}

#[async_trait]
impl ClusterWatcher for KubeClusterClient {
    async fn watch(&self, namespace: Option<&str>) -> Result<ClusterEventStream> {
        let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECONDS);
        // Lazy: the initial list runs on first poll and its failures arrive as stream items
        let stream = watcher::watcher(self.api(namespace), config);
        Ok(stream
            .filter_map(|event| futures::future::ready(decode_event(event)))
            .boxed())
    }
}
