//! Configuration artifact synchronization
//!
//! Each cluster has exactly one artifact, a Secret named after the cluster
//! whose only key is `nats.conf`. The synchronizer makes the stored artifact
//! equal to the freshly generated one: it creates it when missing, replaces
//! it wholesale when anything differs, and does not write at all when the
//! content already matches.

use crate::crd::ClusterKey;
use crate::error::Result;
use crate::natsconf::CONFIG_KEY;
use crate::resources::build_artifact_secret;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Stored configuration document for one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: ClusterKey,
    /// Full stored content; a synchronized artifact holds only `nats.conf`
    pub data: BTreeMap<String, Vec<u8>>,
    /// UID of the owning NatsCluster, for garbage collection
    pub owner_uid: Option<String>,
}

impl Artifact {
    /// Artifact holding exactly one configuration document
    pub fn config(key: ClusterKey, payload: Vec<u8>) -> Self {
        let mut data = BTreeMap::new();
        data.insert(CONFIG_KEY.to_string(), payload);
        Self {
            key,
            data,
            owner_uid: None,
        }
    }

    pub fn with_owner(mut self, uid: Option<String>) -> Self {
        self.owner_uid = uid;
        self
    }

    /// The `nats.conf` document, if present
    pub fn payload(&self) -> Option<&[u8]> {
        self.data.get(CONFIG_KEY).map(Vec::as_slice)
    }
}

/// What a synchronization pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Replaced,
    Unchanged,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Created => write!(f, "created"),
            SyncOutcome::Replaced => write!(f, "replaced"),
            SyncOutcome::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Storage of configuration artifacts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch the artifact named after the cluster, if it exists
    async fn get(&self, key: &ClusterKey) -> Result<Option<Artifact>>;

    /// Create the artifact
    async fn create(&self, artifact: &Artifact) -> Result<()>;

    /// Overwrite the artifact completely
    async fn update(&self, artifact: &Artifact) -> Result<()>;
}

/// Stored artifact already matches: same data, and owned by the cluster when
/// an owner is known
fn is_current(existing: &Artifact, desired: &Artifact) -> bool {
    existing.data == desired.data
        && (desired.owner_uid.is_none() || existing.owner_uid == desired.owner_uid)
}

/// Keeps stored artifacts equal to the generated configuration
#[derive(Clone)]
pub struct ArtifactSynchronizer {
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactSynchronizer {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Make the stored artifact for `desired.key` equal to `desired`.
    pub async fn sync(&self, desired: &Artifact) -> Result<SyncOutcome> {
        let outcome = match self.store.get(&desired.key).await? {
            None => {
                self.store.create(desired).await?;
                SyncOutcome::Created
            }
            Some(existing) if is_current(&existing, desired) => SyncOutcome::Unchanged,
            Some(existing) => {
                debug!(
                    cluster = %desired.key,
                    stale_keys = existing.data.len(),
                    "Artifact content differs"
                );
                self.store.update(desired).await?;
                SyncOutcome::Replaced
            }
        };

        if outcome != SyncOutcome::Unchanged {
            info!(cluster = %desired.key, %outcome, "Synchronized configuration artifact");
        }
        Ok(outcome)
    }
}

/// Artifacts backed by Kubernetes Secrets
pub struct KubeArtifactStore {
    client: Client,
}

impl KubeArtifactStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ArtifactStore for KubeArtifactStore {
    async fn get(&self, key: &ClusterKey) -> Result<Option<Artifact>> {
        let secret = self.secrets(&key.namespace).get_opt(&key.name).await?;
        Ok(secret.map(|secret| Artifact {
            key: key.clone(),
            data: secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect(),
            owner_uid: secret
                .metadata
                .owner_references
                .and_then(|refs| refs.into_iter().next())
                .map(|r| r.uid),
        }))
    }

    async fn create(&self, artifact: &Artifact) -> Result<()> {
        let secret = build_artifact_secret(artifact);
        self.secrets(&artifact.key.namespace)
            .create(&PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    async fn update(&self, artifact: &Artifact) -> Result<()> {
        // No resourceVersion: an unconditional replace of the whole object
        let secret = build_artifact_secret(artifact);
        self.secrets(&artifact.key.namespace)
            .replace(&artifact.key.name, &PostParams::default(), &secret)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperatorError;

    fn key() -> ClusterKey {
        ClusterKey::new("default", "c1")
    }

    #[tokio::test]
    async fn test_creates_missing_artifact() {
        let mut store = MockArtifactStore::new();
        store.expect_get().times(1).returning(|_| Ok(None));
        store
            .expect_create()
            .withf(|a| a.payload() == Some(b"conf".as_slice()))
            .times(1)
            .returning(|_| Ok(()));
        store.expect_update().never();

        let sync = ArtifactSynchronizer::new(Arc::new(store));
        let outcome = sync
            .sync(&Artifact::config(key(), b"conf".to_vec()))
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Created);
    }

    #[tokio::test]
    async fn test_identical_artifact_is_not_written() {
        let mut store = MockArtifactStore::new();
        store
            .expect_get()
            .returning(|k| Ok(Some(Artifact::config(k.clone(), b"conf".to_vec()))));
        store.expect_create().never();
        store.expect_update().never();

        let sync = ArtifactSynchronizer::new(Arc::new(store));
        let outcome = sync
            .sync(&Artifact::config(key(), b"conf".to_vec()))
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_different_payload_is_replaced() {
        let mut store = MockArtifactStore::new();
        store
            .expect_get()
            .returning(|k| Ok(Some(Artifact::config(k.clone(), b"port: 4222".to_vec()))));
        store
            .expect_update()
            .withf(|a| a.payload() == Some(b"conf".as_slice()) && a.data.len() == 1)
            .times(1)
            .returning(|_| Ok(()));

        let sync = ArtifactSynchronizer::new(Arc::new(store));
        let outcome = sync
            .sync(&Artifact::config(key(), b"conf".to_vec()))
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Replaced);
    }

    #[tokio::test]
    async fn test_extra_keys_force_replacement() {
        let mut store = MockArtifactStore::new();
        store.expect_get().returning(|k| {
            let mut existing = Artifact::config(k.clone(), b"conf".to_vec());
            existing
                .data
                .insert("extra".to_string(), b"left over".to_vec());
            Ok(Some(existing))
        });
        store.expect_update().times(1).returning(|_| Ok(()));

        let sync = ArtifactSynchronizer::new(Arc::new(store));
        let outcome = sync
            .sync(&Artifact::config(key(), b"conf".to_vec()))
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Replaced);
    }

    #[tokio::test]
    async fn test_unowned_artifact_is_adopted() {
        let mut store = MockArtifactStore::new();
        store
            .expect_get()
            .returning(|k| Ok(Some(Artifact::config(k.clone(), b"conf".to_vec()))));
        store
            .expect_update()
            .withf(|a| a.owner_uid.as_deref() == Some("uid-1"))
            .times(1)
            .returning(|_| Ok(()));

        let sync = ArtifactSynchronizer::new(Arc::new(store));
        let desired =
            Artifact::config(key(), b"conf".to_vec()).with_owner(Some("uid-1".to_string()));
        assert_eq!(sync.sync(&desired).await.unwrap(), SyncOutcome::Replaced);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let mut store = MockArtifactStore::new();
        store.expect_get().returning(|_| {
            Err(OperatorError::Api {
                code: 503,
                message: "unavailable".to_string(),
            })
        });

        let sync = ArtifactSynchronizer::new(Arc::new(store));
        let err = sync
            .sync(&Artifact::config(key(), b"conf".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
