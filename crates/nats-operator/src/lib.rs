//! # NATS Kubernetes Operator
//!
//! Kubernetes operator that keeps NATS server clusters at their declared
//! size. A `NatsCluster` resource declares a cluster of `size` members
//! running server `version`; the operator creates and deletes member pods
//! until the count matches, and keeps a shared `nats.conf` secret listing
//! every member as a route.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nats_operator::prelude::*;
//! use kube::Client;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let cancel = CancellationToken::new();
//!
//!     // Returns Ok(Shutdown) once `cancel` fires
//!     run_controller(client, ControllerConfig::default(), cancel).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: [`watch::WatchMultiplexer`] turns NatsCluster events into
//!    deduplicated keys on a [`queue::WorkQueue`]
//! 2. **Reconcile**: a pool of workers runs [`reconcile::Reconciler`] once per
//!    key, never twice at the same time for one key
//! 3. **Act**: members are created or deleted through [`members::MemberStore`]
//!    and the configuration is synchronized through
//!    [`artifact::ArtifactSynchronizer`]
//! 4. **Status**: the observed size and phase are written back
//!
//! Every external system sits behind a trait with a Kubernetes
//! implementation; the tests swap in in-memory ones.
//!
//! ## Custom Resource
//!
//! ```yaml
//! apiVersion: nats.io/v1alpha2
//! kind: NatsCluster
//! metadata:
//!   name: c1
//!   namespace: default
//! spec:
//!   size: 3
//!   version: "1.1.0"
//! ```
//!
//! ## Metrics
//!
//! - `nats_operator_reconciliations_total` - Total reconciliation attempts
//! - `nats_operator_reconciliation_errors_total` - Reconciliation errors
//! - `nats_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `nats_operator_members_created_total` / `nats_operator_members_deleted_total`
//! - `nats_operator_artifact_writes_total` - Configuration artifact writes

pub mod artifact;
pub mod cluster_client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod members;
/// In-memory store backends for tests; not part of the supported API
#[doc(hidden)]
pub mod memory;
pub mod natsconf;
pub mod queue;
pub mod reconcile;
pub mod registration;
pub mod resources;
pub mod watch;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::artifact::{Artifact, ArtifactStore, ArtifactSynchronizer, SyncOutcome};
    pub use crate::cluster_client::{ClusterEvent, ClusterStore, ClusterWatcher};
    pub use crate::config::{BackoffPolicy, ControllerConfig};
    pub use crate::controller::{run_controller, Controller, ControllerMetrics, Shutdown};
    pub use crate::crd::{
        ClusterDesiredState, ClusterKey, ClusterPhase, NatsCluster, NatsClusterSpec,
        NatsClusterStatus,
    };
    pub use crate::error::{ErrorClass, OperatorError, Result};
    pub use crate::members::{Member, MemberSpec, MemberStore};
    pub use crate::reconcile::{ReconcileOutcome, Reconciler};
    pub use crate::registration::ensure_crd;
}
