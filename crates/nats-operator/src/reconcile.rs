//! Reconciliation engine
//!
//! One pass converges one cluster:
//!
//! 1. read the desired state; a missing cluster ends the pass
//! 2. list the members and create or delete until the active count matches
//! 3. regenerate `nats.conf` from the surviving members and sync the artifact
//! 4. write the status
//!
//! Each step re-reads what it needs, so a pass interrupted at any point is
//! finished by the next one. Every external call runs under the per-call
//! deadline and aborts as soon as the governing token is cancelled.

use crate::artifact::{Artifact, ArtifactSynchronizer, SyncOutcome};
use crate::cluster_client::ClusterStore;
use crate::crd::{ClusterDesiredState, ClusterKey, ClusterPhase, NatsClusterStatus};
use crate::error::{ErrorClass, OperatorError, Result};
use crate::members::{active_members, Member, MemberSpec, MemberStore, MembershipPlan};
use crate::natsconf;
use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Result of one successful pass
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The cluster no longer exists; nothing was changed
    Absent,
    /// The cluster is paused; only the status was refreshed
    Paused(NatsClusterStatus),
    /// The spec was rejected before and has not changed since
    Parked,
    /// Membership and configuration match the desired state
    Converged(ConvergeReport),
}

/// What a converging pass changed
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergeReport {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub artifact: SyncOutcome,
    pub status: NatsClusterStatus,
}

impl ReconcileOutcome {
    /// Delay before the cluster should be looked at again, if ever
    pub fn requeue_after(&self, resync: Duration, pending: Duration) -> Option<Duration> {
        match self {
            ReconcileOutcome::Absent | ReconcileOutcome::Parked => None,
            ReconcileOutcome::Paused(_) => Some(resync),
            ReconcileOutcome::Converged(report) if report.status.phase == ClusterPhase::Running => {
                Some(resync)
            }
            ReconcileOutcome::Converged(_) => Some(pending),
        }
    }
}

/// Render validation errors as one line
fn validation_message(errors: &validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(msg) => format!("{}: {}", field, msg),
                None => format!("{}: {}", field, e.code),
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}

/// Status for a cluster whose members are `active`
pub fn build_status(desired: &ClusterDesiredState, active: &[Member]) -> NatsClusterStatus {
    let size = active.len();
    let ready = active.iter().filter(|m| m.ready).count();
    let desired_size = usize::try_from(desired.spec.size).unwrap_or(0);

    let phase = if size == desired_size && ready == size {
        ClusterPhase::Running
    } else {
        ClusterPhase::Creating
    };

    // Only claim a version once every member runs it
    let current_version = active
        .iter()
        .all(|m| m.version.as_deref() == Some(desired.spec.version.as_str()))
        .then(|| desired.spec.version.clone());

    let message = (phase == ClusterPhase::Creating)
        .then(|| format!("{}/{} members ready", ready, desired_size));

    NatsClusterStatus {
        size: i32::try_from(size).unwrap_or(i32::MAX),
        phase,
        current_version,
        observed_generation: desired.generation.unwrap_or(0),
        message,
        last_updated: Some(Utc::now().to_rfc3339()),
    }
}

/// Converges clusters one pass at a time
pub struct Reconciler {
    clusters: Arc<dyn ClusterStore>,
    members: Arc<dyn MemberStore>,
    artifacts: ArtifactSynchronizer,
    call_timeout: Duration,
    /// Desired states rejected with a permanent error, skipped until they change
    parked: DashMap<ClusterKey, ClusterDesiredState>,
}

impl Reconciler {
    pub fn new(
        clusters: Arc<dyn ClusterStore>,
        members: Arc<dyn MemberStore>,
        artifacts: ArtifactSynchronizer,
        call_timeout: Duration,
    ) -> Self {
        Self {
            clusters,
            members,
            artifacts,
            call_timeout,
            parked: DashMap::new(),
        }
    }

    /// Whether `key` is parked on a rejected desired state
    pub fn is_parked(&self, key: &ClusterKey) -> bool {
        self.parked.contains_key(key)
    }

    /// Run one external call under the deadline and the governing token
    async fn call<T, F>(&self, cancel: &CancellationToken, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OperatorError::Cancelled),
            res = tokio::time::timeout(self.call_timeout, fut) => match res {
                Ok(res) => res,
                Err(_) => Err(OperatorError::Timeout(format!(
                    "{} did not finish within {:?}",
                    what, self.call_timeout
                ))),
            },
        }
    }

    /// Converge the cluster `key` once.
    #[instrument(skip(self, key, cancel), fields(cluster = %key))]
    pub async fn reconcile(
        &self,
        key: &ClusterKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        if cancel.is_cancelled() {
            return Err(OperatorError::Cancelled);
        }

        let desired = match self.call(cancel, "get cluster", self.clusters.get(key)).await? {
            Some(desired) => desired,
            None => {
                debug!("NatsCluster no longer exists");
                self.parked.remove(key);
                return Ok(ReconcileOutcome::Absent);
            }
        };

        if self.parked.get(key).is_some_and(|p| *p == desired) {
            debug!("Desired state unchanged since it was rejected");
            return Ok(ReconcileOutcome::Parked);
        }
        self.parked.remove(key);

        match self.converge(&desired, cancel).await {
            Err(e) if e.class() == ErrorClass::Permanent => {
                warn!(error = %e, "Desired state rejected, parking until it changes");
                self.parked.insert(key.clone(), desired.clone());
                let status = self.degraded_status(&desired, &e.to_string(), cancel).await;
                if let Err(status_err) = self
                    .call(cancel, "update status", self.clusters.update_status(key, &status))
                    .await
                {
                    debug!(error = %status_err, "Could not record Degraded status");
                }
                Err(e)
            }
            other => other,
        }
    }

    async fn converge(
        &self,
        desired: &ClusterDesiredState,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let key = &desired.key;

        desired
            .spec
            .validate()
            .map_err(|errors| OperatorError::ValidationError(validation_message(&errors)))?;

        let members = self.call(cancel, "list members", self.members.list(key)).await?;

        if desired.spec.paused {
            info!("Cluster is paused, leaving members untouched");
            let mut status = build_status(desired, &active_members(&members));
            status.message = Some("paused".to_string());
            self.call(cancel, "update status", self.clusters.update_status(key, &status))
                .await?;
            return Ok(ReconcileOutcome::Paused(status));
        }

        let desired_size = usize::try_from(desired.spec.size).unwrap_or(0);
        let plan = MembershipPlan::compute(&key.name, desired_size, &members);

        for name in &plan.create {
            let spec = MemberSpec::for_cluster(desired, name.clone());
            self.call(cancel, "create member", self.members.create(&spec))
                .await?;
        }
        for name in &plan.delete {
            self.call(cancel, "delete member", self.members.delete(key, name))
                .await?;
        }

        let members = if plan.is_empty() {
            members
        } else {
            info!(
                created = plan.create.len(),
                deleted = plan.delete.len(),
                "Membership changed"
            );
            self.call(cancel, "list members", self.members.list(key)).await?
        };
        let active = active_members(&members);

        let payload = natsconf::generate(&key.name, &active);
        let artifact = Artifact::config(key.clone(), payload).with_owner(desired.uid.clone());
        let artifact_outcome = self
            .call(cancel, "sync artifact", self.artifacts.sync(&artifact))
            .await?;

        let status = build_status(desired, &active);
        self.call(cancel, "update status", self.clusters.update_status(key, &status))
            .await?;

        debug!(
            size = status.size,
            phase = %status.phase,
            artifact = %artifact_outcome,
            "Reconciliation complete"
        );

        Ok(ReconcileOutcome::Converged(ConvergeReport {
            created: plan.create,
            deleted: plan.delete,
            artifact: artifact_outcome,
            status,
        }))
    }

    async fn degraded_status(
        &self,
        desired: &ClusterDesiredState,
        message: &str,
        cancel: &CancellationToken,
    ) -> NatsClusterStatus {
        // Size falls back to zero when the members cannot be listed
        let members = self
            .call(cancel, "list members", self.members.list(&desired.key))
            .await
            .unwrap_or_default();
        let mut status = build_status(desired, &active_members(&members));
        status.phase = ClusterPhase::Degraded;
        status.message = Some(message.to_string());
        status
    }

    /// Record that the cluster keeps failing to converge.
    ///
    /// Best effort: a failure here is returned for logging only.
    pub async fn report_degraded(
        &self,
        key: &ClusterKey,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(desired) = self.call(cancel, "get cluster", self.clusters.get(key)).await? else {
            return Ok(());
        };
        let status = self.degraded_status(&desired, message, cancel).await;
        self.call(cancel, "update status", self.clusters.update_status(key, &status))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NatsClusterSpec;
    use crate::memory::{MemoryBackend, Op};

    fn key() -> ClusterKey {
        ClusterKey::new("default", "c1")
    }

    fn reconciler(backend: &MemoryBackend) -> Reconciler {
        Reconciler::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            ArtifactSynchronizer::new(Arc::new(backend.clone())),
            Duration::from_secs(5),
        )
    }

    fn member(name: &str, ready: bool, version: &str) -> Member {
        let mut m = Member::new(name, key());
        m.ready = ready;
        m.version = Some(version.to_string());
        m
    }

    #[test]
    fn test_build_status_running() {
        let desired = ClusterDesiredState::new(key(), NatsClusterSpec::new(2, "1.1.0"));
        let status = build_status(
            &desired,
            &[member("c1-1", true, "1.1.0"), member("c1-2", true, "1.1.0")],
        );
        assert_eq!(status.size, 2);
        assert_eq!(status.phase, ClusterPhase::Running);
        assert_eq!(status.current_version.as_deref(), Some("1.1.0"));
        assert!(status.message.is_none());
    }

    #[test]
    fn test_build_status_creating() {
        let desired = ClusterDesiredState::new(key(), NatsClusterSpec::new(2, "1.2.0"));
        let status = build_status(
            &desired,
            &[member("c1-1", true, "1.1.0"), member("c1-2", false, "1.2.0")],
        );
        assert_eq!(status.phase, ClusterPhase::Creating);
        assert!(status.current_version.is_none());
        assert_eq!(status.message.as_deref(), Some("1/2 members ready"));
    }

    #[test]
    fn test_requeue_policy() {
        let resync = Duration::from_secs(300);
        let pending = Duration::from_secs(5);
        assert_eq!(ReconcileOutcome::Absent.requeue_after(resync, pending), None);
        assert_eq!(ReconcileOutcome::Parked.requeue_after(resync, pending), None);

        let report = |phase| {
            ReconcileOutcome::Converged(ConvergeReport {
                created: vec![],
                deleted: vec![],
                artifact: SyncOutcome::Unchanged,
                status: NatsClusterStatus {
                    phase,
                    ..Default::default()
                },
            })
        };
        assert_eq!(
            report(ClusterPhase::Running).requeue_after(resync, pending),
            Some(resync)
        );
        assert_eq!(
            report(ClusterPhase::Creating).requeue_after(resync, pending),
            Some(pending)
        );
    }

    #[tokio::test]
    async fn test_converges_new_cluster() {
        let backend = MemoryBackend::new();
        backend.apply_cluster(key(), NatsClusterSpec::new(3, "1.1.0"));
        let r = reconciler(&backend);

        let outcome = r.reconcile(&key(), &CancellationToken::new()).await.unwrap();
        let report = match outcome {
            ReconcileOutcome::Converged(report) => report,
            other => panic!("expected convergence, got {:?}", other),
        };
        assert_eq!(report.created, vec!["c1-1", "c1-2", "c1-3"]);
        assert_eq!(report.artifact, SyncOutcome::Created);
        assert_eq!(report.status.size, 3);
        assert_eq!(report.status.phase, ClusterPhase::Running);

        let conf = backend.config_text(&key()).unwrap();
        for name in ["c1-1", "c1-2", "c1-3"] {
            assert!(conf.contains(name), "{} missing from {}", name, conf);
        }
        assert_eq!(backend.status(&key()).unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let backend = MemoryBackend::new();
        backend.apply_cluster(key(), NatsClusterSpec::new(2, "1.1.0"));
        let r = reconciler(&backend);
        let cancel = CancellationToken::new();

        r.reconcile(&key(), &cancel).await.unwrap();
        let writes = backend.artifact_writes();
        let creates = backend.member_creates();

        let outcome = r.reconcile(&key(), &cancel).await.unwrap();
        let report = match outcome {
            ReconcileOutcome::Converged(report) => report,
            other => panic!("expected convergence, got {:?}", other),
        };
        assert!(report.created.is_empty() && report.deleted.is_empty());
        assert_eq!(report.artifact, SyncOutcome::Unchanged);
        assert_eq!(backend.artifact_writes(), writes);
        assert_eq!(backend.member_creates(), creates);
    }

    #[tokio::test]
    async fn test_absent_cluster_changes_nothing() {
        let backend = MemoryBackend::new();
        let r = reconciler(&backend);
        let outcome = r.reconcile(&key(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Absent);
        assert_eq!(backend.member_creates(), 0);
        assert_eq!(backend.artifact_writes(), 0);
    }

    #[tokio::test]
    async fn test_paused_cluster_is_left_alone() {
        let backend = MemoryBackend::new();
        let mut spec = NatsClusterSpec::new(3, "1.1.0");
        spec.paused = true;
        backend.apply_cluster(key(), spec);
        let r = reconciler(&backend);

        let outcome = r.reconcile(&key(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Paused(_)));
        assert_eq!(backend.member_creates(), 0);
        assert!(backend.config_text(&key()).is_none());
    }

    #[tokio::test]
    async fn test_invalid_spec_is_parked_until_changed() {
        let backend = MemoryBackend::new();
        backend.apply_cluster(key(), NatsClusterSpec::new(-1, "1.1.0"));
        let r = reconciler(&backend);
        let cancel = CancellationToken::new();

        let err = r.reconcile(&key(), &cancel).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(r.is_parked(&key()));
        let status = backend.status(&key()).unwrap();
        assert_eq!(status.phase, ClusterPhase::Degraded);
        assert!(status.message.unwrap().contains("size"));

        assert_eq!(
            r.reconcile(&key(), &cancel).await.unwrap(),
            ReconcileOutcome::Parked
        );

        backend.apply_cluster(key(), NatsClusterSpec::new(1, "1.1.0"));
        let outcome = r.reconcile(&key(), &cancel).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Converged(_)));
        assert!(!r.is_parked(&key()));
    }

    #[tokio::test]
    async fn test_transient_failure_is_returned() {
        let backend = MemoryBackend::new();
        backend.apply_cluster(key(), NatsClusterSpec::new(3, "1.1.0"));
        backend.fail(Op::CreateMember, 503, 1);
        let r = reconciler(&backend);
        let cancel = CancellationToken::new();

        let err = r.reconcile(&key(), &cancel).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!r.is_parked(&key()));

        // The retry picks up where the failed pass stopped
        r.reconcile(&key(), &cancel).await.unwrap();
        assert_eq!(backend.member_names(&key()), vec!["c1-1", "c1-2", "c1-3"]);
    }

    #[tokio::test]
    async fn test_cancelled_pass_does_not_start() {
        let backend = MemoryBackend::new();
        backend.apply_cluster(key(), NatsClusterSpec::new(3, "1.1.0"));
        let r = reconciler(&backend);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = r.reconcile(&key(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(backend.member_creates(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let backend = MemoryBackend::new();
        backend.apply_cluster(key(), NatsClusterSpec::new(1, "1.1.0"));
        backend.slow(Op::GetCluster, Duration::from_secs(60));
        let r = reconciler(&backend);

        let err = r.reconcile(&key(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OperatorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_report_degraded() {
        let backend = MemoryBackend::new();
        backend.apply_cluster(key(), NatsClusterSpec::new(1, "1.1.0"));
        let r = reconciler(&backend);

        r.report_degraded(&key(), "3 consecutive failures", &CancellationToken::new())
            .await
            .unwrap();
        let status = backend.status(&key()).unwrap();
        assert_eq!(status.phase, ClusterPhase::Degraded);
        assert_eq!(status.message.as_deref(), Some("3 consecutive failures"));
    }
}
