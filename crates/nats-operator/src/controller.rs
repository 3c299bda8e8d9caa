//! NatsCluster Controller
//!
//! Ties the pieces together: the watch multiplexer feeds cluster keys into
//! a deduplicating work queue, and a fixed pool of workers drains it, running
//! one reconcile pass per key. Failures are classified and requeued with
//! backoff, permanently rejected specs are parked, and a cluster that keeps
//! failing is reported `Degraded`.
//!
//! Cancelling the governing token stops the watch, lets in-flight passes
//! finish within the grace period, and then abandons whatever is left.

use crate::artifact::{ArtifactStore, ArtifactSynchronizer, KubeArtifactStore, SyncOutcome};
use crate::cluster_client::{ClusterStore, ClusterWatcher, KubeClusterClient};
use crate::config::ControllerConfig;
use crate::crd::ClusterKey;
use crate::error::{ErrorClass, OperatorError, Result};
use crate::members::{KubeMemberStore, MemberStore};
use crate::queue::WorkQueue;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::watch::WatchMultiplexer;
use kube::Client;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Counter for members created
    pub members_created: metrics::Counter,
    /// Counter for members deleted
    pub members_deleted: metrics::Counter,
    /// Counter for artifact creates and replaces
    pub artifact_writes: metrics::Counter,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("nats_operator_reconciliations_total"),
            errors: metrics::counter!("nats_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("nats_operator_reconciliation_duration_seconds"),
            members_created: metrics::counter!("nats_operator_members_created_total"),
            members_deleted: metrics::counter!("nats_operator_members_deleted_total"),
            artifact_writes: metrics::counter!("nats_operator_artifact_writes_total"),
        }
    }

    fn record_outcome(&self, outcome: &ReconcileOutcome) {
        if let ReconcileOutcome::Converged(report) = outcome {
            self.members_created.increment(report.created.len() as u64);
            self.members_deleted.increment(report.deleted.len() as u64);
            if report.artifact != SyncOutcome::Unchanged {
                self.artifact_writes.increment(1);
            }
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// How the run loop ended after cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Every in-flight pass finished within the grace period
    Graceful,
    /// The grace period expired; `abandoned` passes were aborted
    GraceExpired { abandoned: usize },
}

impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shutdown::Graceful => write!(f, "graceful"),
            Shutdown::GraceExpired { abandoned } => {
                write!(f, "grace period expired, {} passes abandoned", abandoned)
            }
        }
    }
}

/// State shared by the workers
struct WorkerContext {
    config: ControllerConfig,
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<ClusterKey>,
    metrics: Option<ControllerMetrics>,
    /// Governing token: no new passes start once it fires
    cancel: CancellationToken,
    /// Fires when the grace period expires, aborting in-flight external calls
    hard_stop: CancellationToken,
}

/// The NatsCluster controller
pub struct Controller {
    config: ControllerConfig,
    watcher: Arc<dyn ClusterWatcher>,
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<ClusterKey>,
    metrics: Option<ControllerMetrics>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        watcher: Arc<dyn ClusterWatcher>,
        clusters: Arc<dyn ClusterStore>,
        members: Arc<dyn MemberStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            clusters,
            members,
            ArtifactSynchronizer::new(artifacts),
            config.call_timeout,
        ));
        let queue = WorkQueue::new(config.requeue_backoff);
        Self {
            config,
            watcher,
            reconciler,
            queue,
            metrics: None,
        }
    }

    /// Controller backed by the Kubernetes API server
    pub fn from_client(client: Client, config: ControllerConfig) -> Self {
        let clusters = Arc::new(KubeClusterClient::new(client.clone()));
        Self::new(
            config,
            clusters.clone(),
            clusters,
            Arc::new(KubeMemberStore::new(client.clone())),
            Arc::new(KubeArtifactStore::new(client)),
        )
        .with_metrics(ControllerMetrics::new())
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The reconciler the workers run
    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    /// Run until `cancel` fires or the watch fails for good.
    ///
    /// Cancellation is not a failure: it yields `Ok` with the shutdown kind.
    pub async fn run(self, cancel: CancellationToken) -> Result<Shutdown> {
        info!(
            namespace = self.config.namespace_label(),
            workers = self.config.workers,
            "Starting NatsCluster controller"
        );

        // Child token: a watch failure stops this run without cancelling the caller
        let cancel = cancel.child_token();
        let hard_stop = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            config: self.config.clone(),
            reconciler: self.reconciler.clone(),
            queue: self.queue.clone(),
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
            hard_stop: hard_stop.clone(),
        });

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            workers.spawn(worker_loop(id, ctx.clone()));
        }

        let multiplexer = WatchMultiplexer::new(
            self.watcher.clone(),
            self.queue.clone(),
            self.config.namespace.clone(),
            self.config.watch_backoff,
            self.config.watch_max_failures,
        );
        let watch_result = multiplexer.run(cancel.clone()).await;

        // Stop handing out keys; idle workers exit, busy ones finish their pass
        cancel.cancel();
        self.queue.shutdown();

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Worker ended abnormally");
                }
            }
        })
        .await;

        let shutdown = match drained {
            Ok(()) => Shutdown::Graceful,
            Err(_) => {
                let abandoned = workers.len();
                warn!(abandoned, "Shutdown grace period expired, aborting in-flight passes");
                hard_stop.cancel();
                workers.abort_all();
                while workers.join_next().await.is_some() {}
                Shutdown::GraceExpired { abandoned }
            }
        };

        match watch_result {
            Ok(()) => {
                info!(%shutdown, "NatsCluster controller stopped");
                Ok(shutdown)
            }
            Err(e) => {
                error!(error = %e, "NatsCluster controller stopped on watch failure");
                Err(e)
            }
        }
    }
}

async fn worker_loop(id: usize, ctx: Arc<WorkerContext>) {
    debug!(worker = id, "Worker started");

    while let Some(key) = ctx.queue.get().await {
        if ctx.cancel.is_cancelled() {
            ctx.queue.done(&key);
            break;
        }

        let start = Instant::now();
        if let Some(ref metrics) = ctx.metrics {
            metrics.reconciliations.increment(1);
        }

        let result = ctx.reconciler.reconcile(&key, &ctx.hard_stop).await;

        if let Some(ref metrics) = ctx.metrics {
            metrics.duration.record(start.elapsed().as_secs_f64());
        }

        match result {
            Ok(outcome) => {
                ctx.queue.forget(&key);
                if let Some(ref metrics) = ctx.metrics {
                    metrics.record_outcome(&outcome);
                }
                let requeue = outcome
                    .requeue_after(ctx.config.resync_interval, ctx.config.pending_requeue);
                if let Some(delay) = requeue {
                    ctx.queue.add_after(key.clone(), delay);
                }
                debug!(cluster = %key, ?outcome, "Reconciliation completed");
            }
            Err(e) => {
                if let Some(ref metrics) = ctx.metrics {
                    metrics.errors.increment(1);
                }
                error_policy(&key, &e, &ctx).await;
            }
        }

        ctx.queue.done(&key);
    }

    debug!(worker = id, "Worker stopped");
}

/// Error policy for the controller: exponential backoff per cluster.
async fn error_policy(key: &ClusterKey, error: &OperatorError, ctx: &WorkerContext) {
    if error.is_cancelled() {
        debug!(cluster = %key, "Reconciliation cancelled");
        return;
    }

    match error.class() {
        ErrorClass::Permanent => {
            // The reconciler parked the desired state; a spec change re-enqueues it
            ctx.queue.forget(key);
            warn!(cluster = %key, error = %error, "Reconciliation rejected, not retrying");
        }
        ErrorClass::Transient | ErrorClass::Fatal => {
            // 500ms → 1s → 2s → ... → 600s (capped)
            let delay = ctx.queue.add_rate_limited(key.clone());
            let retries = ctx.queue.num_requeues(key);

            warn!(
                error = %error,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                "Reconciliation error for '{}', will retry",
                key
            );

            if retries >= ctx.config.degraded_after {
                let message = format!("{} consecutive failures, last: {}", retries, error);
                if let Err(e) = ctx
                    .reconciler
                    .report_degraded(key, &message, &ctx.hard_stop)
                    .await
                {
                    debug!(cluster = %key, error = %e, "Could not record Degraded status");
                }
            }
        }
    }
}

/// Start the NatsCluster controller against the API server.
///
/// Runs until `cancel` fires; see [`Controller::run`].
pub async fn run_controller(
    client: Client,
    config: ControllerConfig,
    cancel: CancellationToken,
) -> Result<Shutdown> {
    Controller::from_client(client, config).run(cancel).await
}
