//! Controller configuration
//!
//! Every tunable of the run loop lives here so the binary can build it from
//! CLI flags and tests can shrink the timings.

use std::time::Duration;

/// Requeue interval after a successful reconciliation
const DEFAULT_RESYNC_SECONDS: u64 = 300; // 5 minutes

/// Requeue interval while members are still starting
const DEFAULT_PENDING_REQUEUE_SECONDS: u64 = 5;

/// Base delay for error backoff
const ERROR_REQUEUE_MILLIS: u64 = 500;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^16 is far beyond any sane cap already
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self.base.saturating_mul(2u32.saturating_pow(exp));
        backoff.min(self.max)
    }
}

/// Configuration for the NatsCluster controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch (`None` for all namespaces)
    pub namespace: Option<String>,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Requeue interval after a successful reconciliation
    pub resync_interval: Duration,
    /// Requeue interval while a cluster is still `Creating`
    pub pending_requeue: Duration,
    /// Deadline applied to every external API call
    pub call_timeout: Duration,
    /// How long shutdown waits for in-flight reconciles
    pub shutdown_grace: Duration,
    /// Backoff for keys whose reconcile failed
    pub requeue_backoff: BackoffPolicy,
    /// Backoff between watch resubscriptions
    pub watch_backoff: BackoffPolicy,
    /// Consecutive watch failures tolerated before the controller gives up
    pub watch_max_failures: u32,
    /// Consecutive reconcile failures after which the cluster is reported `Degraded`
    pub degraded_after: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 4,
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_SECONDS),
            pending_requeue: Duration::from_secs(DEFAULT_PENDING_REQUEUE_SECONDS),
            call_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            requeue_backoff: BackoffPolicy::new(
                Duration::from_millis(ERROR_REQUEUE_MILLIS),
                Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS),
            ),
            watch_backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(60)),
            watch_max_failures: 10,
            degraded_after: 3,
        }
    }
}

impl ControllerConfig {
    /// Scope the controller to one namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Namespace label used in logs
    pub fn namespace_label(&self) -> &str {
        self.namespace.as_deref().unwrap_or("all")
    }
}
