//! Shared helpers for the integration tests

#![allow(dead_code)]

use anyhow::Result;
use nats_operator::config::{BackoffPolicy, ControllerConfig};
use nats_operator::controller::{Controller, Shutdown};
use nats_operator::crd::{ClusterKey, NatsClusterSpec};
use nats_operator::memory::MemoryBackend;
use nats_operator::error::Result as OperatorResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Initialize tracing for tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nats_operator=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

pub fn cluster_key(name: &str) -> ClusterKey {
    ClusterKey::new("default", name)
}

pub fn spec(size: i32) -> NatsClusterSpec {
    NatsClusterSpec::new(size, "1.1.0")
}

/// Controller timings shrunk for tests
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        workers: 4,
        pending_requeue: Duration::from_millis(20),
        call_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(5),
        requeue_backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(100)),
        watch_backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(100)),
        ..Default::default()
    }
}

/// Controller wired to `backend` for every seam
pub fn controller(backend: &MemoryBackend, config: ControllerConfig) -> Controller {
    let backend = Arc::new(backend.clone());
    Controller::new(
        config,
        backend.clone(),
        backend.clone(),
        backend.clone(),
        backend,
    )
}

/// A controller running in the background
pub struct RunningController {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<OperatorResult<Shutdown>>,
}

impl RunningController {
    pub fn start(backend: &MemoryBackend, config: ControllerConfig) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller(backend, config).run(cancel.clone()));
        Self { cancel, handle }
    }

    /// Cancel the run and wait for it to return
    pub async fn stop(self) -> Result<OperatorResult<Shutdown>> {
        self.cancel.cancel();
        Ok(tokio::time::timeout(Duration::from_secs(10), self.handle).await??)
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_until<F>(mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let timeout_duration = Duration::from_secs(10);
    let start = std::time::Instant::now();

    while start.elapsed() < timeout_duration {
        if condition() {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }

    anyhow::bail!("Condition not met within {:?}", timeout_duration)
}
