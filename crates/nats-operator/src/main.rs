//! NATS Kubernetes Operator
//!
//! This operator manages NatsCluster custom resources in Kubernetes,
//! keeping every NATS cluster at its declared size and configuration.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use nats_operator::config::{BackoffPolicy, ControllerConfig};
use nats_operator::controller::{run_controller, Shutdown};
use nats_operator::registration::{crd_yaml, ensure_crd};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// NATS Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "nats-operator")]
#[command(about = "Kubernetes operator for NATS server clusters")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Seconds between periodic resyncs of a converged cluster
    #[arg(long, env = "RESYNC_SECONDS", default_value = "300")]
    resync_seconds: u64,

    /// Deadline in seconds for every API call
    #[arg(long, env = "CALL_TIMEOUT_SECONDS", default_value = "30")]
    call_timeout_seconds: u64,

    /// Seconds to wait for in-flight reconciles on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECONDS", default_value = "30")]
    shutdown_grace_seconds: u64,

    /// Maximum requeue delay in seconds for failing clusters
    #[arg(long, env = "MAX_BACKOFF_SECONDS", default_value = "600")]
    max_backoff_seconds: u64,

    /// Consecutive failures after which a cluster is reported Degraded
    #[arg(long, env = "DEGRADED_AFTER", default_value = "3")]
    degraded_after: u32,

    /// Register the NatsCluster CRD before starting
    #[arg(long, env = "REGISTER_CRD", default_value = "false")]
    register_crd: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        let defaults = ControllerConfig::default();
        ControllerConfig {
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            workers: self.workers.max(1),
            resync_interval: Duration::from_secs(self.resync_seconds),
            call_timeout: Duration::from_secs(self.call_timeout_seconds),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
            requeue_backoff: BackoffPolicy::new(
                defaults.requeue_backoff.base,
                Duration::from_secs(self.max_backoff_seconds),
            ),
            degraded_after: self.degraded_after.max(1),
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.controller_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace_label(),
        "Starting NATS Kubernetes Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    if args.register_crd {
        ensure_crd(client.clone(), Duration::from_secs(60))
            .await
            .context("Failed to register NatsCluster CRD")?;
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let shutdown = run_controller(client, config, cancel)
        .await
        .context("Controller failed")?;

    match shutdown {
        Shutdown::Graceful => info!("Shutdown complete"),
        Shutdown::GraceExpired { abandoned } => {
            warn!(abandoned, "Shutdown complete, in-flight reconciles abandoned")
        }
    }

    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, falling back to Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    token.cancel();
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}
