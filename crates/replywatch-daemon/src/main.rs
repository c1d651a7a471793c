//! replywatch-daemon - conversation response-deadline tracking replica.
//!
//! Loads configuration from the environment (flags override), connects to
//! the shared store, and runs every replica role concurrently: ingress,
//! leader election, leader-gated detection and cleanup, stream
//! consumption, and pending-entry recovery. SIGTERM/SIGINT trigger a
//! graceful shutdown: ingress drains, loops unwind through a shared watch
//! channel, and the lease is resigned best-effort.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use replywatch_core::clock::{Clock, SystemClock};
use replywatch_core::config::{Config, RECOVERY_INTERVAL};
use replywatch_core::store::{RedisStore, TimeoutStore};
use replywatch_daemon::consumer::EventConsumer;
use replywatch_daemon::detector::TimeoutDetector;
use replywatch_daemon::http::{self, AppState};
use replywatch_daemon::index::{CleanupTask, TimeoutIndex};
use replywatch_daemon::leader::LeaderElector;
use replywatch_daemon::metrics::{SharedMetrics, new_shared_registry};
use replywatch_daemon::sink::LogSink;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Time allowed for loops and ingress to drain after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// replywatch daemon - response-deadline tracking service
#[derive(Parser, Debug)]
#[command(name = "replywatch-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Store connection URL (overrides REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// Ingress HTTP port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Metrics HTTP port (overrides METRICS_PORT)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log level (overrides LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// Replica identity (overrides POD_ID)
    #[arg(long)]
    pod_id: Option<String>,
}

impl Args {
    fn apply(self, mut config: Config) -> Config {
        if let Some(redis_url) = self.redis_url {
            config.redis_url = redis_url;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(metrics_port) = self.metrics_port {
            config.metrics_port = metrics_port;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
        if let Some(pod_id) = self.pod_id {
            config.pod_id = pod_id;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().apply(Config::from_env());

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(pod_id = %config.pod_id, "starting timeout tracking service");

    // Store connectivity is a startup requirement; everything else
    // degrades, this does not.
    let store: Arc<dyn TimeoutStore> = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .context("failed to connect to store")?,
    );

    let metrics = new_shared_registry().context("failed to initialize metrics registry")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let index = TimeoutIndex::new(Arc::clone(&store), metrics.service().clone());
    let leader = Arc::new(LeaderElector::new(
        Arc::clone(&store),
        metrics.service().clone(),
        config.pod_id.clone(),
        config.leader_ttl(),
        config.election_interval(),
    ));
    let detector = TimeoutDetector::new(
        Arc::clone(&store),
        Arc::clone(&leader),
        Arc::clone(&clock),
        metrics.service().clone(),
        config.timeout_interval_ms,
        config.check_interval(),
    );
    let cleanup = CleanupTask::new(
        index.clone(),
        Arc::clone(&leader),
        Arc::clone(&clock),
        config.cleanup_interval(),
        config.max_age_ms(),
    );
    let consumer = Arc::new(EventConsumer::new(
        Arc::clone(&store),
        Arc::new(LogSink),
        metrics.service().clone(),
        config.consumer_group.clone(),
        config.consumer_name(),
    ));
    consumer
        .init()
        .await
        .context("failed to create consumer group")?;

    let mut tasks: Vec<JoinHandle<()>> = vec![
        tokio::spawn(Arc::clone(&leader).run(shutdown_rx.clone())),
        tokio::spawn(detector.run(shutdown_rx.clone())),
        tokio::spawn(cleanup.run(shutdown_rx.clone())),
        tokio::spawn(Arc::clone(&consumer).run(shutdown_rx.clone())),
        tokio::spawn(Arc::clone(&consumer).run_recovery(RECOVERY_INTERVAL, shutdown_rx.clone())),
    ];

    let state = Arc::new(AppState {
        index,
        leader: Arc::clone(&leader),
        metrics: Arc::clone(&metrics),
        clock,
        pod_id: config.pod_id.clone(),
    });

    tasks.push(spawn_metrics_server(
        Arc::clone(&metrics),
        SocketAddr::from((Ipv4Addr::LOCALHOST, config.metrics_port)),
        shutdown_rx.clone(),
    ));

    // Signal handling: first SIGTERM/SIGINT starts the graceful shutdown.
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(error = %err, "failed to register SIGTERM handler");
                return;
            },
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(error = %err, "failed to register SIGINT handler");
                return;
            },
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = signal_tx.send(true);
    });

    // Ingress serves until shutdown; binding failure is fatal.
    let ingress_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = tokio::net::TcpListener::bind(ingress_addr)
        .await
        .with_context(|| format!("failed to bind ingress server on {ingress_addr}"))?;
    info!(addr = %ingress_addr, "ingress HTTP server listening");

    let mut ingress_shutdown = shutdown_rx.clone();
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move {
            let _ = ingress_shutdown.changed().await;
        })
        .await
        .context("ingress server error")?;

    // Ensure loops stop even when the server exited on its own.
    let _ = shutdown_tx.send(true);

    info!("draining background tasks");
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    for task in tasks.drain(..) {
        if tokio::time::timeout_at(deadline, task).await.is_err() {
            warn!("background task did not stop within the shutdown grace period");
        }
    }

    info!("service shutdown complete");
    Ok(())
}

/// Serves `/metrics` on a dedicated localhost port for scraping.
fn spawn_metrics_server(
    metrics: SharedMetrics,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let handler = {
            let metrics = Arc::clone(&metrics);
            move || {
                let metrics = Arc::clone(&metrics);
                async move {
                    use axum::http::StatusCode;
                    use axum::response::IntoResponse;

                    match metrics.encode_text() {
                        Ok(body) => (
                            StatusCode::OK,
                            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                            body,
                        )
                            .into_response(),
                        Err(err) => {
                            error!(error = %err, "failed to encode metrics");
                            (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed").into_response()
                        },
                    }
                }
            }
        };

        let app = Router::new().route("/metrics", get(handler));

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(addr = %addr, error = %err, "failed to bind metrics server");
                return;
            },
        };
        info!(addr = %addr, "metrics HTTP server listening");

        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(err) = serve.await {
            error!(error = %err, "metrics server error");
        }
    })
}
