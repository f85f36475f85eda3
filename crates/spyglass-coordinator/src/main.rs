//! spyglass-coordinator — coordinator daemon for the spyglass fabric.
//!
//! Listens for probe streams on the probe port and client WebSocket
//! sessions on the client port, and runs until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use spyglass_coordinator::auth::Authenticator;
use spyglass_coordinator::config::CoordinatorConfig;
use spyglass_coordinator::probe_server::ProbeServer;
use spyglass_coordinator::registry::ProbeRegistry;
use spyglass_coordinator::scheduler::Scheduler;
use spyglass_coordinator::streams::{StreamRegistry, TaskDispatcher};
use spyglass_coordinator::ws::ClientHub;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// spyglass coordinator - network diagnostics dispatch
#[derive(Parser, Debug)]
#[command(name = "spyglass-coordinator")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "coordinator.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args, config: &CoordinatorConfig) -> Result<()> {
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log.level.clone());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = args.log_file.clone().or_else(|| config.log.file.clone());
    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = CoordinatorConfig::from_file(&args.config)
        .with_context(|| format!("failed to load configuration {}", args.config.display()))?;
    init_logging(&args, &config)?;

    info!(
        probe_port = config.server.probe_port,
        client_port = config.server.client_port,
        auth_mode = ?config.auth.mode,
        "starting spyglass coordinator"
    );

    let authenticator = Arc::new(
        Authenticator::new(&config.auth)
            .map_err(anyhow::Error::msg)
            .context("failed to build authenticator")?,
    );

    let registry = Arc::new(ProbeRegistry::new(
        config.probe.heartbeat_timeout,
        config.concurrency.probe_default_max,
    ));
    let streams = Arc::new(StreamRegistry::new());
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&registry),
        Arc::clone(&streams) as Arc<dyn TaskDispatcher>,
        config.concurrency.global_max,
        config.scheduler.output_filter.clone(),
    ));

    let hub = Arc::new(ClientHub::new(Arc::clone(&registry), Arc::clone(&scheduler)));

    // Every registry transition pushes the full masked list to every
    // connected client.
    {
        let hub = Arc::clone(&hub);
        registry.subscribe(Arc::new(move |snapshots| {
            hub.broadcast_status_update(&snapshots);
        }));
    }

    let shutdown = CancellationToken::new();

    let sweeper = Arc::clone(&registry)
        .spawn_sweeper(config.probe.offline_check_interval, shutdown.clone());

    let probe_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.server.probe_port))
            .await
            .with_context(|| format!("failed to bind probe port {}", config.server.probe_port))?;
    let probe_server = Arc::new(ProbeServer::new(
        Arc::clone(&registry),
        Arc::clone(&streams),
        Arc::clone(&scheduler),
        authenticator,
        config.probe.heartbeat_interval,
    ));
    let probe_task = tokio::spawn(probe_server.run(probe_listener, shutdown.clone()));

    let client_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.server.client_port))
            .await
            .with_context(|| format!("failed to bind client port {}", config.server.client_port))?;
    let app = hub.router();
    let http_shutdown = shutdown.clone();
    let client_task = tokio::spawn(async move {
        let serve = axum::serve(client_listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await });
        if let Err(err) = serve.await {
            tracing::error!(error = %err, "client server error");
        }
    });

    info!("coordinator started");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("shutting down coordinator...");
    shutdown.cancel();

    // Probes reconnect on their own after a restart; in-flight tasks
    // are lost by design (no persistent state).
    let _ = probe_task.await;
    let _ = client_task.await;
    sweeper.abort();

    info!("coordinator stopped");
    Ok(())
}
