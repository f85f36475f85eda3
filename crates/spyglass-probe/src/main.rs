//! spyglass-probe — probe daemon for the spyglass fabric.
//!
//! Connects out to the coordinator (probes live behind NAT; nothing
//! dials them), advertises the configured task table, and executes
//! dispatched diagnostics until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use spyglass_core::protocol::{ProbeInfo, TaskDescriptor};
use spyglass_probe::client::StreamClient;
use spyglass_probe::config::ProbeDaemonConfig;
use spyglass_probe::netdetect;
use spyglass_probe::runtime::TaskRuntime;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// spyglass probe - remote diagnostics executor
#[derive(Parser, Debug)]
#[command(name = "spyglass-probe")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "probe.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args, config: &ProbeDaemonConfig) -> Result<()> {
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

    let mut config = ProbeDaemonConfig::from_file(&args.config)
        .with_context(|| format!("failed to load configuration {}", args.config.display()))?;
    init_logging(&args, &config)?;

    info!(
        id = %config.probe.id,
        name = %config.probe.name,
        location = %config.probe.metadata.location,
        "starting spyglass probe"
    );

    // Addresses are informational; detection failure is a warning.
    if config.probe.ipv4.is_empty() {
        match netdetect::public_ipv4().await {
            Some(ip) => {
                info!(ipv4 = %ip, "auto-detected public IPv4");
                config.probe.ipv4 = ip;
            }
            None => warn!("failed to auto-detect public IPv4"),
        }
    }
    if config.probe.ipv6.is_empty() {
        match netdetect::public_ipv6().await {
            Some(ip) => {
                info!(ipv6 = %ip, "auto-detected public IPv6");
                config.probe.ipv6 = ip;
            }
            None => info!("no public IPv6 detected (normal on v4-only hosts)"),
        }
    }

    let tasks = config
        .resolve_tasks()
        .context("failed to resolve task table")?;

    let descriptors: Vec<TaskDescriptor> = tasks
        .iter()
        .map(|task| TaskDescriptor {
            task_name: task.name.clone(),
            display_name: task.display_name.clone(),
            description: task.description.clone(),
            requires_target: task.requires_target,
        })
        .collect();
    for descriptor in &descriptors {
        info!(
            task = %descriptor.task_name,
            display_name = %descriptor.display_name,
            requires_target = descriptor.requires_target,
            "task advertised"
        );
    }

    let runtime = Arc::new(TaskRuntime::new(
        tasks,
        config.executor.global_concurrency,
        config.executor.default_timeout,
    ));

    let info = ProbeInfo {
        id: config.probe.id.clone(),
        display_name: config.probe.name.clone(),
        location: config.probe.metadata.location.clone(),
        provider: config.probe.metadata.provider.clone(),
        idc: config.probe.metadata.idc.clone(),
        description: config.probe.metadata.description.clone(),
        ipv4: config.probe.ipv4.clone(),
        ipv6: config.probe.ipv6.clone(),
        hide_ip: config.probe.hide_ip,
        max_concurrent: config.probe.max_concurrent,
        tasks: descriptors,
    };

    let client = Arc::new(StreamClient::new(
        config.coordinator.clone(),
        info,
        Arc::clone(&runtime),
    ));

    let shutdown = CancellationToken::new();
    let client_task = tokio::spawn(Arc::clone(&client).run(shutdown.clone()));

    info!("probe started in stream mode");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("shutting down probe...");
    shutdown.cancel();
    let _ = client_task.await;

    info!("probe stopped");
    Ok(())
}
