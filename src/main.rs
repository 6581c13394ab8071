//! Local Storage Manager
//!
//! Node agent binary: loads the node config, wires the storage engines to
//! the event bus and runs the reconciliation loop, the consistency sweep,
//! capacity publication and the HTTP API until interrupted.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_storage_manager::api::{self, RestRouter};
use local_storage_manager::controller::{ConsistencySweeper, Reconciler};
use local_storage_manager::crd::{KubeCapacitySink, KubeDesiredState};
use local_storage_manager::domain::ports::{CapacitySinkRef, DesiredStateSourceRef, ExecutorRef};
use local_storage_manager::events::{
    CapacityPublisher, EventBus, StorageMetrics, TopologyRef, WatchCapacitySink,
};
use local_storage_manager::hardware::{node_hostname, DiskScanner};
use local_storage_manager::storage::{CommandExecutor, LockManager, LvmEngine, PartitionEngine};
use local_storage_manager::ConfigWatcher;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local Storage Manager - node-local LVM and raw-partition provisioning
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node config file (YAML)
    #[arg(long, env = "CONFIG_PATH", default_value = "/etc/local-storage/config.yaml")]
    config: PathBuf,

    /// Node name; overrides the config file
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = api::DEFAULT_API_ADDR)]
    api_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Config file poll interval in seconds
    #[arg(long, env = "CONFIG_POLL_SECS", default_value = "30")]
    config_poll_secs: u64,

    /// Consistency sweep interval in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "600")]
    sweep_interval_secs: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Local Storage Manager");
    info!("  Version: {}", local_storage_manager::VERSION);
    info!("  Config: {}", args.config.display());
    info!("  REST API: {}", args.api_addr);
    info!("  Standalone mode: {}", args.standalone);

    let api_addr: SocketAddr = args
        .api_addr
        .parse()
        .with_context(|| format!("Invalid REST API address: {}", args.api_addr))?;

    let cli_node_name = args.node_name.clone();
    let (watcher, config_rx) = ConfigWatcher::new(
        &args.config,
        Duration::from_secs(args.config_poll_secs.max(1)),
        move |config| {
            if let Some(name) = &cli_node_name {
                config.node_name = name.clone();
            } else if config.node_name.is_empty() {
                config.node_name = node_hostname();
            }
        },
    )
    .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    let config = config_rx.borrow().clone();
    let node_name = config.node_name.clone();
    info!(
        node = %node_name,
        selectors = config.disk_selectors.len(),
        interval_secs = config.scan_interval().as_secs(),
        "Node config loaded"
    );

    // Engines
    let exec: ExecutorRef = Arc::new(CommandExecutor::new());
    let locks = LockManager::new();
    let events = EventBus::with_timeout(config.event_timeout());
    let lvm = LvmEngine::new(exec.clone(), locks.clone(), events.clone());
    let partitions = PartitionEngine::new(exec.clone(), locks, events.clone());
    let topology = TopologyRef::default();

    // Capacity sinks and desired state
    let metrics = StorageMetrics::new().context("Failed to register metrics")?;
    let (watch_sink, capacity_rx) = WatchCapacitySink::new();
    let mut sinks: Vec<CapacitySinkRef> = Vec::new();
    sinks.push(watch_sink);
    sinks.push(metrics.clone());

    // Without a cluster there is no desired state to sweep against
    let desired: Option<DesiredStateSourceRef> = if args.standalone {
        warn!("Standalone mode: capacity stays in-process and the consistency sweep is disabled");
        None
    } else {
        let client = kube::Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        sinks.push(Arc::new(KubeCapacitySink::new(client.clone())));
        let source: DesiredStateSourceRef = Arc::new(KubeDesiredState::new(client, node_name.clone()));
        Some(source)
    };

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    // Subscribers attach before any producer starts
    let publisher = CapacityPublisher::new(
        node_name.clone(),
        lvm.clone(),
        partitions.clone(),
        topology.clone(),
        sinks,
    );
    tasks.push(publisher.spawn(&events, shutdown.clone()));
    tasks.push(metrics.clone().spawn(&events, shutdown.clone()));

    tasks.push(tokio::spawn(watcher.run(shutdown.clone())));

    let reconciler = Reconciler::new(
        DiskScanner::default_scanner(exec),
        lvm.clone(),
        partitions.clone(),
        events,
        topology.clone(),
        config_rx,
    )
    .with_metrics(metrics.clone());
    tasks.push(tokio::spawn(reconciler.run(shutdown.clone())));

    if let Some(desired) = desired {
        let sweeper = ConsistencySweeper::new(lvm.clone(), partitions, desired, topology);
        tasks.push(tokio::spawn(sweeper.run(
            Duration::from_secs(args.sweep_interval_secs.max(60)),
            shutdown.clone(),
        )));
    }

    let router = RestRouter::new(lvm, metrics, capacity_rx);
    let api_shutdown = shutdown.clone();
    let api_task = tokio::spawn(async move { api::serve(api_addr, router, api_shutdown).await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("REST server error: {}", e),
        Err(e) => error!("REST server task failed: {}", e),
    }
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("Background task failed: {}", e);
        }
    }

    info!("Local storage manager shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
