#![forbid(unsafe_code)]

//! Controller service binary.
//!
//! Wires the repositories, pool, quota guard, snapshot service, and
//! orchestrator, then serves the user-facing API. Scheduled jobs run only on
//! instance index 0. `--dev` swaps the cloud collaborators for in-process
//! fakes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ariana_controller::{
    providers::fakes::{FakeBlobStore, FakeMachineProvider},
    routes::{self, AppState},
    EnvironmentRegistry, EventPoller, HttpWorkerTransport, InMemoryBus, MachinePool,
    Orchestrator, OrchestratorConfig, PortDomainRegistry, QuotaGuard, QuotaLimits,
    SnapshotService, MAX_ACTIVE_MACHINES,
};
use ariana_store::Repositories;

#[derive(Parser)]
#[command(name = "ariana-controller")]
#[command(about = "Ariana controller - agent orchestration control plane")]
#[command(version)]
struct Cli {
    /// HTTP port for the user-facing API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Machine pool capacity
    #[arg(long, default_value_t = MAX_ACTIVE_MACHINES)]
    max_machines: usize,

    /// Replica index; scheduled jobs run on index 0 only
    #[arg(long, default_value = "0")]
    instance_index: usize,

    /// Use in-process fake cloud collaborators
    #[arg(long)]
    dev: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    info!("Starting Ariana controller v{}", env!("CARGO_PKG_VERSION"));

    if !cli.dev {
        // Production providers are wired by the deployment build; the open
        // core ships the fakes only.
        warn!("no cloud provider configured; falling back to --dev collaborators");
    }
    let provider = Arc::new(FakeMachineProvider::new());
    let blobs = Arc::new(FakeBlobStore::new());

    let repos = Repositories::in_memory();
    let pool = Arc::new(MachinePool::new(
        repos.clone(),
        provider.clone(),
        cli.max_machines,
    ));
    let quota = Arc::new(QuotaGuard::new(repos.usage.clone(), QuotaLimits::default()));
    let snapshots = Arc::new(SnapshotService::new(
        repos.snapshots.clone(),
        blobs,
        provider,
    ));
    let transport = Arc::new(HttpWorkerTransport::new(Duration::from_secs(30)));
    let environments = Arc::new(EnvironmentRegistry::new());
    let bus = InMemoryBus::default();

    let orchestrator = Orchestrator::new(
        repos,
        pool,
        quota,
        snapshots.clone(),
        transport,
        environments,
        Arc::new(PortDomainRegistry::new("apps.ariana.dev")),
        bus,
        OrchestratorConfig::default(),
    );

    let shutdown = CancellationToken::new();

    let poller = Arc::new(EventPoller::new(orchestrator.clone()));
    tokio::spawn(poller.run(shutdown.clone()));

    if cli.instance_index == 0 {
        spawn_scheduled_jobs(orchestrator.clone(), snapshots, shutdown.clone());
    } else {
        info!(
            instance = cli.instance_index,
            "scheduled jobs disabled on this replica"
        );
    }

    let app = routes::router(AppState {
        orchestrator: orchestrator.clone(),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cli.port))
        .await
        .with_context(|| format!("Failed to bind to port {}", cli.port))?;
    info!("Controller API listening on port {}", cli.port);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
    }

    shutdown.cancel();
    info!("Ariana controller stopped");
    Ok(())
}

/// Background loops owned by instance 0.
fn spawn_scheduled_jobs(
    orchestrator: Arc<Orchestrator>,
    snapshots: Arc<SnapshotService>,
    shutdown: CancellationToken,
) {
    // Auto-restore sweep.
    {
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15 * 60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let restored = orchestrator.auto_restore_sweep().await;
                        if restored > 0 {
                            info!(restored, "auto-restore sweep completed");
                        }
                    }
                }
            }
        });
    }

    // Snapshot garbage collection, daily.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = snapshots.collect_garbage().await {
                            error!("snapshot GC failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    // Custom-machine health checks and pool reconciliation.
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    orchestrator.check_custom_machines().await;
                    if let Err(e) = orchestrator.pool.reconcile().await {
                        error!("pool reconciliation failed: {}", e);
                    }
                }
            }
        }
    });
}

fn init_logging(log_level: &str) {
    let filter = format!("ariana_controller={log_level},tower_http=warn");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("failed to install signal handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
