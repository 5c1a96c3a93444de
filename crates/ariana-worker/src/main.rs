#![forbid(unsafe_code)]

//! Worker service binary.
//!
//! Boots the per-VM worker runtime and serves the encrypted API until the
//! process receives a shutdown signal. The streaming assistant provider is
//! wired at deployment; without one the worker still serves setup, git, and
//! automation traffic.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ariana_types::CoreError;
use ariana_worker::{
    api, AssistantQuery, AssistantStream, HttpImageInstaller, Worker, WorkerConfig,
};

#[derive(Parser)]
#[command(name = "ariana-worker")]
#[command(about = "Ariana worker - per-VM agent runtime")]
#[command(version)]
struct Cli {
    /// HTTP port for the encrypted API
    #[arg(long, default_value = "8420")]
    port: u16,

    /// Working tree directory
    #[arg(long, default_value = "/workspace/project")]
    project_dir: PathBuf,

    /// Automation state directory (scripts, vars, action spool)
    #[arg(long, default_value = "/tmp/ariana-automations")]
    automations_dir: PathBuf,

    /// Home directory holding the conversation snapshot
    #[arg(long, env = "HOME", default_value = "/root")]
    home_dir: PathBuf,

    /// Agent secret the wire cipher derives from
    #[arg(long, env = "ARIANA_AGENT_SECRET", hide_env_values = true)]
    agent_secret: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Placeholder assistant used until a vendor provider is wired at deployment.
struct UnconfiguredAssistant;

#[async_trait]
impl AssistantQuery for UnconfiguredAssistant {
    async fn query(
        &self,
        _session_id: Option<String>,
        _prompt: String,
        _model: Option<String>,
        _cancel: CancellationToken,
    ) -> Result<AssistantStream, CoreError> {
        Err(CoreError::AssistantFailure(
            "no assistant provider configured".to_string(),
        ))
    }

    async fn interrupt(&self) {}

    async fn oneshot(&self, _prompt: String, _model: String) -> Result<String, CoreError> {
        Err(CoreError::AssistantFailure(
            "no assistant provider configured".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    info!("Starting Ariana worker v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig {
        project_dir: cli.project_dir.clone(),
        automations_dir: cli.automations_dir.clone(),
        home_dir: cli.home_dir.clone(),
        agent_secret: cli.agent_secret.clone(),
    };
    let installer = Arc::new(HttpImageInstaller::new(
        cli.automations_dir.join("restore").join("image.img"),
    ));
    let worker = Worker::new(config, Arc::new(UnconfiguredAssistant), installer);

    let app = api::router(worker.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cli.port))
        .await
        .with_context(|| format!("Failed to bind to port {}", cli.port))?;
    info!("Worker API listening on port {}", cli.port);

    let shutdown = worker.shutdown_token();
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
    info!("Ariana worker stopped");
    Ok(())
}

fn init_logging(log_level: &str) {
    let filter = format!("ariana_worker={log_level},tower_http=warn");
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
