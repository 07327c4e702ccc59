//! herdd — the ollaherd daemon.
//!
//! Single binary: loads `clusterconfig.json` (creating it with defaults if
//! missing), fills the worker pool to its minimum, starts the control loop
//! and the config watcher, and serves the HTTP control plane until Ctrl-C.
//! On shutdown every worker subprocess is killed before the daemon exits.
//!
//! # Usage
//!
//! ```text
//! herdd --port 5000 --config clusterconfig.json
//! ```

mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use herd_core::ClusterConfig;
use herd_dispatch::Dispatcher;
use herd_pool::{ControlLoop, Supervisor};

#[derive(Parser)]
#[command(name = "herdd", about = "Local Ollama worker-pool supervisor")]
struct Cli {
    /// Port for the HTTP control plane.
    #[arg(long, default_value = "5000")]
    port: u16,

    /// Path to the cluster configuration file.
    #[arg(long, default_value = "clusterconfig.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,herdd=debug,herd=debug")),
        )
        .init();

    let cli = Cli::parse();

    let config = ClusterConfig::load_or_create(&cli.config)?;
    info!(path = ?cli.config, model = %config.model, "configuration loaded");
    let (config_tx, config_rx) = watch::channel(config);

    // ── Worker pool ────────────────────────────────────────────

    let supervisor = Arc::new(Supervisor::new(config_rx.clone()));
    supervisor.initial_fill().await;

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control = ControlLoop::new(supervisor.clone(), config_rx.clone());
    let control_shutdown = shutdown_rx.clone();
    let control_handle = tokio::spawn(async move {
        control.run(control_shutdown).await;
    });

    let watcher_path = cli.config.clone();
    let watcher_shutdown = shutdown_rx.clone();
    let watcher_handle = tokio::spawn(async move {
        watcher::watch_config(watcher_path, config_tx, watcher_shutdown).await;
    });

    // ── Control plane ──────────────────────────────────────────

    let dispatcher = Arc::new(Dispatcher::new(supervisor.clone()));
    let router = herd_api::build_router(supervisor.clone(), dispatcher);

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
    info!(%addr, "control plane starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = control_handle.await;
    let _ = watcher_handle.await;

    // Kill every subprocess before exit so no inference servers linger.
    supervisor.shutdown().await;

    info!("herdd stopped");
    Ok(())
}
