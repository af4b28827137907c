//! modelplane Worker Agent
//!
//! Runs on each inference node. Watches the control plane's model
//! instance stream, launches and supervises inference server processes,
//! and reports state transitions back.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use modelplane_worker_agent::client::{ControlPlane, ControlPlaneClient};
use modelplane_worker_agent::config::Config;
use modelplane_worker_agent::coordinator::Coordinator;
use modelplane_worker_agent::probe::{HealthProber, HttpProber};
use modelplane_worker_agent::runtime::{HostRuntime, ServeRuntime};
use modelplane_worker_agent::sweeper::{Sweeper, SweeperConfig};
use modelplane_worker_agent::watcher::Watcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting modelplane worker agent");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        worker_id = config.worker_id,
        server_url = %config.server_url,
        log_dir = %config.log_dir,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Wire the coordinator to the real control plane, host runtime and
    // HTTP prober
    let control_plane: Arc<dyn ControlPlane> = Arc::new(ControlPlaneClient::new(&config));
    let runtime: Arc<dyn ServeRuntime> = Arc::new(HostRuntime::new());
    let prober: Arc<dyn HealthProber> = Arc::new(HttpProber::new());
    let coordinator = Arc::new(Coordinator::new(&config, control_plane, runtime, prober));

    // Start the event watch loop
    let watcher = Watcher::new(ControlPlaneClient::new(&config), Arc::clone(&coordinator));
    let watcher_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            watcher.run(shutdown_rx).await;
        }
    });

    // Start the restart + health sweep loops
    let sweeper = Sweeper::new(Arc::clone(&coordinator), SweeperConfig::default());
    let sweeper_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sweeper.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = watcher_handle => {
            info!("Watcher exited");
        }
        _ = sweeper_handle => {
            info!("Sweeper exited");
        }
    }

    // Signal shutdown to all loops. Running server processes are left
    // untouched; the control plane re-converges them on restart.
    let _ = shutdown_tx.send(true);

    // Give loops time to shut down gracefully
    info!("Waiting for loops to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Worker agent shutdown complete");
    Ok(())
}
