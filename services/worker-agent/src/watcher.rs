//! Model instance event loop.
//!
//! Subscribes to the control plane's instance watch stream and feeds
//! each event to the lifecycle coordinator. The subscription is
//! re-established after a fixed delay whenever the stream ends or
//! fails; missed events are recovered because the control plane replays
//! current instance state on (re)subscribe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::{ClientError, ControlPlaneClient};
use crate::coordinator::Coordinator;

/// Delay before re-opening a broken watch stream.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Event loop feeding instance change events to the coordinator.
pub struct Watcher {
    client: ControlPlaneClient,
    coordinator: Arc<Coordinator>,
}

impl Watcher {
    pub fn new(client: ControlPlaneClient, coordinator: Arc<Coordinator>) -> Self {
        Self {
            client,
            coordinator,
        }
    }

    /// Run the watch loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting model instance watch loop");

        loop {
            tokio::select! {
                result = self.watch_once() => {
                    match result {
                        Ok(()) => warn!("Model instance watch stream closed, reconnecting"),
                        Err(e) => warn!(error = %e, "Model instance watch failed, reconnecting"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Watcher shutting down");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Watcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One subscription: dispatch events until the stream ends.
    async fn watch_once(&self) -> Result<(), ClientError> {
        let mut stream = self.client.watch_instances().await?;
        while let Some(event) = stream.next().await? {
            self.coordinator.handle_event(event).await;
        }
        Ok(())
    }
}
