//! Periodic sweep loops.
//!
//! Two fixed-cadence passes run independently of the event stream: the
//! restart sweep reschedules remembered ERROR instances whose backoff
//! has elapsed, and the health sweep checks every locally-serving
//! process and confirms readiness.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::coordinator::Coordinator;

/// Sweep loop configuration.
pub struct SweeperConfig {
    /// Interval between restart policy passes.
    pub restart_interval: Duration,

    /// Interval between health check passes.
    pub health_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            restart_interval: Duration::from_secs(10),
            health_interval: Duration::from_secs(5),
        }
    }
}

/// Driver for the restart and health sweeps.
pub struct Sweeper {
    coordinator: Arc<Coordinator>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(coordinator: Arc<Coordinator>, config: SweeperConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Run both sweep loops until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            restart_interval_secs = self.config.restart_interval.as_secs(),
            health_interval_secs = self.config.health_interval.as_secs(),
            "Starting sweep loops"
        );

        let mut restart_interval = tokio::time::interval(self.config.restart_interval);
        let mut health_interval = tokio::time::interval(self.config.health_interval);

        loop {
            tokio::select! {
                _ = restart_interval.tick() => {
                    self.coordinator.restart_error_instances().await;
                }
                _ = health_interval.tick() => {
                    self.coordinator.health_sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
