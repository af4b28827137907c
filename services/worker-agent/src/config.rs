//! Configuration for the worker agent.

use anyhow::{Context, Result};

use crate::ports::PortRange;

/// Worker agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier assigned to this worker by the control plane.
    pub worker_id: i64,

    /// Control plane API URL.
    pub server_url: String,

    /// Root directory for serve logs.
    pub log_dir: String,

    /// Port range for inference server processes.
    pub service_port_range: PortRange,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let worker_id = std::env::var("MODELPLANE_WORKER_ID")
            .context("MODELPLANE_WORKER_ID must be set")?
            .parse()
            .context("MODELPLANE_WORKER_ID must be an integer")?;

        let server_url = std::env::var("MODELPLANE_SERVER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let log_dir = std::env::var("MODELPLANE_LOG_DIR")
            .unwrap_or_else(|_| "/var/lib/modelplane/log".to_string());

        let service_port_range = std::env::var("MODELPLANE_SERVICE_PORT_RANGE")
            .unwrap_or_else(|_| "40000-41024".to_string())
            .parse()
            .context("MODELPLANE_SERVICE_PORT_RANGE must look like 40000-41024")?;

        Ok(Self {
            worker_id,
            server_url,
            log_dir,
            service_port_range,
        })
    }

    /// Serve log root under the configured log directory.
    pub fn serve_log_root(&self) -> String {
        format!("{}/serve", self.log_dir)
    }
}
