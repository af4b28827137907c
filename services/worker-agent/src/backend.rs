//! Inference server backends.
//!
//! A backend is the pluggable launcher for one kind of inference server:
//! it knows how to build the launch command for a model instance and what
//! readiness conventions the server follows.

use serde::{Deserialize, Serialize};

use crate::types::{Model, ModelInstance};

/// Supported inference server kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    LlamaBox,
    VoxBox,
    Vllm,
    AscendMindie,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::LlamaBox => write!(f, "llama-box"),
            BackendKind::VoxBox => write!(f, "vox-box"),
            BackendKind::Vllm => write!(f, "vllm"),
            BackendKind::AscendMindie => write!(f, "ascend-mindie"),
        }
    }
}

/// Program and arguments to launch a server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl BackendKind {
    /// Health check path served once the backend is servable.
    ///
    /// `/v1/models` is served by every backend; llama-box exposes a
    /// dedicated `/health` that avoids error logs on the server side.
    pub fn health_path(&self) -> &'static str {
        match self {
            BackendKind::LlamaBox => "/health",
            _ => "/v1/models",
        }
    }

    /// Whether the readiness probe must use the worker's external IP.
    /// Loopback connectivity does not work for Ascend MindIE.
    pub fn probes_via_worker_ip(&self) -> bool {
        matches!(self, BackendKind::AscendMindie)
    }

    /// Whether subordinate workers have no separate readiness signal and
    /// report RUNNING as soon as their process is launched.
    pub fn subordinate_ready_at_start(&self) -> bool {
        matches!(self, BackendKind::AscendMindie)
    }

    /// Whether a distributed topology needs a second reserved port for
    /// subordinate-watch coordination.
    pub fn needs_coordination_port(&self) -> bool {
        matches!(self, BackendKind::AscendMindie)
    }

    /// Build the launch command for an instance of the given model.
    ///
    /// Expects the instance port to be assigned already.
    pub fn launch_command(&self, model: &Model, instance: &ModelInstance) -> LaunchCommand {
        let port = instance.port.unwrap_or(0).to_string();
        let mut args: Vec<String> = match self {
            BackendKind::LlamaBox => vec![
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                port,
                "-m".to_string(),
                model.source.clone(),
                "--alias".to_string(),
                model.name.clone(),
            ],
            BackendKind::VoxBox => vec![
                "start".to_string(),
                "--model".to_string(),
                model.source.clone(),
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                port,
            ],
            BackendKind::Vllm => vec![
                "serve".to_string(),
                model.source.clone(),
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                port,
                "--served-model-name".to_string(),
                model.name.clone(),
            ],
            BackendKind::AscendMindie => {
                let mut a = vec![
                    "--model-name".to_string(),
                    model.name.clone(),
                    "--model-weight-path".to_string(),
                    model.source.clone(),
                    "--port".to_string(),
                    port,
                ];
                // Second reserved port carries inter-node coordination.
                if let Some(ports) = &instance.ports {
                    if let Some(watch_port) = ports.get(1) {
                        a.push("--inter-node-port".to_string());
                        a.push(watch_port.to_string());
                    }
                }
                a
            }
        };
        args.extend(model.backend_parameters.iter().cloned());

        let program = match self {
            BackendKind::LlamaBox => "llama-box",
            BackendKind::VoxBox => "vox-box",
            BackendKind::Vllm => "vllm",
            BackendKind::AscendMindie => "mindieservice_daemon",
        };

        LaunchCommand {
            program: program.to_string(),
            args,
        }
    }
}
