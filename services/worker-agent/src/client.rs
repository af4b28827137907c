//! Control plane API client for the worker agent.
//!
//! Provides the read/patch surface the lifecycle coordinator needs
//! (instance lookup, model lookup, partial updates) plus the long-lived
//! model instance watch. "Not found" is its own error variant because
//! the coordinator treats it as a benign race everywhere.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::patch::ModelInstancePatch;
use crate::types::{InstanceEvent, Model, ModelInstance};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The object was deleted concurrently; callers suppress this.
    #[error("not found")]
    NotFound,
    #[error("api error: {status} - {body}")]
    Api { status: u16, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("failed to decode event: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Control plane surface used by the lifecycle coordinator.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_instance(&self, id: i64) -> Result<ModelInstance, ClientError>;

    async fn get_model(&self, id: i64) -> Result<Model, ClientError>;

    /// Apply a partial update; only set fields are touched server-side.
    async fn patch_instance(&self, id: i64, patch: &ModelInstancePatch)
        -> Result<(), ClientError>;
}

// =============================================================================
// HTTP client
// =============================================================================

/// HTTP control plane client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.server_url.clone(),
        }
    }

    /// Open the long-lived model instance watch.
    ///
    /// The response is a newline-delimited JSON stream of events. The
    /// request itself carries no timeout; the overall client timeout is
    /// bypassed by streaming the body.
    pub async fn watch_instances(&self) -> Result<EventStream, ClientError> {
        let url = format!("{}/v1/model-instances?watch=true", self.base_url);
        debug!(url = %url, "Opening model instance watch");

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(3600 * 24))
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(EventStream {
            response,
            buf: Vec::new(),
        })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn get_instance(&self, id: i64) -> Result<ModelInstance, ClientError> {
        let url = format!("{}/v1/model-instances/{}", self.base_url, id);
        let response = check_status(self.client.get(&url).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn get_model(&self, id: i64) -> Result<Model, ClientError> {
        let url = format!("{}/v1/models/{}", self.base_url, id);
        let response = check_status(self.client.get(&url).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn patch_instance(
        &self,
        id: i64,
        patch: &ModelInstancePatch,
    ) -> Result<(), ClientError> {
        let url = format!("{}/v1/model-instances/{}", self.base_url, id);
        debug!(instance_id = id, "Patching model instance");
        check_status(self.client.patch(&url).json(patch).send().await?).await?;
        Ok(())
    }
}

/// Buffered reader over the newline-delimited JSON watch stream.
pub struct EventStream {
    response: reqwest::Response,
    buf: Vec<u8>,
}

impl EventStream {
    /// Next event, or `Ok(None)` when the server closed the stream.
    pub async fn next(&mut self) -> Result<Option<InstanceEvent>, ClientError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(serde_json::from_str(line)?));
            }
            match self.response.chunk().await? {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => {
                    // Residual unterminated line at end of stream.
                    let rest: Vec<u8> = std::mem::take(&mut self.buf);
                    let rest = String::from_utf8_lossy(&rest);
                    let rest = rest.trim();
                    if rest.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(serde_json::from_str(rest)?));
                }
            }
        }
    }
}

// =============================================================================
// In-memory control plane (tests)
// =============================================================================

#[derive(Default)]
struct MockState {
    instances: HashMap<i64, ModelInstance>,
    models: HashMap<i64, Model>,
    patches: Vec<(i64, ModelInstancePatch)>,
}

/// In-memory control plane for tests: applies patches via the merge
/// function and records them for assertions.
#[derive(Default)]
pub struct MockControlPlane {
    state: Mutex<MockState>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_instance(&self, instance: ModelInstance) {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(instance.id, instance);
    }

    pub fn put_model(&self, model: Model) {
        self.state.lock().unwrap().models.insert(model.id, model);
    }

    pub fn remove_instance(&self, id: i64) {
        self.state.lock().unwrap().instances.remove(&id);
    }

    pub fn instance(&self, id: i64) -> Option<ModelInstance> {
        self.state.lock().unwrap().instances.get(&id).cloned()
    }

    /// All recorded patches, in application order.
    pub fn patches(&self) -> Vec<(i64, ModelInstancePatch)> {
        self.state.lock().unwrap().patches.clone()
    }

    /// Recorded patches for one instance.
    pub fn patches_for(&self, id: i64) -> Vec<ModelInstancePatch> {
        self.state
            .lock()
            .unwrap()
            .patches
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn get_instance(&self, id: i64) -> Result<ModelInstance, ClientError> {
        self.state
            .lock()
            .unwrap()
            .instances
            .get(&id)
            .cloned()
            .ok_or(ClientError::NotFound)
    }

    async fn get_model(&self, id: i64) -> Result<Model, ClientError> {
        self.state
            .lock()
            .unwrap()
            .models
            .get(&id)
            .cloned()
            .ok_or(ClientError::NotFound)
    }

    async fn patch_instance(
        &self,
        id: i64,
        patch: &ModelInstancePatch,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        let Some(instance) = state.instances.get_mut(&id) else {
            return Err(ClientError::NotFound);
        };
        patch.apply_to(instance);
        state.patches.push((id, patch.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::types::InstanceState;

    fn instance(id: i64) -> ModelInstance {
        ModelInstance {
            id,
            name: format!("llama-7b-{id}"),
            model_id: 3,
            model_name: "llama-7b".to_string(),
            worker_id: Some(1),
            worker_ip: None,
            pid: None,
            port: None,
            ports: None,
            state: InstanceState::Scheduled,
            state_message: String::new(),
            restart_count: None,
            last_restart_time: None,
            updated_at: None,
            distributed_servers: None,
        }
    }

    #[tokio::test]
    async fn test_mock_control_plane_patch_applies_and_records() {
        let plane = MockControlPlane::new();
        plane.put_instance(instance(7));

        let patch = ModelInstancePatch {
            state: Some(InstanceState::Initializing),
            port: Some(40001),
            ..Default::default()
        };
        plane.patch_instance(7, &patch).await.unwrap();

        let mi = plane.instance(7).unwrap();
        assert_eq!(mi.state, InstanceState::Initializing);
        assert_eq!(mi.port, Some(40001));
        assert_eq!(plane.patches_for(7).len(), 1);
    }

    #[tokio::test]
    async fn test_mock_control_plane_not_found() {
        let plane = MockControlPlane::new();
        assert!(matches!(
            plane.get_instance(1).await,
            Err(ClientError::NotFound)
        ));
        assert!(matches!(
            plane
                .patch_instance(1, &ModelInstancePatch::default())
                .await,
            Err(ClientError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_mock_control_plane_model_lookup() {
        let plane = MockControlPlane::new();
        plane.put_model(Model {
            id: 3,
            name: "llama-7b".to_string(),
            backend: BackendKind::Vllm,
            source: "/models/llama-7b".to_string(),
            backend_parameters: vec![],
            restart_on_error: true,
        });
        let model = plane.get_model(3).await.unwrap();
        assert_eq!(model.backend, BackendKind::Vllm);
        assert!(model.restart_on_error);
    }
}
