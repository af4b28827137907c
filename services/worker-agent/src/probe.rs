//! Health probing of locally-serving inference servers.
//!
//! A probe failure is never escalated: non-200 responses and I/O errors
//! both mean "not ready yet" and the sweep retries on its next pass.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::backend::BackendKind;
use crate::types::ModelInstance;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Readiness probe against a running server's control endpoint.
#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Whether the instance's server answers its health endpoint.
    async fn is_ready(&self, backend: BackendKind, instance: &ModelInstance) -> bool;
}

/// HTTP prober hitting the backend's health path with a short timeout.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");
        Self { client }
    }

    fn probe_url(backend: BackendKind, instance: &ModelInstance) -> Option<String> {
        let port = instance.port?;
        let host = if backend.probes_via_worker_ip() {
            instance.worker_ip.as_deref().unwrap_or("127.0.0.1")
        } else {
            "127.0.0.1"
        };
        Some(format!("http://{host}:{port}{}", backend.health_path()))
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn is_ready(&self, backend: BackendKind, instance: &ModelInstance) -> bool {
        let Some(url) = Self::probe_url(backend, instance) else {
            return false;
        };
        match self.client.get(&url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(_) => false,
        }
    }
}

/// Prober with per-instance scripted readiness, for tests.
#[derive(Default)]
pub struct MockProber {
    ready: std::sync::Mutex<HashSet<i64>>,
}

impl MockProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, instance_id: i64) {
        self.ready.lock().unwrap().insert(instance_id);
    }

    pub fn set_not_ready(&self, instance_id: i64) {
        self.ready.lock().unwrap().remove(&instance_id);
    }
}

#[async_trait]
impl HealthProber for MockProber {
    async fn is_ready(&self, _backend: BackendKind, instance: &ModelInstance) -> bool {
        self.ready.lock().unwrap().contains(&instance.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceState;

    fn instance(port: Option<u16>, worker_ip: Option<&str>) -> ModelInstance {
        ModelInstance {
            id: 7,
            name: "llama-7b-0".to_string(),
            model_id: 3,
            model_name: "llama-7b".to_string(),
            worker_id: Some(1),
            worker_ip: worker_ip.map(str::to_string),
            pid: None,
            port,
            ports: None,
            state: InstanceState::Initializing,
            state_message: String::new(),
            restart_count: None,
            last_restart_time: None,
            updated_at: None,
            distributed_servers: None,
        }
    }

    #[test]
    fn test_probe_url_defaults_to_loopback() {
        let url = HttpProber::probe_url(BackendKind::Vllm, &instance(Some(40001), Some("10.0.0.5")));
        assert_eq!(url.unwrap(), "http://127.0.0.1:40001/v1/models");
    }

    #[test]
    fn test_probe_url_uses_worker_ip_for_mindie() {
        let url = HttpProber::probe_url(
            BackendKind::AscendMindie,
            &instance(Some(40001), Some("10.0.0.5")),
        );
        assert_eq!(url.unwrap(), "http://10.0.0.5:40001/v1/models");
    }

    #[test]
    fn test_probe_url_requires_port() {
        assert!(HttpProber::probe_url(BackendKind::Vllm, &instance(None, None)).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_not_ready() {
        // Nothing listens on this port; must come back "not ready", not error.
        let prober = HttpProber::new();
        let ready = prober
            .is_ready(BackendKind::Vllm, &instance(Some(1), None))
            .await;
        assert!(!ready);
    }

    #[tokio::test]
    async fn test_mock_prober_scripting() {
        let prober = MockProber::new();
        let mi = instance(Some(40001), None);
        assert!(!prober.is_ready(BackendKind::Vllm, &mi).await);
        prober.set_ready(7);
        assert!(prober.is_ready(BackendKind::Vllm, &mi).await);
        prober.set_not_ready(7);
        assert!(!prober.is_ready(BackendKind::Vllm, &mi).await);
    }
}
