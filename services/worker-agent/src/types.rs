//! Shared types for model instances, models, and change events.
//!
//! These mirror the control plane's view of the world. The agent never
//! mutates a `ModelInstance` locally as a source of truth; all writes go
//! through `ModelInstancePatch` (see `patch`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

/// Model instance state as tracked by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Created, not yet placed on a worker.
    Pending,
    /// Placed on a worker, waiting for the worker to act.
    Scheduled,
    /// Server process launched, not yet servable.
    Initializing,
    /// Server process starting up (distributed main ready-enough state).
    Starting,
    /// Servable.
    Running,
    /// Failed; `state_message` carries the cause.
    Error,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "pending"),
            InstanceState::Scheduled => write!(f, "scheduled"),
            InstanceState::Initializing => write!(f, "initializing"),
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Error => write!(f, "error"),
        }
    }
}

/// Ordering policy between the main worker and subordinate workers of a
/// distributed serving topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationMode {
    /// Subordinates start first; the main worker waits for all of them.
    RunFirst,
    /// The main worker handles everything; subordinates ignore events.
    Delegated,
    /// Subordinates wait for the main worker to initialize, then start in
    /// list order.
    InitializeLater,
}

/// One non-main participant in a distributed serving topology. Its
/// `state`/`pid` fields are written only by the worker owning the slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubordinateWorker {
    pub worker_id: i64,
    pub worker_ip: String,
    pub state: InstanceState,
    #[serde(default)]
    pub state_message: String,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Multi-node serving topology for one model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedServers {
    pub mode: CoordinationMode,
    #[serde(default)]
    pub subordinate_workers: Vec<SubordinateWorker>,
}

/// A model instance assignment, owned by the control plane. The agent
/// holds a possibly-stale cached view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstance {
    pub id: i64,
    pub name: String,
    pub model_id: i64,
    pub model_name: String,
    #[serde(default)]
    pub worker_id: Option<i64>,
    #[serde(default)]
    pub worker_ip: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ports: Option<Vec<u16>>,
    pub state: InstanceState,
    #[serde(default)]
    pub state_message: String,
    #[serde(default)]
    pub restart_count: Option<i32>,
    #[serde(default)]
    pub last_restart_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub distributed_servers: Option<DistributedServers>,
}

impl ModelInstance {
    /// Position of the given worker in the subordinate list, if any.
    pub fn subordinate_position(&self, worker_id: i64) -> Option<usize> {
        self.distributed_servers
            .as_ref()?
            .subordinate_workers
            .iter()
            .position(|sw| sw.worker_id == worker_id)
    }

    /// The subordinate slot owned by the given worker.
    pub fn subordinate(&self, worker_id: i64) -> Option<(usize, &SubordinateWorker)> {
        let pos = self.subordinate_position(worker_id)?;
        let sw = &self.distributed_servers.as_ref()?.subordinate_workers[pos];
        Some((pos, sw))
    }
}

/// Model definition. Immutable once referenced by a running instance,
/// safe to cache for the instance's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub backend: BackendKind,
    /// Model weights location (local path or hub reference).
    pub source: String,
    #[serde(default)]
    pub backend_parameters: Vec<String>,
    #[serde(default)]
    pub restart_on_error: bool,
}

/// Change event type delivered by the instance watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Created => write!(f, "CREATED"),
            EventType::Updated => write!(f, "UPDATED"),
            EventType::Deleted => write!(f, "DELETED"),
        }
    }
}

/// One entry from the model instance watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: ModelInstance,
}
