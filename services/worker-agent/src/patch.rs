//! Typed partial updates for model instances.
//!
//! The control plane applies only the fields that are set, so concurrent
//! writers (main worker, subordinate workers, scheduler) never clobber
//! each other's fields. Subordinate slot updates are addressed by list
//! position and replace exactly one slot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{InstanceState, ModelInstance, SubordinateWorker};

/// Replacement of one subordinate slot, addressed by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubordinateWorkerPatch {
    pub index: usize,
    pub worker: SubordinateWorker,
}

/// Partial update for a model instance. Unset fields are left untouched
/// by the receiving side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInstancePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subordinate_worker: Option<SubordinateWorkerPatch>,
}

impl ModelInstancePatch {
    /// Top-level state transition with a message.
    pub fn state_change(state: InstanceState, message: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            state_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Replacement of the subordinate slot at `index`.
    pub fn subordinate_slot(index: usize, worker: SubordinateWorker) -> Self {
        Self {
            subordinate_worker: Some(SubordinateWorkerPatch { index, worker }),
            ..Default::default()
        }
    }

    /// Merge this patch into an instance, field by field. Defines the
    /// exact semantics the control plane applies server-side; also used
    /// by the in-memory control plane in tests.
    pub fn apply_to(&self, instance: &mut ModelInstance) {
        if let Some(state) = self.state {
            instance.state = state;
        }
        if let Some(message) = &self.state_message {
            instance.state_message = message.clone();
        }
        if let Some(port) = self.port {
            instance.port = Some(port);
        }
        if let Some(ports) = &self.ports {
            instance.ports = Some(ports.clone());
        }
        if let Some(pid) = self.pid {
            instance.pid = Some(pid);
        }
        if let Some(count) = self.restart_count {
            instance.restart_count = Some(count);
        }
        if let Some(t) = self.last_restart_time {
            instance.last_restart_time = Some(t);
        }
        if let Some(sub) = &self.subordinate_worker {
            if let Some(slot) = instance
                .distributed_servers
                .as_mut()
                .and_then(|d| d.subordinate_workers.get_mut(sub.index))
            {
                *slot = sub.worker.clone();
            }
        }
    }
}
