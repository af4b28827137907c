//! Coordination gate: decides whether this worker must act on an
//! instance-change event now, later, or never.
//!
//! Pure function over the event's instance snapshot; all waiting is
//! re-evaluated on the next relevant event rather than polled.

use crate::types::{CoordinationMode, InstanceState, ModelInstance};

/// Outcome of the gate for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// This worker must act on the event now.
    Proceed,
    /// This worker will act later; the reason is logged, not an error.
    Wait(String),
    /// This worker is not involved in the event.
    Ignore,
}

/// Evaluate the gate for an instance event observed by `self_worker_id`.
pub fn should_act(mi: &ModelInstance, self_worker_id: i64) -> GateDecision {
    if mi.worker_id == Some(self_worker_id) {
        return gate_main(mi);
    }
    gate_subordinate(mi, self_worker_id)
}

fn gate_main(mi: &ModelInstance) -> GateDecision {
    if let Some(ds) = &mi.distributed_servers {
        if ds.mode == CoordinationMode::RunFirst && !ds.subordinate_workers.is_empty() {
            let ready = ds
                .subordinate_workers
                .iter()
                .all(|sw| sw.state == InstanceState::Running);
            if !ready {
                return GateDecision::Wait(
                    "waiting for all subordinate workers to be ready".to_string(),
                );
            }
        }
    }
    GateDecision::Proceed
}

fn gate_subordinate(mi: &ModelInstance, self_worker_id: i64) -> GateDecision {
    let Some(ds) = &mi.distributed_servers else {
        return GateDecision::Ignore;
    };
    // The main worker is responsible for the whole topology.
    if ds.mode == CoordinationMode::Delegated {
        return GateDecision::Ignore;
    }
    if mi.subordinate_position(self_worker_id).is_none() {
        return GateDecision::Ignore;
    }
    if ds.mode == CoordinationMode::InitializeLater
        && !matches!(
            mi.state,
            InstanceState::Starting | InstanceState::Running | InstanceState::Error
        )
    {
        return GateDecision::Wait(format!(
            "waiting for main worker {} to be initialized",
            mi.worker_ip.as_deref().unwrap_or("unknown")
        ));
    }
    // Earlier subordinates must reach a terminal-ready state first; this
    // guards against acting on a stale read of shared state.
    for sw in &ds.subordinate_workers {
        if sw.worker_id == self_worker_id {
            break;
        }
        if !matches!(sw.state, InstanceState::Running | InstanceState::Error) {
            return GateDecision::Wait(format!(
                "waiting for previous subordinate worker {} to be ready",
                sw.worker_ip
            ));
        }
    }
    GateDecision::Proceed
}
