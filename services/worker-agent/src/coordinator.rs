//! Lifecycle coordinator: the worker-side state machine for model
//! instances.
//!
//! The coordinator owns all local bookkeeping for instances served on
//! this node, reacts to instance change events, drives server processes
//! through the runtime, and reports state transitions back to the
//! control plane with optimistic partial updates. It never mutates the
//! control plane's copy except through explicit patches.
//!
//! All local maps live in one `CoordinatorState` behind a single mutex;
//! event dispatch and each sweep pass hold the lock for their duration,
//! so the interleaving guarantees match the original single-threaded
//! design.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::BackendKind;
use crate::client::{ClientError, ControlPlane};
use crate::config::Config;
use crate::gate::{self, GateDecision};
use crate::logdir::ServeLogDir;
use crate::patch::ModelInstancePatch;
use crate::ports::{self, PortRange};
use crate::probe::HealthProber;
use crate::restart;
use crate::runtime::{ProcessHandle, ServeRuntime, SpawnSpec};
use crate::types::{EventType, InstanceEvent, InstanceState, Model, ModelInstance};

/// Local bookkeeping, exclusively owned by the coordinator.
#[derive(Default)]
struct CoordinatorState {
    /// Instance id -> live process handle. At most one per id.
    serving: HashMap<i64, Box<dyn ProcessHandle>>,
    /// Instance id -> ports reserved by its process. Same keys as
    /// `serving`.
    serving_ports: HashMap<i64, HashSet<u16>>,
    /// Instance ids launched but not yet confirmed servable.
    starting: HashSet<i64>,
    /// Instance id -> cached model definition (immutable per instance).
    model_cache: HashMap<i64, Model>,
    /// Instance id -> remembered ERROR snapshot for the restart sweep.
    error_instances: HashMap<i64, ModelInstance>,
}

/// Read-only view of the local bookkeeping, for tests and debugging.
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot {
    pub serving: Vec<i64>,
    pub serving_ports: HashMap<i64, Vec<u16>>,
    pub starting: Vec<i64>,
    pub error_instances: Vec<i64>,
    pub cached_models: Vec<i64>,
}

/// Worker-side model instance lifecycle coordinator.
pub struct Coordinator {
    worker_id: i64,
    control_plane: Arc<dyn ControlPlane>,
    runtime: Arc<dyn ServeRuntime>,
    prober: Arc<dyn HealthProber>,
    log_dir: ServeLogDir,
    port_range: PortRange,
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    pub fn new(
        config: &Config,
        control_plane: Arc<dyn ControlPlane>,
        runtime: Arc<dyn ServeRuntime>,
        prober: Arc<dyn HealthProber>,
    ) -> Self {
        Self {
            worker_id: config.worker_id,
            control_plane,
            runtime,
            prober,
            log_dir: ServeLogDir::new(config.serve_log_root()),
            port_range: config.service_port_range,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Number of locally-serving instances.
    pub async fn serving_count(&self) -> usize {
        self.state.lock().await.serving.len()
    }

    /// Snapshot of the local bookkeeping.
    pub async fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.state.lock().await;
        let mut snapshot = CoordinatorSnapshot {
            serving: state.serving.keys().copied().collect(),
            serving_ports: state
                .serving_ports
                .iter()
                .map(|(id, ports)| {
                    let mut ports: Vec<u16> = ports.iter().copied().collect();
                    ports.sort_unstable();
                    (*id, ports)
                })
                .collect(),
            starting: state.starting.iter().copied().collect(),
            error_instances: state.error_instances.keys().copied().collect(),
            cached_models: state.model_cache.keys().copied().collect(),
        };
        snapshot.serving.sort_unstable();
        snapshot.starting.sort_unstable();
        snapshot.error_instances.sort_unstable();
        snapshot.cached_models.sort_unstable();
        snapshot
    }

    // -------------------------------------------------------------------------
    // Event dispatch
    // -------------------------------------------------------------------------

    /// Dispatch one instance change event. Per-instance failures are
    /// logged and isolated; this never returns an error.
    pub async fn handle_event(&self, event: InstanceEvent) {
        let mi = event.data;
        debug!(
            event_type = %event.event_type,
            instance = %mi.name,
            state = %mi.state,
            "Received model instance event"
        );

        match gate::should_act(&mi, self.worker_id) {
            GateDecision::Ignore => return,
            GateDecision::Wait(reason) => {
                info!(instance = %mi.name, reason = %reason, "Model instance event deferred");
                return;
            }
            GateDecision::Proceed => {}
        }

        let mut state = self.state.lock().await;

        if mi.state == InstanceState::Error {
            if event.event_type == EventType::Deleted {
                state.error_instances.remove(&mi.id);
                state.model_cache.remove(&mi.id);
                return;
            }
            match self.model_for(&mut state.model_cache, &mi).await {
                Ok(model) if model.restart_on_error => {
                    state.error_instances.insert(mi.id, mi);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        instance = %mi.name,
                        error = %e,
                        "Failed to look up model for error instance"
                    );
                }
            }
            return;
        }

        if state.serving.contains_key(&mi.id) && event.event_type == EventType::Deleted {
            self.stop_instance(&mut state, mi.id, &mi.name).await;
        } else if state.serving.contains_key(&mi.id) && mi.state == InstanceState::Scheduled {
            // The control plane rescheduled an instance whose local
            // process we still believe is alive (e.g. after a
            // connectivity gap). Restart to resynchronize.
            debug!(instance = %mi.name, "Restarting serving model instance");
            self.stop_instance(&mut state, mi.id, &mi.name).await;
            self.start_instance(&mut state, mi).await;
        } else if matches!(event.event_type, EventType::Created | EventType::Updated)
            && !state.serving.contains_key(&mi.id)
        {
            self.start_instance(&mut state, mi).await;
        }
    }

    // -------------------------------------------------------------------------
    // Start / stop
    // -------------------------------------------------------------------------

    async fn start_instance(&self, state: &mut CoordinatorState, mut mi: ModelInstance) {
        let is_main = mi.worker_id == Some(self.worker_id);
        let sub_slot = if is_main {
            None
        } else {
            match mi.subordinate(self.worker_id) {
                Some((pos, sw)) => Some((pos, sw.clone())),
                None => {
                    warn!(
                        instance = %mi.name,
                        "Not a participant of this instance's topology, skipping start"
                    );
                    return;
                }
            }
        };

        match self.try_start(state, &mut mi).await {
            Ok((handle, assigned_ports, backend)) => {
                let pid = handle.pid();
                state.serving.insert(mi.id, handle);
                state
                    .serving_ports
                    .insert(mi.id, assigned_ports.iter().copied().collect());
                state.starting.insert(mi.id);

                let patch = match &sub_slot {
                    None => ModelInstancePatch {
                        state: Some(InstanceState::Initializing),
                        port: mi.port,
                        ports: mi.ports.clone(),
                        pid: Some(pid),
                        ..Default::default()
                    },
                    Some((pos, sw)) => {
                        let mut worker = sw.clone();
                        // Backends without a discrete subordinate
                        // readiness signal report RUNNING right away.
                        worker.state = if backend.subordinate_ready_at_start() {
                            InstanceState::Running
                        } else {
                            InstanceState::Initializing
                        };
                        worker.pid = Some(pid);
                        ModelInstancePatch::subordinate_slot(*pos, worker)
                    }
                };
                self.apply_patch(mi.id, &patch, "start").await;
                info!(
                    instance = %mi.name,
                    ports = ?assigned_ports,
                    pid,
                    "Started model instance"
                );
            }
            Err(e) => {
                error!(instance = %mi.name, error = %e, "Failed to start model instance");
                let message = format!("Failed to start model instance: {e}");
                let patch = match &sub_slot {
                    None => ModelInstancePatch::state_change(InstanceState::Error, message),
                    Some((pos, sw)) => {
                        let mut worker = sw.clone();
                        worker.state = InstanceState::Error;
                        worker.state_message = message;
                        ModelInstancePatch::subordinate_slot(*pos, worker)
                    }
                };
                self.apply_patch(mi.id, &patch, "start failure").await;
            }
        }
    }

    /// Fallible part of the start path. No bookkeeping is created here;
    /// the caller inserts it only on success.
    async fn try_start(
        &self,
        state: &mut CoordinatorState,
        mi: &mut ModelInstance,
    ) -> anyhow::Result<(Box<dyn ProcessHandle>, Vec<u16>, BackendKind)> {
        let instance_dir = self.log_dir.ensure_instance_dir(&mi.model_name, &mi.name)?;
        self.log_dir.record_instance(mi.id, &instance_dir)?;

        let model = self.model_for(&mut state.model_cache, mi).await?;
        let backend = model.backend;

        // Assign ports once; repeated start attempts reuse the cached
        // assignment from the instance snapshot.
        if mi.port.is_none() {
            let mut unavailable: HashSet<u16> = state
                .serving_ports
                .values()
                .flat_map(|ports| ports.iter().copied())
                .collect();
            let port = ports::allocate_port(&self.port_range, &unavailable)?;
            mi.port = Some(port);
            let mut assigned = vec![port];
            let distributed = mi
                .distributed_servers
                .as_ref()
                .is_some_and(|ds| !ds.subordinate_workers.is_empty());
            if distributed && backend.needs_coordination_port() {
                unavailable.insert(port);
                assigned.push(ports::allocate_port(&self.port_range, &unavailable)?);
            }
            mi.ports = Some(assigned);
        }
        let assigned_ports = mi
            .ports
            .clone()
            .or_else(|| mi.port.map(|p| vec![p]))
            .unwrap_or_default();

        info!(instance = %mi.name, ports = ?assigned_ports, "Starting model instance");

        let spec = SpawnSpec {
            instance_id: mi.id,
            instance_name: mi.name.clone(),
            command: backend.launch_command(&model, mi),
            env: vec![],
            log_dir: instance_dir,
        };
        let handle = self.runtime.spawn_server(&spec).await?;
        Ok((handle, assigned_ports, backend))
    }

    async fn stop_instance(&self, state: &mut CoordinatorState, id: i64, name: &str) {
        match state.serving.remove(&id) {
            Some(mut handle) => {
                let pid = handle.pid();
                handle.terminate().await;
                info!(instance = %name, pid, "Stopped model instance");
            }
            None => {
                warn!(instance = %name, "Model instance is not running, skipping stop");
            }
        }
        self.cleanup_instance(state, id);
    }

    /// Discard all local bookkeeping for an instance.
    fn cleanup_instance(&self, state: &mut CoordinatorState, id: i64) {
        state.serving.remove(&id);
        state.serving_ports.remove(&id);
        state.starting.remove(&id);
        state.model_cache.remove(&id);
        if let Err(e) = self.log_dir.remove_instance(id) {
            warn!(instance_id = id, error = %e, "Failed to prune instance log mapping");
        }
    }

    // -------------------------------------------------------------------------
    // Restart sweep
    // -------------------------------------------------------------------------

    /// One pass of the restart policy over remembered ERROR instances.
    pub async fn restart_error_instances(&self) {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let candidates: Vec<ModelInstance> = state.error_instances.values().cloned().collect();

        for mi in candidates {
            if state.serving.contains_key(&mi.id) {
                warn!(instance = %mi.name, "Model instance is already running, skipping restart");
                continue;
            }
            if !restart::restart_due(&mi, now) {
                continue;
            }

            let restart_count = mi.restart_count.unwrap_or(0);
            info!(
                instance = %mi.name,
                attempt = restart_count + 1,
                "Rescheduling model instance after error"
            );

            // Rescheduling re-triggers the normal start path on the next
            // event for this instance.
            let patch = ModelInstancePatch {
                restart_count: Some(restart_count + 1),
                last_restart_time: Some(now),
                state: Some(InstanceState::Scheduled),
                state_message: Some(String::new()),
                ..Default::default()
            };
            match self.control_plane.patch_instance(mi.id, &patch).await {
                Ok(()) => {
                    state.error_instances.remove(&mi.id);
                }
                Err(ClientError::NotFound) => {
                    debug!(instance = %mi.name, "Instance deleted concurrently, dropping");
                    state.error_instances.remove(&mi.id);
                }
                Err(e) => {
                    warn!(instance = %mi.name, error = %e, "Failed to reschedule error instance");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Health sweep
    // -------------------------------------------------------------------------

    /// One health pass over all locally-serving instances. Failures in
    /// one instance's handling never abort the sweep for the rest.
    pub async fn health_sweep(&self) {
        let mut state = self.state.lock().await;
        let ids: Vec<i64> = state.serving.keys().copied().collect();
        for id in ids {
            self.sweep_instance(&mut state, id).await;
        }
    }

    async fn sweep_instance(&self, state: &mut CoordinatorState, id: i64) {
        let (alive, exit_code) = match state.serving.get_mut(&id) {
            Some(handle) => match handle.try_exit_code() {
                None => (true, None),
                Some(code) => (false, Some(code)),
            },
            None => return,
        };

        // Steady state: process alive and start already confirmed.
        if alive && !state.starting.contains(&id) {
            return;
        }

        let mi = match self.control_plane.get_instance(id).await {
            Ok(mi) => mi,
            Err(ClientError::NotFound) => {
                warn!(
                    instance_id = id,
                    "Model instance no longer exists, stopping serving process"
                );
                self.stop_instance(state, id, &format!("instance-{id}")).await;
                return;
            }
            Err(e) => {
                warn!(instance_id = id, error = %e, "Failed to fetch instance during sweep");
                return;
            }
        };
        let is_main = mi.worker_id == Some(self.worker_id);

        if !alive {
            let exit_code = exit_code.unwrap_or(-1);
            if mi.state != InstanceState::Error {
                let message = format!("Inference server exited with code {exit_code}.");
                let patch = if is_main {
                    Some(ModelInstancePatch::state_change(
                        InstanceState::Error,
                        message,
                    ))
                } else {
                    mi.subordinate(self.worker_id).map(|(pos, sw)| {
                        let mut worker = sw.clone();
                        worker.state = InstanceState::Error;
                        worker.state_message = message;
                        ModelInstancePatch::subordinate_slot(pos, worker)
                    })
                };
                if let Some(patch) = patch {
                    self.apply_patch(id, &patch, "process exit").await;
                }
            }
            warn!(
                instance = %mi.name,
                exit_code,
                "Inference server process exited, cleaning up"
            );
            self.cleanup_instance(state, id);
            return;
        }

        // Process alive and still starting: evaluate readiness.
        let model = match self.model_for(&mut state.model_cache, &mi).await {
            Ok(model) => model,
            Err(ClientError::NotFound) => return,
            Err(e) => {
                warn!(instance = %mi.name, error = %e, "Failed to fetch model during sweep");
                return;
            }
        };
        let backend = model.backend;

        if is_main {
            self.sweep_main(state, &mi, backend).await;
        } else {
            self.sweep_subordinate(state, &mi, backend).await;
        }
    }

    async fn sweep_main(
        &self,
        state: &mut CoordinatorState,
        mi: &ModelInstance,
        backend: BackendKind,
    ) {
        // An errored subordinate fails the whole distributed instance.
        let subordinate_error = mi.distributed_servers.as_ref().and_then(|ds| {
            ds.subordinate_workers
                .iter()
                .find(|sw| sw.state == InstanceState::Error)
                .map(|sw| {
                    format!(
                        "Distributed serving error in subordinate worker {}: {}.",
                        sw.worker_ip, sw.state_message
                    )
                })
        });

        let patch = match subordinate_error {
            Some(message) => ModelInstancePatch::state_change(InstanceState::Error, message),
            None => {
                if !self.prober.is_ready(backend, mi).await {
                    // Not ready yet; retried next sweep.
                    return;
                }
                if mi.state == InstanceState::Running {
                    return;
                }
                ModelInstancePatch::state_change(InstanceState::Running, String::new())
            }
        };
        if self.apply_patch(mi.id, &patch, "readiness").await {
            state.starting.remove(&mi.id);
        }
    }

    async fn sweep_subordinate(
        &self,
        state: &mut CoordinatorState,
        mi: &ModelInstance,
        backend: BackendKind,
    ) {
        // These backends reported RUNNING at start; nothing to confirm.
        if backend.subordinate_ready_at_start() {
            state.starting.remove(&mi.id);
            return;
        }
        let Some((pos, sw)) = mi.subordinate(self.worker_id) else {
            return;
        };
        if sw.state == InstanceState::Running {
            return;
        }
        // Subordinates have no health endpoint of their own; process
        // liveness is the readiness signal.
        let mut worker = sw.clone();
        worker.state = InstanceState::Running;
        worker.state_message = String::new();
        let patch = ModelInstancePatch::subordinate_slot(pos, worker);
        if self.apply_patch(mi.id, &patch, "subordinate readiness").await {
            state.starting.remove(&mi.id);
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Patch the control plane, suppressing the deleted-concurrently
    /// race. Returns whether the patch was applied.
    async fn apply_patch(&self, id: i64, patch: &ModelInstancePatch, action: &str) -> bool {
        match self.control_plane.patch_instance(id, patch).await {
            Ok(()) => true,
            Err(ClientError::NotFound) => {
                debug!(instance_id = id, action, "Instance gone before patch, ignoring");
                false
            }
            Err(e) => {
                warn!(instance_id = id, action, error = %e, "Failed to patch model instance");
                false
            }
        }
    }

    async fn model_for(
        &self,
        cache: &mut HashMap<i64, Model>,
        mi: &ModelInstance,
    ) -> Result<Model, ClientError> {
        if let Some(model) = cache.get(&mi.id) {
            return Ok(model.clone());
        }
        let model = self.control_plane.get_model(mi.model_id).await?;
        cache.insert(mi.id, model.clone());
        Ok(model)
    }
}
