//! Server process runtime: spawning and supervising inference server
//! OS processes.
//!
//! Servers run out-of-process so a crashing backend cannot take down the
//! agent, and they are spawned into their own process group so stopping
//! an instance can signal the whole tree (backends fork workers that
//! would otherwise be orphaned). A mock implementation is provided for
//! tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::backend::LaunchCommand;

/// Grace period between SIGTERM and SIGKILL when stopping an instance.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Everything needed to launch one server process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub instance_id: i64,
    pub instance_name: String,
    pub command: LaunchCommand,
    pub env: Vec<(String, String)>,
    /// Directory receiving the server's stdout/stderr.
    pub log_dir: PathBuf,
}

/// Handle to a launched server process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> u32;

    /// Exit code if the process has exited, `None` while running.
    fn try_exit_code(&mut self) -> Option<i32>;

    /// Terminate the whole process group and reap the child.
    async fn terminate(&mut self);
}

/// Runtime abstraction over process spawning.
#[async_trait]
pub trait ServeRuntime: Send + Sync {
    async fn spawn_server(&self, spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>>;
}

#[cfg(unix)]
fn signal_process_group(pid: u32, signal: libc::c_int) {
    // SAFETY: signalling a process group we spawned.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // Signal deaths map to the conventional 128 + signal.
        status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

// =============================================================================
// Host runtime
// =============================================================================

/// Runtime spawning real OS processes on this host.
pub struct HostRuntime;

impl HostRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

struct HostProcessHandle {
    pid: u32,
    child: Child,
    exit: Option<i32>,
}

#[async_trait]
impl ProcessHandle for HostProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit_code(&mut self) -> Option<i32> {
        if let Some(code) = self.exit {
            return Some(code);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code_of(status);
                self.exit = Some(code);
                Some(code)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to poll process status");
                None
            }
        }
    }

    async fn terminate(&mut self) {
        if self.exit.is_some() {
            return;
        }
        #[cfg(unix)]
        signal_process_group(self.pid, libc::SIGTERM);
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit = Some(exit_code_of(status));
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "Failed to reap process");
            }
            Err(_) => {
                debug!(pid = self.pid, "Process ignored SIGTERM, killing process group");
                #[cfg(unix)]
                signal_process_group(self.pid, libc::SIGKILL);
                if let Ok(status) = self.child.wait().await {
                    self.exit = Some(exit_code_of(status));
                }
            }
        }
    }
}

#[async_trait]
impl ServeRuntime for HostRuntime {
    async fn spawn_server(&self, spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>> {
        std::fs::create_dir_all(&spec.log_dir)
            .with_context(|| format!("failed to create {}", spec.log_dir.display()))?;
        let log_path = spec.log_dir.join("serve.log");
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open {}", log_path.display()))?;
        let stderr = stdout
            .try_clone()
            .context("failed to clone server log handle")?;

        let mut cmd = std::process::Command::new(&spec.command.program);
        cmd.args(&spec.command.args)
            .env(
                "MODELPLANE_INSTANCE_ID",
                spec.instance_id.to_string(),
            )
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Discoverable title embedding the instance id, and a fresh
            // process group so the whole tree can be signalled.
            cmd.arg0(format!("modelplane-serving: instance_{}", spec.instance_id));
            cmd.process_group(0);
        }

        let child = tokio::process::Command::from(cmd)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn {} for instance {}",
                    spec.command.program, spec.instance_name
                )
            })?;
        let pid = child
            .id()
            .context("spawned process has no pid (already reaped)")?;

        info!(
            instance_id = spec.instance_id,
            instance = %spec.instance_name,
            program = %spec.command.program,
            pid,
            "Launched inference server process"
        );

        Ok(Box::new(HostProcessHandle {
            pid,
            child,
            exit: None,
        }))
    }
}

// =============================================================================
// Mock runtime
// =============================================================================

#[derive(Default)]
struct MockProcess {
    exit: Mutex<Option<i32>>,
    terminated: AtomicBool,
}

struct MockProcessHandle {
    pid: u32,
    process: Arc<MockProcess>,
}

#[async_trait]
impl ProcessHandle for MockProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit_code(&mut self) -> Option<i32> {
        *self.process.exit.lock().unwrap()
    }

    async fn terminate(&mut self) {
        self.process.terminated.store(true, Ordering::SeqCst);
        let mut exit = self.process.exit.lock().unwrap();
        if exit.is_none() {
            // SIGTERM death.
            *exit = Some(143);
        }
    }
}

/// Mock runtime for tests: records spawn specs and exposes per-instance
/// process controls.
#[derive(Default)]
pub struct MockRuntime {
    fail_starts: bool,
    next_pid: AtomicU32,
    specs: Mutex<Vec<SpawnSpec>>,
    processes: Mutex<HashMap<i64, Arc<MockProcess>>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(4200),
            ..Default::default()
        }
    }

    /// Mock runtime that fails every spawn.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            next_pid: AtomicU32::new(4200),
            ..Default::default()
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.specs.lock().unwrap().len()
    }

    pub fn specs(&self) -> Vec<SpawnSpec> {
        self.specs.lock().unwrap().clone()
    }

    /// Mark the last-spawned process of an instance as exited.
    pub fn exit(&self, instance_id: i64, code: i32) {
        if let Some(process) = self.processes.lock().unwrap().get(&instance_id) {
            *process.exit.lock().unwrap() = Some(code);
        }
    }

    /// Whether the instance's process was terminated via its handle.
    pub fn terminated(&self, instance_id: i64) -> bool {
        self.processes
            .lock()
            .unwrap()
            .get(&instance_id)
            .map(|p| p.terminated.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ServeRuntime for MockRuntime {
    async fn spawn_server(&self, spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>> {
        if self.fail_starts {
            anyhow::bail!("Mock runtime configured to fail");
        }
        self.specs.lock().unwrap().push(spec.clone());
        let process = Arc::new(MockProcess::default());
        self.processes
            .lock()
            .unwrap()
            .insert(spec.instance_id, Arc::clone(&process));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockProcessHandle { pid, process }))
    }
}
