//! Worker process supervision
//!
//! This module owns the lifetime of inference-server processes, keyed by
//! workload id. A process is tracked from the moment its key is reserved
//! until it is stopped or exits on its own; at most one live entry exists per
//! key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Default time a process gets to exit after SIGTERM before it is killed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Default time a process gets to answer its health endpoint
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors that can occur during process supervision
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn process '{key}': {reason}")]
    SpawnFailed { key: String, reason: String },

    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Process '{key}' did not become ready: {reason}")]
    NotReady { key: String, reason: String },

    #[error("Failed to stop process '{key}': {reason}")]
    StopFailed { key: String, reason: String },
}

/// What to launch and how to tell when it is ready
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub key: String,
    pub binary_path: PathBuf,
    pub args: Vec<String>,
    pub port: u16,
    pub ctx_size: u32,
    /// Polled until it answers 200; `None` means ready once spawned
    pub health_url: Option<String>,
    pub ready_timeout: Duration,
}

impl ProcessSpec {
    pub fn new(key: impl Into<String>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            binary_path: binary_path.into(),
            args: Vec::new(),
            port: 0,
            ctx_size: 0,
            health_url: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_ctx_size(mut self, ctx_size: u32) -> Self {
        self.ctx_size = ctx_size;
        self
    }

    pub fn with_health_check(mut self, url: impl Into<String>, ready_timeout: Duration) -> Self {
        self.health_url = Some(url.into());
        self.ready_timeout = ready_timeout;
        self
    }
}

/// Descriptor of a supervised process. Always handed out as a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedProcess {
    pub id: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub ctx_size: u32,
    pub binary_path: PathBuf,
    pub args: Vec<String>,
    /// False while the process is loading
    pub running: bool,
    pub started_at: DateTime<Utc>,
}

impl ManagedProcess {
    fn reserved(spec: &ProcessSpec) -> Self {
        Self {
            id: spec.key.clone(),
            pid: None,
            port: spec.port,
            ctx_size: spec.ctx_size,
            binary_path: spec.binary_path.clone(),
            args: spec.args.clone(),
            running: false,
            started_at: Utc::now(),
        }
    }
}

/// Tracked processes split by phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessListing {
    pub running: Vec<ManagedProcess>,
    pub loading: Vec<ManagedProcess>,
}

impl ProcessListing {
    pub fn len(&self) -> usize {
        self.running.len() + self.loading.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ports held by any tracked process
    pub fn ports(&self) -> Vec<u16> {
        self.running
            .iter()
            .chain(self.loading.iter())
            .map(|p| p.port)
            .collect()
    }
}

/// Spawning, tracking and terminating worker processes
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Spawn a process under `spec.key`; fails if the key is already tracked
    async fn start(&self, spec: ProcessSpec) -> Result<ManagedProcess, SupervisorError>;

    /// Terminate a tracked process, gracefully unless `force` is set
    async fn stop(&self, key: &str, force: bool) -> Result<(), SupervisorError>;

    /// Copy of the entry for `key`, loading or running
    fn get(&self, key: &str) -> Option<ManagedProcess>;

    /// Copies of every tracked entry
    fn list_all(&self) -> ProcessListing;

    /// Stop every tracked process, concurrently
    async fn shutdown_all(&self) {
        let listing = self.list_all();
        let stops = listing
            .running
            .iter()
            .chain(listing.loading.iter())
            .map(|process| async move {
                if let Err(e) = self.stop(&process.id, false).await {
                    error!("Failed to stop '{}' during shutdown: {}", process.id, e);
                }
            });
        futures::future::join_all(stops).await;
    }
}

/// Lowest port at or above `base` not held by a tracked process
pub fn next_free_port(listing: &ProcessListing, base: u16) -> u16 {
    let used = listing.ports();
    let mut port = base;
    while used.contains(&port) {
        port = port.saturating_add(1);
    }
    port
}

#[derive(Debug, Clone, Copy)]
enum StopMode {
    Graceful,
    Force,
}

struct Tracked {
    process: ManagedProcess,
    generation: u64,
    control: Option<oneshot::Sender<StopMode>>,
    exited: watch::Receiver<bool>,
}

type ProcessTable = Arc<Mutex<HashMap<String, Tracked>>>;

fn lock_table(table: &ProcessTable) -> MutexGuard<'_, HashMap<String, Tracked>> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Remove `key` only if it still belongs to the given start generation
fn remove_generation(table: &ProcessTable, key: &str, generation: u64) -> bool {
    let mut processes = lock_table(table);
    if processes.get(key).map(|t| t.generation) == Some(generation) {
        processes.remove(key);
        true
    } else {
        false
    }
}

/// Supervisor backed by `tokio::process`
///
/// Every process is started in its own process group so that termination
/// reaches helper processes it forks.
pub struct LocalProcessSupervisor {
    processes: ProcessTable,
    generations: AtomicU64,
    stop_grace: Duration,
    http_client: reqwest::Client,
}

impl LocalProcessSupervisor {
    pub fn new() -> Self {
        Self::with_stop_grace(DEFAULT_STOP_GRACE)
    }

    pub fn with_stop_grace(stop_grace: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            stop_grace,
            http_client,
        }
    }

    fn spawn_child(spec: &ProcessSpec) -> std::io::Result<Child> {
        let mut cmd = Command::new(&spec.binary_path);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn()
    }

    /// Poll the health endpoint until it answers 200, the process exits, or
    /// the deadline passes.
    async fn wait_for_ready(
        &self,
        url: &str,
        ready_timeout: Duration,
        exited: &watch::Receiver<bool>,
    ) -> Result<(), String> {
        let deadline = Instant::now() + ready_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if *exited.borrow() {
                return Err("process exited during startup".to_string());
            }
            match self.http_client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("{} ready after {} attempts", url, attempt);
                    return Ok(());
                }
                Ok(resp) => debug!("{} answered {}", url, resp.status()),
                Err(e) => debug!("{} not reachable yet: {}", url, e),
            }
            if Instant::now() >= deadline {
                return Err(format!("no healthy response within {:?}", ready_timeout));
            }
            sleep(Duration::from_millis(250)).await;
        }
    }
}

impl Default for LocalProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSupervisor for LocalProcessSupervisor {
    async fn start(&self, spec: ProcessSpec) -> Result<ManagedProcess, SupervisorError> {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let (exited_tx, exited_rx) = watch::channel(false);

        {
            let mut processes = lock_table(&self.processes);
            if processes.contains_key(&spec.key) {
                return Err(SupervisorError::AlreadyRunning(spec.key.clone()));
            }
            processes.insert(
                spec.key.clone(),
                Tracked {
                    process: ManagedProcess::reserved(&spec),
                    generation,
                    control: None,
                    exited: exited_rx.clone(),
                },
            );
        }

        let child = match Self::spawn_child(&spec) {
            Ok(child) => child,
            Err(e) => {
                remove_generation(&self.processes, &spec.key, generation);
                return Err(SupervisorError::SpawnFailed {
                    key: spec.key.clone(),
                    reason: format!("{}: {}", spec.binary_path.display(), e),
                });
            }
        };

        let pid = child.id();
        let (control_tx, control_rx) = oneshot::channel();
        let mut control_tx = Some(control_tx);
        tokio::spawn(monitor(
            child,
            control_rx,
            exited_tx,
            Arc::clone(&self.processes),
            spec.key.clone(),
            generation,
            self.stop_grace,
        ));

        let ready_now = spec.health_url.is_none();
        let process = {
            let mut processes = lock_table(&self.processes);
            match processes.get_mut(&spec.key) {
                Some(tracked) if tracked.generation == generation => {
                    tracked.process.pid = pid;
                    tracked.process.running = ready_now;
                    tracked.control = control_tx.take();
                    Some(tracked.process.clone())
                }
                _ => None,
            }
        };

        let Some(process) = process else {
            let reason = if *exited_rx.borrow() {
                "process exited immediately"
            } else {
                "stopped during startup"
            };
            if let Some(tx) = control_tx.take() {
                let _ = tx.send(StopMode::Force);
            }
            return Err(SupervisorError::NotReady {
                key: spec.key.clone(),
                reason: reason.to_string(),
            });
        };

        info!(
            "Started process '{}' (pid {:?}) on port {}",
            spec.key, pid, spec.port
        );

        let Some(url) = spec.health_url.as_deref() else {
            return Ok(process);
        };

        match self
            .wait_for_ready(url, spec.ready_timeout, &exited_rx)
            .await
        {
            Ok(()) => {
                let mut processes = lock_table(&self.processes);
                match processes.get_mut(&spec.key) {
                    Some(tracked) if tracked.generation == generation => {
                        tracked.process.running = true;
                        Ok(tracked.process.clone())
                    }
                    _ => Err(SupervisorError::NotReady {
                        key: spec.key.clone(),
                        reason: "process went away during startup".to_string(),
                    }),
                }
            }
            Err(reason) => {
                warn!("Process '{}' failed readiness: {}", spec.key, reason);
                if let Err(e) = self.stop(&spec.key, true).await {
                    debug!("Cleanup of '{}' after failed readiness: {}", spec.key, e);
                }
                Err(SupervisorError::NotReady {
                    key: spec.key,
                    reason,
                })
            }
        }
    }

    async fn stop(&self, key: &str, force: bool) -> Result<(), SupervisorError> {
        let (control, mut exited, generation, spawned) = {
            let mut processes = lock_table(&self.processes);
            let tracked = processes
                .get_mut(key)
                .ok_or_else(|| SupervisorError::NotFound(key.to_string()))?;
            (
                tracked.control.take(),
                tracked.exited.clone(),
                tracked.generation,
                tracked.process.pid.is_some(),
            )
        };

        if control.is_none() && !spawned {
            // Reservation without a child yet; start() notices and cleans up
            remove_generation(&self.processes, key, generation);
            return Ok(());
        }

        info!("Stopping process '{}' (force={})", key, force);
        if let Some(control) = control {
            let mode = if force {
                StopMode::Force
            } else {
                StopMode::Graceful
            };
            // The monitor may already be gone if the process exited
            let _ = control.send(mode);
        }

        let wait_exit = async {
            while !*exited.borrow() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
        };
        if timeout(self.stop_grace + Duration::from_secs(5), wait_exit)
            .await
            .is_err()
        {
            return Err(SupervisorError::StopFailed {
                key: key.to_string(),
                reason: "process did not exit".to_string(),
            });
        }

        remove_generation(&self.processes, key, generation);
        Ok(())
    }

    fn get(&self, key: &str) -> Option<ManagedProcess> {
        lock_table(&self.processes)
            .get(key)
            .map(|t| t.process.clone())
    }

    fn list_all(&self) -> ProcessListing {
        let processes = lock_table(&self.processes);
        let mut listing = ProcessListing::default();
        for tracked in processes.values() {
            if tracked.process.running {
                listing.running.push(tracked.process.clone());
            } else {
                listing.loading.push(tracked.process.clone());
            }
        }
        listing.running.sort_by(|a, b| a.id.cmp(&b.id));
        listing.loading.sort_by(|a, b| a.id.cmp(&b.id));
        listing
    }
}

/// Owns the child handle for its whole life: reaps it on exit, or terminates
/// it when asked.
async fn monitor(
    mut child: Child,
    control: oneshot::Receiver<StopMode>,
    exited: watch::Sender<bool>,
    table: ProcessTable,
    key: String,
    generation: u64,
    stop_grace: Duration,
) {
    let requested = tokio::select! {
        status = child.wait() => Err(status),
        mode = control => Ok(mode.unwrap_or(StopMode::Force)),
    };

    match requested {
        Err(status) => {
            match status {
                Ok(status) => warn!("Process '{}' exited unexpectedly: {}", key, status),
                Err(e) => error!("Failed to wait on process '{}': {}", key, e),
            }
            remove_generation(&table, &key, generation);
        }
        Ok(StopMode::Graceful) => {
            if !signal_terminate(&child) {
                kill(&mut child, &key).await;
            } else if timeout(stop_grace, child.wait()).await.is_err() {
                warn!(
                    "Process '{}' ignored SIGTERM for {:?}, killing",
                    key, stop_grace
                );
                kill(&mut child, &key).await;
            }
        }
        Ok(StopMode::Force) => kill(&mut child, &key).await,
    }

    let _ = exited.send(true);
}

#[cfg(unix)]
fn signal_terminate(child: &Child) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => killpg(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn signal_terminate(_child: &Child) -> bool {
    false
}

async fn kill(child: &mut Child, key: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Kill of '{}' reported: {}", key, e);
    }
}
