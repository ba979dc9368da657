// src/execution/mod.rs

//! Process supervision.
//!
//! Every supervised service runs as one OS process owned by one tokio task.
//! The task relaunches the command in place whenever it exits (inner retry);
//! when the task itself ends, the health loop asks the supervisor for an
//! outer restart, which replaces the task under the same name.

pub mod executor;
#[cfg(test)]
pub(crate) mod fake;
pub mod stragglers;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::increment_counter;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bootstrap::handoff::BoxedHandoff;
use crate::service::ServiceDescriptor;
pub use executor::{BoxedExecutor, CommandOutput, CommandSpec, ExecutionError, Executor, HostExecutor};

/// Where supervised children write their output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutput {
    /// Appended to one per-deployment log file
    LogFile(PathBuf),

    /// Inherited from the orchestrator (verbose mode)
    Inherit,

    /// Discarded
    Null,
}

/// Supervisor timings and output policy
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Child stdout/stderr destination
    pub output: ChildOutput,

    /// Delay before a stopped command is relaunched in place
    pub inner_restart_delay: Duration,

    /// Grace period between SIGTERM and SIGKILL on shutdown
    pub stop_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            output: ChildOutput::Null,
            inner_restart_delay: Duration::from_secs(1),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// One supervised service: a run-body task that owns the OS process
pub struct ManagedProcess {
    /// Unique id, changes on every outer restart
    pub id: Uuid,

    /// Service abbreviation
    pub name: String,

    /// When the run-body was spawned
    pub started_at: DateTime<Utc>,

    descriptor: Arc<ServiceDescriptor>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), ExecutionError>>,
}

impl ManagedProcess {
    /// Whether the run-body is still running
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Forcefully ends the run-body; `kill_on_drop` takes the child with it
    async fn kill(self) {
        self.handle.abort();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!("{} run-body panicked: {}", self.name, e);
            }
        }
    }

    /// Asks the run-body to stop its child gracefully and waits for it
    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.handle.await {
            Ok(Ok(())) => debug!("{} stopped", self.name),
            Ok(Err(e)) => debug!("{} had already failed: {}", self.name, e),
            Err(e) => warn!("{} run-body ended abnormally: {}", self.name, e),
        }
    }
}

/// Operations the sequencer needs from a supervisor
#[async_trait]
pub trait Supervise: Send + Sync {
    /// Starts a service, replacing any process already running under its name
    async fn launch(&self, descriptor: &ServiceDescriptor) -> Result<Uuid, ExecutionError>;

    /// Names currently in the supervised table
    fn supervised(&self) -> Vec<String>;

    /// Non-blocking liveness check
    fn is_alive(&self, name: &str) -> bool;

    /// Replaces a process with a new one under the same name
    async fn restart(&self, name: &str) -> Result<Uuid, ExecutionError>;

    /// Stops and joins every process, leaving the table empty
    async fn shutdown_all(&self) -> usize;
}

/// Supervised table keyed by service name
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    handoffs: HashMap<String, BoxedHandoff>,
    table: Mutex<HashMap<String, ManagedProcess>>,
}

impl ProcessSupervisor {
    /// Creates a supervisor with an empty table
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            handoffs: HashMap::new(),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `handoff` in the run-body of `name` before its command is spawned
    pub fn with_handoff(mut self, name: impl Into<String>, handoff: BoxedHandoff) -> Self {
        self.handoffs.insert(name.into(), handoff);
        self
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, ManagedProcess>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current id of a supervised name
    pub fn process_id(&self, name: &str) -> Option<Uuid> {
        self.table().get(name).map(|p| p.id)
    }

    /// Spawns the run-body task for a descriptor
    fn spawn(&self, descriptor: Arc<ServiceDescriptor>) -> ManagedProcess {
        let (stop, stop_rx) = oneshot::channel();
        let settings = self.settings.clone();
        let body = descriptor.clone();
        let handoff = self.handoffs.get(&descriptor.abbreviation).cloned();
        let handle = tokio::spawn(async move { run_body(body, handoff, settings, stop_rx).await });

        ManagedProcess {
            id: Uuid::new_v4(),
            name: descriptor.abbreviation.clone(),
            started_at: Utc::now(),
            descriptor,
            stop: Some(stop),
            handle,
        }
    }

    /// Inserts a new process, killing whatever held the name before
    async fn replace(&self, descriptor: Arc<ServiceDescriptor>) -> Uuid {
        let previous = self.table().remove(&descriptor.abbreviation);
        if let Some(previous) = previous {
            debug!("terminating {} ({})", previous.name, previous.id);
            previous.kill().await;
        }

        let process = self.spawn(descriptor);
        let id = process.id;
        self.table().insert(process.name.clone(), process);
        id
    }
}

#[async_trait]
impl Supervise for ProcessSupervisor {
    async fn launch(&self, descriptor: &ServiceDescriptor) -> Result<Uuid, ExecutionError> {
        let id = self.replace(Arc::new(descriptor.clone())).await;
        info!("Started {} ({})", descriptor.abbreviation, id);
        Ok(id)
    }

    fn supervised(&self) -> Vec<String> {
        self.table().keys().cloned().collect()
    }

    fn is_alive(&self, name: &str) -> bool {
        self.table().get(name).map_or(false, ManagedProcess::is_alive)
    }

    async fn restart(&self, name: &str) -> Result<Uuid, ExecutionError> {
        let descriptor = self
            .table()
            .get(name)
            .map(|p| p.descriptor.clone())
            .ok_or_else(|| {
                ExecutionError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} is not supervised", name),
                ))
            })?;

        let id = self.replace(descriptor).await;
        increment_counter!("netdeploy_process_restarts_total", "service" => name.to_string());
        warn!("Restarted {} ({})", name, id);
        Ok(id)
    }

    async fn shutdown_all(&self) -> usize {
        let processes: Vec<ManagedProcess> = self.table().drain().map(|(_, p)| p).collect();
        let count = processes.len();
        info!("Stopping {} supervised processes", count);

        join_all(processes.into_iter().map(ManagedProcess::stop)).await;
        count
    }
}

/// Runs a service command forever, relaunching it whenever it exits.
///
/// A handoff, if any, completes before the first launch. A failed handoff is
/// logged and the command launched anyway.
///
/// Returns only when asked to stop, or with an error when the command cannot
/// be spawned at all; the latter is left to the health loop.
async fn run_body(
    descriptor: Arc<ServiceDescriptor>,
    handoff: Option<BoxedHandoff>,
    settings: SupervisorSettings,
    mut stop: oneshot::Receiver<()>,
) -> Result<(), ExecutionError> {
    let spec = descriptor.command_spec();
    let name = descriptor.abbreviation.as_str();

    if let Some(handoff) = handoff {
        tokio::select! {
            prepared = handoff.prepare(&descriptor) => match prepared {
                Ok(()) => debug!("{} handoff for {} done", handoff.name(), name),
                Err(e) => error!("{} handoff for {} failed, starting anyway: {}", handoff.name(), name, e),
            },
            _ = &mut stop => return Ok(()),
        }
    }

    loop {
        let mut command = spec.to_command();
        command.kill_on_drop(true);
        match &settings.output {
            ChildOutput::LogFile(path) => {
                let log = OpenOptions::new().create(true).append(true).open(path)?;
                command.stdout(Stdio::from(log.try_clone()?)).stderr(Stdio::from(log));
            }
            ChildOutput::Inherit => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            ChildOutput::Null => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let mut child = command.spawn().map_err(|source| {
            error!("Failed to start {}: {}", name, source);
            ExecutionError::Spawn {
                command: spec.to_string(),
                source,
            }
        })?;
        increment_counter!("netdeploy_process_launches_total", "service" => name.to_string());
        debug!("{} running as pid {:?}", name, child.id());

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => warn!("{} stopped ({}), restarting", name, status),
                Err(e) => warn!("{} could not be waited on ({}), restarting", name, e),
            },
            _ = &mut stop => {
                terminate(name, &mut child, settings.stop_grace).await;
                return Ok(());
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.inner_restart_delay) => {}
            _ = &mut stop => return Ok(()),
        }
    }
}

/// SIGTERM, then SIGKILL once the grace period is over
async fn terminate(name: &str, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        match i32::try_from(pid) {
            Ok(raw) => {
                if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    debug!("SIGTERM to {} failed: {}", name, e);
                }
            }
            Err(_) => debug!("pid {} of {} out of range", pid, name),
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!("{} ignored SIGTERM for {:?}, killing", name, grace);
    }
    if let Err(e) = child.kill().await {
        debug!("kill of {} failed: {}", name, e);
    }
}
