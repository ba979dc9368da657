// src/sequencer/mod.rs

//! Dependency-ordered startup, health supervision and interrupt shutdown.
//!
//! Services start strictly one after another, each followed by its settle
//! delay, because later services consume files earlier ones produce. Once
//! everything is up the sequencer runs the health loop until the shutdown
//! signal fires; every wait along the way observes that signal.

pub mod lock;
pub mod plan;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use metrics::gauge;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bootstrap::Bootstrapper;
use crate::config::DeploymentConfig;
use crate::execution::stragglers::{wait_for_stragglers, HostProcessTable, ProcessTable};
use crate::execution::Supervise;
use crate::service::gate::{self, GateError};
use crate::service::ServiceDescriptor;

pub use lock::DeploymentLock;
pub use plan::{DeploymentMode, DeploymentPlan};

/// Sequencer errors
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Validation(#[from] GateError),

    #[error("Deployment root is in use by running process {pid} (lock file {path})")]
    Locked { path: PathBuf, pid: u32 },

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How a supervised deployment ended
#[derive(Debug)]
pub enum Outcome {
    /// Shutdown was requested and completed
    Interrupted(ShutdownReport),
}

/// What the shutdown sequence did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Supervised processes stopped
    pub stopped: usize,

    /// Process table polls that still found stragglers
    pub straggler_polls: usize,

    /// Ephemeral paths removed
    pub removed: Vec<PathBuf>,
}

/// Requests shutdown; the first request wins
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Fires the signal, returning false when it had already fired
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }
}

/// Observes a shutdown request
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested; never resolves if every trigger is
    /// dropped first
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Creates a connected trigger and signal
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

/// Sequencer timings and cleanup
#[derive(Debug, Clone)]
pub struct SequencerSettings {
    /// Interval between health passes
    pub health_check_frequency: Duration,

    /// Interval between straggler polls on shutdown
    pub straggler_poll: Duration,

    /// Absolute paths removed on shutdown
    pub ephemeral_paths: Vec<PathBuf>,
}

impl SequencerSettings {
    /// Settings of a loaded configuration
    pub fn from_config(config: &DeploymentConfig) -> Self {
        Self {
            health_check_frequency: config.health_check_frequency(),
            straggler_poll: Duration::from_secs(config.supervisor.straggler_poll_secs),
            ephemeral_paths: config.ephemeral_paths.iter().map(|p| config.resolve(p)).collect(),
        }
    }
}

/// Brings a deployment up and keeps it running
pub struct DeploymentSequencer {
    supervisor: Arc<dyn Supervise>,
    settings: SequencerSettings,
    subzone: Option<Box<dyn Bootstrapper>>,
    firewall: Option<Box<dyn Bootstrapper>>,
    process_table: Box<dyn ProcessTable>,
    lock: Mutex<Option<DeploymentLock>>,
}

impl DeploymentSequencer {
    /// Creates a sequencer over a supervisor
    pub fn new(supervisor: Arc<dyn Supervise>, settings: SequencerSettings) -> Self {
        Self {
            supervisor,
            settings,
            subzone: None,
            firewall: None,
            process_table: Box::new(HostProcessTable::new()),
            lock: Mutex::new(None),
        }
    }

    /// Runs `bootstrapper` when the plan asks for subzone registration
    pub fn with_subzone(mut self, bootstrapper: Box<dyn Bootstrapper>) -> Self {
        self.subzone = Some(bootstrapper);
        self
    }

    /// Runs `bootstrapper` before launching deferred firewall legs
    pub fn with_firewall(mut self, bootstrapper: Box<dyn Bootstrapper>) -> Self {
        self.firewall = Some(bootstrapper);
        self
    }

    /// Replaces the host process table used for the straggler wait
    pub fn with_process_table(mut self, table: Box<dyn ProcessTable>) -> Self {
        self.process_table = table;
        self
    }

    /// Releases `lock` at the end of the shutdown sequence
    pub fn with_lock(self, lock: DeploymentLock) -> Self {
        *self.lock.lock().unwrap_or_else(PoisonError::into_inner) = Some(lock);
        self
    }

    /// Gates, launches and supervises `plan` until `shutdown` fires.
    ///
    /// Nothing is launched when any gate check fails.
    pub async fn run(&self, plan: DeploymentPlan, mut shutdown: ShutdownSignal) -> Result<Outcome, SequencerError> {
        let (immediate, deferred) = plan.partition();
        gate::check_all(&immediate).into_result()?;

        let listing: Vec<&str> = plan.services.iter().map(|s| s.abbreviation.as_str()).collect();
        info!("Deploying {} services: {}", listing.len(), listing.join(", "));

        tokio::select! {
            _ = async {
                self.bring_up(&immediate, deferred, plan.run_subzone).await;
                self.health_loop().await
            } => {}
            _ = shutdown.triggered() => {
                info!("Shutdown requested, terminating processes");
            }
        }

        let report = self.shutdown(&plan.process_patterns()).await;
        Ok(Outcome::Interrupted(report))
    }

    async fn bring_up(&self, immediate: &[ServiceDescriptor], deferred: Vec<ServiceDescriptor>, run_subzone: bool) {
        self.launch_in_order(immediate).await;

        if run_subzone {
            match &self.subzone {
                Some(bootstrapper) => {
                    info!("All services deployed, setting up subzones");
                    match bootstrapper.setup().await {
                        Ok(()) => info!("Subzone setup complete"),
                        Err(e) => error!("Subzone setup failed: {}", e),
                    }
                }
                None => warn!("Subzone setup requested but no bootstrapper is configured"),
            }
        }

        if !deferred.is_empty() {
            self.bring_up_firewall(deferred).await;
        }
    }

    async fn bring_up_firewall(&self, legs: Vec<ServiceDescriptor>) {
        let Some(bootstrapper) = &self.firewall else {
            error!("{} firewall services deferred but no firewall bootstrapper is configured", legs.len());
            return;
        };

        info!("Running {} bootstrap", bootstrapper.name());
        if let Err(e) = bootstrapper.setup().await {
            error!("Firewall setup failed, not launching firewall services: {}", e);
            return;
        }
        if let Err(e) = gate::check_all(&legs).into_result() {
            error!("Firewall services failed validation: {}", e);
            return;
        }
        self.launch_in_order(&legs).await;
    }

    async fn launch_in_order(&self, services: &[ServiceDescriptor]) {
        for service in services {
            info!("Deploying {}", service.abbreviation);
            if let Err(e) = self.supervisor.launch(service).await {
                error!("Failed to deploy {}: {}", service.abbreviation, e);
            }
            debug!("waiting {:?} before the next service", service.settle_delay);
            tokio::time::sleep(service.settle_delay).await;
        }
    }

    /// Restarts every dead process, returning the restarted names
    pub async fn health_pass(&self) -> Vec<String> {
        let mut names = self.supervisor.supervised();
        names.sort();
        gauge!("netdeploy_supervised_processes", names.len() as f64);

        let mut restarted = Vec::new();
        for name in names {
            if self.supervisor.is_alive(&name) {
                debug!("{} is healthy", name);
                continue;
            }
            error!("{} is unhealthy, restarting", name);
            match self.supervisor.restart(&name).await {
                Ok(_) => restarted.push(name),
                Err(e) => error!("Failed to restart {}: {}", name, e),
            }
        }
        restarted
    }

    async fn health_loop(&self) {
        loop {
            info!("Running process health check");
            self.health_pass().await;
            tokio::time::sleep(self.settings.health_check_frequency).await;
        }
    }

    async fn shutdown(&self, patterns: &[String]) -> ShutdownReport {
        let stopped = self.supervisor.shutdown_all().await;
        let straggler_polls =
            wait_for_stragglers(self.process_table.as_ref(), patterns, self.settings.straggler_poll).await;

        let removed = self
            .settings
            .ephemeral_paths
            .iter()
            .filter(|path| remove_path(path))
            .cloned()
            .collect();

        let lock = self.lock.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(lock) = lock {
            if let Err(e) = lock.release() {
                warn!("{}", e);
            }
        }

        info!("All processes terminated");
        ShutdownReport {
            stopped,
            straggler_polls,
            removed,
        }
    }
}

fn remove_path(path: &Path) -> bool {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => return false,
    };
    match result {
        Ok(()) => {
            debug!("removed {}", path.display());
            true
        }
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}
