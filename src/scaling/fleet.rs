// src/scaling/fleet.rs

//! Node replicas cloned from one template node.
//!
//! Replica `i` lives next to the template in `<template>-<i>`, with its legal
//! name and every listening port derived from `i`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::rewrite::{self, quote, RewriteError};
use crate::config::NodeFleetConfig;
use crate::execution::executor::{BoxedExecutor, CommandSpec, ExecutionError};
use crate::service::gate::{self, GateError};
use crate::service::{is_runtime_state, CleanOptions, ServiceDescriptor};

/// Highest ordinal whose port block stays inside the TCP port range
pub const MAX_REPLICAS: u32 = 55;

/// Length of the random legal-name suffix
const SUFFIX_LEN: usize = 6;

/// Key material generated at registration, never copied into a clone
const IDENTITY_FILES: [&str; 3] = ["nodekeystore.jks", "sslkeystore.jks", "certificate-request-id.txt"];

/// Listening ports of one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortBlock {
    /// Peer-to-peer port
    pub p2p: u16,

    /// RPC port
    pub rpc: u16,

    /// RPC admin port
    pub admin: u16,

    /// SSH shell port
    pub ssh: u16,
}

impl PortBlock {
    /// Ports of replica `ordinal`: `60{i}11`, `60{i}12`, `60{i}13` and `223{i}`
    pub fn for_ordinal(ordinal: u32) -> Option<Self> {
        if ordinal == 0 || ordinal > MAX_REPLICAS {
            return None;
        }
        let base = 60_000 + 100 * ordinal;
        Some(Self {
            p2p: u16::try_from(base + 11).ok()?,
            rpc: u16::try_from(base + 12).ok()?,
            admin: u16::try_from(base + 13).ok()?,
            ssh: u16::try_from(2230 + ordinal).ok()?,
        })
    }

    /// Every port of the block
    pub fn ports(&self) -> [u16; 4] {
        [self.p2p, self.rpc, self.admin, self.ssh]
    }
}

/// One node replica
#[derive(Debug, Clone)]
pub struct NodeInstance {
    /// Ordinal, 1-based
    pub ordinal: u32,

    /// Listening ports
    pub ports: PortBlock,

    /// `myLegalName` of the replica, when readable
    pub legal_name: Option<String>,

    /// Random legal-name suffix
    pub suffix: Option<String>,

    /// Whether the replica runs behind the firewall
    pub firewall: bool,

    /// Whether this run created the replica
    pub created: bool,

    /// Descriptor handed to the sequencer
    pub descriptor: ServiceDescriptor,
}

/// Fleet errors
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{existing} node replicas exist but {requested} were requested; request 0 to adopt them or deep clean first")]
    CountMismatch { existing: usize, requested: u32 },

    #[error("At most {max} node replicas are supported, {requested} requested")]
    TooManyReplicas { requested: u32, max: u32 },

    #[error("Node template {0} does not exist")]
    MissingTemplate(PathBuf),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error("Failed to switch clone to the firewall branch: {0}")]
    Checkout(#[source] ExecutionError),

    #[error("Artifact fetch for {service} failed: {reason}")]
    Fetch { service: String, reason: String },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> FleetError + '_ {
    move |source| FleetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Acquires the artifacts of a freshly cloned replica
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Makes the replica's artifacts present in its directory
    async fn fetch(&self, replica: &ServiceDescriptor) -> Result<(), FleetError>;
}

/// Treats artifacts as a precondition and only reports missing ones
#[derive(Debug, Default, Clone)]
pub struct ExpectPresent;

#[async_trait]
impl ArtifactFetcher for ExpectPresent {
    async fn fetch(&self, replica: &ServiceDescriptor) -> Result<(), FleetError> {
        let jar = replica.dir.join(format!("{}.jar", replica.artifact));
        if !jar.exists() {
            warn!("{} has no {}; it will not start until the artifact is provided", replica.abbreviation, jar.display());
        }
        Ok(())
    }
}

/// Naming and addressing of replicas
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// Organisation prefix of legal names
    pub name_prefix: String,

    /// Host part of every address
    pub host: String,

    /// Whether replicas run behind the firewall
    pub firewall: bool,

    /// Branch checked out in clones in firewall mode
    pub firewall_branch: String,
}

impl FleetSettings {
    /// Settings from the fleet configuration
    pub fn from_config(config: &NodeFleetConfig, firewall: bool) -> Self {
        Self {
            name_prefix: config.name_prefix.clone(),
            host: config.host.clone(),
            firewall,
            firewall_branch: config.firewall_branch.clone(),
        }
    }
}

/// Reconciles, clones and cleans node replicas of one template
pub struct NodeFleetManager {
    template: ServiceDescriptor,
    settings: FleetSettings,
    executor: BoxedExecutor,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl NodeFleetManager {
    /// Creates a manager for `template`
    pub fn new(template: ServiceDescriptor, settings: FleetSettings, executor: BoxedExecutor) -> Self {
        Self {
            template,
            settings,
            executor,
            fetcher: Arc::new(ExpectPresent),
        }
    }

    /// Replaces the artifact fetcher
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Directory of replica `ordinal`
    pub fn replica_dir(&self, ordinal: u32) -> PathBuf {
        let name = self
            .template
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.template.dir.with_file_name(format!("{}-{}", name, ordinal))
    }

    /// Existing replica directories, ordered by ordinal
    pub fn discover(&self) -> Result<Vec<(u32, PathBuf)>, FleetError> {
        let parent = match self.template.dir.parent() {
            Some(parent) if parent.is_dir() => parent,
            _ => return Ok(Vec::new()),
        };
        let prefix = match self.template.dir.file_name() {
            Some(name) => format!("{}-", name.to_string_lossy()),
            None => return Ok(Vec::new()),
        };

        let mut replicas = Vec::new();
        for entry in fs::read_dir(parent).map_err(io_error(parent))? {
            let entry = entry.map_err(io_error(parent))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let ordinal = name
                .strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|rest| rest.parse::<u32>().ok())
                .filter(|ordinal| *ordinal > 0);
            if let Some(ordinal) = ordinal {
                replicas.push((ordinal, entry.path()));
            }
        }

        replicas.sort_by_key(|(ordinal, _)| *ordinal);
        Ok(replicas)
    }

    /// Adopts existing replicas or creates `desired` new ones.
    ///
    /// Existing replicas are adopted when `desired` is 0 or equals their
    /// count; any other count fails before the filesystem is touched. When
    /// creation fails, every replica this call created is removed again.
    pub async fn reconcile_or_create(&self, desired: u32) -> Result<Vec<NodeInstance>, FleetError> {
        if desired > MAX_REPLICAS {
            return Err(FleetError::TooManyReplicas {
                requested: desired,
                max: MAX_REPLICAS,
            });
        }

        let existing = self.discover()?;
        if !existing.is_empty() {
            if desired != 0 && desired as usize != existing.len() {
                return Err(FleetError::CountMismatch {
                    existing: existing.len(),
                    requested: desired,
                });
            }
            info!("Adopting {} existing node replicas", existing.len());
            return existing
                .into_iter()
                .map(|(ordinal, dir)| self.bind(ordinal, dir))
                .collect();
        }

        if desired > 0 && !self.template.dir.is_dir() {
            return Err(FleetError::MissingTemplate(self.template.dir.clone()));
        }

        let mut instances = Vec::with_capacity(desired as usize);
        for ordinal in 1..=desired {
            match self.create(ordinal).await {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    self.discard(&instances);
                    return Err(e);
                }
            }
        }
        Ok(instances)
    }

    /// Removes replicas created by a run that failed partway
    fn discard(&self, instances: &[NodeInstance]) {
        for instance in instances.iter().filter(|i| i.created) {
            let dir = &instance.descriptor.dir;
            match fs::remove_dir_all(dir) {
                Ok(()) => info!("Removed node replica {} after failed fleet creation", instance.ordinal),
                Err(e) => warn!("Could not remove node replica {}: {}", dir.display(), e),
            }
        }
    }

    /// Gates every replica and returns their descriptors in ordinal order
    pub fn deployment_list(&self, instances: &[NodeInstance]) -> Result<Vec<ServiceDescriptor>, GateError> {
        let descriptors: Vec<ServiceDescriptor> = instances.iter().map(|i| i.descriptor.clone()).collect();
        gate::check_all(&descriptors).into_result()?;
        Ok(descriptors)
    }

    /// Applies clean options to every replica, returning how many were touched
    pub fn clean_fleet(&self, options: &CleanOptions) -> Result<usize, FleetError> {
        let replicas = self.discover()?;
        for (ordinal, dir) in &replicas {
            let report = self
                .template
                .replica(*ordinal, dir.clone())
                .clean(options)
                .map_err(io_error(dir))?;
            debug!("Replica {}: removed {} paths", ordinal, report.removed.len());
        }
        info!("Cleaned {} node replicas", replicas.len());
        Ok(replicas.len())
    }

    fn ports(&self, ordinal: u32) -> Result<PortBlock, FleetError> {
        PortBlock::for_ordinal(ordinal).ok_or(FleetError::TooManyReplicas {
            requested: ordinal,
            max: MAX_REPLICAS,
        })
    }

    fn node_conf(&self, dir: &Path) -> Option<PathBuf> {
        self.template.config_files.first().map(|f| dir.join(f))
    }

    /// Binds an existing directory without modifying it
    fn bind(&self, ordinal: u32, dir: PathBuf) -> Result<NodeInstance, FleetError> {
        let ports = self.ports(ordinal)?;
        let legal_name = self
            .node_conf(&dir)
            .and_then(|conf| fs::read_to_string(conf).ok())
            .and_then(|contents| rewrite::read_field(&contents, "myLegalName"));
        let suffix = legal_name
            .as_deref()
            .and_then(|name| legal_name_suffix(name, &self.settings.name_prefix, ordinal));

        Ok(NodeInstance {
            ordinal,
            ports,
            legal_name,
            suffix,
            firewall: self.settings.firewall,
            created: false,
            descriptor: self.template.replica(ordinal, dir),
        })
    }

    /// Clones the template into a new replica, removing it again on failure
    async fn create(&self, ordinal: u32) -> Result<NodeInstance, FleetError> {
        let dir = self.replica_dir(ordinal);
        let ports = self.ports(ordinal)?;
        info!("Creating node replica {} in {}", ordinal, dir.display());

        match self.populate(ordinal, &dir, ports).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    debug!("Could not remove partial replica {}: {}", dir.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    async fn populate(&self, ordinal: u32, dir: &Path, ports: PortBlock) -> Result<NodeInstance, FleetError> {
        copy_template(&self.template.dir, dir)?;

        if self.settings.firewall {
            let checkout = CommandSpec::new("git")
                .args(["checkout", self.settings.firewall_branch.as_str()])
                .current_dir(dir);
            self.executor.execute(&checkout).await.map_err(FleetError::Checkout)?;
        }

        let suffix = random_suffix();
        let conf = self
            .node_conf(dir)
            .ok_or_else(|| FleetError::MissingTemplate(self.template.dir.clone()))?;
        let contents = fs::read_to_string(&conf).map_err(io_error(&conf))?;
        let legal_name = replica_legal_name(
            rewrite::read_field(&contents, "myLegalName").as_deref(),
            &self.settings.name_prefix,
            ordinal,
            &suffix,
        );

        let host = &self.settings.host;
        rewrite::set_fields_in_file(
            &conf,
            &[
                ("myLegalName", quote(&legal_name)),
                ("p2pAddress", quote(&format!("{}:{}", host, ports.p2p))),
                ("rpcSettings.address", quote(&format!("{}:{}", host, ports.rpc))),
                ("rpcSettings.adminAddress", quote(&format!("{}:{}", host, ports.admin))),
                ("sshd.port", ports.ssh.to_string()),
            ],
        )?;

        let descriptor = self.template.replica(ordinal, dir.to_path_buf());
        self.fetcher.fetch(&descriptor).await?;
        info!("Created {} as {}", descriptor.abbreviation, legal_name);

        Ok(NodeInstance {
            ordinal,
            ports,
            legal_name: Some(legal_name),
            suffix: Some(suffix),
            firewall: self.settings.firewall,
            created: true,
            descriptor,
        })
    }
}

/// Copies the template tree, leaving out runtime state and registration keys
fn copy_template(from: &Path, to: &Path) -> Result<(), FleetError> {
    let mut walker = WalkDir::new(from).min_depth(1).into_iter();
    fs::create_dir_all(to).map_err(io_error(to))?;

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| FleetError::Io {
            path: from.to_path_buf(),
            source: io::Error::from(e),
        })?;
        let name = entry.file_name().to_string_lossy();
        let skip = (entry.depth() == 1 && is_runtime_state(&name))
            || (entry.file_type().is_file() && IDENTITY_FILES.contains(&&*name));
        if skip {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_error(&target))?;
        } else if entry.file_type().is_symlink() {
            let link = fs::read_link(entry.path()).map_err(io_error(entry.path()))?;
            std::os::unix::fs::symlink(link, &target).map_err(io_error(&target))?;
        } else {
            fs::copy(entry.path(), &target).map_err(io_error(&target))?;
        }
    }
    Ok(())
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

/// Template legal name with its organisation replaced by `<prefix><i>-<suffix>`
pub fn replica_legal_name(template: Option<&str>, prefix: &str, ordinal: u32, suffix: &str) -> String {
    let organisation = format!("O={}{}-{}", prefix, ordinal, suffix);
    let template = match template {
        Some(name) if !name.trim().is_empty() => name,
        _ => return format!("{}, L=London, C=GB", organisation),
    };

    let mut replaced = false;
    let mut parts: Vec<String> = template
        .split(',')
        .map(|part| {
            if part.trim_start().starts_with("O=") {
                replaced = true;
                organisation.clone()
            } else {
                part.trim().to_string()
            }
        })
        .collect();
    if !replaced {
        parts.insert(0, organisation);
    }
    parts.join(", ")
}

/// Suffix of a legal name produced by [`replica_legal_name`]
pub fn legal_name_suffix(legal_name: &str, prefix: &str, ordinal: u32) -> Option<String> {
    let expected = format!("{}{}-", prefix, ordinal);
    legal_name
        .split(',')
        .filter_map(|part| part.trim().strip_prefix("O="))
        .find_map(|org| org.strip_prefix(expected.as_str()))
        .filter(|suffix| !suffix.is_empty())
        .map(str::to_string)
}
