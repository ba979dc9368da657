// src/service/mod.rs

//! Static service metadata and the per-kind behaviour attached to it.

pub mod gate;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::{ConfigError, DeploymentConfig, ServiceEntry, ServiceGroup, ServiceRole};
use crate::execution::executor::CommandSpec;

/// Role of a service in the firewall topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirewallRole {
    /// Message broker shared by the legs
    Broker,

    /// Internal leg
    Bridge,

    /// External leg
    Float,
}

/// Minimum number of files that must exist before a service may start
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertificateRequirement {
    /// Absolute directories, counted recursively and summed
    pub dirs: Vec<PathBuf>,

    /// Minimum file count
    pub required: usize,
}

impl CertificateRequirement {
    /// Number of certificate files currently present
    pub fn count(&self) -> usize {
        gate::count_certificates(&self.dirs)
    }

    /// Same requirement rooted at another service directory
    fn rebased(&self, from: &Path, to: &Path) -> Self {
        Self {
            dirs: self
                .dirs
                .iter()
                .map(|d| match d.strip_prefix(from) {
                    Ok(rel) => to.join(rel),
                    Err(_) => d.clone(),
                })
                .collect(),
            required: self.required,
        }
    }
}

/// Closed set of service behaviours
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    /// Started as-is, never gated
    Plain,

    /// Certificate gated service
    Deployable(CertificateRequirement),

    /// Node template (ordinal 0) or one of its replicas
    NodeRole {
        /// Replica ordinal, 0 for the template itself
        ordinal: u32,
        /// Certificate gate
        certificates: CertificateRequirement,
    },

    /// Broker or firewall leg, deferred until the firewall exchange completed
    FirewallLeg(FirewallRole, CertificateRequirement),
}

/// Program and argument template of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    /// Executable
    pub program: String,

    /// Arguments with `{artifact}`, `{config}` and `{version}` placeholders
    pub args: Vec<String>,
}

impl CommandTemplate {
    /// Substitutes placeholders in every argument
    pub fn render(&self, artifact: &str, config: &str, version: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{artifact}", artifact)
                    .replace("{config}", config)
                    .replace("{version}", version)
            })
            .collect()
    }
}

/// Immutable metadata of one logical service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Unique identifier, also the supervised process name
    pub abbreviation: String,

    /// Artifact base name
    pub artifact: String,

    /// Absolute working directory
    pub dir: PathBuf,

    /// Component version
    pub version: String,

    /// Declared runtime version
    pub runtime: String,

    /// Start command
    pub command: CommandTemplate,

    /// Config files relative to `dir`
    pub config_files: Vec<String>,

    /// Fixed delay after launch
    pub settle_delay: Duration,

    /// Command line fragment identifying leftover processes
    pub process_pattern: String,

    /// Deployment mode group
    pub group: ServiceGroup,

    /// Behaviour variant
    pub kind: ServiceKind,
}

impl ServiceDescriptor {
    /// Builds a descriptor from a catalog entry, resolving version and runtime
    pub fn from_entry(entry: &ServiceEntry, config: &DeploymentConfig) -> Result<Self, ConfigError> {
        let version = config
            .version_of(&entry.version_key)
            .ok_or_else(|| ConfigError::MissingVersion {
                service: entry.abbreviation.clone(),
                key: entry.version_key.clone(),
            })?
            .to_string();

        let program = match &entry.program {
            Some(program) => program.clone(),
            None => config
                .runtime_executable(&entry.runtime)
                .ok_or_else(|| ConfigError::UnknownRuntime {
                    service: entry.abbreviation.clone(),
                    runtime: entry.runtime.clone(),
                })?
                .to_string(),
        };

        let dir = config.resolve(&entry.dir);
        let certificates = entry.certificates.as_ref().map(|c| CertificateRequirement {
            dirs: c.dirs.iter().map(|d| dir.join(d)).collect(),
            required: c.required,
        });

        let kind = match (entry.role, certificates) {
            (ServiceRole::Plain, _) | (ServiceRole::Deployable, None) => ServiceKind::Plain,
            (ServiceRole::Deployable, Some(c)) => ServiceKind::Deployable(c),
            (ServiceRole::Node, c) => ServiceKind::NodeRole {
                ordinal: 0,
                certificates: c.unwrap_or_default(),
            },
            (ServiceRole::Broker, c) => ServiceKind::FirewallLeg(FirewallRole::Broker, c.unwrap_or_default()),
            (ServiceRole::Bridge, c) => ServiceKind::FirewallLeg(FirewallRole::Bridge, c.unwrap_or_default()),
            (ServiceRole::Float, c) => ServiceKind::FirewallLeg(FirewallRole::Float, c.unwrap_or_default()),
        };

        Ok(Self {
            abbreviation: entry.abbreviation.clone(),
            artifact: entry.artifact.clone(),
            process_pattern: entry
                .process_pattern
                .clone()
                .unwrap_or_else(|| format!("{}.jar", entry.artifact)),
            dir,
            version,
            runtime: entry.runtime.clone(),
            command: CommandTemplate {
                program,
                args: entry.args.clone(),
            },
            config_files: entry.config_files.clone(),
            settle_delay: Duration::from_secs(entry.settle_delay_secs),
            group: entry.group,
            kind,
        })
    }

    /// Certificate gate, if this kind is gated
    pub fn certificate_requirement(&self) -> Option<&CertificateRequirement> {
        match &self.kind {
            ServiceKind::Plain => None,
            ServiceKind::Deployable(c) => Some(c),
            ServiceKind::NodeRole { certificates, .. } => Some(certificates),
            ServiceKind::FirewallLeg(_, c) => Some(c),
        }
    }

    /// Firewall role, if this is a broker or leg
    pub fn firewall_role(&self) -> Option<FirewallRole> {
        match self.kind {
            ServiceKind::FirewallLeg(role, _) => Some(role),
            _ => None,
        }
    }

    /// Whether launch must wait for the firewall exchange
    pub fn is_firewall_leg(&self) -> bool {
        self.firewall_role().is_some()
    }

    /// Whether this is the node template or a replica
    pub fn is_node(&self) -> bool {
        matches!(self.kind, ServiceKind::NodeRole { .. })
    }

    /// Absolute paths of every config file
    pub fn config_paths(&self) -> Vec<PathBuf> {
        self.config_files.iter().map(|f| self.dir.join(f)).collect()
    }

    /// Command that starts the service inside its directory
    pub fn command_spec(&self) -> CommandSpec {
        let config = self.config_files.first().map(String::as_str).unwrap_or_default();
        CommandSpec::new(&self.command.program)
            .args(self.command.render(&self.artifact, config, &self.version))
            .current_dir(&self.dir)
    }

    /// Descriptor of replica `ordinal` living in `dir`
    pub fn replica(&self, ordinal: u32, dir: PathBuf) -> Self {
        let certificates = self
            .certificate_requirement()
            .map(|c| c.rebased(&self.dir, &dir))
            .unwrap_or_default();

        Self {
            abbreviation: format!("{}{}", self.abbreviation, ordinal),
            dir,
            kind: ServiceKind::NodeRole { ordinal, certificates },
            ..self.clone()
        }
    }

    /// Applies clean options to the service directory.
    ///
    /// `deep` removes node directories outright; any other service keeps its
    /// directory and is stripped of artifacts, certificates and runtime state.
    pub fn clean(&self, options: &CleanOptions) -> io::Result<CleanReport> {
        let mut report = CleanReport::default();
        if !self.dir.exists() {
            return Ok(report);
        }

        if options.deep && self.is_node() {
            fs::remove_dir_all(&self.dir)?;
            info!("Removed {}", self.dir.display());
            report.removed.push(self.dir.clone());
            return Ok(report);
        }

        if options.artifacts || options.deep {
            strip_artifacts(&self.dir, &mut report)?;
        }

        if options.certs || options.deep {
            if let Some(requirement) = self.certificate_requirement() {
                for dir in &requirement.dirs {
                    remove_path(dir, &mut report)?;
                }
            }
        }

        if options.runtime || options.deep {
            for entry in fs::read_dir(&self.dir)? {
                let entry = entry?;
                if is_runtime_state(&entry.file_name().to_string_lossy()) {
                    remove_path(&entry.path(), &mut report)?;
                }
            }
        }

        debug!("Cleaned {}: {} paths removed", self.abbreviation, report.removed.len());
        Ok(report)
    }
}

/// Destructive clean flags; `deep` supersedes the others
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanOptions {
    /// Remove node directories entirely
    pub deep: bool,

    /// Strip jars, zips and drivers
    pub artifacts: bool,

    /// Strip certificate directories
    pub certs: bool,

    /// Strip generated runtime state
    pub runtime: bool,
}

impl CleanOptions {
    /// Whether no flag is set
    pub fn is_empty(&self) -> bool {
        !(self.deep || self.artifacts || self.certs || self.runtime)
    }
}

/// Paths removed by a clean
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanReport {
    /// Removed files and directories
    pub removed: Vec<PathBuf>,
}

/// Whether a top-level entry of a service directory is generated at runtime
pub fn is_runtime_state(name: &str) -> bool {
    matches!(
        name,
        "logs" | "artemis" | "brokers" | "additional-node-infos" | "network-parameters" | "token" | "process-id"
    ) || name.starts_with("nodeInfo-")
        || (name.starts_with("persistence") && name.ends_with(".db"))
}

/// `nodeInfo-*` files a service has published, sorted by name
pub fn node_info_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("nodeInfo-"))
            .filter(|e| e.path().is_file())
            .map(|e| e.path())
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

fn is_artifact(name: &str) -> bool {
    name.ends_with(".jar") || name.ends_with(".zip")
}

fn strip_artifacts(dir: &Path, report: &mut CleanReport) -> io::Result<()> {
    let mut targets = Vec::new();
    let mut walker = WalkDir::new(dir).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::from)?;
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() {
            if name == ".git" {
                walker.skip_current_dir();
            } else if name == "drivers" {
                targets.push(entry.path().to_path_buf());
                walker.skip_current_dir();
            }
        } else if is_artifact(&name) {
            targets.push(entry.path().to_path_buf());
        }
    }

    for target in targets {
        remove_path(&target, report)?;
    }
    Ok(())
}

fn remove_path(path: &Path, report: &mut CleanReport) -> io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => {
            report.removed.push(path.to_path_buf());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Ordered descriptors of every catalog service plus the node template
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    services: Vec<ServiceDescriptor>,
    template: ServiceDescriptor,
}

impl ServiceCatalog {
    /// Builds every descriptor of a configuration
    pub fn from_config(config: &DeploymentConfig) -> Result<Self, ConfigError> {
        let services = config
            .services
            .iter()
            .map(|entry| ServiceDescriptor::from_entry(entry, config))
            .collect::<Result<Vec<_>, _>>()?;
        let template = ServiceDescriptor::from_entry(&config.nodes.template, config)?;

        Ok(Self { services, template })
    }

    /// Catalog services in start order
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Services of one group, in start order
    pub fn group(&self, group: ServiceGroup) -> Vec<ServiceDescriptor> {
        self.services
            .iter()
            .filter(|s| s.group == group)
            .cloned()
            .collect()
    }

    /// Node template cloned into replicas
    pub fn node_template(&self) -> &ServiceDescriptor {
        &self.template
    }

    /// Looks up a catalog service
    pub fn get(&self, abbreviation: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.abbreviation == abbreviation)
    }

    /// Looks up the service playing a firewall role
    pub fn firewall_leg(&self, role: FirewallRole) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.firewall_role() == Some(role))
    }
}
