// src/config/mod.rs

pub mod rewrite;
pub mod schema;
pub mod validator;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Version keys every deployment may reference from the `.env` file
pub const VERSION_KEYS: [&str; 4] = ["CENM_VERSION", "AUTH_VERSION", "GATEWAY_VERSION", "NODE_VERSION"];

/// Complete configuration of one deployment root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Configuration format version
    pub version: String,

    /// Directory holding every service directory, relative to the config file
    pub root_dir: PathBuf,

    /// `KEY=VALUE` file providing component versions, relative to `root_dir`
    pub env_file: PathBuf,

    /// Java runtimes available to services
    pub runtimes: Vec<RuntimeEntry>,

    /// Ordered service catalog
    pub services: Vec<ServiceEntry>,

    /// Node template and fleet settings
    pub nodes: NodeFleetConfig,

    /// Firewall credential exchange settings
    pub firewall: FirewallConfig,

    /// Subzone registration settings
    pub subzone: SubzoneConfig,

    /// Process supervision timings
    pub supervisor: SupervisorConfig,

    /// Child output settings
    pub logging: LoggingConfig,

    /// Files services hand to each other before launch
    #[serde(default)]
    pub handoffs: HandoffConfig,

    /// Paths removed after an interrupted deployment, relative to `root_dir`
    #[serde(default)]
    pub ephemeral_paths: Vec<PathBuf>,

    /// Component versions resolved from `env_file`
    #[serde(skip)]
    pub versions: BTreeMap<String, String>,
}

/// Maps a declared runtime version to an executable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeEntry {
    /// Declared version, e.g. `1.8`
    pub version: String,

    /// Executable used to start services declaring this version
    pub executable: String,
}

/// One catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Short unique identifier, e.g. `idman`
    pub abbreviation: String,

    /// Artifact base name, e.g. `identitymanager`
    pub artifact: String,

    /// Working directory relative to the deployment root
    pub dir: PathBuf,

    /// `.env` key holding this service's version
    pub version_key: String,

    /// Declared runtime version
    pub runtime: String,

    /// Program overriding the runtime executable
    #[serde(default)]
    pub program: Option<String>,

    /// Argument template, supports `{artifact}`, `{config}` and `{version}`
    pub args: Vec<String>,

    /// Config files relative to `dir`; the first one fills `{config}`
    #[serde(default)]
    pub config_files: Vec<String>,

    /// Fixed delay after launch before the next service starts
    pub settle_delay_secs: u64,

    /// Behaviour variant
    pub role: ServiceRole,

    /// Deployment mode group
    pub group: ServiceGroup,

    /// Certificate gate, absent for ungated services
    #[serde(default)]
    pub certificates: Option<CertificateEntry>,

    /// Command line fragment identifying leftover processes
    #[serde(default)]
    pub process_pattern: Option<String>,
}

/// Behaviour variant of a catalog entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// No gate, no special behaviour
    Plain,

    /// Certificate gated service
    Deployable,

    /// Node template cloned into replicas
    Node,

    /// Message broker started after the firewall exchange
    Broker,

    /// Internal firewall leg
    Bridge,

    /// External firewall leg
    Float,
}

/// Deployment mode group a service belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceGroup {
    /// Network manager services
    Network,

    /// Notary services started before the fleet
    Notary,

    /// Broker and firewall legs
    Firewall,
}

/// Certificate gate of a catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateEntry {
    /// Directories counted recursively, relative to the service directory
    pub dirs: Vec<PathBuf>,

    /// Minimum number of files across all directories
    pub required: usize,
}

/// Node fleet settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFleetConfig {
    /// Template node cloned into replicas
    pub template: ServiceEntry,

    /// Organisation prefix of replica legal names
    pub name_prefix: String,

    /// Host part of replica addresses
    pub host: String,

    /// Branch checked out in clones when the firewall is enabled
    pub firewall_branch: String,
}

/// Firewall credential exchange settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Scratch directory holding the shared keystore
    pub tmp_dir: PathBuf,

    /// File name of the shared keystore
    pub shared_keystore: String,

    /// Store password of node and shared keystores
    pub store_password: SecretSource,

    /// Alias of the TLS entry in each replica keystore
    pub source_alias: String,

    /// Keystore tool executable
    pub keytool: String,

    /// Interval between replica keystore polls
    pub poll_interval_secs: u64,

    /// Sleep after every replica keystore exists
    pub settle_secs: u64,

    /// Upper bound on the template run producing network parameters
    pub template_timeout_secs: u64,
}

/// Subzone registration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubzoneConfig {
    /// Administrative tool settings
    pub admin_tool: AdminToolConfig,

    /// Abbreviation of the auth service
    pub auth: String,

    /// Abbreviation of the identity manager
    pub identity_manager: String,

    /// Abbreviation of the signer
    pub signer: String,

    /// Abbreviation of the network map
    pub network_map: String,

    /// Setup script run inside the auth directory
    pub setup_script: String,

    /// Role permission files, relative to the auth directory
    pub roles_dir: PathBuf,

    /// Admin address of the identity manager
    pub identity_manager_admin_address: String,

    /// Admin address of the signer
    pub signer_admin_address: String,

    /// Address the network map subzone is served on
    pub network_map_address: String,

    /// Network parameters file, relative to the network map directory
    pub network_parameters: String,

    /// Label of the created subzone
    pub label: String,

    /// Label colour of the created subzone
    pub label_color: String,
}

/// Administrative tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminToolConfig {
    /// Directory the tool runs in, relative to the deployment root
    pub dir: PathBuf,

    /// Executable
    pub program: String,

    /// Arguments preceding every command
    pub args: Vec<String>,

    /// Gateway URL the tool logs in to
    pub url: String,

    /// Login user
    pub username: String,

    /// Login password
    pub password: SecretSource,
}

/// Pre-launch handoffs run by a service's supervisor task before its command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Abbreviation of the network map, which needs the notary's node info
    pub network_map: String,

    /// Abbreviation of the notary publishing `nodeInfo-*`
    pub notary: String,

    /// Network parameters file, relative to the network map directory
    pub network_parameters: String,

    /// Arguments registering the network parameters, run with the network
    /// map's program; supports `{artifact}`, `{config}` and `{version}`
    pub set_parameters_args: Vec<String>,

    /// Abbreviation of the message broker
    pub broker: String,

    /// Abbreviation of the float the broker waits for
    pub float: String,

    /// Path, relative to the broker directory, present once it is configured
    pub broker_instance_marker: PathBuf,

    /// Tool creating the broker instance, when it is not configured yet
    #[serde(default)]
    pub broker_tool: Option<ToolCommand>,

    /// Interval between polls for node info and for the float
    pub poll_interval_secs: u64,
}

/// External tool run once from its own directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCommand {
    /// Working directory, relative to the deployment root
    pub dir: PathBuf,

    /// Executable
    pub program: String,

    /// Arguments; `{broker_dir}` expands to the absolute broker directory
    pub args: Vec<String>,

    /// Files relative to `dir` copied after a successful run
    #[serde(default)]
    pub copy_files: Vec<PathBuf>,

    /// Destination of `copy_files`, relative to the service directory
    #[serde(default)]
    pub copy_to: PathBuf,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        let strings = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        Self {
            network_map: "nmap".to_string(),
            notary: "notary".to_string(),
            network_parameters: "network-parameters.conf".to_string(),
            set_parameters_args: strings(&[
                "-jar",
                "{artifact}.jar",
                "-f",
                "{config}",
                "--set-network-parameters",
                "network-parameters.conf",
                "--network-truststore",
                "./certificates/network-root-truststore.jks",
                "--truststore-password",
                "trustpass",
                "--root-alias",
                "cordarootca",
            ]),
            broker: "broker".to_string(),
            float: "float".to_string(),
            broker_instance_marker: PathBuf::from("bin/artemis"),
            broker_tool: Some(ToolCommand {
                dir: PathBuf::from("corda-tools"),
                program: "java".to_string(),
                args: strings(&[
                    "-jar",
                    "corda-tools-ha-utilities.jar",
                    "configure-artemis",
                    "--install",
                    "--distribution",
                    "{broker_dir}/../apache-artemis",
                    "--path",
                    "{broker_dir}",
                    "--user",
                    "CN=artemis, O=Corda, L=London, C=GB",
                    "--ha",
                    "MASTER",
                    "--acceptor-address",
                    "localhost:11005",
                    "--keystore",
                    "./artemis/artemis.jks",
                    "--keystore-password",
                    "artemisStorePass",
                    "--truststore",
                    "./artemis/artemis-truststore.jks",
                    "--truststore-password",
                    "artemisTrustpass",
                    "--connectors",
                    "localhost:11005",
                ]),
                copy_files: vec![
                    PathBuf::from("artemis/artemis.jks"),
                    PathBuf::from("artemis/artemis-truststore.jks"),
                ],
                copy_to: PathBuf::from("etc/artemis"),
            }),
            poll_interval_secs: 5,
        }
    }
}

/// Process supervision timings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds between health passes
    pub health_check_frequency_secs: u64,

    /// Delay before a stopped command is relaunched in place
    pub inner_restart_delay_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace_secs: u64,

    /// Interval between straggler polls during shutdown
    pub straggler_poll_secs: u64,
}

/// Child output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory of the deployment log, relative to the deployment root
    pub log_dir: PathBuf,

    /// Deployment log file stem
    pub deployment_name: String,
}

/// Literal secret or `env:NAME` / `file:PATH` reference
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretSource(String);

impl SecretSource {
    /// Wraps a raw source string
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    /// Resolves the source to its secret value
    pub fn resolve(&self) -> Result<SecretString, ConfigError> {
        let value = match self.0.split_once(':') {
            Some(("env", name)) => std::env::var(name).map_err(|_| ConfigError::SecretResolutionError {
                reference: self.0.clone(),
                error: format!("Environment variable {} not found", name),
            })?,
            Some(("file", path)) => fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .map_err(|e| ConfigError::SecretResolutionError {
                    reference: self.0.clone(),
                    error: format!("Failed to read file {}: {}", path, e),
                })?,
            Some(("vault", _)) => return Err(ConfigError::InvalidSecretSource(self.0.clone())),
            _ => self.0.clone(),
        };
        if value.is_empty() {
            return Err(ConfigError::InvalidSecretReference(self.0.clone()));
        }
        Ok(SecretString::new(value))
    }
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.split_once(':') {
            Some((kind @ ("env" | "file"), _)) => write!(f, "SecretSource({}:..)", kind),
            _ => f.write_str("SecretSource(****)"),
        }
    }
}

impl DeploymentConfig {
    /// Resolves a path relative to the deployment root
    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root_dir.join(relative)
    }

    /// Version resolved for a `.env` key
    pub fn version_of(&self, key: &str) -> Option<&str> {
        self.versions.get(key).map(String::as_str)
    }

    /// Executable for a declared runtime version
    pub fn runtime_executable(&self, version: &str) -> Option<&str> {
        self.runtimes
            .iter()
            .find(|r| r.version == version)
            .map(|r| r.executable.as_str())
    }

    /// File receiving the output of every supervised child
    pub fn log_file(&self) -> PathBuf {
        self.resolve(&self.logging.log_dir)
            .join(format!("{}.log", self.logging.deployment_name))
    }

    /// Every catalog entry followed by the node template
    pub fn all_entries(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.services.iter().chain(std::iter::once(&self.nodes.template))
    }

    /// Seconds between health passes
    pub fn health_check_frequency(&self) -> Duration {
        Duration::from_secs(self.supervisor.health_check_frequency_secs)
    }
}

/// Configuration manager
pub struct ConfigManager {
    /// Current active configuration
    config: DeploymentConfig,

    /// Configuration file path
    config_path: Option<PathBuf>,

    /// Whether the configuration has been validated
    validated: bool,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    /// Creates a new configuration manager with the standard topology
    pub fn new() -> Self {
        Self {
            config: Self::default_config(),
            config_path: None,
            validated: false,
        }
    }

    /// Wraps a programmatically built configuration
    pub fn with_config(config: DeploymentConfig) -> Result<Self, ConfigError> {
        let mut manager = Self {
            config,
            config_path: None,
            validated: false,
        };
        manager.validate()?;
        Ok(manager)
    }

    /// Loads configuration from a YAML file layered with `NETDEPLOY__` overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        let document: serde_json::Value =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        validator::ConfigValidator::new().validate_document(&document)?;

        let mut config: DeploymentConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(
                Environment::with_prefix("NETDEPLOY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if config.root_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.root_dir = parent.join(&config.root_dir);
            }
        }

        let mut manager = Self {
            config,
            config_path: Some(path.to_path_buf()),
            validated: false,
        };
        manager.load_versions()?;
        manager.validate()?;

        info!("Configuration loaded from {}", path.display());

        Ok(manager)
    }

    /// Saves the current configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let config_str = serde_yaml::to_string(&self.config)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        fs::write(&path, config_str).map_err(|e| ConfigError::FileWriteError {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;

        info!("Configuration saved to {}", path.as_ref().display());

        Ok(())
    }

    /// Validates the current configuration
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        validator::ConfigValidator::new().validate(&self.config)?;

        self.validated = true;
        debug!("Configuration validated successfully");

        Ok(())
    }

    /// Gets the current configuration
    pub fn get_config(&self) -> &DeploymentConfig {
        &self.config
    }

    /// Path the configuration was loaded from
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Whether the configuration passed validation
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Resolves the admin tool password
    pub fn admin_password(&self) -> Result<SecretString, ConfigError> {
        self.config.subzone.admin_tool.password.resolve()
    }

    /// Reads component versions from the `.env` file, process environment winning
    fn load_versions(&mut self) -> Result<(), ConfigError> {
        let env_path = self.config.resolve(&self.config.env_file);
        if !env_path.exists() {
            return Err(ConfigError::FileReadError {
                path: env_path.display().to_string(),
                error: "No .env file found. Please create one and try again.".to_string(),
            });
        }

        let entries = dotenvy::from_path_iter(&env_path).map_err(|e| ConfigError::FileReadError {
            path: env_path.display().to_string(),
            error: e.to_string(),
        })?;

        let mut versions = BTreeMap::new();
        for entry in entries {
            let (key, value) = entry.map_err(|e| ConfigError::ParseError(format!(
                "{}: {}",
                env_path.display(),
                e
            )))?;
            versions.insert(key, value);
        }

        for key in VERSION_KEYS {
            if let Ok(value) = std::env::var(key) {
                if versions.insert(key.to_string(), value).is_some() {
                    warn!("{} overridden from the process environment", key);
                }
            }
        }

        for entry in self.config.all_entries() {
            if !versions.contains_key(&entry.version_key) {
                return Err(ConfigError::MissingVersion {
                    service: entry.abbreviation.clone(),
                    key: entry.version_key.clone(),
                });
            }
        }

        debug!("Resolved {} component versions", versions.len());
        self.config.versions = versions;

        Ok(())
    }

    /// Creates the standard network manager topology
    pub fn default_config() -> DeploymentConfig {
        let java = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        let certs = |dirs: &[&str], required: usize| {
            Some(CertificateEntry {
                dirs: dirs.iter().map(PathBuf::from).collect(),
                required,
            })
        };
        let entry = |abbreviation: &str,
                     artifact: &str,
                     dir: &str,
                     version_key: &str,
                     args: Vec<String>,
                     config_file: &str,
                     settle_delay_secs: u64,
                     role: ServiceRole,
                     group: ServiceGroup,
                     certificates: Option<CertificateEntry>| ServiceEntry {
            abbreviation: abbreviation.to_string(),
            artifact: artifact.to_string(),
            dir: PathBuf::from(dir),
            version_key: version_key.to_string(),
            runtime: "1.8".to_string(),
            program: None,
            args,
            config_files: vec![config_file.to_string()],
            settle_delay_secs,
            role,
            group,
            certificates,
            process_pattern: None,
        };
        let service_args = java(&["-jar", "{artifact}.jar", "--config-file", "{config}"]);
        let node_args = java(&["-jar", "{artifact}.jar", "-f", "{config}"]);

        let mut broker = entry(
            "broker",
            "artemis",
            "cenm-firewall/artemis",
            "NODE_VERSION",
            java(&["bin/artemis", "run"]),
            "etc/broker.xml",
            15,
            ServiceRole::Broker,
            ServiceGroup::Firewall,
            None,
        );
        broker.program = Some("bash".to_string());
        broker.config_files.clear();
        broker.process_pattern = Some("artemis".to_string());

        DeploymentConfig {
            version: "1.0".to_string(),
            root_dir: PathBuf::from("."),
            env_file: PathBuf::from(".env"),
            runtimes: vec![
                RuntimeEntry {
                    version: "1.8".to_string(),
                    executable: "java".to_string(),
                },
                RuntimeEntry {
                    version: "11".to_string(),
                    executable: "java".to_string(),
                },
            ],
            services: vec![
                entry("idman", "identitymanager", "cenm-idman", "CENM_VERSION", service_args.clone(),
                    "identitymanager.conf", 10, ServiceRole::Deployable, ServiceGroup::Network,
                    certs(&["certificates"], 3)),
                entry("signer", "signer", "cenm-signer", "CENM_VERSION", service_args.clone(),
                    "signer.conf", 10, ServiceRole::Deployable, ServiceGroup::Network,
                    certs(&["certificates"], 3)),
                entry("notary", "corda", "cenm-notary", "NODE_VERSION", node_args.clone(),
                    "node.conf", 30, ServiceRole::Deployable, ServiceGroup::Notary,
                    certs(&["certificates"], 1)),
                entry("nmap", "networkmap", "cenm-nmap", "CENM_VERSION", service_args.clone(),
                    "network-map.conf", 10, ServiceRole::Deployable, ServiceGroup::Network,
                    certs(&["certificates"], 2)),
                entry("auth", "accounts-application", "cenm-auth", "AUTH_VERSION", service_args.clone(),
                    "auth.conf", 15, ServiceRole::Deployable, ServiceGroup::Network,
                    certs(&["certificates"], 2)),
                entry("gateway", "gateway-service", "cenm-gateway", "GATEWAY_VERSION",
                    java(&["-jar", "private/{artifact}.jar", "--config-file", "{config}"]),
                    "private/gateway.conf", 10, ServiceRole::Deployable, ServiceGroup::Network,
                    certs(&["public/certificates", "private/certificates"], 2)),
                entry("zone", "zone", "cenm-zone", "CENM_VERSION", service_args,
                    "zone.conf", 10, ServiceRole::Deployable, ServiceGroup::Network,
                    certs(&["certificates"], 2)),
                broker,
                entry("bridge", "corda-firewall", "cenm-firewall/bridge", "NODE_VERSION",
                    java(&["-jar", "{artifact}.jar", "--config-file", "{config}"]),
                    "firewall.conf", 10, ServiceRole::Bridge, ServiceGroup::Firewall,
                    certs(&["certificates"], 2)),
                entry("float", "corda-firewall", "cenm-firewall/float", "NODE_VERSION",
                    java(&["-jar", "{artifact}.jar", "--config-file", "{config}"]),
                    "firewall.conf", 10, ServiceRole::Float, ServiceGroup::Firewall,
                    certs(&["certificates"], 1)),
            ],
            nodes: NodeFleetConfig {
                template: entry("node", "corda", "cenm-node", "NODE_VERSION", node_args,
                    "node.conf", 30, ServiceRole::Node, ServiceGroup::Network,
                    certs(&["certificates"], 1)),
                name_prefix: "TestNode".to_string(),
                host: "localhost".to_string(),
                firewall_branch: "release/firewall".to_string(),
            },
            firewall: FirewallConfig {
                tmp_dir: PathBuf::from("cenm-firewall/tmp"),
                shared_keystore: "nodesUnitedSslKeystore.jks".to_string(),
                store_password: SecretSource::new("cordacadevpass"),
                source_alias: "cordaclienttls".to_string(),
                keytool: "keytool".to_string(),
                poll_interval_secs: 5,
                settle_secs: 10,
                template_timeout_secs: 60,
            },
            subzone: SubzoneConfig {
                admin_tool: AdminToolConfig {
                    dir: PathBuf::from("cenm-tool"),
                    program: "java".to_string(),
                    args: vec!["-jar".to_string(), "cenm-tool.jar".to_string()],
                    url: "http://127.0.0.1:8089".to_string(),
                    username: "admin".to_string(),
                    password: SecretSource::new("password"),
                },
                auth: "auth".to_string(),
                identity_manager: "idman".to_string(),
                signer: "signer".to_string(),
                network_map: "nmap".to_string(),
                setup_script: "setup-auth.sh".to_string(),
                roles_dir: PathBuf::from("setup-auth/roles"),
                identity_manager_admin_address: "127.0.0.1:5053".to_string(),
                signer_admin_address: "127.0.0.1:5054".to_string(),
                network_map_address: "127.0.0.1:20000".to_string(),
                network_parameters: "network-parameters.conf".to_string(),
                label: "Main".to_string(),
                label_color: "#941213".to_string(),
            },
            supervisor: SupervisorConfig {
                health_check_frequency_secs: 30,
                inner_restart_delay_ms: 1000,
                stop_grace_secs: 10,
                straggler_poll_secs: 5,
            },
            logging: LoggingConfig {
                log_dir: PathBuf::from("logs"),
                deployment_name: "netdeploy".to_string(),
            },
            handoffs: HandoffConfig::default(),
            ephemeral_paths: vec![PathBuf::from("cenm-firewall/tmp")],
            versions: BTreeMap::new(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {error}")]
    FileReadError {
        path: String,
        error: String,
    },

    #[error("Failed to write configuration file {path}: {error}")]
    FileWriteError {
        path: String,
        error: String,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Service {service} requires {key}, which is missing from the .env file")]
    MissingVersion {
        service: String,
        key: String,
    },

    #[error("Service {service} declares runtime {runtime}, which has no configured executable")]
    UnknownRuntime {
        service: String,
        runtime: String,
    },

    #[error("Invalid secret reference: {0}")]
    InvalidSecretReference(String),

    #[error("Unsupported secret source: {0}")]
    InvalidSecretSource(String),

    #[error("Failed to resolve secret {reference}: {error}")]
    SecretResolutionError {
        reference: String,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn write_env(dir: &Path) {
        fs::write(
            dir.join(".env"),
            "ARTIFACTORY_USERNAME=user\nCENM_VERSION=1.5.9\nAUTH_VERSION=1.4\nGATEWAY_VERSION=1.4\nNODE_VERSION=4.10\n",
        )
        .unwrap();
    }

    #[test]
    fn default_config_is_valid() {
        let mut manager = ConfigManager::new();
        manager.validate().unwrap();
        assert!(manager.is_validated());
    }

    #[test]
    fn saved_config_loads_back_with_versions() {
        let dir = tempfile::tempdir().unwrap();
        write_env(dir.path());
        let path = dir.path().join("deployment.yaml");
        ConfigManager::new().save_to_file(&path).unwrap();

        let manager = ConfigManager::load_from_file(&path).unwrap();
        let config = manager.get_config();
        assert_eq!(config.version_of("CENM_VERSION"), Some("1.5.9"));
        assert_eq!(config.version_of("ARTIFACTORY_USERNAME"), Some("user"));
        assert_eq!(config.services.len(), 10);
        assert_eq!(config.root_dir, dir.path().join("."));
        assert_eq!(config.runtime_executable("1.8"), Some("java"));
        assert_eq!(
            config.log_file(),
            dir.path().join(".").join("logs").join("netdeploy.log")
        );
    }

    #[test]
    fn missing_env_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployment.yaml");
        ConfigManager::new().save_to_file(&path).unwrap();

        let err = ConfigManager::load_from_file(&path).err().unwrap();
        assert!(matches!(err, ConfigError::FileReadError { .. }));
    }

    #[test]
    fn missing_version_names_the_service() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".env"),
            "CENM_VERSION=1.5.9\nGATEWAY_VERSION=1.4\nNODE_VERSION=4.10\n",
        )
        .unwrap();
        let path = dir.path().join("deployment.yaml");
        ConfigManager::new().save_to_file(&path).unwrap();

        match ConfigManager::load_from_file(&path) {
            Err(ConfigError::MissingVersion { service, key }) => {
                assert_eq!(service, "auth");
                assert_eq!(key, "AUTH_VERSION");
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn document_violating_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_env(dir.path());
        let path = dir.path().join("deployment.yaml");
        fs::write(&path, "version: \"1.0\"\nservices: []\n").unwrap();

        let err = ConfigManager::load_from_file(&path).err().unwrap();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn omitted_handoffs_take_the_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_env(dir.path());
        let path = dir.path().join("deployment.yaml");
        ConfigManager::new().save_to_file(&path).unwrap();

        let mut document: serde_yaml::Value = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        document.as_mapping_mut().unwrap().remove("handoffs");
        fs::write(&path, serde_yaml::to_string(&document).unwrap()).unwrap();

        let manager = ConfigManager::load_from_file(&path).unwrap();
        let handoffs = &manager.get_config().handoffs;
        assert_eq!(handoffs.network_map, "nmap");
        assert_eq!(handoffs.float, "float");
        assert_eq!(handoffs.broker_instance_marker, PathBuf::from("bin/artemis"));
        assert_eq!(handoffs.broker_tool.as_ref().unwrap().copy_to, PathBuf::from("etc/artemis"));
    }

    #[test]
    fn secret_sources_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pw");
        fs::write(&file, "s3cret\n").unwrap();

        let from_file = SecretSource::new(format!("file:{}", file.display()));
        assert_eq!(from_file.resolve().unwrap().expose_secret(), "s3cret");

        let literal = SecretSource::new("password");
        assert_eq!(literal.resolve().unwrap().expose_secret(), "password");
        assert_eq!(format!("{:?}", literal), "SecretSource(****)");

        let missing = SecretSource::new("env:NETDEPLOY_TEST_UNSET_SECRET");
        assert!(matches!(
            missing.resolve(),
            Err(ConfigError::SecretResolutionError { .. })
        ));
        assert!(matches!(
            SecretSource::new("vault:kv/admin").resolve(),
            Err(ConfigError::InvalidSecretSource(_))
        ));
    }
}
