// src/bootstrap/subzone.rs

//! Subzone registration against a freshly started network.
//!
//! The identity manager, signer and network map each need a token minted by
//! the zone service before their agents can pick up configuration. Tokens are
//! written next to each service and never overwritten.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::admin_cli::{parse_subzone_ids, token_from, AdminCli};
use super::{io_error, persist_token, BootstrapError, Bootstrapper};
use crate::config::rewrite::{self, RewriteError};
use crate::config::SubzoneConfig;
use crate::execution::{BoxedExecutor, CommandSpec};
use crate::service::{ServiceCatalog, ServiceDescriptor};

/// Placeholder substituted in role permission files
pub const SUBZONE_PLACEHOLDER: &str = "<SUBZONE_ID>";

/// A service that receives a zone token
#[derive(Debug, Clone)]
pub struct TokenTarget {
    /// Service directory, where the token is written
    pub dir: PathBuf,

    /// Configuration pushed to the zone service
    pub config: PathBuf,
}

impl TokenTarget {
    fn for_service(catalog: &ServiceCatalog, abbreviation: &str) -> Result<Self, BootstrapError> {
        let service = lookup(catalog, abbreviation)?;
        let config = service.config_paths().into_iter().next().ok_or_else(|| {
            BootstrapError::Configuration(format!("{} has no configuration file to push", abbreviation))
        })?;
        Ok(Self {
            dir: service.dir.clone(),
            config,
        })
    }
}

fn lookup<'a>(catalog: &'a ServiceCatalog, abbreviation: &str) -> Result<&'a ServiceDescriptor, BootstrapError> {
    catalog
        .get(abbreviation)
        .ok_or_else(|| BootstrapError::Configuration(format!("Subzone setup needs service {}", abbreviation)))
}

/// Resolved subzone registration settings
#[derive(Debug, Clone)]
pub struct SubzoneSettings {
    /// Directory of the auth service
    pub auth_dir: PathBuf,

    /// Setup script run inside `auth_dir`
    pub setup_script: String,

    /// Directory of role permission files
    pub roles_dir: PathBuf,

    /// Identity manager
    pub identity_manager: TokenTarget,

    /// Signer
    pub signer: TokenTarget,

    /// Network map
    pub network_map: TokenTarget,

    /// Network parameters of the created subzone
    pub network_parameters: PathBuf,

    /// Admin address of the identity manager
    pub identity_manager_admin_address: String,

    /// Admin address of the signer
    pub signer_admin_address: String,

    /// Address the subzone network map is served on
    pub network_map_address: String,

    /// Subzone label
    pub label: String,

    /// Subzone label colour
    pub label_color: String,
}

impl SubzoneSettings {
    /// Resolves the settings against the service catalog
    pub fn from_config(config: &SubzoneConfig, catalog: &ServiceCatalog) -> Result<Self, BootstrapError> {
        let auth = lookup(catalog, &config.auth)?;
        let network_map = TokenTarget::for_service(catalog, &config.network_map)?;

        Ok(Self {
            auth_dir: auth.dir.clone(),
            setup_script: config.setup_script.clone(),
            roles_dir: auth.dir.join(&config.roles_dir),
            identity_manager: TokenTarget::for_service(catalog, &config.identity_manager)?,
            signer: TokenTarget::for_service(catalog, &config.signer)?,
            network_parameters: network_map.dir.join(&config.network_parameters),
            network_map,
            identity_manager_admin_address: config.identity_manager_admin_address.clone(),
            signer_admin_address: config.signer_admin_address.clone(),
            network_map_address: config.network_map_address.clone(),
            label: config.label.clone(),
            label_color: config.label_color.clone(),
        })
    }
}

/// Tokens minted during one registration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneTokens {
    /// Identity manager token
    pub identity_manager: Option<String>,
    /// Signer token
    pub signer: Option<String>,
    /// Network map token
    pub network_map: Option<String>,
}

/// Registers the network with the zone service
pub struct SubzoneBootstrapper {
    executor: BoxedExecutor,
    cli: AdminCli,
    settings: SubzoneSettings,
}

impl SubzoneBootstrapper {
    /// Creates a bootstrapper; `executor` runs the setup script
    pub fn new(executor: BoxedExecutor, cli: AdminCli, settings: SubzoneSettings) -> Self {
        Self {
            executor,
            cli,
            settings,
        }
    }

    async fn run_setup_script(&self) -> Result<(), BootstrapError> {
        info!("Running {} in {}", self.settings.setup_script, self.settings.auth_dir.display());
        let spec = CommandSpec::new("bash")
            .arg(&self.settings.setup_script)
            .current_dir(&self.settings.auth_dir);
        self.executor.execute(&spec).await?;
        Ok(())
    }

    async fn set_admin_address(&self, service: &str, address: &str) -> Result<(), BootstrapError> {
        let address = format!("-a={}", address);
        self.cli
            .run([service, "config", "set-admin-address", address.as_str()])
            .await?;
        Ok(())
    }

    async fn push_config(&self, service: &str, config: &Path) -> Result<Option<String>, BootstrapError> {
        let file = format!("-f={}", config.display());
        let output = self
            .cli
            .run([service, "config", "set", file.as_str(), "--zone-token"])
            .await?;
        Ok(token_from(&output))
    }

    async fn create_subzone(&self) -> Result<Option<String>, BootstrapError> {
        let s = &self.settings;
        let output = self
            .cli
            .run([
                "zone".to_string(),
                "create-subzone".to_string(),
                format!("--config-file={}", s.network_map.config.display()),
                format!("--network-map-address={}", s.network_map_address),
                format!("--network-parameters={}", s.network_parameters.display()),
                format!("--label={}", s.label),
                format!("--label-color={}", s.label_color),
                "--zone-token".to_string(),
            ])
            .await?;
        Ok(token_from(&output))
    }

    /// Ids of the existing subzones; unparseable output means none
    pub async fn subzones(&self) -> Result<Vec<String>, BootstrapError> {
        let output = self.cli.run(["zone", "get-subzones"]).await?;
        Ok(parse_subzone_ids(&output))
    }

    /// Writes `id` over the placeholder in every role file
    fn substitute_roles(&self, id: &str) -> Result<usize, BootstrapError> {
        let roles = &self.settings.roles_dir;
        if !roles.is_dir() {
            warn!("Role directory {} does not exist", roles.display());
            return Ok(0);
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(roles) {
            let entry = entry.map_err(|e| io_error(roles)(e.into()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        let mut replaced = 0;
        for file in files {
            rewrite::rewrite_file(&file, |contents| {
                let (updated, count) = rewrite::replace_placeholder(contents, SUBZONE_PLACEHOLDER, id);
                replaced += count;
                Ok::<_, RewriteError>(updated)
            })?;
        }
        info!("Replaced {} {} occurrence(s) in {}", replaced, SUBZONE_PLACEHOLDER, roles.display());
        Ok(replaced)
    }

    /// Runs registration and returns the minted tokens without persisting them
    pub async fn register(&self) -> Result<ZoneTokens, BootstrapError> {
        let s = &self.settings;
        self.run_setup_script().await?;

        self.set_admin_address("identity-manager", &s.identity_manager_admin_address)
            .await?;
        self.set_admin_address("signer", &s.signer_admin_address).await?;

        let mut tokens = ZoneTokens {
            identity_manager: self.push_config("identity-manager", &s.identity_manager.config).await?,
            signer: self.push_config("signer", &s.signer.config).await?,
            network_map: self.create_subzone().await?,
        };

        let subzones = self.subzones().await?;
        if let Some(id) = subzones.first() {
            info!("Found subzone {}", id);
            self.substitute_roles(id)?;
            self.run_setup_script().await?;

            let output = self
                .cli
                .run([
                    "netmap".to_string(),
                    "config".to_string(),
                    "set".to_string(),
                    "-s".to_string(),
                    id.clone(),
                    format!("-f={}", s.network_map.config.display()),
                    "--zone-token".to_string(),
                ])
                .await?;
            if let Some(token) = token_from(&output) {
                tokens.network_map = Some(token);
            }
        } else {
            warn!("No subzones reported, keeping the token from subzone creation");
        }

        Ok(tokens)
    }

    /// Writes every minted token, keeping existing token files
    pub fn persist(&self, tokens: &ZoneTokens) -> Result<(), BootstrapError> {
        let s = &self.settings;
        let targets = [
            ("identity manager", &s.identity_manager, &tokens.identity_manager),
            ("signer", &s.signer, &tokens.signer),
            ("network map", &s.network_map, &tokens.network_map),
        ];
        for (name, target, token) in targets {
            match token {
                Some(token) => {
                    persist_token(&target.dir, token)?;
                }
                None => warn!("No token was printed for the {}", name),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Bootstrapper for SubzoneBootstrapper {
    fn name(&self) -> &'static str {
        "subzone"
    }

    async fn setup(&self) -> Result<(), BootstrapError> {
        let tokens = self.register().await?;
        self.persist(&tokens)
    }
}
