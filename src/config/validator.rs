// src/config/validator.rs

use std::collections::HashSet;

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::config::{ConfigError, DeploymentConfig, ServiceEntry, ServiceGroup, ServiceRole};

/// Configuration validator
pub struct ConfigValidator {
    schema: Value,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// Creates a new configuration validator
    pub fn new() -> Self {
        Self {
            schema: super::schema::get_deployment_config_schema(),
        }
    }

    /// Validates a raw configuration document against the JSON schema
    pub fn validate_document(&self, document: &Value) -> Result<(), ConfigError> {
        let compiled = JSONSchema::compile(&self.schema)
            .map_err(|e| ConfigError::ValidationError(format!("Invalid schema: {}", e)))?;

        if let Err(errors) = compiled.validate(document) {
            let messages: Vec<String> = errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect();
            return Err(ConfigError::ValidationError(messages.join("; ")));
        }

        Ok(())
    }

    /// Validates a configuration
    pub fn validate(&self, config: &DeploymentConfig) -> Result<(), ConfigError> {
        // Validate base configuration
        if config.version.is_empty() {
            return Err(ConfigError::ValidationError(
                "Configuration version cannot be empty".to_string(),
            ));
        }

        if !config.version.starts_with("1.") {
            return Err(ConfigError::ValidationError(format!(
                "Unsupported configuration version: {}",
                config.version
            )));
        }

        // Validate service catalog
        self.validate_catalog(config)?;
        self.validate_template(&config.nodes.template)?;

        // Validate bootstrap configuration
        self.validate_firewall(config)?;
        self.validate_subzone(config)?;

        // Validate supervisor timings
        if config.supervisor.health_check_frequency_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Health check frequency cannot be zero".to_string(),
            ));
        }

        if config.supervisor.straggler_poll_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Straggler poll interval cannot be zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates catalog entries and the node template together
    fn validate_catalog(&self, config: &DeploymentConfig) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for entry in config.all_entries() {
            if !seen.insert(entry.abbreviation.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate service abbreviation: {}",
                    entry.abbreviation
                )));
            }

            if entry.program.is_none() && config.runtime_executable(&entry.runtime).is_none() {
                return Err(ConfigError::UnknownRuntime {
                    service: entry.abbreviation.clone(),
                    runtime: entry.runtime.clone(),
                });
            }

            if entry.program.is_none() && entry.args.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Service {} has an empty start command",
                    entry.abbreviation
                )));
            }

            if entry.args.iter().any(|a| a.contains("{config}")) && entry.config_files.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Service {} references {{config}} but lists no config files",
                    entry.abbreviation
                )));
            }
        }

        if let Some(entry) = config.services.iter().find(|e| e.role == ServiceRole::Node) {
            return Err(ConfigError::ValidationError(format!(
                "Service {} has the node role; nodes are cloned from the fleet template",
                entry.abbreviation
            )));
        }

        Ok(())
    }

    fn validate_template(&self, template: &ServiceEntry) -> Result<(), ConfigError> {
        if template.role != ServiceRole::Node {
            return Err(ConfigError::ValidationError(format!(
                "Node template {} must have the node role",
                template.abbreviation
            )));
        }

        if template.config_files.is_empty() {
            return Err(ConfigError::ValidationError(
                "Node template must list its node configuration file".to_string(),
            ));
        }

        Ok(())
    }

    /// Firewall legs must come as a complete set in the firewall group
    fn validate_firewall(&self, config: &DeploymentConfig) -> Result<(), ConfigError> {
        let legs: Vec<&ServiceEntry> = config
            .services
            .iter()
            .filter(|e| matches!(e.role, ServiceRole::Broker | ServiceRole::Bridge | ServiceRole::Float))
            .collect();

        if legs.is_empty() {
            return Ok(());
        }

        for leg in &legs {
            if leg.group != ServiceGroup::Firewall {
                return Err(ConfigError::ValidationError(format!(
                    "Firewall leg {} must belong to the firewall group",
                    leg.abbreviation
                )));
            }
        }

        for role in [ServiceRole::Bridge, ServiceRole::Float] {
            let count = legs.iter().filter(|e| e.role == role).count();
            if count != 1 {
                return Err(ConfigError::ValidationError(format!(
                    "Expected exactly one {:?} firewall leg, found {}",
                    role, count
                )));
            }
        }

        if config.firewall.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Firewall poll interval cannot be zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Subzone roles must name catalog services
    fn validate_subzone(&self, config: &DeploymentConfig) -> Result<(), ConfigError> {
        let subzone = &config.subzone;
        for abbreviation in [
            &subzone.auth,
            &subzone.identity_manager,
            &subzone.signer,
            &subzone.network_map,
        ] {
            if !config.services.iter().any(|e| &e.abbreviation == abbreviation) {
                return Err(ConfigError::ValidationError(format!(
                    "Subzone role {} is not in the service catalog",
                    abbreviation
                )));
            }
        }

        Ok(())
    }
}

/// Whether a configuration contains a complete firewall topology
pub fn has_firewall_legs(config: &DeploymentConfig) -> bool {
    config.services.iter().any(|e| e.role == ServiceRole::Bridge)
        && config.services.iter().any(|e| e.role == ServiceRole::Float)
}
