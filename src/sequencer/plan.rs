// src/sequencer/plan.rs

//! What a deployment launches, and in which order.

use std::fmt;
use std::str::FromStr;

use crate::config::{ServiceGroup, SubzoneConfig};
use crate::service::{node_info_files, ServiceCatalog, ServiceDescriptor};

/// Which part of the topology a deployment brings up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Network services and the notary
    Network,
    /// Node replicas, with the firewall when enabled
    Nodes,
    /// Both, network first
    Full,
}

impl DeploymentMode {
    /// Whether network services are launched
    pub fn includes_network(self) -> bool {
        matches!(self, Self::Network | Self::Full)
    }

    /// Whether node replicas are launched
    pub fn includes_nodes(self) -> bool {
        matches!(self, Self::Nodes | Self::Full)
    }
}

impl FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "network" => Ok(Self::Network),
            "nodes" => Ok(Self::Nodes),
            "full" => Ok(Self::Full),
            other => Err(format!("Unknown deployment mode {:?}, expected network, nodes or full", other)),
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Nodes => "nodes",
            Self::Full => "full",
        })
    }
}

/// Ordered services of one deployment
#[derive(Debug, Clone, Default)]
pub struct DeploymentPlan {
    /// Services in launch order
    pub services: Vec<ServiceDescriptor>,

    /// Whether subzone registration runs once everything has launched
    pub run_subzone: bool,

    /// Whether firewall legs wait for the firewall bootstrap
    pub firewall: bool,
}

impl DeploymentPlan {
    /// Plan launching `services` in order, with no bootstrap
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        Self {
            services,
            run_subzone: false,
            firewall: false,
        }
    }

    /// Standard plan: catalog network services, then `nodes`, then the
    /// firewall group when `firewall` is set
    pub fn build(
        mode: DeploymentMode,
        catalog: &ServiceCatalog,
        nodes: Vec<ServiceDescriptor>,
        firewall: bool,
        subzone: &SubzoneConfig,
    ) -> Self {
        let mut services: Vec<ServiceDescriptor> = Vec::new();
        if mode.includes_network() {
            services.extend(
                catalog
                    .services()
                    .iter()
                    .filter(|s| matches!(s.group, ServiceGroup::Network | ServiceGroup::Notary))
                    .cloned(),
            );
        }

        let firewall = firewall && mode.includes_nodes();
        if mode.includes_nodes() {
            services.extend(nodes);
        }
        if firewall {
            services.extend(catalog.group(ServiceGroup::Firewall));
        }

        let run_subzone = mode.includes_network() && needs_subzone_setup(&services, subzone);
        Self {
            services,
            run_subzone,
            firewall,
        }
    }

    /// Splits the plan into services launched right away and firewall legs
    /// held back for the firewall bootstrap
    pub fn partition(&self) -> (Vec<ServiceDescriptor>, Vec<ServiceDescriptor>) {
        if !self.firewall {
            return (self.services.clone(), Vec::new());
        }
        self.services.iter().cloned().partition(|s| !s.is_firewall_leg())
    }

    /// Distinct process patterns of every planned service
    pub fn process_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        for service in &self.services {
            if !patterns.contains(&service.process_pattern) {
                patterns.push(service.process_pattern.clone());
            }
        }
        patterns
    }
}

/// Subzone registration is due when the auth service and network map are
/// deployed and the network has not yet published node information
pub fn needs_subzone_setup(services: &[ServiceDescriptor], subzone: &SubzoneConfig) -> bool {
    let deployed = |abbreviation: &str| services.iter().any(|s| s.abbreviation == abbreviation);
    if !deployed(&subzone.auth) || !deployed(&subzone.network_map) {
        return false;
    }

    let published = services
        .iter()
        .filter(|s| s.abbreviation == subzone.network_map || s.group == ServiceGroup::Notary)
        .all(|s| !node_info_files(&s.dir).is_empty());
    !published
}
