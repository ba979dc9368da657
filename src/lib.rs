// netdeploy - Deployment orchestration for network-fleet services
//
// Licensed under the GNU General Public License v3.0

//! netdeploy brings up an interdependent fleet of network infrastructure
//! services in dependency order, keeps their processes alive, scales the node
//! role into numbered replicas and drives the bootstrap protocols that later
//! services depend on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// One-shot bootstrap protocols
pub mod bootstrap;

/// Configuration subsystem
pub mod config;

/// Process supervision and external commands
pub mod execution;

/// Node replica management
pub mod scaling;

/// Startup sequencing and health supervision
pub mod sequencer;

/// Service descriptors and pre-launch gating
pub mod service;

// Re-export common types
pub use config::{ConfigManager, DeploymentConfig};
pub use sequencer::{DeploymentPlan, DeploymentSequencer};
pub use service::{ServiceCatalog, ServiceDescriptor};
