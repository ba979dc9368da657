// src/scaling/mod.rs

//! Horizontal scaling of the node role.

pub mod fleet;

pub use fleet::{
    ArtifactFetcher, ExpectPresent, FleetError, FleetSettings, NodeFleetManager, NodeInstance, PortBlock,
    MAX_REPLICAS,
};
