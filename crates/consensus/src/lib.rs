//! Consensus constants, parameters, and soft-fork deployment schedule.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;
pub mod rewards;

pub use deployments::{deployment_active, Deployment, DeploymentHeights};
pub use params::{
    chain_params, consensus_params, hash256_from_hex, ChainParams, Checkpoint, ConsensusParams,
    HexError, Network,
};
pub use rewards::block_subsidy;

pub type Hash256 = [u8; 32];
