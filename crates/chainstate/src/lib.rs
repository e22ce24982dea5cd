//! Block index, UTXO set, and the chain state manager that keeps them in step.

pub mod filemeta;
pub mod flatfiles;
pub mod index;
pub mod state;
pub mod undo;
pub mod utxo;
pub mod validation;

pub use flatfiles::{BlockStore, BlockStoreOptions};
pub use state::{
    ActivationStep, BlockAcceptance, BlockInfo, ChainState, ChainStateError, ChainStateOptions,
    ChainTip, HeadersAccepted, NextBlockContext,
};
pub use utxo::{UtxoEntry, UtxoOverlay, UtxoSet, UtxoView};
pub use validation::{FailureClass, ValidationError};
