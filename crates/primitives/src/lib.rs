//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod genesis;
pub mod hash;
pub mod hex;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockDecodeError, BlockHeader};
pub use genesis::genesis_block;
pub use hash::{hash160, sha256, sha256d};
pub use hex::{bytes_to_hex, hash256_to_hex, hex_to_bytes};
pub use merkle::{merkle_root, witness_merkle_root};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TransactionDecodeError, TxIn, TxOut};
