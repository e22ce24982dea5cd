//! Hard-coded genesis blocks.

use utxod_consensus::constants::SEQUENCE_FINAL;
use utxod_consensus::ConsensusParams;

use crate::block::{Block, BlockHeader};
use crate::hex::hex_to_bytes;
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxIn, TxOut};

const GENESIS_SCRIPT_SIG: &str = "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73";
const GENESIS_OUTPUT_SCRIPT: &str = "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac";

/// Builds the genesis block for `params`; its hash equals `params.hash_genesis_block`.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn::new(
            OutPoint::null(),
            hex_to_bytes(GENESIS_SCRIPT_SIG).unwrap_or_default(),
            SEQUENCE_FINAL,
        )],
        vout: vec![TxOut {
            value: params.genesis_reward,
            script_pubkey: hex_to_bytes(GENESIS_OUTPUT_SCRIPT).unwrap_or_default(),
        }],
        lock_time: 0,
    };
    let merkle_root = coinbase.txid();
    Block {
        header: BlockHeader {
            version: params.genesis_version,
            prev_block: [0u8; 32],
            merkle_root,
            time: params.genesis_time,
            bits: params.genesis_bits,
            nonce: params.genesis_nonce,
        },
        transactions: vec![coinbase],
    }
}
