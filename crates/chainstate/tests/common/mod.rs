#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use utxod_chainstate::validation::coinbase_height_prefix;
use utxod_chainstate::{BlockStore, BlockStoreOptions, ChainState, ChainStateOptions};
use utxod_consensus::constants::SEQUENCE_FINAL;
use utxod_consensus::money::Amount;
use utxod_consensus::{block_subsidy, chain_params, consensus_params, ConsensusParams, Network};
use utxod_pow::validate_pow_header;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};
use utxod_storage::memory::MemoryStore;

pub const NOW: i64 = 2_000_000_000;
pub const REGTEST_BITS: u32 = 0x207f_ffff;
pub const ANYONE_CAN_SPEND: [u8; 1] = [0x51];

pub fn regtest() -> ConsensusParams {
    consensus_params(Network::Regtest)
}

pub fn open_chain(
    store: Arc<MemoryStore>,
    dir: &Path,
    options: ChainStateOptions,
) -> ChainState<MemoryStore> {
    let magic = chain_params(Network::Regtest).message_start;
    let blocks = BlockStore::open(BlockStoreOptions::new(dir, magic)).expect("block store");
    ChainState::open(store, blocks, regtest(), options).expect("open chain state")
}

pub fn coinbase(height: i32, tag: u8, value: Amount) -> Transaction {
    let mut script_sig = coinbase_height_prefix(height);
    script_sig.push(tag);
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig, SEQUENCE_FINAL)],
        vout: vec![TxOut {
            value,
            script_pubkey: ANYONE_CAN_SPEND.to_vec(),
        }],
        lock_time: 0,
    }
}

/// Spends `prevout` into a single anyone-can-spend output.
pub fn spend(prevout: OutPoint, value: Amount) -> Transaction {
    Transaction {
        version: 2,
        vin: vec![TxIn::new(prevout, Vec::new(), SEQUENCE_FINAL)],
        vout: vec![TxOut {
            value,
            script_pubkey: ANYONE_CAN_SPEND.to_vec(),
        }],
        lock_time: 0,
    }
}

/// Builds a block on `parent` paying the full subsidy and grinds the nonce
/// until it meets the regtest target.
pub fn mine(parent: &BlockHeader, height: i32, tag: u8, txs: Vec<Transaction>) -> Block {
    let params = regtest();
    let mut transactions = vec![coinbase(height, tag, block_subsidy(height, &params))];
    transactions.extend(txs);
    let mut block = Block {
        header: BlockHeader {
            version: 0x2000_0000,
            prev_block: parent.hash(),
            merkle_root: [0u8; 32],
            time: parent.time + 1,
            bits: REGTEST_BITS,
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    while validate_pow_header(&block.header, &params).is_err() {
        block.header.nonce += 1;
    }
    block
}

/// Mines `count` empty blocks on `parent`, returning them in order.
pub fn mine_chain(parent: &BlockHeader, start_height: i32, count: usize, tag: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count);
    let mut header = parent.clone();
    for offset in 0..count {
        let block = mine(&header, start_height + offset as i32, tag, Vec::new());
        header = block.header.clone();
        blocks.push(block);
    }
    blocks
}

pub fn submit(state: &ChainState<MemoryStore>, block: &Block) {
    state.accept_block(block, NOW).expect("accept block");
    state.activate_best_chain_fully().expect("activate");
}

pub fn genesis_header(state: &ChainState<MemoryStore>) -> BlockHeader {
    let tip = state.hash_at_height(0).expect("genesis");
    state.block_info(&tip).expect("genesis info").header
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}
