#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use utxod::interface::{PeerId, Severity, Transport};
use utxod::{MempoolPolicy, Node, SyncConfig};
use utxod_chainstate::validation::coinbase_height_prefix;
use utxod_chainstate::{BlockStore, BlockStoreOptions, ChainState, ChainStateOptions};
use utxod_consensus::constants::SEQUENCE_FINAL;
use utxod_consensus::money::Amount;
use utxod_consensus::{block_subsidy, chain_params, consensus_params, Hash256, Network};
use utxod_pow::validate_pow_header;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};
use utxod_storage::memory::MemoryStore;

pub const NOW: i64 = 2_000_000_000;
pub const REGTEST_BITS: u32 = 0x207f_ffff;
pub const ANYONE_CAN_SPEND: [u8; 1] = [0x51];

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Sent {
    Headers(PeerId, Vec<Hash256>),
    Block(PeerId, Hash256),
    Misbehavior(PeerId, Severity, String),
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingTransport {
    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock().expect("sent lock"))
    }

    fn push(&self, sent: Sent) {
        self.sent.lock().expect("sent lock").push(sent);
    }
}

impl Transport for RecordingTransport {
    fn request_headers(&self, peer: PeerId, locator: Vec<Hash256>) {
        self.push(Sent::Headers(peer, locator));
    }

    fn request_block(&self, peer: PeerId, hash: Hash256) {
        self.push(Sent::Block(peer, hash));
    }

    fn report_misbehavior(&self, peer: PeerId, severity: Severity, reason: &str) {
        self.push(Sent::Misbehavior(peer, severity, reason.to_string()));
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub chain: Arc<ChainState<MemoryStore>>,
    pub node: Node<MemoryStore>,
    pub transport: Arc<RecordingTransport>,
    /// Blocks 1..=101 of the active chain; the first coinbase is mature.
    pub blocks: Vec<Block>,
}

impl Harness {
    /// A regtest node whose commands run inline via `process_pending`.
    pub fn new() -> Self {
        Self::with_sync_config(SyncConfig::default())
    }

    pub fn with_sync_config(sync: SyncConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let magic = chain_params(Network::Regtest).message_start;
        let blocks_store =
            BlockStore::open(BlockStoreOptions::new(dir.path(), magic)).expect("block store");
        let chain = ChainState::open(
            Arc::new(MemoryStore::new()),
            blocks_store,
            consensus_params(Network::Regtest),
            ChainStateOptions::default(),
        )
        .expect("open chain state");

        let genesis = chain
            .block_info(&chain.hash_at_height(0).expect("genesis"))
            .expect("genesis info")
            .header;
        let blocks = mine_chain(&genesis, 1, 101, 1);
        for block in &blocks {
            chain.accept_block(block, NOW).expect("accept block");
        }
        chain.activate_best_chain_fully().expect("activate");

        let chain = Arc::new(chain);
        let transport = Arc::new(RecordingTransport::default());
        let node = Node::new(
            Arc::clone(&chain),
            MempoolPolicy::for_network(Network::Regtest),
            sync,
            transport.clone(),
        );
        Self {
            dir,
            chain,
            node,
            transport,
            blocks,
        }
    }

    pub fn tip_header(&self) -> BlockHeader {
        let tip = self.chain.tip();
        self.chain.block_info(&tip.hash).expect("tip info").header
    }

    /// Coinbase output of active block `height`.
    pub fn coinbase_coin(&self, height: usize) -> (OutPoint, Amount) {
        let coinbase = &self.blocks[height - 1].transactions[0];
        (OutPoint::new(coinbase.txid(), 0), coinbase.vout[0].value)
    }
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

/// Spends `prevout` worth `value` into one anyone-can-spend output.
pub fn spend(prevout: OutPoint, value: Amount, fee: Amount, sequence: u32) -> Transaction {
    Transaction {
        version: 2,
        vin: vec![TxIn::new(prevout, Vec::new(), sequence)],
        vout: vec![TxOut {
            value: value - fee,
            script_pubkey: ANYONE_CAN_SPEND.to_vec(),
        }],
        lock_time: 0,
    }
}

pub fn mine(parent: &BlockHeader, height: i32, tag: u8, txs: Vec<Transaction>) -> Block {
    let subsidy = block_subsidy(height, &consensus_params(Network::Regtest));
    mine_paying(parent, height, tag, txs, subsidy)
}

/// Like `mine`, but the coinbase claims `coinbase_value`.
pub fn mine_paying(
    parent: &BlockHeader,
    height: i32,
    tag: u8,
    txs: Vec<Transaction>,
    coinbase_value: Amount,
) -> Block {
    let mut transactions = vec![coinbase(height, tag, coinbase_value)];
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
    regrind(&mut block.header);
    block
}

/// Searches nonces until `header` meets the regtest target again.
pub fn regrind(header: &mut BlockHeader) {
    let params = consensus_params(Network::Regtest);
    header.nonce = 0;
    while validate_pow_header(header, &params).is_err() {
        header.nonce += 1;
    }
}

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
