//! The node facade: transport callbacks in, read-only queries and
//! transaction submission for RPC callers.

use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use utxod_chainstate::{ChainState, ChainStateError, ChainTip, UtxoEntry};
use utxod_consensus::Hash256;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::Transaction;
use utxod_storage::KeyValueStore;

use crate::interface::{PeerId, Transport};
use crate::mempool::{Mempool, MempoolAcceptance, MempoolEntry, MempoolError, MempoolInfo};
use crate::policy::MempoolPolicy;
use crate::sync::{SyncConfig, SyncCoordinator};
use crate::writer::{ChainWriter, WriterCommand};

#[derive(Debug)]
pub enum NodeError {
    Chain(ChainStateError),
    Mempool(MempoolError),
    Io(std::io::Error),
    /// The writer thread is gone; nothing can be applied any more.
    WriterStopped,
    Config(String),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Chain(err) => write!(f, "{err}"),
            NodeError::Mempool(err) => write!(f, "{err}"),
            NodeError::Io(err) => write!(f, "{err}"),
            NodeError::WriterStopped => write!(f, "chain writer is not running"),
            NodeError::Config(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ChainStateError> for NodeError {
    fn from(err: ChainStateError) -> Self {
        NodeError::Chain(err)
    }
}

impl From<MempoolError> for NodeError {
    fn from(err: MempoolError) -> Self {
        NodeError::Mempool(err)
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err)
    }
}

pub struct Node<S> {
    chain: Arc<ChainState<S>>,
    mempool: Arc<RwLock<Mempool>>,
    sync: Arc<SyncCoordinator<S>>,
    writer: Arc<ChainWriter<S>>,
    commands: Sender<WriterCommand>,
    /// Held until `start` moves it to the writer thread.
    receiver: Mutex<Option<Receiver<WriterCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: KeyValueStore + 'static> Node<S> {
    pub fn new(
        chain: Arc<ChainState<S>>,
        policy: MempoolPolicy,
        sync_config: SyncConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (commands, receiver) = unbounded();
        let mempool = Arc::new(RwLock::new(Mempool::new(policy)));
        let sync = Arc::new(SyncCoordinator::new(
            Arc::clone(&chain),
            transport,
            commands.clone(),
            sync_config,
        ));
        let writer = Arc::new(ChainWriter::new(
            Arc::clone(&chain),
            Arc::clone(&mempool),
            Arc::clone(&sync),
            commands.clone(),
        ));
        Self {
            chain,
            mempool,
            sync,
            writer,
            commands,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
        }
    }

    /// Moves command processing onto a dedicated writer thread.
    pub fn start(&self) -> Result<(), NodeError> {
        let Some(receiver) = self.receiver.lock().expect("receiver lock").take() else {
            return Ok(());
        };
        let writer = Arc::clone(&self.writer);
        let handle = thread::Builder::new()
            .name("chain-writer".to_string())
            .spawn(move || writer.run(receiver))?;
        *self.worker.lock().expect("worker lock") = Some(handle);
        Ok(())
    }

    /// Stops the writer after the command it is working on.
    pub fn shutdown(&self) {
        let _ = self.commands.send(WriterCommand::Shutdown);
        if let Some(handle) = self.worker.lock().expect("worker lock").take() {
            let _ = handle.join();
        }
    }

    /// Commands waiting for the writer.
    pub fn queued_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().expect("worker lock").is_some()
    }

    /// Handles queued commands on the calling thread when no writer thread
    /// was started.
    pub fn process_pending(&self) -> usize {
        match self.receiver.lock().expect("receiver lock").as_ref() {
            Some(receiver) => self.writer.drain(receiver),
            None => 0,
        }
    }

    pub fn chain(&self) -> &Arc<ChainState<S>> {
        &self.chain
    }

    pub fn sync(&self) -> &Arc<SyncCoordinator<S>> {
        &self.sync
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, NodeError> {
        Ok(self.chain.utxo(outpoint)?)
    }

    pub fn get_chain_tip(&self) -> ChainTip {
        self.chain.tip()
    }

    pub fn get_mempool_entry(&self, txid: &Hash256) -> Option<MempoolEntry> {
        self.mempool.read().expect("mempool lock").get(txid).cloned()
    }

    /// Whether the entry or an in-pool ancestor signals opt-in replacement.
    pub fn is_replaceable(&self, txid: &Hash256) -> bool {
        self.mempool
            .read()
            .expect("mempool lock")
            .signals_replaceable(txid)
    }

    pub fn mempool_info(&self) -> MempoolInfo {
        self.mempool.read().expect("mempool lock").info()
    }

    /// Routes `tx` through the writer and waits for the verdict.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<MempoolAcceptance, NodeError> {
        let (reply, verdict) = bounded(1);
        self.commands
            .send(WriterCommand::Transaction {
                peer: None,
                tx,
                reply: Some(reply),
            })
            .map_err(|_| NodeError::WriterStopped)?;
        if !self.is_running() {
            self.process_pending();
        }
        let result = verdict.recv().map_err(|_| NodeError::WriterStopped)?;
        Ok(result?)
    }

    /// Queues a block from a local source, such as a bootstrap file.
    pub fn submit_block(&self, block: Block) -> Result<(), NodeError> {
        self.commands
            .send(WriterCommand::Block { peer: None, block })
            .map_err(|_| NodeError::WriterStopped)
    }

    pub fn add_peer(&self, peer: PeerId) {
        self.sync.add_peer(peer);
    }

    pub fn remove_peer(&self, peer: PeerId) {
        self.sync.remove_peer(peer);
    }

    pub fn on_headers_received(&self, peer: PeerId, headers: Vec<BlockHeader>) {
        self.sync.on_headers_received(peer, headers);
    }

    pub fn on_block_received(&self, peer: PeerId, block: Block) {
        self.sync.on_block_received(peer, block);
    }

    pub fn on_transaction_received(&self, peer: PeerId, tx: Transaction) {
        self.sync.on_transaction_received(peer, tx);
    }

    /// Periodic housekeeping: request timeouts, download scheduling and
    /// orphan expiry.
    pub fn tick(&self, now: u64) {
        self.sync.tick(now);
        let _ = self.commands.send(WriterCommand::ExpireOrphans { now });
    }
}
