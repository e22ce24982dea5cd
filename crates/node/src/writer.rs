//! The single thread that mutates chain state and the mempool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::{Receiver, Sender};
use utxod_chainstate::{ActivationStep, BlockAcceptance, ChainState, ChainStateError, FailureClass};
use utxod_consensus::Hash256;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::hash256_to_hex;
use utxod_primitives::transaction::Transaction;
use utxod_storage::KeyValueStore;

use crate::interface::PeerId;
use crate::mempool::{now_secs, Mempool, MempoolAcceptance, MempoolError};
use crate::sync::SyncCoordinator;

pub type TxReply = Sender<Result<MempoolAcceptance, MempoolError>>;

pub enum WriterCommand {
    Headers {
        peer: PeerId,
        headers: Vec<BlockHeader>,
    },
    /// `peer` is `None` for locally imported blocks.
    Block {
        peer: Option<PeerId>,
        block: Block,
    },
    Transaction {
        peer: Option<PeerId>,
        tx: Transaction,
        reply: Option<TxReply>,
    },
    ExpireOrphans {
        now: u64,
    },
    /// Resume an activation that stopped at its step bound.
    ContinueActivation,
    Shutdown,
}

pub struct ChainWriter<S> {
    chain: Arc<ChainState<S>>,
    mempool: Arc<RwLock<Mempool>>,
    sync: Arc<SyncCoordinator<S>>,
    commands: Sender<WriterCommand>,
    continuation_queued: AtomicBool,
}

impl<S: KeyValueStore> ChainWriter<S> {
    pub fn new(
        chain: Arc<ChainState<S>>,
        mempool: Arc<RwLock<Mempool>>,
        sync: Arc<SyncCoordinator<S>>,
        commands: Sender<WriterCommand>,
    ) -> Self {
        Self {
            chain,
            mempool,
            sync,
            commands,
            continuation_queued: AtomicBool::new(false),
        }
    }

    /// Processes commands until `Shutdown` or until every sender is gone.
    pub fn run(&self, commands: Receiver<WriterCommand>) {
        while let Ok(command) = commands.recv() {
            if !self.handle(command) {
                break;
            }
        }
        utxod_log::log_info!("chain writer stopped at height {}", self.chain.tip().height);
    }

    /// Processes whatever is queued without blocking, including commands
    /// queued while draining. Returns the number handled.
    pub fn drain(&self, commands: &Receiver<WriterCommand>) -> usize {
        let mut handled = 0;
        while let Ok(command) = commands.try_recv() {
            handled += 1;
            if !self.handle(command) {
                break;
            }
        }
        handled
    }

    /// Returns false once the writer should stop.
    pub fn handle(&self, command: WriterCommand) -> bool {
        match command {
            WriterCommand::Headers { peer, headers } => self.process_headers(peer, headers),
            WriterCommand::Block { peer, block } => self.process_block(peer, block),
            WriterCommand::Transaction { peer, tx, reply } => {
                let result = self.process_transaction(peer, tx);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            WriterCommand::ExpireOrphans { now } => {
                let expired = self.mempool.write().expect("mempool lock").expire_orphans(now);
                if expired > 0 {
                    utxod_log::log_debug!("expired {expired} orphan transactions");
                }
            }
            WriterCommand::ContinueActivation => {
                self.continuation_queued.store(false, Ordering::SeqCst);
                self.activate();
            }
            WriterCommand::Shutdown => return false,
        }
        true
    }

    fn process_headers(&self, peer: PeerId, headers: Vec<BlockHeader>) {
        let received = headers.len();
        match self.chain.accept_headers(&headers, now_secs() as i64) {
            Ok(outcome) => {
                utxod_log::log_debug!(
                    "accepted {} of {received} headers from peer {peer}",
                    outcome.accepted
                );
                self.sync.headers_processed(peer, received, outcome);
            }
            Err(ChainStateError::MissingParent(parent)) => {
                utxod_log::log_debug!(
                    "headers from peer {peer} do not connect (missing {})",
                    hash256_to_hex(&parent)
                );
                self.sync.headers_disconnected(peer);
            }
            Err(err) => self.chain_error(Some(peer), None, &err),
        }
    }

    fn process_block(&self, peer: Option<PeerId>, block: Block) {
        let hash = block.hash();
        match self.chain.accept_block(&block, now_secs() as i64) {
            Ok(BlockAcceptance::Stored { height, .. }) => {
                utxod_log::log_debug!("stored block {} at height {height}", hash256_to_hex(&hash));
                self.sync.block_stored(&hash);
                self.activate();
            }
            Ok(BlockAcceptance::AlreadyKnown) => {
                utxod_log::log_debug!("block {} already known", hash256_to_hex(&hash));
                self.sync.block_stored(&hash);
            }
            Err(ChainStateError::MissingParent(_)) => self.sync.stash_orphan(peer, block),
            Err(err) => self.chain_error(peer, Some(&hash), &err),
        }
    }

    fn process_transaction(
        &self,
        peer: Option<PeerId>,
        tx: Transaction,
    ) -> Result<MempoolAcceptance, MempoolError> {
        let txid = tx.txid();
        let result = self
            .mempool
            .write()
            .expect("mempool lock")
            .accept_transaction(tx, peer, self.chain.as_ref(), now_secs());
        match &result {
            Ok(acceptance) => {
                for rejected in &acceptance.orphans_rejected {
                    utxod_log::log_debug!(
                        "orphan {} rejected: {}",
                        hash256_to_hex(&rejected.txid),
                        rejected.error
                    );
                    if let Some(peer) = rejected.peer {
                        self.sync
                            .penalize(peer, rejected.error.class(), &rejected.error.message);
                    }
                }
            }
            Err(err) => {
                let class = err.class();
                if class == FailureClass::ConsensusInvalid {
                    utxod_log::log_warn!("rejected transaction {}: {}", hash256_to_hex(&txid), err);
                } else {
                    utxod_log::log_debug!("rejected transaction {}: {}", hash256_to_hex(&txid), err);
                }
                if let Some(peer) = peer {
                    self.sync.penalize(peer, class, &err.message);
                }
            }
        }
        result
    }

    /// Runs one bounded activation step and carries its effects into the
    /// mempool; a remaining step is queued behind other work.
    fn activate(&self) {
        let step = match self.chain.activate_best_chain() {
            Ok(step) => step,
            Err(err) => {
                self.chain_error(None, None, &err);
                return;
            }
        };
        if step.is_empty() && !step.more_pending {
            return;
        }
        self.update_mempool(&step);
        self.sync.chain_advanced(&step);
        if step.more_pending
            && !self.continuation_queued.swap(true, Ordering::SeqCst)
            && self.commands.send(WriterCommand::ContinueActivation).is_err()
        {
            self.continuation_queued.store(false, Ordering::SeqCst);
        }
    }

    fn update_mempool(&self, step: &ActivationStep) {
        let mut mempool = self.mempool.write().expect("mempool lock");
        for block in &step.connected {
            let removal = mempool.remove_for_block(&block.transactions);
            if removal.confirmed > 0 || !removal.conflicts.is_empty() {
                utxod_log::log_debug!(
                    "block {} confirmed {} mempool entries, removed {} conflicts",
                    hash256_to_hex(&block.hash()),
                    removal.confirmed,
                    removal.conflicts.len()
                );
            }
        }
        if step.disconnected.is_empty() {
            return;
        }
        let resurrected: Vec<Transaction> = step
            .disconnected
            .iter()
            .rev()
            .flat_map(|block| block.transactions.iter().cloned())
            .collect();
        let update = mempool.update_for_reorg(resurrected, self.chain.as_ref(), now_secs());
        utxod_log::log_debug!(
            "mempool after reorg: {} reinserted, {} dropped, {} evicted",
            update.reinserted,
            update.dropped.len(),
            update.evicted.len()
        );
    }

    fn chain_error(&self, peer: Option<PeerId>, hash: Option<&Hash256>, err: &ChainStateError) {
        let class = err.class();
        match class {
            FailureClass::StorageFatal => {
                utxod_log::log_error!("chain state unavailable: {err}");
            }
            FailureClass::Malformed | FailureClass::ConsensusInvalid => {
                let reason = err.validation().map_or("invalid", |err| err.reason());
                match hash {
                    Some(hash) => self.sync.block_rejected(peer, hash, class, reason),
                    None => {
                        if let Some(peer) = peer {
                            utxod_log::log_warn!("rejected headers from peer {peer}: {reason}");
                            self.sync.penalize(peer, class, reason);
                        }
                    }
                }
            }
            FailureClass::Conflicting
            | FailureClass::ResourceExhausted
            | FailureClass::Transient => {
                utxod_log::log_debug!("deferred chain update: {err}");
            }
        }
    }
}
