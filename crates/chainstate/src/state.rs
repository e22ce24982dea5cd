//! Chain state manager: owns the block index, the active chain and the UTXO
//! set, and moves the tip toward the most-work valid candidate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use primitive_types::U256;
use utxod_consensus::constants::{LOCKTIME_VERIFY_SEQUENCE, MAX_BLOCK_SIGOPS_COST};
use utxod_consensus::money::{money_range, Amount};
use utxod_consensus::{block_subsidy, deployment_active, ConsensusParams, Deployment, Hash256};
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::{genesis_block, hash256_to_hex};
use utxod_script::sigops::transaction_sigop_cost;
use utxod_script::standard::is_unspendable;
use utxod_script::{script_flags_for_height, ScriptFlags};
use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::filemeta::{block_file_key, parse_block_file_key, BlockFileInfo};
use crate::flatfiles::{BlockStore, BlockStoreError, FileLocation};
use crate::index::{
    ActiveChain, BlockIndex, IndexError, NodeId, StoredNode, STATUS_FAILED_MASK, STATUS_HAVE_DATA,
    STATUS_HAVE_UNDO, STATUS_VALID_SCRIPTS,
};
use crate::undo::{BlockUndo, SpentOutput};
use crate::utxo::{UtxoEntry, UtxoError, UtxoOverlay, UtxoSet, UtxoSetInfo, UtxoView};
use crate::validation::{
    calculate_sequence_locks, check_block, check_block_header, check_tx_inputs,
    contextual_check_block, contextual_check_header, is_bip30_exception, run_script_checks,
    sequence_locks_satisfied, FailureClass, HeaderContext, ScriptCheck, ValidationError,
};

pub const DEFAULT_REORG_STEP_BLOCKS: usize = 64;
pub const DEFAULT_CHECK_BLOCKS: u32 = 6;

const META_TIP_KEY: &[u8] = b"tip";
const META_REORG_TARGET_KEY: &[u8] = b"reorg_target";
const IBD_MAX_TIP_AGE: i64 = 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct ChainStateOptions {
    /// Upper bound on blocks disconnected plus connected by one activation step.
    pub reorg_step_blocks: usize,
    /// Keep block files whose newest block is within this many blocks of the
    /// tip. Zero disables pruning.
    pub prune_depth: u32,
    /// Recent active blocks whose data and undo are verified on open.
    pub check_blocks: u32,
    /// Script verification workers; zero uses the global rayon pool.
    pub script_threads: usize,
}

impl Default for ChainStateOptions {
    fn default() -> Self {
        Self {
            reorg_step_blocks: DEFAULT_REORG_STEP_BLOCKS,
            prune_depth: 0,
            check_blocks: DEFAULT_CHECK_BLOCKS,
            script_threads: 0,
        }
    }
}

#[derive(Debug)]
pub enum ChainStateError {
    Validation(ValidationError),
    Store(StoreError),
    BlockStore(BlockStoreError),
    /// The block's parent is not indexed yet.
    MissingParent(Hash256),
    UnknownBlock(Hash256),
    MissingBlockData(Hash256),
    MissingUndo(Hash256),
    CorruptIndex(&'static str),
    /// A durable write failed earlier; no further mutation is allowed.
    Halted,
}

impl ChainStateError {
    pub fn class(&self) -> FailureClass {
        match self {
            ChainStateError::Validation(err) => err.class(),
            ChainStateError::MissingParent(_) | ChainStateError::UnknownBlock(_) => {
                FailureClass::Transient
            }
            ChainStateError::Store(_)
            | ChainStateError::BlockStore(_)
            | ChainStateError::MissingBlockData(_)
            | ChainStateError::MissingUndo(_)
            | ChainStateError::CorruptIndex(_)
            | ChainStateError::Halted => FailureClass::StorageFatal,
        }
    }

    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            ChainStateError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Validation(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "store error: {err}"),
            ChainStateError::BlockStore(err) => write!(f, "block store error: {err}"),
            ChainStateError::MissingParent(hash) => {
                write!(f, "missing parent block {}", hash256_to_hex(hash))
            }
            ChainStateError::UnknownBlock(hash) => {
                write!(f, "unknown block {}", hash256_to_hex(hash))
            }
            ChainStateError::MissingBlockData(hash) => {
                write!(f, "block data missing for {}", hash256_to_hex(hash))
            }
            ChainStateError::MissingUndo(hash) => {
                write!(f, "undo data missing for {}", hash256_to_hex(hash))
            }
            ChainStateError::CorruptIndex(message) => write!(f, "corrupt index: {message}"),
            ChainStateError::Halted => write!(f, "chain state halted after a storage failure"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<BlockStoreError> for ChainStateError {
    fn from(err: BlockStoreError) -> Self {
        ChainStateError::BlockStore(err)
    }
}

impl From<UtxoError> for ChainStateError {
    fn from(err: UtxoError) -> Self {
        match err {
            UtxoError::Missing(outpoint) => {
                ChainStateError::Validation(ValidationError::MissingInputs(outpoint))
            }
            UtxoError::Overwrite(_) => {
                ChainStateError::Validation(ValidationError::InvalidBlock("bad-txns-BIP30"))
            }
            UtxoError::Store(message) => ChainStateError::Store(StoreError::Backend(message)),
        }
    }
}

/// Snapshot of the active tip, replaced as a whole after each committed step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: i32,
    pub chainwork: U256,
    pub time: u32,
    pub median_time_past: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: i32,
    pub chainwork: U256,
    pub status: u32,
    pub tx_count: u32,
    pub in_active_chain: bool,
}

impl BlockInfo {
    pub fn has_data(&self) -> bool {
        (self.status & STATUS_HAVE_DATA) != 0
    }

    pub fn is_failed(&self) -> bool {
        (self.status & STATUS_FAILED_MASK) != 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadersAccepted {
    /// Headers that were new to the index.
    pub accepted: usize,
    pub last: Option<Hash256>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockAcceptance {
    Stored { hash: Hash256, height: i32 },
    AlreadyKnown,
}

/// Outcome of one bounded ActivateBestChain step.
#[derive(Debug, Default)]
pub struct ActivationStep {
    /// Blocks removed from the active chain, tip first.
    pub disconnected: Vec<Block>,
    /// Blocks added to the active chain, in connect order.
    pub connected: Vec<Block>,
    /// The block that failed to connect, if any.
    pub invalid: Option<(Hash256, ValidationError)>,
    /// A better candidate remains; call again to keep going.
    pub more_pending: bool,
}

impl ActivationStep {
    pub fn is_empty(&self) -> bool {
        self.disconnected.is_empty() && self.connected.is_empty() && self.invalid.is_none()
    }
}

/// Chain context the next block on top of the tip would be validated with.
#[derive(Clone, Copy, Debug)]
pub struct NextBlockContext {
    pub height: i32,
    pub median_time_past: i64,
    pub script_flags: ScriptFlags,
    pub lock_flags: u32,
}

struct ChainInner {
    index: BlockIndex,
    active: ActiveChain,
}

struct ConnectPlan {
    disconnect: Vec<NodeId>,
    connect: Vec<NodeId>,
    target: NodeId,
}

pub struct ChainState<S> {
    store: Arc<S>,
    params: ConsensusParams,
    options: ChainStateOptions,
    blocks: BlockStore,
    utxos: UtxoSet<Arc<S>>,
    inner: RwLock<ChainInner>,
    tip: RwLock<ChainTip>,
    writer: Mutex<()>,
    halted: AtomicBool,
    script_pool: Option<rayon::ThreadPool>,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Loads the index from `store`, or writes the genesis block when the
    /// store is empty.
    pub fn open(
        store: Arc<S>,
        blocks: BlockStore,
        params: ConsensusParams,
        options: ChainStateOptions,
    ) -> Result<Self, ChainStateError> {
        let mut stored = Vec::new();
        let mut corrupt = false;
        let mut visitor = |_: &[u8], value: &[u8]| -> Result<(), StoreError> {
            match StoredNode::decode(value) {
                Ok(node) => stored.push(node),
                Err(_) => corrupt = true,
            }
            Ok(())
        };
        store.for_each_prefix(Column::BlockIndex, &[], &mut visitor)?;
        if corrupt {
            return Err(ChainStateError::CorruptIndex("undecodable block index entry"));
        }
        stored.sort_by_key(|node| node.height);

        let mut index = BlockIndex::new();
        for node in stored {
            index
                .restore(node)
                .map_err(|_| ChainStateError::CorruptIndex("block index entry without parent"))?;
        }

        let script_pool = if options.script_threads > 0 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(options.script_threads)
                .thread_name(|idx| format!("script-{idx}"))
                .build()
                .ok()
        } else {
            None
        };

        let utxos = UtxoSet::new(Arc::clone(&store));
        let placeholder = ChainTip {
            hash: params.hash_genesis_block,
            height: -1,
            chainwork: U256::zero(),
            time: 0,
            median_time_past: 0,
        };
        let state = Self {
            store,
            params,
            options,
            blocks,
            utxos,
            inner: RwLock::new(ChainInner {
                index,
                active: ActiveChain::default(),
            }),
            tip: RwLock::new(placeholder),
            writer: Mutex::new(()),
            halted: AtomicBool::new(false),
            script_pool,
        };

        let empty = state.inner.read().expect("chain index lock").index.is_empty();
        if empty {
            state.write_genesis()?;
        } else {
            state.load_tip()?;
        }
        if state.store.get(Column::Meta, META_REORG_TARGET_KEY)?.is_some() {
            utxod_log::log_info!("resuming interrupted chain reorganization");
        }
        state.verify_recent_blocks()?;
        let tip = state.tip();
        utxod_log::log_info!(
            "chain state loaded at height {} ({})",
            tip.height,
            hash256_to_hex(&tip.hash)
        );
        Ok(state)
    }

    fn write_genesis(&self) -> Result<(), ChainStateError> {
        let genesis = genesis_block(&self.params);
        let hash = genesis.hash();
        if hash != self.params.hash_genesis_block {
            return Err(ChainStateError::CorruptIndex("genesis block does not match params"));
        }
        let location = self.blocks.append(&genesis.consensus_encode())?;
        self.blocks.sync()?;

        let mut inner = self.inner.write().expect("chain index lock");
        let id = inner
            .index
            .insert(genesis.header.clone())
            .map_err(|_| ChainStateError::CorruptIndex("genesis insert failed"))?;
        inner
            .index
            .set_have_data(id, location, genesis.transactions.len() as u32);
        inner
            .index
            .set_status(id, STATUS_HAVE_UNDO | STATUS_VALID_SCRIPTS);

        let mut batch = WriteBatch::new();
        put_node(&mut batch, &inner.index, id);
        self.stage_file_info(&mut batch, location, 0)?;
        batch.put(Column::Meta, META_TIP_KEY, hash);
        self.commit(&batch)?;

        let ChainInner { index, active } = &mut *inner;
        active.set_tip(index, id);
        self.publish_tip(index, id);
        utxod_log::log_info!("wrote genesis block {}", hash256_to_hex(&hash));
        Ok(())
    }

    fn load_tip(&self) -> Result<(), ChainStateError> {
        let tip_hash = self
            .store
            .get(Column::Meta, META_TIP_KEY)?
            .ok_or(ChainStateError::CorruptIndex("missing chain tip"))?;
        let tip_hash: Hash256 = tip_hash
            .as_slice()
            .try_into()
            .map_err(|_| ChainStateError::CorruptIndex("invalid chain tip"))?;
        let mut inner = self.inner.write().expect("chain index lock");
        let ChainInner { index, active } = &mut *inner;
        let id = index
            .lookup(&tip_hash)
            .ok_or(ChainStateError::CorruptIndex("chain tip not in index"))?;
        active.set_tip(index, id);
        index.prune_candidates(id);
        self.publish_tip(index, id);
        Ok(())
    }

    /// Re-reads the newest active blocks and their undo records.
    fn verify_recent_blocks(&self) -> Result<(), ChainStateError> {
        let inner = self.inner.read().expect("chain index lock");
        let Some(tip) = inner.active.tip() else {
            return Ok(());
        };
        let mut cursor = Some(tip);
        let mut checked = 0u32;
        while let Some(id) = cursor {
            if checked >= self.options.check_blocks {
                break;
            }
            let node = inner.index.node(id);
            if node.height == 0 {
                break;
            }
            let block = self.read_block_at(&inner.index, id)?;
            if block.hash() != node.hash {
                return Err(ChainStateError::CorruptIndex("stored block hash mismatch"));
            }
            self.read_undo(&node.hash)?;
            checked += 1;
            cursor = node.parent;
        }
        utxod_log::log_debug!("verified {checked} recent blocks");
        Ok(())
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn tip(&self) -> ChainTip {
        self.tip.read().expect("chain tip lock").clone()
    }

    /// Below minimum chain work, or the tip is more than a day old.
    pub fn is_initial_block_download(&self, now: i64) -> bool {
        let tip = self.tip();
        tip.chainwork < U256::from_little_endian(&self.params.minimum_chain_work)
            || (tip.time as i64) < now - IBD_MAX_TIP_AGE
    }

    pub fn next_block_context(&self) -> NextBlockContext {
        let tip = self.tip();
        let height = tip.height + 1;
        let lock_flags = if deployment_active(height, &self.params.deployments, Deployment::Csv) {
            LOCKTIME_VERIFY_SEQUENCE
        } else {
            0
        };
        NextBlockContext {
            height,
            median_time_past: tip.median_time_past,
            script_flags: script_flags_for_height(height, &self.params),
            lock_flags,
        }
    }

    /// Median time past of the active block at `height`.
    pub fn median_time_past_at(&self, height: i32) -> Option<i64> {
        let inner = self.inner.read().expect("chain index lock");
        inner
            .active
            .at(height)
            .map(|id| inner.index.median_time_past(id))
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainStateError> {
        Ok(self.utxos.get(outpoint)?)
    }

    /// Committed UTXO set, for overlays that must not see uncommitted work.
    pub fn utxo_set(&self) -> &UtxoSet<Arc<S>> {
        &self.utxos
    }

    pub fn utxo_set_info(&self) -> Result<UtxoSetInfo, ChainStateError> {
        let _guard = self.writer.lock().expect("chain writer lock");
        Ok(self.utxos.info()?)
    }

    pub fn block_info(&self, hash: &Hash256) -> Option<BlockInfo> {
        let inner = self.inner.read().expect("chain index lock");
        inner
            .index
            .lookup(hash)
            .map(|id| block_info(&inner.index, &inner.active, id))
    }

    pub fn best_header(&self) -> Option<BlockInfo> {
        let inner = self.inner.read().expect("chain index lock");
        inner
            .index
            .best_header()
            .map(|id| block_info(&inner.index, &inner.active, id))
    }

    pub fn hash_at_height(&self, height: i32) -> Option<Hash256> {
        let inner = self.inner.read().expect("chain index lock");
        inner.active.at(height).map(|id| inner.index.node(id).hash)
    }

    /// Locator from the active tip.
    pub fn locator(&self) -> Vec<Hash256> {
        let inner = self.inner.read().expect("chain index lock");
        inner
            .active
            .tip()
            .map(|tip| inner.index.locator(tip))
            .unwrap_or_default()
    }

    /// Locator from the best known header, used to continue header download.
    pub fn header_locator(&self) -> Vec<Hash256> {
        let inner = self.inner.read().expect("chain index lock");
        inner
            .index
            .best_header()
            .or(inner.active.tip())
            .map(|id| inner.index.locator(id))
            .unwrap_or_default()
    }

    /// Headers after the first locator entry found on the active chain.
    pub fn headers_after_locator(&self, locator: &[Hash256], limit: usize) -> Vec<BlockHeader> {
        let inner = self.inner.read().expect("chain index lock");
        let start = locator
            .iter()
            .filter_map(|hash| inner.index.lookup(hash))
            .find(|id| inner.active.contains(&inner.index, *id))
            .map(|id| inner.index.node(id).height + 1)
            .unwrap_or(0);
        (start..=inner.active.height())
            .take(limit)
            .filter_map(|height| inner.active.at(height))
            .map(|id| inner.index.node(id).header.clone())
            .collect()
    }

    /// Blocks on the best header chain that still need their data, lowest
    /// first, skipping any for which `skip` returns true.
    pub fn blocks_to_download<F>(&self, limit: usize, skip: F) -> Vec<Hash256>
    where
        F: Fn(&Hash256) -> bool,
    {
        let inner = self.inner.read().expect("chain index lock");
        let Some(best) = inner.index.best_header() else {
            return Vec::new();
        };
        let fork_height = inner
            .active
            .find_fork(&inner.index, best)
            .map_or(-1, |fork| inner.index.node(fork).height);
        let best_height = inner.index.node(best).height;
        let mut wanted = Vec::new();
        for height in (fork_height + 1)..=best_height {
            if wanted.len() >= limit {
                break;
            }
            let Some(id) = inner.index.ancestor(best, height) else {
                break;
            };
            let node = inner.index.node(id);
            if node.has_data() || node.is_failed() || skip(&node.hash) {
                continue;
            }
            wanted.push(node.hash);
        }
        wanted
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let inner = self.inner.read().expect("chain index lock");
        let Some(id) = inner.index.lookup(hash) else {
            return Ok(None);
        };
        if !inner.index.node(id).has_data() {
            return Ok(None);
        }
        self.read_block_at(&inner.index, id).map(Some)
    }

    /// Validates and indexes headers in order, stopping at the first failure.
    pub fn accept_headers(
        &self,
        headers: &[BlockHeader],
        now: i64,
    ) -> Result<HeadersAccepted, ChainStateError> {
        let _guard = self.writer.lock().expect("chain writer lock");
        self.ensure_running()?;
        let mut outcome = HeadersAccepted::default();
        let mut batch = WriteBatch::new();
        let result = {
            let mut inner = self.inner.write().expect("chain index lock");
            let mut result = Ok(());
            for header in headers {
                match self.accept_header_locked(&mut inner.index, header, now, &mut batch) {
                    Ok((id, is_new)) => {
                        if is_new {
                            outcome.accepted += 1;
                        }
                        outcome.last = Some(inner.index.node(id).hash);
                    }
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
            }
            result
        };
        if !batch.is_empty() {
            self.commit(&batch)?;
        }
        result.map(|()| outcome)
    }

    fn accept_header_locked(
        &self,
        index: &mut BlockIndex,
        header: &BlockHeader,
        now: i64,
        batch: &mut WriteBatch,
    ) -> Result<(NodeId, bool), ChainStateError> {
        let hash = header.hash();
        if let Some(id) = index.lookup(&hash) {
            if index.node(id).is_failed() {
                return Err(ValidationError::InvalidHeader("duplicate-invalid").into());
            }
            return Ok((id, false));
        }
        check_block_header(header, &self.params)?;
        let parent = index
            .lookup(&header.prev_block)
            .ok_or(ChainStateError::MissingParent(header.prev_block))?;
        if index.node(parent).is_failed() {
            return Err(ValidationError::InvalidHeader("bad-prevblk").into());
        }
        let context = HeaderContext {
            height: index.node(parent).height + 1,
            expected_bits: index.next_work_required(parent, header.time as i64, &self.params).map_err(ValidationError::from)?,
            median_time_past: index.median_time_past(parent),
        };
        contextual_check_header(header, &context, &self.params, now)?;
        let id = index.insert(header.clone()).map_err(|err| match err {
            IndexError::UnknownParent => ChainStateError::MissingParent(header.prev_block),
            _ => ChainStateError::CorruptIndex("header insert failed"),
        })?;
        put_node(batch, index, id);
        utxod_log::log_debug!(
            "accepted header {} at height {}",
            hash256_to_hex(&hash),
            context.height
        );
        Ok((id, true))
    }

    /// Checks a block body and stores it. Does not move the tip; call
    /// `activate_best_chain` afterwards.
    pub fn accept_block(&self, block: &Block, now: i64) -> Result<BlockAcceptance, ChainStateError> {
        let _guard = self.writer.lock().expect("chain writer lock");
        self.ensure_running()?;
        let hash = block.hash();
        {
            let inner = self.inner.read().expect("chain index lock");
            if let Some(id) = inner.index.lookup(&hash) {
                let node = inner.index.node(id);
                if node.is_failed() {
                    return Err(ValidationError::InvalidBlock("duplicate-invalid").into());
                }
                if node.has_data() {
                    return Ok(BlockAcceptance::AlreadyKnown);
                }
            }
        }

        if let Err(err) = check_block(block, &self.params) {
            self.reject_block(&hash, &err)?;
            return Err(err.into());
        }

        let mut batch = WriteBatch::new();
        let mut inner = self.inner.write().expect("chain index lock");
        let header_result =
            self.accept_header_locked(&mut inner.index, &block.header, now, &mut batch);
        let (id, _) = match header_result {
            Ok(accepted) => accepted,
            Err(err) => {
                drop(inner);
                if !batch.is_empty() {
                    self.commit(&batch)?;
                }
                return Err(err);
            }
        };
        let height = inner.index.node(id).height;
        let prev_mtp = inner
            .index
            .node(id)
            .parent
            .map_or(0, |parent| inner.index.median_time_past(parent));

        if let Err(err) = contextual_check_block(block, height, prev_mtp, &self.params) {
            if err.marks_block_invalid() {
                for changed in inner.index.mark_failed(id) {
                    put_node(&mut batch, &inner.index, changed);
                }
            }
            drop(inner);
            self.commit(&batch)?;
            utxod_log::log_warn!("rejected block {}: {}", hash256_to_hex(&hash), err);
            return Err(err.into());
        }

        let location = match self
            .blocks
            .append(&block.consensus_encode())
            .and_then(|location| self.blocks.sync().map(|()| location))
        {
            Ok(location) => location,
            Err(err) => {
                self.halt(&err);
                return Err(err.into());
            }
        };
        inner
            .index
            .set_have_data(id, location, block.transactions.len() as u32);
        put_node(&mut batch, &inner.index, id);
        self.stage_file_info(&mut batch, location, height)?;
        drop(inner);
        self.commit(&batch)?;
        utxod_log::log_debug!(
            "stored block {} at height {}",
            hash256_to_hex(&hash),
            height
        );
        Ok(BlockAcceptance::Stored { hash, height })
    }

    /// Marks an indexed block failed after a context-free check rejected it.
    fn reject_block(&self, hash: &Hash256, err: &ValidationError) -> Result<(), ChainStateError> {
        utxod_log::log_warn!("rejected block {}: {}", hash256_to_hex(hash), err);
        if !err.marks_block_invalid() {
            return Ok(());
        }
        let mut inner = self.inner.write().expect("chain index lock");
        let Some(id) = inner.index.lookup(hash) else {
            return Ok(());
        };
        let mut batch = WriteBatch::new();
        for changed in inner.index.mark_failed(id) {
            put_node(&mut batch, &inner.index, changed);
        }
        drop(inner);
        self.commit(&batch)
    }

    /// Moves the active chain toward the most-work candidate, doing at most
    /// `reorg_step_blocks` disconnects plus connects. Everything the step
    /// changes is committed in one batch.
    pub fn activate_best_chain(&self) -> Result<ActivationStep, ChainStateError> {
        let _guard = self.writer.lock().expect("chain writer lock");
        self.ensure_running()?;

        let inner = self.inner.read().expect("chain index lock");
        let Some(plan) = self.plan_step(&inner)? else {
            return Ok(ActivationStep::default());
        };

        let mut step = ActivationStep::default();
        let mut batch = WriteBatch::new();
        let mut overlay = UtxoOverlay::new(&self.utxos);
        let mut new_tip = inner
            .active
            .tip()
            .ok_or(ChainStateError::CorruptIndex("empty active chain"))?;
        let mut connected_ids = Vec::new();
        let mut failed: Option<NodeId> = None;

        for &id in &plan.disconnect {
            let node = inner.index.node(id);
            let block = self.read_block_at(&inner.index, id)?;
            let undo = self.read_undo(&node.hash)?;
            disconnect_block(&block, &undo, &mut overlay)?;
            new_tip = node
                .parent
                .ok_or(ChainStateError::CorruptIndex("disconnecting the genesis block"))?;
            step.disconnected.push(block);
        }

        for &id in &plan.connect {
            let node = inner.index.node(id);
            let block = self.read_block_at(&inner.index, id)?;
            let result = {
                let mut child = UtxoOverlay::new(&overlay);
                self.connect_block(&block, &inner.index, id, &mut child)
                    .map(|undo| (undo, child.into_changes()))
            };
            match result {
                Ok((undo, changes)) => {
                    overlay.merge(changes);
                    batch.put(Column::BlockUndo, node.hash, undo.encode());
                    new_tip = id;
                    connected_ids.push(id);
                    step.connected.push(block);
                }
                Err(ChainStateError::Validation(err)) => {
                    utxod_log::log_warn!(
                        "block {} at height {} failed to connect: {}",
                        hash256_to_hex(&node.hash),
                        node.height,
                        err
                    );
                    failed = Some(id);
                    step.invalid = Some((node.hash, err));
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        self.utxos.stage(&mut batch, overlay.into_changes());
        for &id in &connected_ids {
            let mut stored = StoredNode::from_node(inner.index.node(id));
            stored.status |= STATUS_HAVE_UNDO | STATUS_VALID_SCRIPTS;
            batch.put(Column::BlockIndex, inner.index.node(id).hash, stored.encode());
        }
        if let Some(id) = failed {
            for (changed, status) in inner.index.failed_statuses(id) {
                let mut stored = StoredNode::from_node(inner.index.node(changed));
                stored.status = status;
                batch.put(Column::BlockIndex, inner.index.node(changed).hash, stored.encode());
            }
        }
        let new_tip_hash = inner.index.node(new_tip).hash;
        batch.put(Column::Meta, META_TIP_KEY, new_tip_hash);
        if new_tip != plan.target && failed.is_none() {
            batch.put(Column::Meta, META_REORG_TARGET_KEY, inner.index.node(plan.target).hash);
        } else {
            batch.delete(Column::Meta, META_REORG_TARGET_KEY);
        }
        drop(inner);
        self.commit(&batch)?;

        let mut inner = self.inner.write().expect("chain index lock");
        let ChainInner { index, active } = &mut *inner;
        for &id in &connected_ids {
            index.set_status(id, STATUS_HAVE_UNDO | STATUS_VALID_SCRIPTS);
        }
        if let Some(id) = failed {
            index.mark_failed(id);
        }
        active.set_tip(index, new_tip);
        index.prune_candidates(new_tip);
        self.publish_tip(index, new_tip);
        step.more_pending = index
            .most_work_candidate()
            .map_or(false, |best| best != new_tip);
        let tip_height = index.node(new_tip).height;
        drop(inner);

        if !step.disconnected.is_empty() {
            utxod_log::log_info!(
                "reorganized: disconnected {} blocks, connected {}, tip {} at height {}",
                step.disconnected.len(),
                step.connected.len(),
                hash256_to_hex(&new_tip_hash),
                tip_height
            );
        } else if !step.connected.is_empty() {
            utxod_log::log_debug!(
                "connected {} blocks, tip {} at height {}",
                step.connected.len(),
                hash256_to_hex(&new_tip_hash),
                tip_height
            );
        }

        if self.options.prune_depth > 0 && !step.connected.is_empty() {
            self.prune_block_files()?;
        }
        Ok(step)
    }

    /// Runs activation steps until the tip is the best candidate.
    pub fn activate_best_chain_fully(&self) -> Result<Vec<ActivationStep>, ChainStateError> {
        let mut steps = Vec::new();
        loop {
            let step = self.activate_best_chain()?;
            let done = step.is_empty() || !step.more_pending;
            if !step.is_empty() {
                steps.push(step);
            }
            if done {
                return Ok(steps);
            }
        }
    }

    fn plan_step(&self, inner: &ChainInner) -> Result<Option<ConnectPlan>, ChainStateError> {
        let index = &inner.index;
        let Some(target) = index.most_work_candidate() else {
            return Ok(None);
        };
        let tip = inner
            .active
            .tip()
            .ok_or(ChainStateError::CorruptIndex("empty active chain"))?;
        // Candidates are ordered, so anything ahead of the tip is preferred to it.
        if target == tip {
            return Ok(None);
        }
        let fork = inner
            .active
            .find_fork(index, target)
            .ok_or(ChainStateError::CorruptIndex("candidate shares no ancestor"))?;

        let budget = self.options.reorg_step_blocks.max(1);
        let mut disconnect = Vec::new();
        let mut cursor = tip;
        while cursor != fork && disconnect.len() < budget {
            disconnect.push(cursor);
            cursor = index
                .node(cursor)
                .parent
                .ok_or(ChainStateError::CorruptIndex("active chain broken"))?;
        }
        let mut connect = Vec::new();
        if cursor == fork {
            let fork_height = index.node(fork).height;
            let remaining = budget - disconnect.len();
            let last = (fork_height + remaining as i32).min(index.node(target).height);
            for height in (fork_height + 1)..=last {
                let id = index
                    .ancestor(target, height)
                    .ok_or(ChainStateError::CorruptIndex("candidate chain broken"))?;
                if !index.node(id).has_data() {
                    return Err(ChainStateError::MissingBlockData(index.node(id).hash));
                }
                connect.push(id);
            }
        }
        Ok(Some(ConnectPlan {
            disconnect,
            connect,
            target,
        }))
    }

    /// Applies one block to `view` and returns its undo record. Any
    /// `Validation` error means the block is invalid.
    fn connect_block<V: UtxoView>(
        &self,
        block: &Block,
        index: &BlockIndex,
        id: NodeId,
        view: &mut UtxoOverlay<V>,
    ) -> Result<BlockUndo, ChainStateError> {
        let node = index.node(id);
        let height = node.height;
        let parent = node
            .parent
            .ok_or(ChainStateError::CorruptIndex("connecting a block without parent"))?;
        let prev_mtp = index.median_time_past(parent);
        let flags = script_flags_for_height(height, &self.params);
        let lock_flags = if deployment_active(height, &self.params.deployments, Deployment::Csv) {
            LOCKTIME_VERIFY_SEQUENCE
        } else {
            0
        };
        let allow_overwrite = is_bip30_exception(height, &node.hash, &self.params);
        let median_time_at = |h: i32| {
            index
                .ancestor(parent, h)
                .map_or(0, |ancestor| index.median_time_past(ancestor))
        };

        let mut undo = BlockUndo::default();
        let mut checks = Vec::new();
        let mut fees: Amount = 0;
        let mut sigop_cost: u64 = 0;

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            if tx.is_coinbase() {
                sigop_cost += transaction_sigop_cost(tx, flags, |_| None);
            } else {
                let mut coins = Vec::with_capacity(tx.vin.len());
                for input in &tx.vin {
                    coins.push(view.spend(&input.prevout)?);
                }
                let fee = check_tx_inputs(tx, &coins, height)?;

                let coin_heights: Vec<i32> = coins.iter().map(|coin| coin.height as i32).collect();
                let lock = calculate_sequence_locks(tx, lock_flags, &coin_heights, &median_time_at);
                if !sequence_locks_satisfied(&lock, height, prev_mtp) {
                    return Err(ValidationError::InvalidTransaction("bad-txns-nonfinal").into());
                }

                sigop_cost += transaction_sigop_cost(tx, flags, |input| {
                    coins.get(input).map(|coin| coin.script_pubkey.as_slice())
                });

                fees += fee;
                if !money_range(fees) {
                    return Err(ValidationError::InvalidTransaction(
                        "bad-txns-accumulated-fee-outofrange",
                    )
                    .into());
                }
                for (input_index, (input, coin)) in tx.vin.iter().zip(coins).enumerate() {
                    checks.push(ScriptCheck {
                        tx_index,
                        input_index,
                        script_pubkey: coin.script_pubkey.clone(),
                        amount: coin.value,
                    });
                    undo.spent.push(SpentOutput {
                        outpoint: input.prevout,
                        entry: coin,
                    });
                }
            }
            if sigop_cost > MAX_BLOCK_SIGOPS_COST as u64 {
                return Err(ValidationError::InvalidBlock("bad-blk-sigops").into());
            }

            for (vout, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                view.add(
                    OutPoint::new(txid, vout as u32),
                    UtxoEntry::from_output(output, height as u32, tx.is_coinbase()),
                    allow_overwrite,
                )?;
            }
        }

        let coinbase_value = block.transactions[0]
            .value_out()
            .ok_or(ValidationError::InvalidBlock("bad-cb-amount"))?;
        if coinbase_value > block_subsidy(height, &self.params) + fees {
            return Err(ValidationError::InvalidBlock("bad-cb-amount").into());
        }

        run_script_checks(&block.transactions, &checks, flags, self.script_pool.as_ref())?;
        Ok(undo)
    }

    /// Deletes whole block files whose newest block is more than
    /// `prune_depth` blocks below the tip.
    fn prune_block_files(&self) -> Result<(), ChainStateError> {
        let tip_height = self.tip().height;
        let cutoff = tip_height - self.options.prune_depth as i32;
        if cutoff <= 0 {
            return Ok(());
        }
        let current = self.blocks.current_file();
        let mut files = HashSet::new();
        for (key, value) in self.store.scan_prefix(Column::BlockFile, &[])? {
            let (Some(file_id), Some(info)) =
                (parse_block_file_key(&key), BlockFileInfo::decode(&value))
            else {
                continue;
            };
            if file_id < current && info.height_last < cutoff {
                files.insert(file_id);
            }
        }
        if files.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write().expect("chain index lock");
        let pruned: Vec<NodeId> = inner
            .index
            .iter()
            .filter(|(_, node)| {
                node.location
                    .map_or(false, |location| files.contains(&location.file_id))
            })
            .map(|(id, _)| id)
            .collect();
        let mut batch = WriteBatch::new();
        for &id in &pruned {
            let node = inner.index.node(id);
            let mut stored = StoredNode::from_node(node);
            stored.status &= !(STATUS_HAVE_DATA | STATUS_HAVE_UNDO);
            stored.location = None;
            batch.put(Column::BlockIndex, node.hash, stored.encode());
            batch.delete(Column::BlockUndo, node.hash);
        }
        for &file_id in &files {
            batch.delete(Column::BlockFile, block_file_key(file_id));
        }
        self.commit(&batch)?;
        for &id in &pruned {
            inner.index.clear_data(id);
        }
        drop(inner);

        for &file_id in &files {
            if let Err(err) = self.blocks.remove_file(file_id) {
                utxod_log::log_warn!("failed to remove pruned block file {file_id}: {err}");
            }
        }
        utxod_log::log_info!(
            "pruned {} block files ({} blocks) below height {}",
            files.len(),
            pruned.len(),
            cutoff
        );
        Ok(())
    }

    fn read_block_at(&self, index: &BlockIndex, id: NodeId) -> Result<Block, ChainStateError> {
        let node = index.node(id);
        let location = node
            .location
            .ok_or(ChainStateError::MissingBlockData(node.hash))?;
        let bytes = self.blocks.read(location)?;
        Block::consensus_decode(&bytes)
            .map_err(|_| ChainStateError::CorruptIndex("undecodable stored block"))
    }

    fn read_undo(&self, hash: &Hash256) -> Result<BlockUndo, ChainStateError> {
        let bytes = self
            .store
            .get(Column::BlockUndo, hash)?
            .ok_or(ChainStateError::MissingUndo(*hash))?;
        BlockUndo::decode(&bytes).map_err(|_| ChainStateError::CorruptIndex("undecodable undo"))
    }

    fn stage_file_info(
        &self,
        batch: &mut WriteBatch,
        location: FileLocation,
        height: i32,
    ) -> Result<(), ChainStateError> {
        let key = block_file_key(location.file_id);
        let mut info = self
            .store
            .get(Column::BlockFile, &key)?
            .and_then(|bytes| BlockFileInfo::decode(&bytes))
            .unwrap_or_default();
        info.add_block(height, location.record_len());
        batch.put(Column::BlockFile, key, info.encode());
        Ok(())
    }

    fn publish_tip(&self, index: &BlockIndex, id: NodeId) {
        let node = index.node(id);
        let snapshot = ChainTip {
            hash: node.hash,
            height: node.height,
            chainwork: node.chainwork,
            time: node.header.time,
            median_time_past: index.median_time_past(id),
        };
        *self.tip.write().expect("chain tip lock") = snapshot;
    }

    fn ensure_running(&self) -> Result<(), ChainStateError> {
        if self.is_halted() {
            return Err(ChainStateError::Halted);
        }
        Ok(())
    }

    fn commit(&self, batch: &WriteBatch) -> Result<(), ChainStateError> {
        if let Err(err) = self.store.write_batch(batch) {
            self.halt(&err);
            return Err(err.into());
        }
        Ok(())
    }

    fn halt(&self, err: &dyn std::fmt::Display) {
        self.halted.store(true, Ordering::SeqCst);
        utxod_log::log_error!("chain state write failed, halting further updates: {err}");
    }
}

fn put_node(batch: &mut WriteBatch, index: &BlockIndex, id: NodeId) {
    let node = index.node(id);
    batch.put(
        Column::BlockIndex,
        node.hash,
        StoredNode::from_node(node).encode(),
    );
}

fn block_info(index: &BlockIndex, active: &ActiveChain, id: NodeId) -> BlockInfo {
    let node = index.node(id);
    BlockInfo {
        hash: node.hash,
        header: node.header.clone(),
        height: node.height,
        chainwork: node.chainwork,
        status: node.status,
        tx_count: node.tx_count,
        in_active_chain: active.contains(index, id),
    }
}

/// Reverses a connected block on `view` using its undo record.
fn disconnect_block<V: UtxoView>(
    block: &Block,
    undo: &BlockUndo,
    view: &mut UtxoOverlay<V>,
) -> Result<(), ChainStateError> {
    let mut spent = undo.spent.iter().rev();
    for tx in block.transactions.iter().rev() {
        let txid = tx.txid();
        for (vout, output) in tx.vout.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            view.remove(&OutPoint::new(txid, vout as u32))?;
        }
        if tx.is_coinbase() {
            continue;
        }
        for input in tx.vin.iter().rev() {
            let record = spent
                .next()
                .ok_or(ChainStateError::CorruptIndex("undo record too short"))?;
            if record.outpoint != input.prevout {
                return Err(ChainStateError::CorruptIndex("undo record out of order"));
            }
            view.restore(record.outpoint, record.entry.clone());
        }
    }
    if spent.next().is_some() {
        return Err(ChainStateError::CorruptIndex("undo record too long"));
    }
    Ok(())
}
