//! Headers-first download scheduling and the orphan block staging area.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use utxod_chainstate::validation::{check_block, check_block_header};
use utxod_chainstate::{ActivationStep, ChainState, FailureClass, HeadersAccepted};
use utxod_consensus::Hash256;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::hash256_to_hex;
use utxod_primitives::transaction::Transaction;
use utxod_storage::KeyValueStore;

use crate::interface::{PeerId, Severity, Transport};
use crate::mempool::now_secs;
use crate::writer::WriterCommand;

/// Headers per `headers` message; a full batch means the peer has more.
pub const MAX_HEADERS_RESULTS: usize = 2000;
pub const DEFAULT_BLOCKS_IN_FLIGHT: usize = 16;
pub const DEFAULT_BLOCK_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HEADER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HEADER_POLL_SECS: u64 = 120;
pub const DEFAULT_MAX_ORPHAN_BLOCKS: usize = 64;
pub const DEFAULT_MAX_ORPHAN_BLOCK_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Outstanding block requests allowed per peer.
    pub blocks_in_flight: usize,
    pub block_timeout_secs: u64,
    pub header_timeout_secs: u64,
    /// Idle interval after which headers are polled again.
    pub header_poll_secs: u64,
    pub max_orphan_blocks: usize,
    pub max_orphan_block_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            blocks_in_flight: DEFAULT_BLOCKS_IN_FLIGHT,
            block_timeout_secs: DEFAULT_BLOCK_TIMEOUT_SECS,
            header_timeout_secs: DEFAULT_HEADER_TIMEOUT_SECS,
            header_poll_secs: DEFAULT_HEADER_POLL_SECS,
            max_orphan_blocks: DEFAULT_MAX_ORPHAN_BLOCKS,
            max_orphan_block_bytes: DEFAULT_MAX_ORPHAN_BLOCK_BYTES,
        }
    }
}

struct OrphanBlock {
    block: Block,
    peer: Option<PeerId>,
    size: usize,
    sequence: u64,
}

/// Blocks whose parent is not indexed yet, keyed by that parent.
pub struct OrphanBlockPool {
    blocks: HashMap<Hash256, OrphanBlock>,
    by_parent: HashMap<Hash256, Vec<Hash256>>,
    bytes: usize,
    next_sequence: u64,
    max_blocks: usize,
    max_bytes: usize,
}

impl OrphanBlockPool {
    pub fn new(max_blocks: usize, max_bytes: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            by_parent: HashMap::new(),
            bytes: 0,
            next_sequence: 0,
            max_blocks,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Stages `block` and returns the hashes evicted to make room. A block
    /// that alone exceeds the byte budget, or is already staged, is dropped.
    pub fn insert(&mut self, block: Block, peer: Option<PeerId>) -> Vec<Hash256> {
        let hash = block.hash();
        let size = block.total_size();
        if self.blocks.contains_key(&hash) || self.max_blocks == 0 || size > self.max_bytes {
            return Vec::new();
        }
        let mut evicted = Vec::new();
        while self.blocks.len() >= self.max_blocks || self.bytes + size > self.max_bytes {
            let Some(oldest) = self
                .blocks
                .iter()
                .min_by_key(|(_, orphan)| orphan.sequence)
                .map(|(hash, _)| *hash)
            else {
                break;
            };
            self.remove(&oldest);
            evicted.push(oldest);
        }
        self.by_parent
            .entry(block.header.prev_block)
            .or_default()
            .push(hash);
        self.bytes += size;
        self.blocks.insert(
            hash,
            OrphanBlock {
                block,
                peer,
                size,
                sequence: self.next_sequence,
            },
        );
        self.next_sequence += 1;
        evicted
    }

    /// Removes and returns the staged children of `parent`, oldest first.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<(Block, Option<PeerId>)> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        let mut released: Vec<OrphanBlock> = children
            .iter()
            .filter_map(|hash| self.blocks.remove(hash))
            .collect();
        released.sort_by_key(|orphan| orphan.sequence);
        for orphan in &released {
            self.bytes = self.bytes.saturating_sub(orphan.size);
        }
        released
            .into_iter()
            .map(|orphan| (orphan.block, orphan.peer))
            .collect()
    }

    fn remove(&mut self, hash: &Hash256) {
        let Some(orphan) = self.blocks.remove(hash) else {
            return;
        };
        self.bytes = self.bytes.saturating_sub(orphan.size);
        let parent = orphan.block.header.prev_block;
        if let Some(children) = self.by_parent.get_mut(&parent) {
            children.retain(|child| child != hash);
            if children.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct PeerState {
    in_flight: usize,
    /// When the outstanding `getheaders` was sent.
    header_request: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
struct BlockRequest {
    peer: PeerId,
    sent: u64,
}

struct SyncState {
    peers: BTreeMap<PeerId, PeerState>,
    in_flight: HashMap<Hash256, BlockRequest>,
    /// Who delivered a stored but not yet connected block.
    block_sources: HashMap<Hash256, PeerId>,
    orphans: OrphanBlockPool,
    last_header_sync: u64,
    next_peer: usize,
}

/// Turns transport events into writer commands and keeps the download
/// window full. Never touches chain state directly except for reads.
pub struct SyncCoordinator<S> {
    chain: Arc<ChainState<S>>,
    transport: Arc<dyn Transport>,
    commands: Sender<WriterCommand>,
    config: SyncConfig,
    state: Mutex<SyncState>,
}

impl<S: KeyValueStore> SyncCoordinator<S> {
    pub fn new(
        chain: Arc<ChainState<S>>,
        transport: Arc<dyn Transport>,
        commands: Sender<WriterCommand>,
        config: SyncConfig,
    ) -> Self {
        let orphans = OrphanBlockPool::new(config.max_orphan_blocks, config.max_orphan_block_bytes);
        Self {
            chain,
            transport,
            commands,
            config,
            state: Mutex::new(SyncState {
                peers: BTreeMap::new(),
                in_flight: HashMap::new(),
                block_sources: HashMap::new(),
                orphans,
                last_header_sync: 0,
                next_peer: 0,
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn add_peer(&self, peer: PeerId) {
        let mut state = self.state.lock().expect("sync state lock");
        state.peers.entry(peer).or_default();
        let busy = state
            .peers
            .values()
            .any(|peer| peer.header_request.is_some());
        if !busy {
            self.request_headers_locked(&mut state, peer, now_secs());
        }
    }

    /// Forgets `peer`; its outstanding block requests go back to the queue.
    pub fn remove_peer(&self, peer: PeerId) {
        let now = now_secs();
        let mut state = self.state.lock().expect("sync state lock");
        let Some(removed) = state.peers.remove(&peer) else {
            return;
        };
        state.in_flight.retain(|_, request| request.peer != peer);
        if removed.header_request.is_some() {
            if let Some(next) = state.peers.keys().next().copied() {
                self.request_headers_locked(&mut state, next, now);
            }
        }
        self.schedule_downloads_locked(&mut state, now);
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().expect("sync state lock").peers.len()
    }

    pub fn blocks_in_flight(&self) -> usize {
        self.state.lock().expect("sync state lock").in_flight.len()
    }

    pub fn orphan_block_count(&self) -> usize {
        self.state.lock().expect("sync state lock").orphans.len()
    }

    /// Context-free header checks, then hands the batch to the writer.
    pub fn on_headers_received(&self, peer: PeerId, headers: Vec<BlockHeader>) {
        {
            let mut state = self.state.lock().expect("sync state lock");
            if let Some(entry) = state.peers.get_mut(&peer) {
                entry.header_request = None;
            }
        }
        if headers.is_empty() {
            return;
        }
        let connected = headers
            .windows(2)
            .all(|pair| pair[1].prev_block == pair[0].hash());
        if !connected {
            self.penalize(peer, FailureClass::Malformed, "non-continuous headers sequence");
            return;
        }
        for header in &headers {
            if let Err(err) = check_block_header(header, self.chain.params()) {
                utxod_log::log_warn!(
                    "rejected header {} from peer {peer}: {}",
                    hash256_to_hex(&header.hash()),
                    err.reason()
                );
                self.penalize(peer, err.class(), err.reason());
                return;
            }
        }
        self.enqueue(WriterCommand::Headers { peer, headers });
    }

    /// Context-free block checks, then hands the block to the writer.
    pub fn on_block_received(&self, peer: PeerId, block: Block) {
        let hash = block.hash();
        {
            let mut state = self.state.lock().expect("sync state lock");
            if let Some(request) = state.in_flight.remove(&hash) {
                if let Some(entry) = state.peers.get_mut(&request.peer) {
                    entry.in_flight = entry.in_flight.saturating_sub(1);
                }
            }
        }
        if let Err(err) = check_block(&block, self.chain.params()) {
            utxod_log::log_warn!(
                "rejected block {} from peer {peer}: {}",
                hash256_to_hex(&hash),
                err.reason()
            );
            self.penalize(peer, err.class(), err.reason());
            return;
        }
        self.state
            .lock()
            .expect("sync state lock")
            .block_sources
            .insert(hash, peer);
        self.enqueue(WriterCommand::Block {
            peer: Some(peer),
            block,
        });
    }

    pub fn on_transaction_received(&self, peer: PeerId, tx: Transaction) {
        self.enqueue(WriterCommand::Transaction {
            peer: Some(peer),
            tx,
            reply: None,
        });
    }

    /// Expires stale requests, polls headers when idle and refills the
    /// download window.
    pub fn tick(&self, now: u64) {
        let mut state = self.state.lock().expect("sync state lock");

        let block_timeout = self.config.block_timeout_secs;
        let expired: Vec<(Hash256, BlockRequest)> = state
            .in_flight
            .iter()
            .filter(|(_, request)| request.sent.saturating_add(block_timeout) <= now)
            .map(|(hash, request)| (*hash, *request))
            .collect();
        for (hash, request) in expired {
            state.in_flight.remove(&hash);
            if let Some(entry) = state.peers.get_mut(&request.peer) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
            }
            match self.pick_peer_locked(&mut state, Some(request.peer)) {
                Some(next) => {
                    utxod_log::log_debug!(
                        "block request {} to peer {} timed out; requeued to peer {next}",
                        hash256_to_hex(&hash),
                        request.peer
                    );
                    self.send_block_request_locked(&mut state, next, hash, now);
                }
                None => utxod_log::log_debug!(
                    "block request {} to peer {} timed out; no other peer",
                    hash256_to_hex(&hash),
                    request.peer
                ),
            }
        }

        let header_timeout = self.config.header_timeout_secs;
        let stalled: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.header_request
                    .map_or(false, |sent| sent.saturating_add(header_timeout) <= now)
            })
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &stalled {
            if let Some(entry) = state.peers.get_mut(peer) {
                entry.header_request = None;
            }
        }
        for peer in stalled {
            let next = state
                .peers
                .keys()
                .copied()
                .find(|candidate| *candidate != peer)
                .unwrap_or(peer);
            utxod_log::log_debug!("header request to peer {peer} timed out; retrying with peer {next}");
            self.request_headers_locked(&mut state, next, now);
        }

        let waiting = state
            .peers
            .values()
            .any(|peer| peer.header_request.is_some());
        if !waiting
            && now >= state.last_header_sync.saturating_add(self.config.header_poll_secs)
        {
            if let Some(peer) = self.pick_peer_locked(&mut state, None) {
                self.request_headers_locked(&mut state, peer, now);
            }
        }

        self.schedule_downloads_locked(&mut state, now);
    }

    /// Called by the writer once a header batch from `peer` was applied.
    pub fn headers_processed(&self, peer: PeerId, received: usize, outcome: HeadersAccepted) {
        let now = now_secs();
        let mut state = self.state.lock().expect("sync state lock");
        if received >= MAX_HEADERS_RESULTS && outcome.accepted > 0 {
            self.request_headers_locked(&mut state, peer, now);
        }
        self.schedule_downloads_locked(&mut state, now);
    }

    /// Called by the writer when a header batch did not connect to the index.
    pub fn headers_disconnected(&self, peer: PeerId) {
        let mut state = self.state.lock().expect("sync state lock");
        self.request_headers_locked(&mut state, peer, now_secs());
    }

    /// Stages a block whose parent is unknown and asks the sender for the
    /// headers leading to it.
    pub fn stash_orphan(&self, peer: Option<PeerId>, block: Block) {
        let hash = block.hash();
        let mut state = self.state.lock().expect("sync state lock");
        state.block_sources.remove(&hash);
        let evicted = state.orphans.insert(block, peer);
        utxod_log::log_debug!(
            "staged orphan block {} ({} staged, {} evicted)",
            hash256_to_hex(&hash),
            state.orphans.len(),
            evicted.len()
        );
        if let Some(peer) = peer {
            if state.peers.contains_key(&peer) {
                self.request_headers_locked(&mut state, peer, now_secs());
            }
        }
    }

    /// Called by the writer once `hash` is stored: staged children are
    /// queued behind it.
    pub fn block_stored(&self, hash: &Hash256) {
        let children = self
            .state
            .lock()
            .expect("sync state lock")
            .orphans
            .take_children(hash);
        for (block, peer) in children {
            utxod_log::log_debug!(
                "replaying orphan block {} after parent {}",
                hash256_to_hex(&block.hash()),
                hash256_to_hex(hash)
            );
            if let Some(peer) = peer {
                self.state
                    .lock()
                    .expect("sync state lock")
                    .block_sources
                    .insert(block.hash(), peer);
            }
            self.enqueue(WriterCommand::Block { peer, block });
        }
    }

    /// Called by the writer when a block or header batch failed validation.
    pub fn block_rejected(&self, peer: Option<PeerId>, hash: &Hash256, class: FailureClass, reason: &str) {
        let source = {
            let mut state = self.state.lock().expect("sync state lock");
            state.block_sources.remove(hash).or(peer)
        };
        if let Some(peer) = source {
            self.penalize(peer, class, reason);
        }
    }

    /// Called by the writer after every activation step.
    pub fn chain_advanced(&self, step: &ActivationStep) {
        {
            let mut state = self.state.lock().expect("sync state lock");
            for block in &step.connected {
                state.block_sources.remove(&block.hash());
            }
        }
        if let Some((hash, err)) = &step.invalid {
            self.block_rejected(None, hash, err.class(), err.reason());
        }
        let mut state = self.state.lock().expect("sync state lock");
        self.schedule_downloads_locked(&mut state, now_secs());
    }

    pub fn penalize(&self, peer: PeerId, class: FailureClass, reason: &str) {
        let Some(severity) = Severity::for_class(class) else {
            return;
        };
        utxod_log::log_info!(
            "peer {peer} misbehaved ({}, score {}): {reason}",
            class.as_str(),
            severity.score()
        );
        self.transport.report_misbehavior(peer, severity, reason);
    }

    fn enqueue(&self, command: WriterCommand) {
        if self.commands.send(command).is_err() {
            utxod_log::log_debug!("chain writer stopped; dropping command");
        }
    }

    fn request_headers_locked(&self, state: &mut SyncState, peer: PeerId, now: u64) {
        let Some(entry) = state.peers.get_mut(&peer) else {
            return;
        };
        entry.header_request = Some(now);
        state.last_header_sync = now;
        self.transport
            .request_headers(peer, self.chain.header_locator());
    }

    /// Next peer with a free download slot, round robin, avoiding `exclude`.
    fn pick_peer_locked(&self, state: &mut SyncState, exclude: Option<PeerId>) -> Option<PeerId> {
        let candidates: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(peer, entry)| {
                Some(**peer) != exclude && entry.in_flight < self.config.blocks_in_flight
            })
            .map(|(peer, _)| *peer)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let peer = candidates[state.next_peer % candidates.len()];
        state.next_peer = state.next_peer.wrapping_add(1);
        Some(peer)
    }

    fn send_block_request_locked(&self, state: &mut SyncState, peer: PeerId, hash: Hash256, now: u64) {
        if let Some(entry) = state.peers.get_mut(&peer) {
            entry.in_flight += 1;
        }
        state.in_flight.insert(hash, BlockRequest { peer, sent: now });
        self.transport.request_block(peer, hash);
    }

    fn schedule_downloads_locked(&self, state: &mut SyncState, now: u64) {
        let capacity: usize = state
            .peers
            .values()
            .map(|peer| self.config.blocks_in_flight.saturating_sub(peer.in_flight))
            .sum();
        if capacity == 0 {
            return;
        }
        let pending: HashSet<Hash256> = state
            .in_flight
            .keys()
            .chain(state.block_sources.keys())
            .copied()
            .collect();
        let wanted = self.chain.blocks_to_download(capacity, |hash| {
            pending.contains(hash) || state.orphans.contains(hash)
        });
        for hash in wanted {
            let Some(peer) = self.pick_peer_locked(state, None) else {
                break;
            };
            self.send_block_request_locked(state, peer, hash, now);
        }
    }
}
