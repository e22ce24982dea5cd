//! In-memory block index: an arena of header nodes addressed by `NodeId`,
//! with skip pointers for ancestor lookup and the set of chain candidates.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use primitive_types::U256;
use smallvec::SmallVec;
use utxod_consensus::constants::MEDIAN_TIME_SPAN;
use utxod_consensus::{ConsensusParams, Hash256};
use utxod_pow::difficulty::{block_proof, get_next_work_required, CompactError, DifficultyError};
use utxod_pow::HeaderInfo;
use utxod_primitives::block::{BlockHeader, HEADER_SIZE};
use utxod_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::flatfiles::FileLocation;

pub const STATUS_VALID_HEADER: u32 = 1 << 0;
pub const STATUS_HAVE_DATA: u32 = 1 << 1;
pub const STATUS_HAVE_UNDO: u32 = 1 << 2;
pub const STATUS_VALID_SCRIPTS: u32 = 1 << 3;
pub const STATUS_FAILED_VALID: u32 = 1 << 4;
pub const STATUS_FAILED_CHILD: u32 = 1 << 5;
pub const STATUS_FAILED_MASK: u32 = STATUS_FAILED_VALID | STATUS_FAILED_CHILD;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct BlockNode {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub parent: Option<NodeId>,
    pub skip: Option<NodeId>,
    pub height: i32,
    pub chainwork: U256,
    pub status: u32,
    /// Order in which block data arrived; breaks chainwork ties.
    pub sequence: u64,
    pub tx_count: u32,
    pub location: Option<FileLocation>,
    /// Every block from genesis to this one has had its data stored.
    chain_has_data: bool,
    children: SmallVec<[NodeId; 2]>,
}

impl BlockNode {
    pub fn has_data(&self) -> bool {
        (self.status & STATUS_HAVE_DATA) != 0
    }

    pub fn has_undo(&self) -> bool {
        (self.status & STATUS_HAVE_UNDO) != 0
    }

    pub fn is_failed(&self) -> bool {
        (self.status & STATUS_FAILED_MASK) != 0
    }

    pub fn chain_has_data(&self) -> bool {
        self.chain_has_data
    }

    pub fn time(&self) -> i64 {
        self.header.time as i64
    }

    pub fn header_info(&self) -> HeaderInfo {
        HeaderInfo {
            height: self.height as i64,
            time: self.header.time as i64,
            bits: self.header.bits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    UnknownParent,
    Duplicate,
    Compact(CompactError),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::UnknownParent => write!(f, "parent header not in index"),
            IndexError::Duplicate => write!(f, "header already in index"),
            IndexError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<CompactError> for IndexError {
    fn from(err: CompactError) -> Self {
        IndexError::Compact(err)
    }
}

/// Most work first, then earliest data arrival.
type CandidateKey = (Reverse<U256>, u64, NodeId);

#[derive(Default)]
pub struct BlockIndex {
    nodes: Vec<BlockNode>,
    by_hash: HashMap<Hash256, NodeId>,
    candidates: BTreeSet<CandidateKey>,
    best_header: Option<NodeId>,
    next_sequence: u64,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &BlockNode {
        &self.nodes[id.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BlockNode)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (NodeId(idx as u32), node))
    }

    pub fn best_header(&self) -> Option<NodeId> {
        self.best_header
    }

    /// Adds a header whose parent is already indexed. A header with a null
    /// parent hash is accepted as the root.
    pub fn insert(&mut self, header: BlockHeader) -> Result<NodeId, IndexError> {
        let hash = header.hash();
        if self.by_hash.contains_key(&hash) {
            return Err(IndexError::Duplicate);
        }
        let parent = if header.prev_block == [0u8; 32] {
            None
        } else {
            Some(self.lookup(&header.prev_block).ok_or(IndexError::UnknownParent)?)
        };
        let proof = block_proof(header.bits)?;
        let (height, chainwork, inherited) = match parent {
            Some(parent) => {
                let parent = self.node(parent);
                let inherited = parent.status & STATUS_FAILED_MASK;
                let inherited = if inherited != 0 { STATUS_FAILED_CHILD } else { 0 };
                (
                    parent.height + 1,
                    parent.chainwork.saturating_add(proof),
                    inherited,
                )
            }
            None => (0, proof, 0),
        };
        let id = NodeId(self.nodes.len() as u32);
        let skip = parent.and_then(|parent| self.ancestor(parent, get_skip_height(height)));
        self.nodes.push(BlockNode {
            hash,
            header,
            parent,
            skip,
            height,
            chainwork,
            status: STATUS_VALID_HEADER | inherited,
            sequence: u64::MAX,
            tx_count: 0,
            location: None,
            chain_has_data: false,
            children: SmallVec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent.index()].children.push(id);
        }
        self.by_hash.insert(hash, id);
        self.update_best_header(id);
        Ok(id)
    }

    /// Restores a persisted node. Parents must be restored first.
    pub fn restore(&mut self, stored: StoredNode) -> Result<NodeId, IndexError> {
        let id = self.insert(stored.header)?;
        let node = &mut self.nodes[id.index()];
        node.status = stored.status;
        node.sequence = stored.sequence;
        node.tx_count = stored.tx_count;
        node.location = stored.location;
        if stored.sequence != u64::MAX {
            self.next_sequence = self.next_sequence.max(stored.sequence + 1);
        }
        if self.node(id).is_failed() {
            self.recompute_best_header();
        }
        // Pruned nodes keep their tx count, so the chain stays linked above them.
        if self.node(id).tx_count > 0 {
            let parent_ready = self
                .node(id)
                .parent
                .map_or(true, |parent| self.node(parent).chain_has_data);
            if parent_ready {
                self.nodes[id.index()].chain_has_data = true;
                self.add_candidate(id);
            }
        }
        Ok(id)
    }

    pub fn ancestor(&self, id: NodeId, height: i32) -> Option<NodeId> {
        let mut walk = id;
        let mut walk_height = self.node(walk).height;
        if height > walk_height || height < 0 {
            return None;
        }
        while walk_height > height {
            let node = self.node(walk);
            let skip_height = get_skip_height(walk_height);
            let skip_prev_height = get_skip_height(walk_height - 1);
            let take_skip = match node.skip {
                Some(_) => {
                    skip_height == height
                        || (skip_height > height
                            && !(skip_prev_height < skip_height - 2 && skip_prev_height >= height))
                }
                None => false,
            };
            if take_skip {
                walk = node.skip?;
                walk_height = skip_height;
            } else {
                walk = node.parent?;
                walk_height -= 1;
            }
        }
        Some(walk)
    }

    /// Last block shared by the chains ending at `a` and `b`.
    pub fn fork_point(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let height = self.node(a).height.min(self.node(b).height);
        let mut a = self.ancestor(a, height)?;
        let mut b = self.ancestor(b, height)?;
        while a != b {
            a = self.node(a).parent?;
            b = self.node(b).parent?;
        }
        Some(a)
    }

    pub fn is_ancestor(&self, ancestor: NodeId, descendant: NodeId) -> bool {
        self.ancestor(descendant, self.node(ancestor).height) == Some(ancestor)
    }

    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.node(current);
            times.push(node.time());
            cursor = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Bits a child of `prev` with timestamp `time` must carry.
    pub fn next_work_required(
        &self,
        prev: NodeId,
        time: i64,
        params: &ConsensusParams,
    ) -> Result<u32, DifficultyError> {
        let last = self.node(prev).header_info();
        get_next_work_required(&last, time, params, |height| {
            let height = i32::try_from(height).ok()?;
            self.ancestor(prev, height)
                .map(|id| self.node(id).header_info())
        })
    }

    /// Dense for the last ten blocks, then doubling steps back to genesis.
    pub fn locator(&self, id: NodeId) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        let mut step = 1i32;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.node(current);
            hashes.push(node.hash);
            if node.height == 0 {
                break;
            }
            let next_height = (node.height - step).max(0);
            cursor = self.ancestor(current, next_height);
            if hashes.len() > 10 {
                step = step.saturating_mul(2);
            }
        }
        hashes
    }

    /// Records stored block data. Returns every node that became eligible to
    /// be a chain candidate as a result.
    pub fn set_have_data(
        &mut self,
        id: NodeId,
        location: FileLocation,
        tx_count: u32,
    ) -> Vec<NodeId> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        {
            let node = &mut self.nodes[id.index()];
            node.status |= STATUS_HAVE_DATA;
            node.location = Some(location);
            node.tx_count = tx_count;
            node.sequence = sequence;
        }
        let parent_ready = self
            .node(id)
            .parent
            .map_or(true, |parent| self.node(parent).chain_has_data);
        if !parent_ready {
            return Vec::new();
        }

        let mut linked = Vec::new();
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            self.nodes[current.index()].chain_has_data = true;
            self.add_candidate(current);
            linked.push(current);
            for child in self.node(current).children.clone() {
                if self.node(child).has_data() && !self.node(child).chain_has_data {
                    queue.push(child);
                }
            }
        }
        linked
    }

    /// Drops pruned block data; the node stays in the index.
    pub fn clear_data(&mut self, id: NodeId) {
        self.remove_candidate(id);
        let node = &mut self.nodes[id.index()];
        node.status &= !(STATUS_HAVE_DATA | STATUS_HAVE_UNDO);
        node.location = None;
    }

    pub fn set_status(&mut self, id: NodeId, status: u32) {
        self.nodes[id.index()].status |= status;
    }

    /// Marks `id` invalid and every descendant as a failed child. Returns all
    /// nodes whose status changed.
    pub fn mark_failed(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut changed = Vec::new();
        if (self.node(id).status & STATUS_FAILED_VALID) == 0 {
            self.nodes[id.index()].status |= STATUS_FAILED_VALID;
            changed.push(id);
        }
        self.remove_candidate(id);
        let mut stack: Vec<NodeId> = self.node(id).children.to_vec();
        while let Some(current) = stack.pop() {
            self.remove_candidate(current);
            let node = &mut self.nodes[current.index()];
            if (node.status & STATUS_FAILED_CHILD) == 0 {
                node.status |= STATUS_FAILED_CHILD;
                changed.push(current);
            }
            stack.extend(node.children.iter().copied());
        }
        if self
            .best_header
            .map_or(false, |best| self.node(best).is_failed())
        {
            self.recompute_best_header();
        }
        changed
    }

    /// Statuses `mark_failed(id)` would leave behind, without applying them.
    pub fn failed_statuses(&self, id: NodeId) -> Vec<(NodeId, u32)> {
        let mut statuses = vec![(id, self.node(id).status | STATUS_FAILED_VALID)];
        let mut stack: Vec<NodeId> = self.node(id).children.to_vec();
        while let Some(current) = stack.pop() {
            let node = self.node(current);
            statuses.push((current, node.status | STATUS_FAILED_CHILD));
            stack.extend(node.children.iter().copied());
        }
        statuses
    }

    pub fn most_work_candidate(&self) -> Option<NodeId> {
        self.candidates.iter().next().map(|(_, _, id)| *id)
    }

    pub fn candidates(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.candidates.iter().map(|(_, _, id)| *id)
    }

    pub fn remove_candidate(&mut self, id: NodeId) {
        let key = self.candidate_key(id);
        self.candidates.remove(&key);
    }

    pub fn add_candidate(&mut self, id: NodeId) {
        let node = self.node(id);
        if node.has_data() && node.chain_has_data && !node.is_failed() {
            let key = self.candidate_key(id);
            self.candidates.insert(key);
        }
    }

    /// Forgets candidates that can no longer beat `tip`.
    pub fn prune_candidates(&mut self, tip: NodeId) {
        let tip_node = self.node(tip);
        let bound = (Reverse(tip_node.chainwork), tip_node.sequence, tip);
        let stale: Vec<CandidateKey> = self.candidates.range(bound..).skip(1).copied().collect();
        for key in stale {
            self.candidates.remove(&key);
        }
    }

    fn candidate_key(&self, id: NodeId) -> CandidateKey {
        let node = self.node(id);
        (Reverse(node.chainwork), node.sequence, id)
    }

    fn update_best_header(&mut self, id: NodeId) {
        let node = self.node(id);
        if node.is_failed() {
            return;
        }
        let better = match self.best_header {
            Some(best) => node.chainwork > self.node(best).chainwork,
            None => true,
        };
        if better {
            self.best_header = Some(id);
        }
    }

    fn recompute_best_header(&mut self) {
        self.best_header = None;
        for index in 0..self.nodes.len() {
            self.update_best_header(NodeId(index as u32));
        }
    }
}

/// The active chain as a height-indexed vector of nodes.
#[derive(Clone, Debug, Default)]
pub struct ActiveChain {
    nodes: Vec<NodeId>,
}

impl ActiveChain {
    pub fn tip(&self) -> Option<NodeId> {
        self.nodes.last().copied()
    }

    pub fn height(&self) -> i32 {
        self.nodes.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<NodeId> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.nodes.get(height).copied())
    }

    pub fn contains(&self, index: &BlockIndex, id: NodeId) -> bool {
        self.at(index.node(id).height) == Some(id)
    }

    /// Repoints the chain at `tip`, rewriting only the part above the fork.
    pub fn set_tip(&mut self, index: &BlockIndex, tip: NodeId) {
        let height = index.node(tip).height as usize;
        self.nodes.truncate(height + 1);
        self.nodes.resize(height + 1, tip);
        let mut cursor = Some(tip);
        let mut pos = height;
        while let Some(current) = cursor {
            if self.nodes[pos] == current && pos != height {
                break;
            }
            self.nodes[pos] = current;
            cursor = index.node(current).parent;
            if pos == 0 {
                break;
            }
            pos -= 1;
        }
    }

    pub fn find_fork(&self, index: &BlockIndex, id: NodeId) -> Option<NodeId> {
        let tip_height = self.height();
        let mut cursor = if index.node(id).height > tip_height {
            index.ancestor(id, tip_height)
        } else {
            Some(id)
        };
        while let Some(current) = cursor {
            if self.contains(index, current) {
                return Some(current);
            }
            cursor = index.node(current).parent;
        }
        None
    }
}

/// On-disk form of a node. The parent and skip links are rebuilt on load.
#[derive(Clone, Debug)]
pub struct StoredNode {
    pub header: BlockHeader,
    pub height: i32,
    pub status: u32,
    pub sequence: u64,
    pub tx_count: u32,
    pub location: Option<FileLocation>,
}

impl StoredNode {
    pub fn from_node(node: &BlockNode) -> Self {
        Self {
            header: node.header.clone(),
            height: node.height,
            status: node.status,
            sequence: node.sequence,
            tx_count: node.tx_count,
            location: node.location,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE + 37);
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.status);
        encoder.write_u64_le(self.sequence);
        encoder.write_u32_le(self.tx_count);
        match self.location {
            Some(location) => {
                encoder.write_u8(1);
                encoder.write_bytes(&location.encode());
            }
            None => encoder.write_u8(0),
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let height = decoder.read_i32_le()?;
        let status = decoder.read_u32_le()?;
        let sequence = decoder.read_u64_le()?;
        let tx_count = decoder.read_u32_le()?;
        let location = match decoder.read_u8()? {
            0 => None,
            1 => {
                let raw = decoder.read_fixed::<16>()?;
                Some(
                    FileLocation::decode(&raw)
                        .ok_or(DecodeError::InvalidData("invalid block location"))?,
                )
            }
            _ => return Err(DecodeError::InvalidData("invalid block location flag")),
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            height,
            status,
            sequence,
            tx_count,
            location,
        })
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EASY_BITS: u32 = 0x207f_ffff;

    fn child_of(prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_600_000_000 + nonce,
            bits: EASY_BITS,
            nonce,
        }
    }

    fn build_chain(index: &mut BlockIndex, from: Hash256, len: u32, salt: u32) -> Vec<NodeId> {
        let mut prev = from;
        let mut ids = Vec::new();
        for i in 0..len {
            let header = child_of(prev, salt * 10_000 + i);
            prev = header.hash();
            ids.push(index.insert(header).expect("insert"));
        }
        ids
    }

    fn location(n: u32) -> FileLocation {
        FileLocation {
            file_id: 0,
            offset: n as u64 * 100,
            len: 90,
        }
    }

    #[test]
    fn ancestor_matches_parent_walk() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0u8; 32], 300, 1);
        let tip = *ids.last().expect("tip");
        for height in [0, 1, 2, 63, 64, 65, 128, 255, 299] {
            let found = index.ancestor(tip, height).expect("ancestor");
            assert_eq!(found, ids[height as usize]);
            assert_eq!(index.node(found).height, height);
        }
        assert_eq!(index.ancestor(tip, 300), None);
        assert_eq!(index.ancestor(ids[10], -1), None);
    }

    #[test]
    fn fork_point_of_siblings() {
        let mut index = BlockIndex::new();
        let main = build_chain(&mut index, [0u8; 32], 20, 1);
        let side_parent = index.node(main[9]).hash;
        let side = build_chain(&mut index, side_parent, 15, 2);
        let fork = index
            .fork_point(main[19], *side.last().expect("side tip"))
            .expect("fork");
        assert_eq!(fork, main[9]);
        assert!(index.is_ancestor(main[9], side[0]));
        assert!(!index.is_ancestor(main[10], side[0]));
        assert_eq!(index.best_header(), side.last().copied());
    }

    #[test]
    fn candidates_need_connected_data() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0u8; 32], 4, 1);
        index.set_have_data(ids[0], location(0), 1);
        let linked = index.set_have_data(ids[2], location(2), 1);
        assert!(linked.is_empty());
        assert_eq!(index.most_work_candidate(), Some(ids[0]));

        let linked = index.set_have_data(ids[1], location(1), 1);
        assert_eq!(linked.len(), 2);
        assert_eq!(index.most_work_candidate(), Some(ids[2]));
    }

    #[test]
    fn equal_work_prefers_first_data() {
        let mut index = BlockIndex::new();
        let root = build_chain(&mut index, [0u8; 32], 1, 1)[0];
        let a_parent = index.node(root).hash;
        let a = build_chain(&mut index, a_parent, 1, 2)[0];
        let b_parent = index.node(root).hash;
        let b = build_chain(&mut index, b_parent, 1, 3)[0];
        index.set_have_data(root, location(0), 1);
        index.set_have_data(b, location(1), 1);
        index.set_have_data(a, location(2), 1);
        assert_eq!(index.most_work_candidate(), Some(b));
        index.prune_candidates(b);
        assert_eq!(index.candidates().collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn failure_poisons_descendants() {
        let mut index = BlockIndex::new();
        let main = build_chain(&mut index, [0u8; 32], 3, 1);
        let side_parent = index.node(main[0]).hash;
        let side = build_chain(&mut index, side_parent, 4, 2);
        for (n, id) in main.iter().chain(side.iter()).enumerate() {
            index.set_have_data(*id, location(n as u32), 1);
        }
        assert_eq!(index.most_work_candidate(), side.last().copied());

        let changed = index.mark_failed(side[1]);
        assert_eq!(changed.len(), 3);
        assert!(index.node(side[3]).is_failed());
        assert!(!index.node(side[0]).is_failed());
        assert_eq!(index.most_work_candidate(), Some(main[2]));
        assert_eq!(index.best_header(), Some(main[2]));

        let late = index
            .insert(child_of(index.node(side[3]).hash, 99))
            .expect("insert");
        assert_ne!(index.node(late).status & STATUS_FAILED_CHILD, 0);
        assert_eq!(index.best_header(), Some(main[2]));
    }

    #[test]
    fn locator_is_dense_then_sparse() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0u8; 32], 100, 1);
        let locator = index.locator(ids[99]);
        let heights: Vec<i32> = locator
            .iter()
            .map(|hash| index.node(index.lookup(hash).expect("known")).height)
            .collect();
        assert_eq!(&heights[..11], &[99, 98, 97, 96, 95, 94, 93, 92, 91, 90, 89]);
        assert_eq!(&heights[11..14], &[88, 86, 82]);
        assert_eq!(*heights.last().expect("genesis"), 0);
    }

    #[test]
    fn active_chain_follows_reorg() {
        let mut index = BlockIndex::new();
        let main = build_chain(&mut index, [0u8; 32], 6, 1);
        let side_parent = index.node(main[2]).hash;
        let side = build_chain(&mut index, side_parent, 5, 2);
        let mut chain = ActiveChain::default();
        chain.set_tip(&index, main[5]);
        assert_eq!(chain.height(), 5);
        assert_eq!(chain.find_fork(&index, side[4]), Some(main[2]));

        chain.set_tip(&index, side[4]);
        assert_eq!(chain.height(), 7);
        assert_eq!(chain.at(3), Some(side[0]));
        assert_eq!(chain.at(2), Some(main[2]));
        assert!(!chain.contains(&index, main[3]));

        chain.set_tip(&index, main[1]);
        assert_eq!(chain.tip(), Some(main[1]));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn stored_node_round_trip() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0u8; 32], 2, 1);
        index.set_have_data(ids[0], location(0), 3);
        let stored = StoredNode::from_node(index.node(ids[0]));
        let decoded = StoredNode::decode(&stored.encode()).expect("decode");
        assert_eq!(decoded.header, stored.header);
        assert_eq!(decoded.location, Some(location(0)));
        assert_eq!(decoded.tx_count, 3);

        let mut restored = BlockIndex::new();
        let id = restored.restore(decoded).expect("restore");
        assert_eq!(restored.most_work_candidate(), Some(id));
    }
}
