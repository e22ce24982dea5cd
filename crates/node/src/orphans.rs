//! Transactions waiting for parents the node has not seen yet.

use std::collections::{HashMap, HashSet};

use utxod_consensus::Hash256;
use utxod_primitives::transaction::Transaction;

use crate::interface::PeerId;
use crate::policy::MAX_STANDARD_TX_WEIGHT;

#[derive(Clone, Debug)]
struct OrphanTx {
    tx: Transaction,
    size: usize,
    received: u64,
    sequence: u64,
    peer: Option<PeerId>,
    missing_parents: Vec<Hash256>,
}

/// Orphan transactions released because a parent arrived.
#[derive(Clone, Debug)]
pub struct ReleasedOrphan {
    pub tx: Transaction,
    pub peer: Option<PeerId>,
}

pub struct OrphanPool {
    entries: HashMap<Hash256, OrphanTx>,
    by_parent: HashMap<Hash256, HashSet<Hash256>>,
    bytes: usize,
    next_sequence: u64,
    max_entries: usize,
    max_bytes: usize,
    ttl_secs: u64,
}

impl OrphanPool {
    pub fn new(max_entries: usize, max_bytes: usize, ttl_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            by_parent: HashMap::new(),
            bytes: 0,
            next_sequence: 0,
            max_entries,
            max_bytes,
            ttl_secs,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    /// Stores `tx` keyed by the parents it is missing. Returns the txids
    /// evicted to make room, or `None` when the orphan was not kept.
    pub fn insert(
        &mut self,
        tx: Transaction,
        peer: Option<PeerId>,
        missing_parents: Vec<Hash256>,
        now: u64,
    ) -> Option<Vec<Hash256>> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) || self.max_entries == 0 {
            return None;
        }
        if tx.weight() > MAX_STANDARD_TX_WEIGHT {
            return None;
        }
        let size = tx.total_size();
        if size > self.max_bytes {
            return None;
        }

        let mut evicted = self.expire(now);
        while self.entries.len() >= self.max_entries || self.bytes + size > self.max_bytes {
            let Some(oldest) = self.oldest() else {
                break;
            };
            self.remove(&oldest);
            evicted.push(oldest);
        }

        let mut parents = missing_parents;
        parents.sort();
        parents.dedup();
        for parent in &parents {
            self.by_parent.entry(*parent).or_default().insert(txid);
        }
        self.bytes += size;
        self.entries.insert(
            txid,
            OrphanTx {
                tx,
                size,
                received: now,
                sequence: self.next_sequence,
                peer,
                missing_parents: parents,
            },
        );
        self.next_sequence += 1;
        Some(evicted)
    }

    /// Removes and returns every orphan that spends an output of `parent`,
    /// oldest first.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<ReleasedOrphan> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        let mut children: Vec<(u64, Hash256)> = children
            .into_iter()
            .filter_map(|txid| self.entries.get(&txid).map(|orphan| (orphan.sequence, txid)))
            .collect();
        children.sort();
        children
            .into_iter()
            .filter_map(|(_, txid)| self.remove(&txid))
            .map(|orphan| ReleasedOrphan {
                tx: orphan.tx,
                peer: orphan.peer,
            })
            .collect()
    }

    /// Drops orphans confirmed by, or double-spent by, `transactions`.
    pub fn remove_for_block(&mut self, transactions: &[Transaction]) -> usize {
        let mut spent = HashSet::new();
        let mut confirmed = HashSet::new();
        for tx in transactions {
            confirmed.insert(tx.txid());
            if !tx.is_coinbase() {
                spent.extend(tx.vin.iter().map(|input| input.prevout));
            }
        }
        let doomed: Vec<Hash256> = self
            .entries
            .iter()
            .filter(|(txid, orphan)| {
                confirmed.contains(*txid)
                    || orphan
                        .tx
                        .vin
                        .iter()
                        .any(|input| spent.contains(&input.prevout))
            })
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &doomed {
            self.remove(txid);
        }
        doomed.len()
    }

    /// Drops orphans older than the expiry window.
    pub fn expire(&mut self, now: u64) -> Vec<Hash256> {
        let ttl = self.ttl_secs;
        let expired: Vec<Hash256> = self
            .entries
            .iter()
            .filter(|(_, orphan)| orphan.received.saturating_add(ttl) <= now)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &expired {
            self.remove(txid);
        }
        expired
    }

    fn oldest(&self) -> Option<Hash256> {
        self.entries
            .iter()
            .min_by_key(|(_, orphan)| orphan.sequence)
            .map(|(txid, _)| *txid)
    }

    fn remove(&mut self, txid: &Hash256) -> Option<OrphanTx> {
        let orphan = self.entries.remove(txid)?;
        self.bytes = self.bytes.saturating_sub(orphan.size);
        for parent in &orphan.missing_parents {
            if let Some(children) = self.by_parent.get_mut(parent) {
                children.remove(txid);
                if children.is_empty() {
                    self.by_parent.remove(parent);
                }
            }
        }
        Some(orphan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_primitives::outpoint::OutPoint;
    use utxod_primitives::transaction::{TxIn, TxOut};

    fn child_of(parent: Hash256, tag: u8) -> Transaction {
        Transaction {
            version: 2,
            vin: vec![TxIn::new(OutPoint::new(parent, 0), vec![tag], 0xffff_ffff)],
            vout: vec![TxOut {
                value: 1_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn full_pool_evicts_oldest() {
        let mut pool = OrphanPool::new(2, 1 << 20, 600);
        let first = child_of([1u8; 32], 1);
        let second = child_of([2u8; 32], 2);
        let third = child_of([3u8; 32], 3);

        assert_eq!(pool.insert(first.clone(), Some(1), vec![[1u8; 32]], 10), Some(vec![]));
        assert_eq!(pool.insert(second.clone(), Some(1), vec![[2u8; 32]], 11), Some(vec![]));
        let evicted = pool.insert(third.clone(), None, vec![[3u8; 32]], 12).expect("stored");

        assert_eq!(evicted, vec![first.txid()]);
        assert_eq!(pool.len(), 2);
        assert!(pool.contains(&second.txid()));
        assert!(pool.take_children(&[1u8; 32]).is_empty());
    }

    #[test]
    fn children_are_released_oldest_first() {
        let mut pool = OrphanPool::new(10, 1 << 20, 600);
        let parent = [9u8; 32];
        let late = child_of(parent, 2);
        let early = child_of(parent, 1);
        pool.insert(early.clone(), Some(4), vec![parent], 5);
        pool.insert(late.clone(), Some(5), vec![parent], 6);

        let released = pool.take_children(&parent);
        let txids: Vec<_> = released.iter().map(|orphan| orphan.tx.txid()).collect();
        assert_eq!(txids, vec![early.txid(), late.txid()]);
        assert_eq!(released[0].peer, Some(4));
        assert!(pool.is_empty());
        assert_eq!(pool.bytes(), 0);
    }

    #[test]
    fn stale_orphans_expire() {
        let mut pool = OrphanPool::new(10, 1 << 20, 600);
        let tx = child_of([1u8; 32], 1);
        pool.insert(tx.clone(), None, vec![[1u8; 32]], 100);
        assert!(pool.expire(699).is_empty());
        assert_eq!(pool.expire(700), vec![tx.txid()]);
        assert!(pool.is_empty());
    }

    #[test]
    fn block_spending_the_same_input_drops_the_orphan() {
        let mut pool = OrphanPool::new(10, 1 << 20, 600);
        let orphan = child_of([1u8; 32], 1);
        pool.insert(orphan, None, vec![[1u8; 32]], 1);
        let rival = child_of([1u8; 32], 2);
        assert_eq!(pool.remove_for_block(&[rival]), 1);
        assert!(pool.is_empty());
    }
}
