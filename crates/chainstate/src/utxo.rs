//! UTXO set logic backed by the storage trait, plus the layered overlay used
//! to stage a chain step before it is committed.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use utxod_consensus::money::Amount;
use utxod_consensus::Hash256;
use utxod_primitives::encoding::{DecodeError, Decoder, Encoder};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::TxOut;
use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const OUTPOINT_KEY_LEN: usize = 36;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn from_output(output: &TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
            height,
            is_coinbase,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(14 + self.script_pubkey.len());
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_be_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; OUTPOINT_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn outpoint(&self) -> OutPoint {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&self.0[..32]);
        let index = u32::from_be_bytes([self.0[32], self.0[33], self.0[34], self.0[35]]);
        OutPoint { hash, index }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtxoError {
    /// The outpoint is not in the view.
    Missing(OutPoint),
    /// An output with this outpoint is already unspent.
    Overwrite(OutPoint),
    Store(String),
}

impl std::fmt::Display for UtxoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UtxoError::Missing(outpoint) => write!(
                f,
                "missing utxo {}:{}",
                utxod_primitives::hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            UtxoError::Overwrite(outpoint) => write!(
                f,
                "utxo {}:{} already exists",
                utxod_primitives::hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            UtxoError::Store(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for UtxoError {}

impl From<StoreError> for UtxoError {
    fn from(err: StoreError) -> Self {
        UtxoError::Store(err.to_string())
    }
}

/// Read access to a set of unspent outputs.
pub trait UtxoView {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, UtxoError>;
}

impl<T: UtxoView + ?Sized> UtxoView for &T {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, UtxoError> {
        (**self).utxo(outpoint)
    }
}

pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        let key = OutPointKey::new(outpoint);
        match self.store.get(Column::Utxo, key.as_bytes())? {
            Some(bytes) => Ok(Some(
                UtxoEntry::decode(&bytes).map_err(|err| StoreError::Backend(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, outpoint: &OutPoint, entry: &UtxoEntry) {
        let key = OutPointKey::new(outpoint);
        batch.put(Column::Utxo, key.as_bytes(), entry.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        let key = OutPointKey::new(outpoint);
        batch.delete(Column::Utxo, key.as_bytes());
    }

    /// Writes the net changes of an overlay into `batch`.
    pub fn stage(&self, batch: &mut WriteBatch, changes: UtxoChanges) {
        for (outpoint, entry) in changes.entries {
            match entry {
                Some(entry) => self.put(batch, &outpoint, &entry),
                None => self.delete(batch, &outpoint),
            }
        }
    }

    /// Walks the whole set in key order and summarizes it.
    pub fn info(&self) -> Result<UtxoSetInfo, StoreError> {
        let mut info = UtxoSetInfo::default();
        let mut hasher = Sha256::new();
        let mut last_txid: Option<Hash256> = None;
        let mut visitor = |key: &[u8], value: &[u8]| -> Result<(), StoreError> {
            let key = OutPointKey::from_slice(key)
                .ok_or_else(|| StoreError::Backend("invalid utxo key length".to_string()))?;
            let entry =
                UtxoEntry::decode(value).map_err(|err| StoreError::Backend(err.to_string()))?;
            let outpoint = key.outpoint();
            if last_txid != Some(outpoint.hash) {
                info.transactions += 1;
                last_txid = Some(outpoint.hash);
            }
            info.txouts += 1;
            info.total_amount = info
                .total_amount
                .checked_add(entry.value)
                .ok_or_else(|| StoreError::Backend("utxo total overflow".to_string()))?;
            hasher.update(key.as_bytes());
            hasher.update(value);
            Ok(())
        };
        self.store.for_each_prefix(Column::Utxo, &[], &mut visitor)?;
        let first = hasher.finalize();
        info.hash_serialized.copy_from_slice(&Sha256::digest(first));
        Ok(info)
    }
}

impl<S: KeyValueStore> UtxoView for UtxoSet<S> {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, UtxoError> {
        Ok(self.get(outpoint)?)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UtxoSetInfo {
    pub transactions: u64,
    pub txouts: u64,
    pub total_amount: Amount,
    pub hash_serialized: Hash256,
}

/// Net effect of an overlay: `None` deletes the outpoint.
#[derive(Debug, Default)]
pub struct UtxoChanges {
    entries: HashMap<OutPoint, Option<UtxoEntry>>,
}

impl UtxoChanges {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Copy-on-write view over a base set. Nothing reaches the base until the
/// caller takes the changes and stages them into a batch, so dropping an
/// overlay discards its work.
pub struct UtxoOverlay<V> {
    base: V,
    entries: HashMap<OutPoint, Option<UtxoEntry>>,
}

impl<V: UtxoView> UtxoOverlay<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            entries: HashMap::new(),
        }
    }

    /// Removes an unspent output and returns it.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<UtxoEntry, UtxoError> {
        let entry = self.utxo(outpoint)?.ok_or(UtxoError::Missing(*outpoint))?;
        self.entries.insert(*outpoint, None);
        Ok(entry)
    }

    /// Adds a new unspent output; an existing unspent one at the same
    /// outpoint is an error unless `allow_overwrite` is set.
    pub fn add(
        &mut self,
        outpoint: OutPoint,
        entry: UtxoEntry,
        allow_overwrite: bool,
    ) -> Result<(), UtxoError> {
        if !allow_overwrite && self.utxo(&outpoint)?.is_some() {
            return Err(UtxoError::Overwrite(outpoint));
        }
        self.entries.insert(outpoint, Some(entry));
        Ok(())
    }

    /// Puts back an output that an undo record says was spent.
    pub fn restore(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.entries.insert(outpoint, Some(entry));
    }

    /// Drops an output created by a block being disconnected. Missing outputs
    /// are tolerated; they were spent and pruned before the record was made.
    pub fn remove(&mut self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, UtxoError> {
        let existing = self.utxo(outpoint)?;
        self.entries.insert(*outpoint, None);
        Ok(existing)
    }

    /// Folds a child overlay's changes into this one.
    pub fn merge(&mut self, changes: UtxoChanges) {
        self.entries.extend(changes.entries);
    }

    pub fn into_changes(self) -> UtxoChanges {
        UtxoChanges {
            entries: self.entries,
        }
    }

    pub fn base(&self) -> &V {
        &self.base
    }
}

impl<V: UtxoView> UtxoView for UtxoOverlay<V> {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, UtxoError> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok(entry.clone()),
            None => self.base.utxo(outpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use utxod_storage::memory::MemoryStore;

    fn entry(value: Amount, height: u32) -> UtxoEntry {
        UtxoEntry {
            value,
            script_pubkey: vec![0x51],
            height,
            is_coinbase: false,
        }
    }

    #[test]
    fn entry_encoding_round_trip() {
        let original = UtxoEntry {
            value: 5_000_000_000,
            script_pubkey: vec![0x76, 0xa9, 0x14],
            height: 12,
            is_coinbase: true,
        };
        let decoded = UtxoEntry::decode(&original.encode()).expect("decode");
        assert_eq!(decoded, original);
        let mut trailing = original.encode();
        trailing.push(0);
        assert_eq!(UtxoEntry::decode(&trailing), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn outpoint_key_orders_outputs_of_one_transaction() {
        let low = OutPointKey::new(&OutPoint::new([7u8; 32], 1));
        let high = OutPointKey::new(&OutPoint::new([7u8; 32], 256));
        assert!(low.as_bytes() < high.as_bytes());
        assert_eq!(high.outpoint(), OutPoint::new([7u8; 32], 256));
    }

    #[test]
    fn overlay_shadows_base_until_staged() {
        let store = Arc::new(MemoryStore::new());
        let set = UtxoSet::new(Arc::clone(&store));
        let funded = OutPoint::new([1u8; 32], 0);
        let mut batch = WriteBatch::new();
        set.put(&mut batch, &funded, &entry(50, 1));
        store.write_batch(&batch).expect("seed");

        let mut overlay = UtxoOverlay::new(&set);
        let spent = overlay.spend(&funded).expect("spend");
        assert_eq!(spent.value, 50);
        assert_eq!(overlay.spend(&funded), Err(UtxoError::Missing(funded)));
        let created = OutPoint::new([2u8; 32], 0);
        overlay.add(created, entry(40, 2), false).expect("add");
        assert_eq!(
            overlay.add(created, entry(40, 2), false),
            Err(UtxoError::Overwrite(created))
        );

        assert!(set.get(&funded).expect("get").is_some());
        assert!(set.get(&created).expect("get").is_none());

        let changes = overlay.into_changes();
        let mut batch = WriteBatch::new();
        set.stage(&mut batch, changes);
        store.write_batch(&batch).expect("commit");
        assert!(set.get(&funded).expect("get").is_none());
        assert_eq!(set.get(&created).expect("get"), Some(entry(40, 2)));
    }

    #[test]
    fn child_overlay_merges_into_parent() {
        let store = Arc::new(MemoryStore::new());
        let set = UtxoSet::new(store);
        let mut parent = UtxoOverlay::new(&set);
        let outpoint = OutPoint::new([3u8; 32], 0);
        parent.add(outpoint, entry(10, 1), false).expect("add");

        let changes = {
            let mut child = UtxoOverlay::new(&parent);
            child.spend(&outpoint).expect("spend in child");
            child.into_changes()
        };
        assert!(parent.utxo(&outpoint).expect("lookup").is_some());
        parent.merge(changes);
        assert!(parent.utxo(&outpoint).expect("lookup").is_none());
    }

    #[test]
    fn info_counts_transactions_and_value() {
        let store = Arc::new(MemoryStore::new());
        let set = UtxoSet::new(Arc::clone(&store));
        let mut batch = WriteBatch::new();
        set.put(&mut batch, &OutPoint::new([1u8; 32], 0), &entry(10, 1));
        set.put(&mut batch, &OutPoint::new([1u8; 32], 1), &entry(20, 1));
        set.put(&mut batch, &OutPoint::new([2u8; 32], 0), &entry(30, 2));
        store.write_batch(&batch).expect("commit");

        let info = set.info().expect("info");
        assert_eq!(info.transactions, 2);
        assert_eq!(info.txouts, 3);
        assert_eq!(info.total_amount, 60);
        assert_ne!(info.hash_serialized, [0u8; 32]);
    }
}
