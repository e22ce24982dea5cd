//! Pool of unconfirmed transactions that are valid against the active tip.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use utxod_chainstate::validation::{
    calculate_sequence_locks, check_transaction, check_tx_inputs, is_final_tx,
    sequence_locks_satisfied,
};
use utxod_chainstate::{ChainState, FailureClass, NextBlockContext, UtxoEntry};
use utxod_consensus::constants::COINBASE_MATURITY;
use utxod_consensus::money::Amount;
use utxod_consensus::Hash256;
use utxod_primitives::hash256_to_hex;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::Transaction;
use utxod_script::interpreter::STANDARD_SCRIPT_VERIFY_FLAGS;
use utxod_script::sigops::transaction_sigop_cost;
use utxod_script::{verify_input, PrecomputedTxData, ScriptFlags};
use utxod_storage::KeyValueStore;

use crate::interface::PeerId;
use crate::orphans::OrphanPool;
use crate::policy::{
    check_standard_tx, fee_at_rate, fee_rate_per_kb, is_standard_spend, MempoolPolicy,
    MAX_STANDARD_TX_SIGOPS_COST,
};

const ROLLING_FEE_HALFLIFE_SECS: f64 = 12.0 * 60.0 * 60.0;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInMempool,
    /// Has outputs in the UTXO set, so it is already confirmed.
    AlreadyInChain,
    /// Spends an output already spent by an entry that cannot be replaced.
    ConflictingInput,
    ReplacementRejected,
    InsufficientFee,
    MissingInput,
    MempoolFull,
    TooLongChain,
    NonStandard,
    InvalidTransaction,
    InvalidScript,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
    pub missing_inputs: Vec<OutPoint>,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            missing_inputs: Vec::new(),
        }
    }

    pub fn missing_inputs(missing_inputs: Vec<OutPoint>) -> Self {
        Self {
            kind: MempoolErrorKind::MissingInput,
            message: "bad-txns-inputs-missingorspent".to_string(),
            missing_inputs,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self.kind {
            MempoolErrorKind::AlreadyInMempool
            | MempoolErrorKind::AlreadyInChain
            | MempoolErrorKind::ConflictingInput
            | MempoolErrorKind::ReplacementRejected => FailureClass::Conflicting,
            MempoolErrorKind::InsufficientFee
            | MempoolErrorKind::MempoolFull
            | MempoolErrorKind::TooLongChain
            | MempoolErrorKind::NonStandard => FailureClass::ResourceExhausted,
            MempoolErrorKind::MissingInput => FailureClass::Transient,
            MempoolErrorKind::InvalidTransaction | MempoolErrorKind::InvalidScript => {
                FailureClass::ConsensusInvalid
            }
            MempoolErrorKind::Internal => FailureClass::StorageFatal,
        }
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

/// Chain facts admission is checked against.
pub trait CoinView {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, MempoolError>;

    fn next_block(&self) -> NextBlockContext;

    /// Median time past of the active block at `height`.
    fn median_time_past_at(&self, height: i32) -> Option<i64>;
}

impl<S: KeyValueStore> CoinView for ChainState<S> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, MempoolError> {
        self.utxo(outpoint)
            .map_err(|err| MempoolError::new(MempoolErrorKind::Internal, err.to_string()))
    }

    fn next_block(&self) -> NextBlockContext {
        self.next_block_context()
    }

    fn median_time_past_at(&self, height: i32) -> Option<i64> {
        ChainState::median_time_past_at(self, height)
    }
}

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub fee: Amount,
    /// Serialized size including witness data.
    pub size: usize,
    pub vsize: u64,
    pub time: u64,
    /// Arrival order; later entries have larger values.
    pub sequence: u64,
    /// Tip height when the entry was accepted.
    pub height: i32,
    pub sigop_cost: u64,
    pub parents: BTreeSet<Hash256>,
    pub children: BTreeSet<Hash256>,
    pub ancestor_count: usize,
    pub ancestor_vsize: u64,
    pub ancestor_fees: Amount,
    pub descendant_count: usize,
    pub descendant_vsize: u64,
    pub descendant_fees: Amount,
}

impl MempoolEntry {
    /// Satoshis per 1000 virtual bytes.
    pub fn fee_rate(&self) -> Amount {
        fee_rate_per_kb(self.fee, self.vsize)
    }

    pub fn ancestor_fee_rate(&self) -> Amount {
        fee_rate_per_kb(self.ancestor_fees, self.ancestor_vsize)
    }

    pub fn descendant_fee_rate(&self) -> Amount {
        fee_rate_per_kb(self.descendant_fees, self.descendant_vsize)
    }
}

/// Result of a successful admission.
#[derive(Clone, Debug, Default)]
pub struct MempoolAcceptance {
    pub txid: Hash256,
    pub fee: Amount,
    pub vsize: u64,
    /// Entries removed because the new transaction replaced them.
    pub replaced: Vec<Hash256>,
    /// Entries removed to bring the pool back under its size budget.
    pub evicted: Vec<Hash256>,
    pub orphans_accepted: Vec<Hash256>,
    pub orphans_rejected: Vec<OrphanRejection>,
}

/// An orphan that turned out to be unacceptable once its parents arrived.
#[derive(Clone, Debug)]
pub struct OrphanRejection {
    pub txid: Hash256,
    pub peer: Option<PeerId>,
    pub error: MempoolError,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockRemoval {
    pub confirmed: usize,
    pub conflicts: Vec<Hash256>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReorgUpdate {
    pub reinserted: usize,
    /// Entries no longer valid on the new tip, with their descendants.
    pub dropped: Vec<Hash256>,
    pub evicted: Vec<Hash256>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MempoolInfo {
    pub size: usize,
    pub bytes: usize,
    pub orphans: usize,
    pub min_fee_rate: Amount,
    pub revision: u64,
}

struct Admission {
    entry: MempoolEntry,
    replaced: HashSet<Hash256>,
}

pub struct Mempool {
    policy: MempoolPolicy,
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    orphans: OrphanPool,
    total_bytes: usize,
    next_sequence: u64,
    revision: u64,
    rolling_min_fee: f64,
    last_rolling_update: u64,
    block_since_last_bump: bool,
}

impl Mempool {
    pub fn new(policy: MempoolPolicy) -> Self {
        let orphans = OrphanPool::new(
            policy.max_orphans,
            policy.max_orphan_bytes,
            policy.orphan_ttl_secs,
        );
        Self {
            policy,
            entries: HashMap::new(),
            spent: HashMap::new(),
            orphans,
            total_bytes: 0,
            next_sequence: 0,
            revision: 0,
            rolling_min_fee: 0.0,
            last_rolling_update: 0,
            block_since_last_bump: false,
        }
    }

    pub fn policy(&self) -> &MempoolPolicy {
        &self.policy
    }

    /// Bumped on every change to the set of entries.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn has_orphan(&self, txid: &Hash256) -> bool {
        self.orphans.contains(txid)
    }

    /// Fee rate (sat/kvB) a new transaction must reach because of earlier
    /// size-limited evictions; zero when the pool has room.
    pub fn min_fee_rate(&self) -> Amount {
        if self.rolling_min_fee <= 0.0 {
            return 0;
        }
        (self.rolling_min_fee.round() as Amount).max(self.policy.incremental_relay_fee_per_kb)
    }

    pub fn info(&self) -> MempoolInfo {
        MempoolInfo {
            size: self.entries.len(),
            bytes: self.total_bytes,
            orphans: self.orphans.len(),
            min_fee_rate: self.min_fee_rate(),
            revision: self.revision,
        }
    }

    /// Validates `tx` against the pool and `coins` and adds it. A transaction
    /// with unknown inputs is kept as an orphan and reported as
    /// `MissingInput`; orphans waiting on an accepted transaction are
    /// retried before returning.
    pub fn accept_transaction<C: CoinView + ?Sized>(
        &mut self,
        tx: Transaction,
        peer: Option<PeerId>,
        coins: &C,
        now: u64,
    ) -> Result<MempoolAcceptance, MempoolError> {
        let mut acceptance = match self.accept_one(&tx, coins, now, false) {
            Ok(acceptance) => acceptance,
            Err(err) => {
                if err.kind == MempoolErrorKind::MissingInput {
                    self.store_orphan(tx, peer, &err.missing_inputs, now);
                }
                return Err(err);
            }
        };

        let mut parents = vec![acceptance.txid];
        while let Some(parent) = parents.pop() {
            for orphan in self.orphans.take_children(&parent) {
                let txid = orphan.tx.txid();
                match self.accept_one(&orphan.tx, coins, now, false) {
                    Ok(accepted) => {
                        utxod_log::log_debug!(
                            "mempool: accepted orphan {}",
                            hash256_to_hex(&txid)
                        );
                        acceptance.orphans_accepted.push(txid);
                        acceptance.replaced.extend(accepted.replaced);
                        acceptance.evicted.extend(accepted.evicted);
                        parents.push(txid);
                    }
                    Err(err) if err.kind == MempoolErrorKind::MissingInput => {
                        self.store_orphan(orphan.tx, orphan.peer, &err.missing_inputs, now);
                    }
                    Err(error) => acceptance.orphans_rejected.push(OrphanRejection {
                        txid,
                        peer: orphan.peer,
                        error,
                    }),
                }
            }
        }
        Ok(acceptance)
    }

    fn store_orphan(
        &mut self,
        tx: Transaction,
        peer: Option<PeerId>,
        missing_inputs: &[OutPoint],
        now: u64,
    ) {
        let txid = tx.txid();
        let parents = missing_inputs.iter().map(|outpoint| outpoint.hash).collect();
        match self.orphans.insert(tx, peer, parents, now) {
            Some(evicted) => {
                utxod_log::log_debug!(
                    "mempool: stored orphan {} ({} orphans, {} dropped)",
                    hash256_to_hex(&txid),
                    self.orphans.len(),
                    evicted.len()
                );
            }
            None => {
                utxod_log::log_debug!("mempool: orphan {} not kept", hash256_to_hex(&txid));
            }
        }
    }

    fn accept_one<C: CoinView + ?Sized>(
        &mut self,
        tx: &Transaction,
        coins: &C,
        now: u64,
        bypass_limits: bool,
    ) -> Result<MempoolAcceptance, MempoolError> {
        self.decay_rolling_fee(now);
        let Admission { entry, replaced } = self.check_admission(tx, coins, now, bypass_limits)?;
        let txid = entry.txid;
        let fee = entry.fee;
        let vsize = entry.vsize;

        let replaced = self.remove_entries(&replaced);
        for old in &replaced {
            utxod_log::log_debug!(
                "mempool: {} replaced by {}",
                hash256_to_hex(&old.txid),
                hash256_to_hex(&txid)
            );
        }
        self.insert_entry(entry);
        utxod_log::log_debug!(
            "mempool: accepted {} (fee {}, vsize {}, {} entries)",
            hash256_to_hex(&txid),
            fee,
            vsize,
            self.entries.len()
        );

        let evicted = if bypass_limits {
            Vec::new()
        } else {
            self.trim_to_size(now)
        };
        if !self.entries.contains_key(&txid) {
            return Err(MempoolError::new(MempoolErrorKind::MempoolFull, "mempool full"));
        }
        Ok(MempoolAcceptance {
            txid,
            fee,
            vsize,
            replaced: replaced.iter().map(|old| old.txid).collect(),
            evicted,
            ..MempoolAcceptance::default()
        })
    }

    fn check_admission<C: CoinView + ?Sized>(
        &self,
        tx: &Transaction,
        coins: &C,
        now: u64,
        bypass_limits: bool,
    ) -> Result<Admission, MempoolError> {
        let txid = tx.txid();
        check_transaction(tx)
            .map_err(|err| MempoolError::new(MempoolErrorKind::InvalidTransaction, err.reason()))?;
        if tx.is_coinbase() {
            return Err(MempoolError::new(MempoolErrorKind::InvalidTransaction, "coinbase"));
        }
        if self.policy.require_standard {
            check_standard_tx(tx, &self.policy)
                .map_err(|reason| MempoolError::new(MempoolErrorKind::NonStandard, reason))?;
        }
        let next = coins.next_block();
        if !is_final_tx(tx, next.height, next.median_time_past) {
            return Err(MempoolError::new(MempoolErrorKind::NonStandard, "non-final"));
        }
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                "txn-already-in-mempool",
            ));
        }

        let conflicts: BTreeSet<Hash256> = tx
            .vin
            .iter()
            .filter_map(|input| self.spent.get(&input.prevout).copied())
            .collect();

        let mut spent_coins = Vec::with_capacity(tx.vin.len());
        let mut parents = BTreeSet::new();
        let mut missing = Vec::new();
        for input in &tx.vin {
            if let Some(parent) = self.entries.get(&input.prevout.hash) {
                match parent.tx.vout.get(input.prevout.index as usize) {
                    Some(output) => {
                        parents.insert(parent.txid);
                        spent_coins.push(UtxoEntry::from_output(output, next.height as u32, false));
                    }
                    None => missing.push(input.prevout),
                }
                continue;
            }
            match coins.coin(&input.prevout)? {
                Some(coin) => spent_coins.push(coin),
                None => missing.push(input.prevout),
            }
        }
        if !missing.is_empty() {
            // A confirmed transaction has spent its own inputs; only its outputs remain.
            for index in 0..tx.vout.len() as u32 {
                if coins.coin(&OutPoint::new(txid, index))?.is_some() {
                    return Err(MempoolError::new(
                        MempoolErrorKind::AlreadyInChain,
                        "txn-already-known",
                    ));
                }
            }
            return Err(MempoolError::missing_inputs(missing));
        }

        let fee = check_tx_inputs(tx, &spent_coins, next.height)
            .map_err(|err| MempoolError::new(MempoolErrorKind::InvalidTransaction, err.reason()))?;

        let coin_heights: Vec<i32> = spent_coins.iter().map(|coin| coin.height as i32).collect();
        let lock = calculate_sequence_locks(tx, next.lock_flags, &coin_heights, |height| {
            coins
                .median_time_past_at(height)
                .unwrap_or(next.median_time_past)
        });
        if !sequence_locks_satisfied(&lock, next.height, next.median_time_past) {
            return Err(MempoolError::new(
                MempoolErrorKind::NonStandard,
                "non-BIP68-final",
            ));
        }

        if self.policy.require_standard
            && spent_coins
                .iter()
                .any(|coin| !is_standard_spend(&coin.script_pubkey))
        {
            return Err(MempoolError::new(
                MempoolErrorKind::NonStandard,
                "bad-txns-nonstandard-inputs",
            ));
        }
        let sigop_cost = transaction_sigop_cost(tx, next.script_flags, |index| {
            spent_coins.get(index).map(|coin| coin.script_pubkey.as_slice())
        });
        if sigop_cost > MAX_STANDARD_TX_SIGOPS_COST {
            return Err(MempoolError::new(
                MempoolErrorKind::NonStandard,
                "bad-txns-too-many-sigops",
            ));
        }

        let vsize = tx.vsize();
        if !bypass_limits {
            let floor = self.policy.min_relay_fee(vsize);
            if fee < floor {
                return Err(MempoolError::new(
                    MempoolErrorKind::InsufficientFee,
                    format!("min relay fee not met, {fee} < {floor}"),
                ));
            }
            let rolling = fee_at_rate(self.min_fee_rate(), vsize);
            if fee < rolling {
                return Err(MempoolError::new(
                    MempoolErrorKind::InsufficientFee,
                    format!("mempool min fee not met, {fee} < {rolling}"),
                ));
            }
        }

        let replaced = if conflicts.is_empty() {
            HashSet::new()
        } else {
            self.check_replacement(&parents, &conflicts, fee, vsize)?
        };
        self.check_package_limits(&parents, vsize)?;
        self.check_scripts(tx, &spent_coins, next.script_flags)?;

        Ok(Admission {
            entry: MempoolEntry {
                txid,
                tx: tx.clone(),
                fee,
                size: tx.total_size(),
                vsize,
                time: now,
                sequence: self.next_sequence,
                height: next.height - 1,
                sigop_cost,
                parents,
                children: BTreeSet::new(),
                ancestor_count: 1,
                ancestor_vsize: vsize,
                ancestor_fees: fee,
                descendant_count: 1,
                descendant_vsize: vsize,
                descendant_fees: fee,
            },
            replaced,
        })
    }

    /// Replace-by-fee rules; returns every entry the replacement evicts.
    fn check_replacement(
        &self,
        parents: &BTreeSet<Hash256>,
        conflicts: &BTreeSet<Hash256>,
        fee: Amount,
        vsize: u64,
    ) -> Result<HashSet<Hash256>, MempoolError> {
        for txid in conflicts {
            if !self.signals_replaceable(txid) {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    format!(
                        "txn-mempool-conflict: {} is not replaceable",
                        hash256_to_hex(txid)
                    ),
                ));
            }
        }

        let mut evicted = HashSet::new();
        for txid in conflicts {
            evicted.insert(*txid);
            evicted.extend(self.descendants_of(txid));
        }
        if evicted.len() > self.policy.max_replacements {
            return Err(MempoolError::new(
                MempoolErrorKind::ReplacementRejected,
                format!(
                    "too many potential replacements, {} > {}",
                    evicted.len(),
                    self.policy.max_replacements
                ),
            ));
        }
        if parents.iter().any(|parent| evicted.contains(parent)) {
            return Err(MempoolError::new(
                MempoolErrorKind::ReplacementRejected,
                "bad-txns-spends-conflicting-tx",
            ));
        }

        let conflict_parents: HashSet<Hash256> = conflicts
            .iter()
            .filter_map(|txid| self.entries.get(txid))
            .flat_map(|entry| entry.tx.vin.iter().map(|input| input.prevout.hash))
            .collect();
        if parents.iter().any(|parent| !conflict_parents.contains(parent)) {
            return Err(MempoolError::new(
                MempoolErrorKind::ReplacementRejected,
                "replacement-adds-unconfirmed",
            ));
        }

        for txid in conflicts {
            let Some(old) = self.entries.get(txid) else {
                continue;
            };
            let new_rate = fee as i128 * old.vsize as i128;
            let old_rate = old.fee as i128 * vsize as i128;
            if new_rate <= old_rate {
                return Err(MempoolError::new(
                    MempoolErrorKind::ReplacementRejected,
                    format!(
                        "insufficient fee: rate {} does not exceed {} of {}",
                        fee_rate_per_kb(fee, vsize),
                        old.fee_rate(),
                        hash256_to_hex(txid)
                    ),
                ));
            }
        }

        let evicted_fees: Amount = evicted
            .iter()
            .filter_map(|txid| self.entries.get(txid))
            .map(|entry| entry.fee)
            .sum();
        if fee < evicted_fees {
            return Err(MempoolError::new(
                MempoolErrorKind::ReplacementRejected,
                format!("insufficient fee: {fee} < {evicted_fees} paid by replaced entries"),
            ));
        }
        let additional = fee - evicted_fees;
        let required = self.policy.incremental_relay_fee(vsize);
        if additional < required {
            return Err(MempoolError::new(
                MempoolErrorKind::ReplacementRejected,
                format!("insufficient fee: additional {additional} < {required}"),
            ));
        }
        Ok(evicted)
    }

    /// Whether the entry or any of its in-pool ancestors opts into replacement.
    pub fn signals_replaceable(&self, txid: &Hash256) -> bool {
        let signals = |txid: &Hash256| {
            self.entries
                .get(txid)
                .map_or(false, |entry| entry.tx.signals_rbf())
        };
        signals(txid) || self.ancestors_of(txid).iter().any(signals)
    }

    fn check_package_limits(
        &self,
        parents: &BTreeSet<Hash256>,
        vsize: u64,
    ) -> Result<(), MempoolError> {
        let mut ancestors = HashSet::new();
        for parent in parents {
            ancestors.insert(*parent);
            ancestors.extend(self.ancestors_of(parent));
        }
        if ancestors.len() + 1 > self.policy.ancestor_limit {
            return Err(MempoolError::new(
                MempoolErrorKind::TooLongChain,
                format!(
                    "too-long-mempool-chain, too many unconfirmed ancestors [limit: {}]",
                    self.policy.ancestor_limit
                ),
            ));
        }
        let ancestor_vsize: u64 = ancestors
            .iter()
            .filter_map(|txid| self.entries.get(txid))
            .map(|entry| entry.vsize)
            .sum::<u64>()
            + vsize;
        if ancestor_vsize > self.policy.ancestor_size_limit {
            return Err(MempoolError::new(
                MempoolErrorKind::TooLongChain,
                format!(
                    "too-long-mempool-chain, exceeds ancestor size limit [limit: {}]",
                    self.policy.ancestor_size_limit
                ),
            ));
        }
        for entry in ancestors.iter().filter_map(|txid| self.entries.get(txid)) {
            if entry.descendant_count + 1 > self.policy.descendant_limit {
                return Err(MempoolError::new(
                    MempoolErrorKind::TooLongChain,
                    format!(
                        "too-long-mempool-chain, too many descendants for {} [limit: {}]",
                        hash256_to_hex(&entry.txid),
                        self.policy.descendant_limit
                    ),
                ));
            }
            if entry.descendant_vsize + vsize > self.policy.descendant_size_limit {
                return Err(MempoolError::new(
                    MempoolErrorKind::TooLongChain,
                    format!(
                        "too-long-mempool-chain, exceeds descendant size limit for {} [limit: {}]",
                        hash256_to_hex(&entry.txid),
                        self.policy.descendant_size_limit
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_scripts(
        &self,
        tx: &Transaction,
        spent_coins: &[UtxoEntry],
        consensus_flags: ScriptFlags,
    ) -> Result<(), MempoolError> {
        let precomputed = tx.has_witness().then(|| PrecomputedTxData::new(tx));
        let policy_flags = if self.policy.require_standard {
            STANDARD_SCRIPT_VERIFY_FLAGS | consensus_flags
        } else {
            consensus_flags
        };
        for (index, coin) in spent_coins.iter().enumerate() {
            let verify = |flags| {
                verify_input(
                    tx,
                    index,
                    &coin.script_pubkey,
                    coin.value,
                    flags,
                    precomputed.as_ref(),
                )
            };
            if let Err(err) = verify(policy_flags) {
                if policy_flags != consensus_flags && verify(consensus_flags).is_ok() {
                    return Err(MempoolError::new(
                        MempoolErrorKind::NonStandard,
                        format!("non-mandatory-script-verify-flag ({})", err.code()),
                    ));
                }
                return Err(MempoolError::new(
                    MempoolErrorKind::InvalidScript,
                    format!("mandatory-script-verify-flag-failed ({})", err.code()),
                ));
            }
        }
        Ok(())
    }

    fn insert_entry(&mut self, mut entry: MempoolEntry) {
        let txid = entry.txid;
        for input in &entry.tx.vin {
            self.spent.insert(input.prevout, txid);
        }
        for parent in &entry.parents {
            if let Some(parent) = self.entries.get_mut(parent) {
                parent.children.insert(txid);
            }
        }
        // Entries already spending our outputs, after a reorg put us back.
        for index in 0..entry.tx.vout.len() {
            let outpoint = OutPoint::new(txid, index as u32);
            if let Some(child) = self.spent.get(&outpoint).copied() {
                entry.children.insert(child);
                if let Some(child) = self.entries.get_mut(&child) {
                    child.parents.insert(txid);
                }
            }
        }
        self.total_bytes += entry.size;
        self.next_sequence += 1;
        self.entries.insert(txid, entry);

        let mut affected = self.ancestors_of(&txid);
        affected.extend(self.descendants_of(&txid));
        affected.insert(txid);
        self.refresh_aggregates(affected);
        self.revision += 1;
    }

    /// Removes exactly `txids`, leaving any descendants outside the set in place.
    fn remove_entries(&mut self, txids: &HashSet<Hash256>) -> Vec<MempoolEntry> {
        let mut affected = HashSet::new();
        for txid in txids {
            affected.extend(self.ancestors_of(txid));
            affected.extend(self.descendants_of(txid));
        }

        let mut removed = Vec::with_capacity(txids.len());
        for txid in txids {
            let Some(entry) = self.entries.remove(txid) else {
                continue;
            };
            for input in &entry.tx.vin {
                if self.spent.get(&input.prevout) == Some(txid) {
                    self.spent.remove(&input.prevout);
                }
            }
            for parent in &entry.parents {
                if let Some(parent) = self.entries.get_mut(parent) {
                    parent.children.remove(txid);
                }
            }
            for child in &entry.children {
                if let Some(child) = self.entries.get_mut(child) {
                    child.parents.remove(txid);
                }
            }
            self.total_bytes = self.total_bytes.saturating_sub(entry.size);
            removed.push(entry);
        }

        affected.retain(|txid| !txids.contains(txid));
        self.refresh_aggregates(affected);
        if !removed.is_empty() {
            self.revision += 1;
        }
        removed.sort_by_key(|entry| entry.sequence);
        removed
    }

    /// Removes `txid` and everything in the pool that spends from it.
    pub fn remove_with_descendants(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        if !self.entries.contains_key(txid) {
            return Vec::new();
        }
        let mut doomed = self.descendants_of(txid);
        doomed.insert(*txid);
        self.remove_entries(&doomed)
    }

    fn ancestors_of(&self, txid: &Hash256) -> HashSet<Hash256> {
        self.walk(txid, |entry| &entry.parents)
    }

    fn descendants_of(&self, txid: &Hash256) -> HashSet<Hash256> {
        self.walk(txid, |entry| &entry.children)
    }

    fn walk<F>(&self, start: &Hash256, next: F) -> HashSet<Hash256>
    where
        F: Fn(&MempoolEntry) -> &BTreeSet<Hash256>,
    {
        let mut seen = HashSet::new();
        let mut stack: Vec<Hash256> = self
            .entries
            .get(start)
            .map(|entry| next(entry).iter().copied().collect())
            .unwrap_or_default();
        while let Some(txid) = stack.pop() {
            if !seen.insert(txid) {
                continue;
            }
            if let Some(entry) = self.entries.get(&txid) {
                stack.extend(next(entry).iter().copied());
            }
        }
        seen
    }

    fn refresh_aggregates(&mut self, txids: impl IntoIterator<Item = Hash256>) {
        for txid in txids {
            if !self.entries.contains_key(&txid) {
                continue;
            }
            let ancestors = self.package_totals(&self.ancestors_of(&txid));
            let descendants = self.package_totals(&self.descendants_of(&txid));
            if let Some(entry) = self.entries.get_mut(&txid) {
                entry.ancestor_count = ancestors.0 + 1;
                entry.ancestor_vsize = ancestors.1 + entry.vsize;
                entry.ancestor_fees = ancestors.2 + entry.fee;
                entry.descendant_count = descendants.0 + 1;
                entry.descendant_vsize = descendants.1 + entry.vsize;
                entry.descendant_fees = descendants.2 + entry.fee;
            }
        }
    }

    fn package_totals(&self, txids: &HashSet<Hash256>) -> (usize, u64, Amount) {
        txids
            .iter()
            .filter_map(|txid| self.entries.get(txid))
            .fold((0, 0, 0), |(count, vsize, fees), entry| {
                (count + 1, vsize + entry.vsize, fees + entry.fee)
            })
    }

    fn over_budget(&self) -> bool {
        self.total_bytes > self.policy.max_bytes
            || self
                .policy
                .max_entries
                .map_or(false, |max| self.entries.len() > max)
    }

    /// Evicts the lowest ancestor fee rate packages until the pool fits its
    /// budget, raising the rolling minimum fee past each evicted package.
    pub fn trim_to_size(&mut self, now: u64) -> Vec<Hash256> {
        let mut evicted = Vec::new();
        while self.over_budget() {
            let Some(worst) = self.entries.values().min_by(|a, b| eviction_order(a, b)) else {
                break;
            };
            let txid = worst.txid;
            let rate = worst.ancestor_fee_rate() + self.policy.incremental_relay_fee_per_kb;
            let removed = self.remove_with_descendants(&txid);
            utxod_log::log_debug!(
                "mempool: evicted {} with {} descendants at {} sat/kvB",
                hash256_to_hex(&txid),
                removed.len().saturating_sub(1),
                rate - self.policy.incremental_relay_fee_per_kb
            );
            self.bump_rolling_fee(rate, now);
            evicted.extend(removed.into_iter().map(|entry| entry.txid));
        }
        evicted
    }

    fn bump_rolling_fee(&mut self, rate: Amount, now: u64) {
        let rate = rate as f64;
        if rate > self.rolling_min_fee {
            self.rolling_min_fee = rate;
            self.block_since_last_bump = false;
            self.last_rolling_update = now;
        }
    }

    /// Halves the rolling minimum fee every half-life once a block has been
    /// connected since the last bump; faster while the pool is mostly empty.
    fn decay_rolling_fee(&mut self, now: u64) {
        if !self.block_since_last_bump || self.rolling_min_fee <= 0.0 {
            return;
        }
        if now <= self.last_rolling_update.saturating_add(10) {
            return;
        }
        let mut halflife = ROLLING_FEE_HALFLIFE_SECS;
        if self.total_bytes < self.policy.max_bytes / 4 {
            halflife /= 4.0;
        } else if self.total_bytes < self.policy.max_bytes / 2 {
            halflife /= 2.0;
        }
        let elapsed = (now - self.last_rolling_update) as f64;
        self.rolling_min_fee /= 2f64.powf(elapsed / halflife);
        self.last_rolling_update = now;
        if self.rolling_min_fee < self.policy.incremental_relay_fee_per_kb as f64 / 2.0 {
            self.rolling_min_fee = 0.0;
        }
    }

    /// Drops entries confirmed by a newly connected block and entries that
    /// now conflict with it.
    pub fn remove_for_block(&mut self, transactions: &[Transaction]) -> BlockRemoval {
        let confirmed: HashSet<Hash256> = transactions
            .iter()
            .map(|tx| tx.txid())
            .filter(|txid| self.entries.contains_key(txid))
            .collect();
        let confirmed = self.remove_entries(&confirmed).len();

        let mut conflicts = Vec::new();
        for tx in transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.vin {
                if let Some(spender) = self.spent.get(&input.prevout).copied() {
                    let removed = self.remove_with_descendants(&spender);
                    conflicts.extend(removed.into_iter().map(|entry| entry.txid));
                }
            }
        }
        for txid in &conflicts {
            utxod_log::log_debug!(
                "mempool: removed {} conflicting with a connected block",
                hash256_to_hex(txid)
            );
        }
        self.orphans.remove_for_block(transactions);
        self.block_since_last_bump = true;
        self.revision += 1;
        BlockRemoval {
            confirmed,
            conflicts,
        }
    }

    /// Re-adds transactions from disconnected blocks, oldest first, then drops
    /// entries the new tip no longer admits.
    pub fn update_for_reorg<C: CoinView + ?Sized>(
        &mut self,
        disconnected: Vec<Transaction>,
        coins: &C,
        now: u64,
    ) -> ReorgUpdate {
        let mut update = ReorgUpdate::default();
        for tx in disconnected.into_iter().filter(|tx| !tx.is_coinbase()) {
            match self.accept_one(&tx, coins, now, true) {
                Ok(_) => update.reinserted += 1,
                Err(err) => utxod_log::log_debug!(
                    "mempool: not reinserting {}: {}",
                    hash256_to_hex(&tx.txid()),
                    err
                ),
            }
        }

        let next = coins.next_block();
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| !self.valid_on_tip(entry, coins, &next))
            .map(|entry| entry.txid)
            .collect();
        for txid in stale {
            let removed = self.remove_with_descendants(&txid);
            update
                .dropped
                .extend(removed.into_iter().map(|entry| entry.txid));
        }
        update.evicted = self.trim_to_size(now);
        update
    }

    fn valid_on_tip<C: CoinView + ?Sized>(
        &self,
        entry: &MempoolEntry,
        coins: &C,
        next: &NextBlockContext,
    ) -> bool {
        if !is_final_tx(&entry.tx, next.height, next.median_time_past) {
            return false;
        }
        let mut coin_heights = Vec::with_capacity(entry.tx.vin.len());
        for input in &entry.tx.vin {
            if let Some(parent) = self.entries.get(&input.prevout.hash) {
                if parent.tx.vout.len() <= input.prevout.index as usize {
                    return false;
                }
                coin_heights.push(next.height);
                continue;
            }
            match coins.coin(&input.prevout) {
                Ok(Some(coin)) => {
                    if coin.is_coinbase && next.height - (coin.height as i32) < COINBASE_MATURITY {
                        return false;
                    }
                    coin_heights.push(coin.height as i32);
                }
                _ => return false,
            }
        }
        let lock = calculate_sequence_locks(&entry.tx, next.lock_flags, &coin_heights, |height| {
            coins
                .median_time_past_at(height)
                .unwrap_or(next.median_time_past)
        });
        sequence_locks_satisfied(&lock, next.height, next.median_time_past)
    }

    /// Drops expired orphans.
    pub fn expire_orphans(&mut self, now: u64) -> usize {
        self.orphans.expire(now).len()
    }
}

/// `Less` means evict first: lowest ancestor fee rate, then newest, then txid.
fn eviction_order(a: &MempoolEntry, b: &MempoolEntry) -> Ordering {
    let left = a.ancestor_fees as i128 * b.ancestor_vsize as i128;
    let right = b.ancestor_fees as i128 * a.ancestor_vsize as i128;
    left.cmp(&right)
        .then_with(|| b.sequence.cmp(&a.sequence))
        .then_with(|| a.txid.cmp(&b.txid))
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_consensus::constants::{LOCKTIME_VERIFY_SEQUENCE, MAX_BIP125_RBF_SEQUENCE, SEQUENCE_FINAL};
    use utxod_consensus::money::COIN;
    use utxod_consensus::{consensus_params, Network};
    use utxod_primitives::transaction::{TxIn, TxOut};
    use utxod_script::script_flags_for_height;

    const NOW: u64 = 1_700_000_000;
    const TIP_HEIGHT: i32 = 200;

    struct TestCoins {
        coins: HashMap<OutPoint, UtxoEntry>,
    }

    impl TestCoins {
        fn with_funding(count: u8) -> (Self, Vec<OutPoint>) {
            let mut coins = HashMap::new();
            let mut outpoints = Vec::new();
            for tag in 0..count {
                let outpoint = OutPoint::new([tag + 1; 32], 0);
                coins.insert(
                    outpoint,
                    UtxoEntry {
                        value: COIN,
                        script_pubkey: vec![0x51],
                        height: 10,
                        is_coinbase: false,
                    },
                );
                outpoints.push(outpoint);
            }
            (Self { coins }, outpoints)
        }
    }

    impl CoinView for TestCoins {
        fn coin(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, MempoolError> {
            Ok(self.coins.get(outpoint).cloned())
        }

        fn next_block(&self) -> NextBlockContext {
            NextBlockContext {
                height: TIP_HEIGHT + 1,
                median_time_past: NOW as i64 - 600,
                script_flags: script_flags_for_height(
                    TIP_HEIGHT + 1,
                    &consensus_params(Network::Regtest),
                ),
                lock_flags: LOCKTIME_VERIFY_SEQUENCE,
            }
        }

        fn median_time_past_at(&self, _height: i32) -> Option<i64> {
            Some(NOW as i64 - 600)
        }
    }

    fn relaxed_policy() -> MempoolPolicy {
        MempoolPolicy {
            require_standard: false,
            ..MempoolPolicy::default()
        }
    }

    /// Spends `inputs` (each worth `input_value`) into one output, paying `fee`.
    fn spend(inputs: &[OutPoint], input_value: Amount, fee: Amount, sequence: u32) -> Transaction {
        Transaction {
            version: 2,
            vin: inputs
                .iter()
                .map(|prevout| TxIn::new(*prevout, Vec::new(), sequence))
                .collect(),
            vout: vec![TxOut {
                value: input_value * inputs.len() as Amount - fee,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn out(tx: &Transaction) -> OutPoint {
        OutPoint::new(tx.txid(), 0)
    }

    #[test]
    fn replacement_with_lower_fee_rate_is_rejected() {
        let (coins, funding) = TestCoins::with_funding(1);
        let mut pool = Mempool::new(relaxed_policy());
        let original = spend(&funding, COIN, 10_000, MAX_BIP125_RBF_SEQUENCE);
        pool.accept_transaction(original.clone(), None, &coins, NOW)
            .expect("original");

        let cheaper = spend(&funding, COIN, 5_000, MAX_BIP125_RBF_SEQUENCE);
        let err = pool
            .accept_transaction(cheaper, None, &coins, NOW)
            .expect_err("lower fee rate");
        assert_eq!(err.kind, MempoolErrorKind::ReplacementRejected);
        assert_eq!(err.class(), FailureClass::Conflicting);
        assert!(pool.contains(&original.txid()));
        assert_eq!(pool.spender(&funding[0]), Some(original.txid()));
    }

    #[test]
    fn replacement_paying_for_evicted_package_wins() {
        let (coins, funding) = TestCoins::with_funding(1);
        let mut pool = Mempool::new(relaxed_policy());
        let original = spend(&funding, COIN, 10_000, MAX_BIP125_RBF_SEQUENCE);
        pool.accept_transaction(original.clone(), None, &coins, NOW)
            .expect("original");
        let child = spend(&[out(&original)], COIN - 10_000, 2_000, SEQUENCE_FINAL);
        pool.accept_transaction(child.clone(), None, &coins, NOW)
            .expect("child");

        // Higher rate than the original, but does not cover the child's fee.
        let short = spend(&funding, COIN, 11_000, SEQUENCE_FINAL);
        let err = pool
            .accept_transaction(short, None, &coins, NOW)
            .expect_err("does not pay for the package");
        assert_eq!(err.kind, MempoolErrorKind::ReplacementRejected);
        assert!(err.message.starts_with("insufficient fee"));

        let probe = spend(&funding, COIN, 0, SEQUENCE_FINAL);
        let required = 12_000 + pool.policy().incremental_relay_fee(probe.vsize());
        let almost = spend(&funding, COIN, required - 1, SEQUENCE_FINAL);
        let err = pool
            .accept_transaction(almost, None, &coins, NOW)
            .expect_err("additional fee below incremental relay fee");
        assert!(err.message.starts_with("insufficient fee: additional"));

        let replacement = spend(&funding, COIN, required, SEQUENCE_FINAL);
        let revision = pool.revision();
        let accepted = pool
            .accept_transaction(replacement.clone(), None, &coins, NOW)
            .expect("replacement");
        let mut replaced = accepted.replaced.clone();
        replaced.sort();
        let mut expected = vec![original.txid(), child.txid()];
        expected.sort();
        assert_eq!(replaced, expected);
        assert!(!pool.contains(&original.txid()));
        assert!(!pool.contains(&child.txid()));
        assert_eq!(pool.spender(&funding[0]), Some(replacement.txid()));
        assert_eq!(pool.len(), 1);
        assert!(pool.revision() > revision);
    }

    #[test]
    fn non_signaling_conflict_is_not_replaced() {
        let (coins, funding) = TestCoins::with_funding(1);
        let mut pool = Mempool::new(relaxed_policy());
        let original = spend(&funding, COIN, 1_000, SEQUENCE_FINAL);
        pool.accept_transaction(original.clone(), None, &coins, NOW)
            .expect("original");

        let rival = spend(&funding, COIN, 50_000, SEQUENCE_FINAL);
        let err = pool
            .accept_transaction(rival, None, &coins, NOW)
            .expect_err("original does not signal");
        assert_eq!(err.kind, MempoolErrorKind::ConflictingInput);
        assert!(pool.contains(&original.txid()));
    }

    #[test]
    fn replaceability_is_inherited_from_ancestors() {
        let (coins, funding) = TestCoins::with_funding(1);
        let mut pool = Mempool::new(relaxed_policy());
        let parent = spend(&funding, COIN, 1_000, MAX_BIP125_RBF_SEQUENCE);
        pool.accept_transaction(parent.clone(), None, &coins, NOW)
            .expect("parent");
        let child = spend(&[out(&parent)], COIN - 1_000, 1_000, SEQUENCE_FINAL);
        pool.accept_transaction(child.clone(), None, &coins, NOW)
            .expect("child");

        let rival = spend(&[out(&parent)], COIN - 1_000, 5_000, SEQUENCE_FINAL);
        let accepted = pool
            .accept_transaction(rival.clone(), None, &coins, NOW)
            .expect("child inherits replaceability");
        assert_eq!(accepted.replaced, vec![child.txid()]);
        assert!(pool.contains(&parent.txid()));
        assert_eq!(pool.get(&parent.txid()).expect("parent").children.len(), 1);
    }

    #[test]
    fn replacement_may_not_add_unconfirmed_inputs() {
        let (coins, funding) = TestCoins::with_funding(2);
        let mut pool = Mempool::new(relaxed_policy());
        let original = spend(&funding[..1], COIN, 1_000, MAX_BIP125_RBF_SEQUENCE);
        pool.accept_transaction(original, None, &coins, NOW)
            .expect("original");
        let unrelated = spend(&funding[1..], COIN, 1_000, SEQUENCE_FINAL);
        pool.accept_transaction(unrelated.clone(), None, &coins, NOW)
            .expect("unrelated");

        let rival = Transaction {
            version: 2,
            vin: vec![
                TxIn::new(funding[0], Vec::new(), SEQUENCE_FINAL),
                TxIn::new(out(&unrelated), Vec::new(), SEQUENCE_FINAL),
            ],
            vout: vec![TxOut {
                value: COIN,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let err = pool
            .accept_transaction(rival, None, &coins, NOW)
            .expect_err("new unconfirmed input");
        assert_eq!(err.message, "replacement-adds-unconfirmed");
    }

    #[test]
    fn fee_below_relay_floor_is_rejected() {
        let (coins, funding) = TestCoins::with_funding(1);
        let mut pool = Mempool::new(relaxed_policy());
        let tx = spend(&funding, COIN, 10, SEQUENCE_FINAL);
        let err = pool
            .accept_transaction(tx, None, &coins, NOW)
            .expect_err("below floor");
        assert_eq!(err.kind, MempoolErrorKind::InsufficientFee);
        assert_eq!(err.class(), FailureClass::ResourceExhausted);
        assert!(pool.is_empty());
    }

    #[test]
    fn low_fee_rate_package_is_evicted_first() {
        let (coins, funding) = TestCoins::with_funding(4);
        let mut policy = relaxed_policy();
        policy.max_bytes = 200;
        let mut pool = Mempool::new(policy);

        let rich = spend(&funding[0..1], COIN, 0, SEQUENCE_FINAL);
        let vsize = rich.vsize() as Amount;
        let rich = spend(&funding[0..1], COIN, 10 * vsize, SEQUENCE_FINAL);
        let poor = spend(&funding[1..2], COIN, vsize, SEQUENCE_FINAL);
        let poor_child = spend(&[out(&poor)], COIN - vsize, 2 * vsize, SEQUENCE_FINAL);
        for tx in [&rich, &poor, &poor_child] {
            pool.accept_transaction(tx.clone(), None, &coins, NOW)
                .expect("fits");
        }
        assert_eq!(pool.len(), 3);

        let newcomer = spend(&funding[2..3], COIN, 10 * vsize, SEQUENCE_FINAL);
        let accepted = pool
            .accept_transaction(newcomer.clone(), None, &coins, NOW)
            .expect("newcomer");
        let mut evicted = accepted.evicted.clone();
        evicted.sort();
        let mut expected = vec![poor.txid(), poor_child.txid()];
        expected.sort();
        assert_eq!(evicted, expected);
        assert!(pool.contains(&rich.txid()));
        assert!(pool.contains(&newcomer.txid()));
        assert!(pool.bytes() <= 200);

        // The floor rises past the evicted package.
        assert_eq!(pool.min_fee_rate(), 2_000);
        let cheap = spend(&funding[3..4], COIN, vsize * 3 / 2, SEQUENCE_FINAL);
        let err = pool
            .accept_transaction(cheap, None, &coins, NOW)
            .expect_err("below rolling minimum");
        assert!(err.message.starts_with("mempool min fee not met"));
    }

    #[test]
    fn rolling_fee_decays_after_blocks() {
        let (coins, funding) = TestCoins::with_funding(3);
        let mut policy = relaxed_policy();
        policy.max_bytes = 100;
        let mut pool = Mempool::new(policy);
        let first = spend(&funding[0..1], COIN, 1_000, SEQUENCE_FINAL);
        let second = spend(&funding[1..2], COIN, 5_000, SEQUENCE_FINAL);
        pool.accept_transaction(first, None, &coins, NOW).expect("first");
        pool.accept_transaction(second, None, &coins, NOW).expect("second");
        let raised = pool.min_fee_rate();
        assert!(raised > 1_000);

        // No decay until a block has been connected.
        pool.decay_rolling_fee(NOW + 86_400);
        assert_eq!(pool.min_fee_rate(), raised);

        pool.remove_for_block(&[]);
        pool.decay_rolling_fee(NOW + 3 * 60 * 60);
        assert!(pool.min_fee_rate() < raised);
        pool.decay_rolling_fee(NOW + 10 * 86_400);
        assert_eq!(pool.min_fee_rate(), 0);
    }

    #[test]
    fn aggregates_track_the_chain_of_spends() {
        let (coins, funding) = TestCoins::with_funding(1);
        let mut pool = Mempool::new(relaxed_policy());
        let parent = spend(&funding, COIN, 1_000, SEQUENCE_FINAL);
        let child = spend(&[out(&parent)], COIN - 1_000, 2_000, SEQUENCE_FINAL);
        let grandchild = spend(&[out(&child)], COIN - 3_000, 3_000, SEQUENCE_FINAL);
        for tx in [&parent, &child, &grandchild] {
            pool.accept_transaction(tx.clone(), None, &coins, NOW)
                .expect("chain");
        }

        let top = pool.get(&parent.txid()).expect("parent");
        assert_eq!(top.descendant_count, 3);
        assert_eq!(top.descendant_fees, 6_000);
        assert_eq!(top.ancestor_count, 1);
        let bottom = pool.get(&grandchild.txid()).expect("grandchild");
        assert_eq!(bottom.ancestor_count, 3);
        assert_eq!(bottom.ancestor_fees, 6_000);
        assert_eq!(
            bottom.ancestor_vsize,
            parent.vsize() + child.vsize() + grandchild.vsize()
        );

        // Confirming the parent detaches it from the rest of the chain.
        let removal = pool.remove_for_block(&[parent.clone()]);
        assert_eq!(removal.confirmed, 1);
        assert!(removal.conflicts.is_empty());
        let middle = pool.get(&child.txid()).expect("child");
        assert!(middle.parents.is_empty());
        assert_eq!(middle.ancestor_count, 1);
        assert_eq!(middle.descendant_count, 2);
        assert_eq!(pool.get(&grandchild.txid()).expect("grandchild").ancestor_fees, 5_000);
    }

    #[test]
    fn block_conflict_removes_descendants() {
        let (coins, funding) = TestCoins::with_funding(1);
        let mut pool = Mempool::new(relaxed_policy());
        let pending = spend(&funding, COIN, 1_000, SEQUENCE_FINAL);
        let child = spend(&[out(&pending)], COIN - 1_000, 1_000, SEQUENCE_FINAL);
        pool.accept_transaction(pending.clone(), None, &coins, NOW)
            .expect("pending");
        pool.accept_transaction(child.clone(), None, &coins, NOW)
            .expect("child");

        let mined_rival = spend(&funding, COIN, 7_000, SEQUENCE_FINAL);
        let removal = pool.remove_for_block(&[mined_rival]);
        assert_eq!(removal.confirmed, 0);
        assert_eq!(removal.conflicts.len(), 2);
        assert!(pool.is_empty());
        assert_eq!(pool.bytes(), 0);
        assert_eq!(pool.spender(&funding[0]), None);
    }

    #[test]
    fn orphan_is_accepted_once_its_parent_arrives() {
        let (coins, funding) = TestCoins::with_funding(1);
        let mut pool = Mempool::new(relaxed_policy());
        let parent = spend(&funding, COIN, 1_000, SEQUENCE_FINAL);
        let child = spend(&[out(&parent)], COIN - 1_000, 1_000, SEQUENCE_FINAL);

        let err = pool
            .accept_transaction(child.clone(), Some(7), &coins, NOW)
            .expect_err("parent unknown");
        assert_eq!(err.kind, MempoolErrorKind::MissingInput);
        assert_eq!(err.class(), FailureClass::Transient);
        assert_eq!(err.missing_inputs, vec![out(&parent)]);
        assert!(pool.has_orphan(&child.txid()));

        let accepted = pool
            .accept_transaction(parent.clone(), None, &coins, NOW)
            .expect("parent");
        assert_eq!(accepted.orphans_accepted, vec![child.txid()]);
        assert!(pool.contains(&child.txid()));
        assert_eq!(pool.orphan_count(), 0);
    }

    #[test]
    fn confirmed_transaction_is_not_kept_as_orphan() {
        let (mut coins, funding) = TestCoins::with_funding(1);
        let mut pool = Mempool::new(relaxed_policy());
        let tx = spend(&funding, COIN, 1_000, SEQUENCE_FINAL);

        coins.coins.remove(&funding[0]);
        coins.coins.insert(
            out(&tx),
            UtxoEntry {
                value: COIN - 1_000,
                script_pubkey: vec![0x51],
                height: 150,
                is_coinbase: false,
            },
        );

        let err = pool
            .accept_transaction(tx.clone(), Some(3), &coins, NOW)
            .expect_err("already confirmed");
        assert_eq!(err.kind, MempoolErrorKind::AlreadyInChain);
        assert_eq!(err.message, "txn-already-known");
        assert_eq!(err.class(), FailureClass::Conflicting);
        assert!(err.missing_inputs.is_empty());
        assert!(!pool.has_orphan(&tx.txid()));
        assert_eq!(pool.orphan_count(), 0);
        assert!(!pool.contains(&tx.txid()));
    }

    #[test]
    fn ancestor_limit_caps_chain_length() {
        let (coins, funding) = TestCoins::with_funding(1);
        let mut policy = relaxed_policy();
        policy.ancestor_limit = 3;
        let mut pool = Mempool::new(policy);
        let mut prevout = funding[0];
        let mut value = COIN;
        for _ in 0..3 {
            let tx = spend(&[prevout], value, 1_000, SEQUENCE_FINAL);
            pool.accept_transaction(tx.clone(), None, &coins, NOW)
                .expect("within limit");
            prevout = out(&tx);
            value -= 1_000;
        }
        let err = pool
            .accept_transaction(spend(&[prevout], value, 1_000, SEQUENCE_FINAL), None, &coins, NOW)
            .expect_err("fourth in chain");
        assert_eq!(err.kind, MempoolErrorKind::TooLongChain);
    }

    #[test]
    fn reorg_reinserts_and_relinks_transactions() {
        let (mut coins, funding) = TestCoins::with_funding(2);
        let mut pool = Mempool::new(relaxed_policy());

        // `confirmed` sits in a block; `pending` spends its output from the pool.
        let confirmed = spend(&funding[0..1], COIN, 1_000, SEQUENCE_FINAL);
        coins.coins.remove(&funding[0]);
        coins.coins.insert(
            out(&confirmed),
            UtxoEntry::from_output(&confirmed.vout[0], TIP_HEIGHT as u32, false),
        );
        let pending = spend(&[out(&confirmed)], COIN - 1_000, 1_000, SEQUENCE_FINAL);
        pool.accept_transaction(pending.clone(), None, &coins, NOW)
            .expect("pending");

        // A pool entry spending a coin the reorg takes away.
        let doomed = spend(&funding[1..2], COIN, 1_000, SEQUENCE_FINAL);
        pool.accept_transaction(doomed.clone(), None, &coins, NOW)
            .expect("doomed");

        coins.coins.remove(&out(&confirmed));
        coins.coins.remove(&funding[1]);
        coins.coins.insert(
            funding[0],
            UtxoEntry {
                value: COIN,
                script_pubkey: vec![0x51],
                height: 10,
                is_coinbase: false,
            },
        );

        let update = pool.update_for_reorg(vec![confirmed.clone()], &coins, NOW);
        assert_eq!(update.reinserted, 1);
        assert_eq!(update.dropped, vec![doomed.txid()]);
        let restored = pool.get(&confirmed.txid()).expect("reinserted");
        assert_eq!(restored.descendant_count, 2);
        assert!(restored.children.contains(&pending.txid()));
        let pending_entry = pool.get(&pending.txid()).expect("pending kept");
        assert_eq!(pending_entry.ancestor_count, 2);
    }
}
