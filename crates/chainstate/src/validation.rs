//! Block/transaction validation pipeline.

use std::collections::HashSet;

use rayon::prelude::*;
use utxod_consensus::constants::{
    COINBASE_MATURITY, LOCKTIME_THRESHOLD, LOCKTIME_VERIFY_SEQUENCE, MAX_BLOCK_SIGOPS_COST,
    MAX_BLOCK_WEIGHT, MAX_FUTURE_BLOCK_TIME, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG,
    SEQUENCE_LOCKTIME_GRANULARITY, SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
    WITNESS_SCALE_FACTOR,
};
use utxod_consensus::deployments::min_block_version;
use utxod_consensus::money::{money_range, Amount, MAX_MONEY};
use utxod_consensus::{
    deployment_active, hash256_from_hex, ConsensusParams, Deployment, Hash256, Network,
};
use utxod_log::log_warn;
use utxod_pow::difficulty::DifficultyError;
use utxod_pow::{validate_pow_header, PowError};
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::hash::sha256d;
use utxod_primitives::merkle::witness_merkle_root;
use utxod_primitives::transaction::Transaction;
use utxod_primitives::{hash256_to_hex, OutPoint};
use utxod_script::opcode::push_int;
use utxod_script::sigops::legacy_sigop_count;
use utxod_script::{verify_input, PrecomputedTxData, ScriptError, ScriptFlags};

use crate::utxo::UtxoEntry;

/// Coinbase output prefix carrying the BIP141 witness commitment.
pub const WITNESS_COMMITMENT_HEADER: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

/// Two early mainnet blocks repeat an older coinbase txid and may overwrite its outputs.
const BIP30_EXCEPTIONS: [(i32, &str); 2] = [
    (
        91_842,
        "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
    ),
    (
        91_880,
        "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
    ),
];

/// How a failure should be treated by whoever supplied the data.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FailureClass {
    Malformed,
    ConsensusInvalid,
    Conflicting,
    ResourceExhausted,
    StorageFatal,
    Transient,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Malformed => "malformed",
            FailureClass::ConsensusInvalid => "consensus-invalid",
            FailureClass::Conflicting => "conflicting",
            FailureClass::ResourceExhausted => "resource-exhausted",
            FailureClass::StorageFatal => "storage-fatal",
            FailureClass::Transient => "transient",
        }
    }

    /// Whether the peer that sent the data is to blame.
    pub fn is_peer_fault(self) -> bool {
        matches!(self, FailureClass::Malformed | FailureClass::ConsensusInvalid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidHeader(&'static str),
    InvalidBlock(&'static str),
    InvalidTransaction(&'static str),
    /// The block's contents do not match its header commitments; the
    /// header itself may still be valid.
    Mutated(&'static str),
    TimeTooNew,
    MissingInputs(OutPoint),
    Script {
        txid: Hash256,
        input: usize,
        error: ScriptError,
    },
    Pow(PowError),
    Difficulty(DifficultyError),
}

impl ValidationError {
    /// Stable reject reason reported to peers and RPC callers.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::InvalidHeader(reason)
            | ValidationError::InvalidBlock(reason)
            | ValidationError::InvalidTransaction(reason)
            | ValidationError::Mutated(reason) => reason,
            ValidationError::TimeTooNew => "time-too-new",
            ValidationError::MissingInputs(_) => "bad-txns-inputs-missingorspent",
            ValidationError::Script { .. } => "mandatory-script-verify-flag-failed",
            ValidationError::Pow(PowError::HashMismatch) => "high-hash",
            ValidationError::Pow(_) => "bad-diffbits",
            ValidationError::Difficulty(_) => "bad-diffbits",
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ValidationError::Mutated(_) => FailureClass::Malformed,
            ValidationError::TimeTooNew => FailureClass::Transient,
            _ => FailureClass::ConsensusInvalid,
        }
    }

    /// Whether the block carrying this failure can never become valid.
    pub fn marks_block_invalid(&self) -> bool {
        !matches!(
            self,
            ValidationError::Mutated(_) | ValidationError::TimeTooNew
        )
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingInputs(outpoint) => write!(
                f,
                "{}: {}:{}",
                self.reason(),
                hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            ValidationError::Script { txid, input, error } => write!(
                f,
                "{} ({}) tx {} input {input}",
                self.reason(),
                error.code(),
                hash256_to_hex(txid)
            ),
            ValidationError::Pow(err) => write!(f, "{}: {err}", self.reason()),
            ValidationError::Difficulty(err) => write!(f, "{}: {err}", self.reason()),
            _ => write!(f, "{}", self.reason()),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<PowError> for ValidationError {
    fn from(err: PowError) -> Self {
        ValidationError::Pow(err)
    }
}

impl From<DifficultyError> for ValidationError {
    fn from(err: DifficultyError) -> Self {
        ValidationError::Difficulty(err)
    }
}

/// Checks that need nothing but the transaction itself.
pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::InvalidTransaction("bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::InvalidTransaction("bad-txns-vout-empty"));
    }
    if tx.base_size() as u64 * WITNESS_SCALE_FACTOR as u64 > MAX_BLOCK_WEIGHT as u64 {
        return Err(ValidationError::InvalidTransaction("bad-txns-oversize"));
    }

    let mut value_out: Amount = 0;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationError::InvalidTransaction("bad-txns-vout-negative"));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationError::InvalidTransaction("bad-txns-vout-toolarge"));
        }
        value_out += output.value;
        if !money_range(value_out) {
            return Err(ValidationError::InvalidTransaction(
                "bad-txns-txouttotal-toolarge",
            ));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(ValidationError::InvalidTransaction(
                "bad-txns-inputs-duplicate",
            ));
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(ValidationError::InvalidTransaction("bad-cb-length"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationError::InvalidTransaction("bad-txns-prevout-null"));
    }
    Ok(())
}

pub fn check_block_header(
    header: &BlockHeader,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    validate_pow_header(header, params)?;
    Ok(())
}

/// Checks that need nothing but the block itself.
pub fn check_block(block: &Block, params: &ConsensusParams) -> Result<(), ValidationError> {
    check_block_header(&block.header, params)?;

    let (merkle_root, mutated) = block.compute_merkle_root();
    if merkle_root != block.header.merkle_root {
        return Err(ValidationError::Mutated("bad-txnmrklroot"));
    }
    if mutated {
        return Err(ValidationError::Mutated("bad-txns-duplicate"));
    }

    let max_weight = MAX_BLOCK_WEIGHT as u64;
    let scale = WITNESS_SCALE_FACTOR as u64;
    if block.transactions.is_empty()
        || block.transactions.len() as u64 * scale > max_weight
        || block.base_size() as u64 * scale > max_weight
    {
        return Err(ValidationError::InvalidBlock("bad-blk-length"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::InvalidBlock("bad-cb-missing"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::InvalidBlock("bad-cb-multiple"));
    }

    let mut sigops = 0u64;
    for tx in &block.transactions {
        check_transaction(tx)?;
        sigops += legacy_sigop_count(tx) as u64;
    }
    if sigops * scale > MAX_BLOCK_SIGOPS_COST as u64 {
        return Err(ValidationError::InvalidBlock("bad-blk-sigops"));
    }
    Ok(())
}

/// What a header is checked against: facts about its parent chain.
#[derive(Clone, Copy, Debug)]
pub struct HeaderContext {
    pub height: i32,
    pub expected_bits: u32,
    pub median_time_past: i64,
}

pub fn contextual_check_header(
    header: &BlockHeader,
    context: &HeaderContext,
    params: &ConsensusParams,
    now: i64,
) -> Result<(), ValidationError> {
    if header.bits != context.expected_bits {
        return Err(ValidationError::InvalidHeader("bad-diffbits"));
    }
    if let Some(checkpoint) = params.checkpoint_at(context.height) {
        if checkpoint.hash != header.hash() {
            return Err(ValidationError::InvalidHeader("checkpoint-mismatch"));
        }
    }
    if header.time as i64 <= context.median_time_past {
        return Err(ValidationError::InvalidHeader("time-too-old"));
    }
    if header.time as i64 > now + MAX_FUTURE_BLOCK_TIME {
        return Err(ValidationError::TimeTooNew);
    }
    if header.version < min_block_version(context.height, &params.deployments) {
        return Err(ValidationError::InvalidHeader("bad-version"));
    }
    Ok(())
}

/// Checks that depend on the block's height and its parent's median time
/// but not on the UTXO set.
pub fn contextual_check_block(
    block: &Block,
    height: i32,
    prev_median_time_past: i64,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    let lock_time_cutoff = if deployment_active(height, &params.deployments, Deployment::Csv) {
        prev_median_time_past
    } else {
        block.header.time as i64
    };
    for tx in &block.transactions {
        if !is_final_tx(tx, height, lock_time_cutoff) {
            return Err(ValidationError::InvalidTransaction("bad-txns-nonfinal"));
        }
    }

    if deployment_active(height, &params.deployments, Deployment::Bip34) {
        let expected = coinbase_height_prefix(height);
        let script_sig = &block.transactions[0].vin[0].script_sig;
        if !script_sig.starts_with(&expected) {
            return Err(ValidationError::InvalidBlock("bad-cb-height"));
        }
    }

    check_witness_commitment(block, height, params)?;

    if block.weight() > MAX_BLOCK_WEIGHT as u64 {
        return Err(ValidationError::InvalidBlock("bad-blk-weight"));
    }
    Ok(())
}

fn check_witness_commitment(
    block: &Block,
    height: i32,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    let coinbase = &block.transactions[0];
    let segwit = deployment_active(height, &params.deployments, Deployment::Segwit);
    if segwit {
        if let Some(index) = witness_commitment_index(coinbase) {
            let witness = &coinbase.vin[0].witness;
            if witness.len() != 1 || witness[0].len() != 32 {
                return Err(ValidationError::Mutated("bad-witness-nonce-size"));
            }
            let mut nonce = [0u8; 32];
            nonce.copy_from_slice(&witness[0]);
            let expected = witness_commitment(&witness_merkle_root(&block.transactions), &nonce);
            if coinbase.vout[index].script_pubkey[6..38] != expected {
                return Err(ValidationError::Mutated("bad-witness-merkle-match"));
            }
            return Ok(());
        }
    }
    if block.transactions.iter().any(Transaction::has_witness) {
        return Err(ValidationError::Mutated("unexpected-witness"));
    }
    Ok(())
}

/// Position of the last coinbase output that carries a witness commitment.
pub fn witness_commitment_index(coinbase: &Transaction) -> Option<usize> {
    coinbase.vout.iter().rposition(|output| {
        output.script_pubkey.len() >= 38
            && output.script_pubkey[..6] == WITNESS_COMMITMENT_HEADER
    })
}

pub fn witness_commitment(witness_root: &Hash256, nonce: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(witness_root);
    data[32..].copy_from_slice(nonce);
    sha256d(&data)
}

/// Builds the commitment output script for `transactions`, whose coinbase
/// witness must be the single item `nonce`.
pub fn witness_commitment_script(transactions: &[Transaction], nonce: &Hash256) -> Vec<u8> {
    let commitment = witness_commitment(&witness_merkle_root(transactions), nonce);
    let mut script = WITNESS_COMMITMENT_HEADER.to_vec();
    script.extend_from_slice(&commitment);
    script
}

/// Script prefix a BIP34 coinbase must start with.
pub fn coinbase_height_prefix(height: i32) -> Vec<u8> {
    let mut script = Vec::with_capacity(5);
    push_int(&mut script, height as i64);
    script
}

pub fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let threshold = if tx.lock_time < LOCKTIME_THRESHOLD {
        height as i64
    } else {
        block_time
    };
    if (tx.lock_time as i64) < threshold {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

pub fn is_bip30_exception(height: i32, hash: &Hash256, params: &ConsensusParams) -> bool {
    params.network == Network::Mainnet
        && BIP30_EXCEPTIONS.iter().any(|(exception_height, exception_hash)| {
            *exception_height == height
                && hash256_from_hex(exception_hash).map_or(false, |expected| expected == *hash)
        })
}

/// Earliest height and time (exclusive) at which a transaction's relative
/// lock-times are satisfied; `-1` means unconstrained.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SequenceLock {
    pub min_height: i32,
    pub min_time: i64,
}

/// `coin_heights[i]` is the height of the coin spent by input `i`;
/// `median_time_at(h)` is the median time past of the block at height `h`
/// on the chain the transaction is evaluated against.
pub fn calculate_sequence_locks<F>(
    tx: &Transaction,
    lock_flags: u32,
    coin_heights: &[i32],
    median_time_at: F,
) -> SequenceLock
where
    F: Fn(i32) -> i64,
{
    let mut lock = SequenceLock {
        min_height: -1,
        min_time: -1,
    };
    let enforce = (tx.version as u32) >= 2 && (lock_flags & LOCKTIME_VERIFY_SEQUENCE) != 0;
    if !enforce {
        return lock;
    }
    for (input, coin_height) in tx.vin.iter().zip(coin_heights.iter().copied()) {
        if (input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG) != 0 {
            continue;
        }
        let value = (input.sequence & SEQUENCE_LOCKTIME_MASK) as i64;
        if (input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG) != 0 {
            let coin_time = median_time_at((coin_height - 1).max(0));
            let locked_until = coin_time + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1;
            lock.min_time = lock.min_time.max(locked_until);
        } else {
            let locked_until = coin_height + value as i32 - 1;
            lock.min_height = lock.min_height.max(locked_until);
        }
    }
    lock
}

pub fn sequence_locks_satisfied(
    lock: &SequenceLock,
    block_height: i32,
    prev_median_time_past: i64,
) -> bool {
    lock.min_height < block_height && lock.min_time < prev_median_time_past
}

/// Checks the value flow of a non-coinbase transaction given the coins its
/// inputs spend, in input order. Returns the fee.
pub fn check_tx_inputs(
    tx: &Transaction,
    coins: &[UtxoEntry],
    spend_height: i32,
) -> Result<Amount, ValidationError> {
    let mut value_in: Amount = 0;
    for coin in coins {
        if coin.is_coinbase && spend_height - (coin.height as i32) < COINBASE_MATURITY {
            return Err(ValidationError::InvalidTransaction(
                "bad-txns-premature-spend-of-coinbase",
            ));
        }
        value_in += coin.value;
        if !money_range(coin.value) || !money_range(value_in) {
            return Err(ValidationError::InvalidTransaction(
                "bad-txns-inputvalues-outofrange",
            ));
        }
    }

    let value_out = tx
        .value_out()
        .ok_or(ValidationError::InvalidTransaction("bad-txns-txouttotal-toolarge"))?;
    if value_in < value_out {
        return Err(ValidationError::InvalidTransaction("bad-txns-in-belowout"));
    }
    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(ValidationError::InvalidTransaction("bad-txns-fee-outofrange"));
    }
    Ok(fee)
}

/// One input's script to run once all inputs of a block are known.
#[derive(Clone, Debug)]
pub struct ScriptCheck {
    pub tx_index: usize,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    pub amount: Amount,
}

/// Runs every check in parallel, on `pool` when given.
pub fn run_script_checks(
    transactions: &[Transaction],
    checks: &[ScriptCheck],
    flags: ScriptFlags,
    pool: Option<&rayon::ThreadPool>,
) -> Result<(), ValidationError> {
    if checks.is_empty() {
        return Ok(());
    }
    let run = || {
        let precomputed: Vec<Option<PrecomputedTxData>> = transactions
            .par_iter()
            .map(|tx| tx.has_witness().then(|| PrecomputedTxData::new(tx)))
            .collect();
        checks.par_iter().try_for_each(|check| {
            let tx = &transactions[check.tx_index];
            verify_input(
                tx,
                check.input_index,
                &check.script_pubkey,
                check.amount,
                flags,
                precomputed[check.tx_index].as_ref(),
            )
            .map_err(|err| (check.tx_index, check.input_index, err))
        })
    };
    let result = match pool {
        Some(pool) => pool.install(run),
        None => run(),
    };
    if let Err((tx_index, input_index, err)) = result {
        let txid = transactions[tx_index].txid();
        log_warn!(
            "script validation failed for tx {} input {}: {}",
            hash256_to_hex(&txid),
            input_index,
            err
        );
        return Err(ValidationError::Script {
            txid,
            input: input_index,
            error: err,
        });
    }
    Ok(())
}
