//! Relay policy: what the mempool accepts beyond consensus validity.

use utxod_consensus::money::Amount;
use utxod_consensus::Network;
use utxod_primitives::transaction::Transaction;
use utxod_script::standard::{
    classify_script_pubkey, is_dust, is_standard_script_pubkey, is_standard_script_sig,
    ScriptType, DUST_RELAY_TX_FEE,
};

pub const DEFAULT_MIN_RELAY_FEE_PER_KB: Amount = 1_000;
pub const DEFAULT_INCREMENTAL_RELAY_FEE_PER_KB: Amount = 1_000;
pub const DEFAULT_MAX_MEMPOOL_BYTES: usize = 300 * 1024 * 1024;
pub const DEFAULT_ANCESTOR_LIMIT: usize = 25;
pub const DEFAULT_ANCESTOR_SIZE_LIMIT: u64 = 101_000;
pub const DEFAULT_DESCENDANT_LIMIT: usize = 25;
pub const DEFAULT_DESCENDANT_SIZE_LIMIT: u64 = 101_000;
pub const DEFAULT_MAX_REPLACEMENTS: usize = 100;
pub const DEFAULT_MAX_ORPHANS: usize = 100;
pub const DEFAULT_MAX_ORPHAN_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_ORPHAN_TTL_SECS: u64 = 20 * 60;

pub const MAX_STANDARD_TX_WEIGHT: u64 = 400_000;
pub const MAX_STANDARD_TX_SIGOPS_COST: u64 = 16_000;
pub const MIN_STANDARD_TX_NONWITNESS_SIZE: usize = 65;
pub const MAX_STANDARD_TX_VERSION: i32 = 2;

#[derive(Clone, Debug)]
pub struct MempoolPolicy {
    pub require_standard: bool,
    /// Fee rate in satoshis per 1000 virtual bytes.
    pub min_relay_fee_per_kb: Amount,
    /// Extra fee rate a replacement or a size-limited pool demands on top.
    pub incremental_relay_fee_per_kb: Amount,
    pub dust_relay_fee_per_kb: Amount,
    /// Serialized bytes of all entries.
    pub max_bytes: usize,
    /// `None` leaves the entry count unbounded.
    pub max_entries: Option<usize>,
    pub ancestor_limit: usize,
    pub ancestor_size_limit: u64,
    pub descendant_limit: usize,
    pub descendant_size_limit: u64,
    pub max_replacements: usize,
    pub max_orphans: usize,
    pub max_orphan_bytes: usize,
    pub orphan_ttl_secs: u64,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        Self {
            require_standard: true,
            min_relay_fee_per_kb: DEFAULT_MIN_RELAY_FEE_PER_KB,
            incremental_relay_fee_per_kb: DEFAULT_INCREMENTAL_RELAY_FEE_PER_KB,
            dust_relay_fee_per_kb: DUST_RELAY_TX_FEE,
            max_bytes: DEFAULT_MAX_MEMPOOL_BYTES,
            max_entries: None,
            ancestor_limit: DEFAULT_ANCESTOR_LIMIT,
            ancestor_size_limit: DEFAULT_ANCESTOR_SIZE_LIMIT,
            descendant_limit: DEFAULT_DESCENDANT_LIMIT,
            descendant_size_limit: DEFAULT_DESCENDANT_SIZE_LIMIT,
            max_replacements: DEFAULT_MAX_REPLACEMENTS,
            max_orphans: DEFAULT_MAX_ORPHANS,
            max_orphan_bytes: DEFAULT_MAX_ORPHAN_BYTES,
            orphan_ttl_secs: DEFAULT_ORPHAN_TTL_SECS,
        }
    }
}

impl MempoolPolicy {
    /// Regtest relays non-standard transactions unless told otherwise.
    pub fn for_network(network: Network) -> Self {
        Self {
            require_standard: network != Network::Regtest,
            ..Self::default()
        }
    }

    /// Minimum fee for `vsize` at the relay floor.
    pub fn min_relay_fee(&self, vsize: u64) -> Amount {
        fee_at_rate(self.min_relay_fee_per_kb, vsize)
    }

    /// Additional fee a replacement of `vsize` must pay over what it evicts.
    pub fn incremental_relay_fee(&self, vsize: u64) -> Amount {
        fee_at_rate(self.incremental_relay_fee_per_kb, vsize)
    }
}

/// `rate` satoshis per 1000 virtual bytes applied to `vsize`, rounded down.
pub fn fee_at_rate(rate: Amount, vsize: u64) -> Amount {
    ((rate as i128 * vsize as i128) / 1000).clamp(0, Amount::MAX as i128) as Amount
}

/// Fee rate in satoshis per 1000 virtual bytes.
pub fn fee_rate_per_kb(fee: Amount, vsize: u64) -> Amount {
    if vsize == 0 {
        return 0;
    }
    ((fee as i128 * 1000) / vsize as i128) as Amount
}

/// Context-free standardness of the transaction itself; returns the reject
/// reason on failure.
pub fn check_standard_tx(tx: &Transaction, policy: &MempoolPolicy) -> Result<(), &'static str> {
    if tx.version < 1 || tx.version > MAX_STANDARD_TX_VERSION {
        return Err("version");
    }
    if tx.weight() > MAX_STANDARD_TX_WEIGHT {
        return Err("tx-size");
    }
    if tx.base_size() < MIN_STANDARD_TX_NONWITNESS_SIZE {
        return Err("tx-size-small");
    }
    for input in &tx.vin {
        if input.script_sig.len() > utxod_script::standard::MAX_STANDARD_SCRIPTSIG_SIZE {
            return Err("scriptsig-size");
        }
        if !is_standard_script_sig(&input.script_sig) {
            return Err("scriptsig-not-pushonly");
        }
    }

    let mut data_outputs = 0usize;
    for output in &tx.vout {
        if !is_standard_script_pubkey(&output.script_pubkey) {
            return Err("scriptpubkey");
        }
        if classify_script_pubkey(&output.script_pubkey) == ScriptType::NullData {
            data_outputs += 1;
        } else if is_dust(output, policy.dust_relay_fee_per_kb) {
            return Err("dust");
        }
    }
    if data_outputs > 1 {
        return Err("multi-op-return");
    }
    Ok(())
}

/// Spent outputs must be of a known template for the input to be relayed.
pub fn is_standard_spend(script_pubkey: &[u8]) -> bool {
    !matches!(
        classify_script_pubkey(script_pubkey),
        ScriptType::Unknown | ScriptType::NullData
    )
}
