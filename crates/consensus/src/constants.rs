//! Consensus-wide constants shared across validation.

/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// The maximum allowed weight for a block (BIP141).
pub const MAX_BLOCK_WEIGHT: u32 = 4_000_000;
/// The maximum allowed serialized size of a block without witness data.
pub const MAX_BLOCK_SERIALIZED_SIZE: u32 = 4_000_000;
/// The maximum allowed signature operation cost in a block.
pub const MAX_BLOCK_SIGOPS_COST: u32 = 80_000;
pub const WITNESS_SCALE_FACTOR: u32 = 4;
/// Transactions smaller than this (without witness) are rejected to avoid 64-byte merkle leaves.
pub const MIN_TRANSACTION_WEIGHT: u32 = WITNESS_SCALE_FACTOR * 60;
pub const MIN_SERIALIZABLE_TRANSACTION_WEIGHT: u32 = WITNESS_SCALE_FACTOR * 10;

/// Headers may not be more than this many seconds ahead of adjusted time.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of previous blocks used for the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Lock times below this are block heights, at or above are unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
/// Sequence numbers below this signal replaceability (BIP125).
pub const MAX_BIP125_RBF_SEQUENCE: u32 = 0xffff_fffd;

/// If set, the sequence number carries no relative lock (BIP68).
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
/// If set, the relative lock is time based in units of 512 seconds.
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Use the median time past instead of the block time for finality checks.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
/// Enforce relative lock times (BIP68).
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;
/// Standard locktime verify flags used by non-consensus code.
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 = LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;

/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Maximum size of a single stack element.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
/// Maximum number of non-push operations per script.
pub const MAX_OPS_PER_SCRIPT: usize = 201;
/// Maximum number of public keys per multisig.
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;
/// Maximum combined main and alt stack size.
pub const MAX_STACK_SIZE: usize = 1_000;

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_016;
