//! Signature hashing: the legacy algorithm and BIP143 for witness v0 inputs.

use utxod_consensus::money::Amount;
use utxod_consensus::Hash256;
use utxod_primitives::encoding::{Encodable, Encoder};
use utxod_primitives::hash::sha256d;
use utxod_primitives::transaction::Transaction;

use crate::opcode::{Instructions, Opcode};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Returned by the legacy algorithm for an out-of-range input or SIGHASH_SINGLE output.
pub const SIGHASH_ONE: Hash256 = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }

    /// True for ALL, NONE and SINGLE with or without ANYONECANPAY.
    pub fn is_defined(self) -> bool {
        let base = self.0 & !SIGHASH_ANYONECANPAY;
        (SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigVersion {
    Base,
    WitnessV0,
}

/// Per-transaction midstate shared by every witness input, computed once
/// before the inputs are checked in parallel.
#[derive(Clone, Debug)]
pub struct PrecomputedTxData {
    pub hash_prevouts: Hash256,
    pub hash_sequence: Hash256,
    pub hash_outputs: Hash256,
}

impl PrecomputedTxData {
    pub fn new(tx: &Transaction) -> Self {
        Self {
            hash_prevouts: hash_prevouts(tx),
            hash_sequence: hash_sequence(tx),
            hash_outputs: hash_outputs(tx),
        }
    }
}

fn hash_prevouts(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::with_capacity(tx.vin.len() * 36);
    for input in &tx.vin {
        input.prevout.consensus_encode(&mut encoder);
    }
    sha256d(&encoder.into_inner())
}

fn hash_sequence(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::with_capacity(tx.vin.len() * 4);
    for input in &tx.vin {
        encoder.write_u32_le(input.sequence);
    }
    sha256d(&encoder.into_inner())
}

fn hash_outputs(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::new();
    for output in &tx.vout {
        output.consensus_encode(&mut encoder);
    }
    sha256d(&encoder.into_inner())
}

pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: Amount,
    sighash_type: SighashType,
    sigversion: SigVersion,
    precomputed: Option<&PrecomputedTxData>,
) -> Hash256 {
    match sigversion {
        SigVersion::Base => legacy_signature_hash(tx, input_index, script_code, sighash_type),
        SigVersion::WitnessV0 => witness_v0_signature_hash(
            tx,
            input_index,
            script_code,
            amount,
            sighash_type,
            precomputed,
        ),
    }
}

pub fn legacy_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Hash256 {
    if input_index >= tx.vin.len() {
        return SIGHASH_ONE;
    }
    let base = sighash_type.base_type();
    if base == SIGHASH_SINGLE && input_index >= tx.vout.len() {
        return SIGHASH_ONE;
    }
    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let hash_none_or_single = base == SIGHASH_NONE || base == SIGHASH_SINGLE;

    let mut encoder = Encoder::with_capacity(tx.base_size() + script_code.len());
    encoder.write_i32_le(tx.version);

    if anyone_can_pay {
        encoder.write_varint(1);
    } else {
        encoder.write_varint(tx.vin.len() as u64);
    }
    for (index, input) in tx.vin.iter().enumerate() {
        if anyone_can_pay && index != input_index {
            continue;
        }
        input.prevout.consensus_encode(&mut encoder);
        if index == input_index {
            write_script_code_without_separators(&mut encoder, script_code);
        } else {
            encoder.write_varint(0);
        }
        if index != input_index && hash_none_or_single {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    match base {
        SIGHASH_NONE => encoder.write_varint(0),
        SIGHASH_SINGLE => {
            encoder.write_varint(input_index as u64 + 1);
            for (index, output) in tx.vout.iter().enumerate().take(input_index + 1) {
                if index == input_index {
                    output.consensus_encode(&mut encoder);
                } else {
                    encoder.write_i64_le(-1);
                    encoder.write_varint(0);
                }
            }
        }
        _ => {
            encoder.write_varint(tx.vout.len() as u64);
            for output in &tx.vout {
                output.consensus_encode(&mut encoder);
            }
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}

/// Writes the script code with every OP_CODESEPARATOR removed. Bytes after a
/// parse failure are copied unchanged.
fn write_script_code_without_separators(encoder: &mut Encoder, script_code: &[u8]) {
    let mut cut = Vec::new();
    let mut start = 0usize;
    for item in Instructions::new(script_code) {
        let Ok((end, instruction)) = item else {
            break;
        };
        if instruction.byte() == Opcode::CodeSeparator.byte() {
            cut.extend_from_slice(&script_code[start..end - 1]);
            start = end;
        }
    }
    cut.extend_from_slice(&script_code[start..]);
    encoder.write_var_bytes(&cut);
}

pub fn witness_v0_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: Amount,
    sighash_type: SighashType,
    precomputed: Option<&PrecomputedTxData>,
) -> Hash256 {
    let Some(input) = tx.vin.get(input_index) else {
        return SIGHASH_ONE;
    };
    let base = sighash_type.base_type();
    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let zero = [0u8; 32];

    let prevouts = if anyone_can_pay {
        zero
    } else {
        precomputed
            .map(|data| data.hash_prevouts)
            .unwrap_or_else(|| hash_prevouts(tx))
    };
    let sequences = if anyone_can_pay || base == SIGHASH_SINGLE || base == SIGHASH_NONE {
        zero
    } else {
        precomputed
            .map(|data| data.hash_sequence)
            .unwrap_or_else(|| hash_sequence(tx))
    };
    let outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        precomputed
            .map(|data| data.hash_outputs)
            .unwrap_or_else(|| hash_outputs(tx))
    } else if base == SIGHASH_SINGLE && input_index < tx.vout.len() {
        let mut encoder = Encoder::new();
        tx.vout[input_index].consensus_encode(&mut encoder);
        sha256d(&encoder.into_inner())
    } else {
        zero
    };

    let mut encoder = Encoder::with_capacity(156 + script_code.len());
    encoder.write_i32_le(tx.version);
    encoder.write_bytes(&prevouts);
    encoder.write_bytes(&sequences);
    input.prevout.consensus_encode(&mut encoder);
    encoder.write_var_bytes(script_code);
    encoder.write_i64_le(amount);
    encoder.write_u32_le(input.sequence);
    encoder.write_bytes(&outputs);
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}
