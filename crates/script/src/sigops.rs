//! Signature operation counting for the block sigop-cost limit.

use utxod_consensus::constants::{MAX_PUBKEYS_PER_MULTISIG, WITNESS_SCALE_FACTOR};
use utxod_primitives::transaction::Transaction;

use crate::interpreter::{ScriptFlags, SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_WITNESS};
use crate::opcode::{is_push_only, Instruction, Instructions, Opcode};
use crate::standard::{is_p2sh, witness_program};

/// Counts CHECKSIG-family operations. Inaccurate counting charges every
/// CHECKMULTISIG the maximum key count.
pub fn count_sigops(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last: Option<Opcode> = None;
    for item in Instructions::new(script) {
        let Ok((_, instruction)) = item else {
            break;
        };
        let op = match instruction {
            Instruction::Op(op) => op,
            _ => {
                last = None;
                continue;
            }
        };
        match op {
            Opcode::CheckSig | Opcode::CheckSigVerify => count += 1,
            Opcode::CheckMultiSig | Opcode::CheckMultiSigVerify => {
                let keys = last
                    .filter(|_| accurate)
                    .and_then(Opcode::small_int)
                    .filter(|value| *value >= 1);
                count += keys.unwrap_or(MAX_PUBKEYS_PER_MULTISIG as i64) as u32;
            }
            _ => {}
        }
        last = Some(op);
    }
    count
}

/// Sigops of the redeem script a P2SH spend reveals as its last push.
pub fn p2sh_sigops(script_sig: &[u8], script_pubkey: &[u8]) -> u32 {
    if !is_p2sh(script_pubkey) {
        return 0;
    }
    match last_push(script_sig) {
        Some(redeem_script) => count_sigops(redeem_script, true),
        None => 0,
    }
}

fn last_push(script_sig: &[u8]) -> Option<&[u8]> {
    let mut data: &[u8] = &[];
    for item in Instructions::new(script_sig) {
        match item {
            Ok((_, Instruction::Push { data: pushed, .. })) => data = pushed,
            Ok((_, Instruction::Op(op))) if op.small_int().is_some() => data = &[],
            _ => return None,
        }
    }
    Some(data)
}

pub fn witness_sigops(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &[Vec<u8>],
    flags: ScriptFlags,
) -> u32 {
    if (flags & SCRIPT_VERIFY_WITNESS) == 0 {
        return 0;
    }
    if let Some((version, program)) = witness_program(script_pubkey) {
        return witness_program_sigops(version, program, witness);
    }
    if is_p2sh(script_pubkey) && is_push_only(script_sig) {
        if let Some(redeem_script) = last_push(script_sig) {
            if let Some((version, program)) = witness_program(redeem_script) {
                return witness_program_sigops(version, program, witness);
            }
        }
    }
    0
}

fn witness_program_sigops(version: u8, program: &[u8], witness: &[Vec<u8>]) -> u32 {
    if version != 0 {
        return 0;
    }
    match (program.len(), witness.last()) {
        (20, _) => 1,
        (32, Some(witness_script)) => count_sigops(witness_script, true),
        _ => 0,
    }
}

/// Legacy sigops of every scriptSig and scriptPubKey, without looking up spent outputs.
pub fn legacy_sigop_count(tx: &Transaction) -> u32 {
    let inputs: u32 = tx
        .vin
        .iter()
        .map(|input| count_sigops(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| count_sigops(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

/// Total sigop cost of `tx`; `spent_script` returns the scriptPubKey each input spends.
pub fn transaction_sigop_cost<'a, F>(tx: &Transaction, flags: ScriptFlags, spent_script: F) -> u64
where
    F: Fn(usize) -> Option<&'a [u8]>,
{
    let mut cost = legacy_sigop_count(tx) as u64 * WITNESS_SCALE_FACTOR as u64;
    if tx.is_coinbase() {
        return cost;
    }
    for (index, input) in tx.vin.iter().enumerate() {
        let Some(script_pubkey) = spent_script(index) else {
            continue;
        };
        if (flags & SCRIPT_VERIFY_P2SH) != 0 {
            cost += p2sh_sigops(&input.script_sig, script_pubkey) as u64
                * WITNESS_SCALE_FACTOR as u64;
        }
        cost += witness_sigops(&input.script_sig, script_pubkey, &input.witness, flags) as u64;
    }
    cost
}
