//! Standard script templates, relay policy checks, and dust.

use utxod_consensus::constants::MAX_SCRIPT_SIZE;
use utxod_consensus::money::Amount;
use utxod_primitives::encoding::varint_len;
use utxod_primitives::transaction::TxOut;

use crate::opcode::{is_push_only, push_data, Instruction, Instructions, Opcode, OP_0};

/// Largest OP_RETURN output relayed: the opcode plus an 80-byte push.
pub const MAX_OP_RETURN_RELAY: usize = 83;
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;
pub const MAX_STANDARD_MULTISIG_KEYS: usize = 3;
/// Dust relay fee in satoshis per 1000 virtual bytes.
pub const DUST_RELAY_TX_FEE: Amount = 3000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    P2Wpkh,
    P2Wsh,
    MultiSig { required: u8, keys: u8 },
    NullData,
    WitnessUnknown,
    Unknown,
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if let Some((version, program)) = witness_program(script) {
        match (version, program.len()) {
            (0, 20) => ScriptType::P2Wpkh,
            (0, 32) => ScriptType::P2Wsh,
            (0, _) => ScriptType::Unknown,
            _ => ScriptType::WitnessUnknown,
        }
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else if is_null_data(script) {
        ScriptType::NullData
    } else if let Some((required, keys)) = multisig_shape(script) {
        ScriptType::MultiSig { required, keys }
    } else {
        ScriptType::Unknown
    }
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == Opcode::Dup.byte()
        && script[1] == Opcode::Hash160.byte()
        && script[2] == 0x14
        && script[23] == Opcode::EqualVerify.byte()
        && script[24] == Opcode::CheckSig.byte()
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23
        && script[0] == Opcode::Hash160.byte()
        && script[1] == 0x14
        && script[22] == Opcode::Equal.byte()
}

fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };

    let expected_len = key_len as usize + 2;
    script.len() == expected_len && script[script.len() - 1] == Opcode::CheckSig.byte()
}

fn is_null_data(script: &[u8]) -> bool {
    script.first() == Some(&Opcode::Return.byte()) && is_push_only(&script[1..])
}

/// Version and program of a segwit output: a version opcode followed by one 2..=40 byte push.
pub fn witness_program(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = match script[0] {
        OP_0 => 0,
        byte if (Opcode::Num1.byte()..=Opcode::Num16.byte()).contains(&byte) => {
            byte - Opcode::Num1.byte() + 1
        }
        _ => return None,
    };
    if script[1] as usize + 2 != script.len() {
        return None;
    }
    Some((version, &script[2..]))
}

fn multisig_shape(script: &[u8]) -> Option<(u8, u8)> {
    let instructions: Vec<Instruction<'_>> = Instructions::new(script)
        .map(|item| item.map(|(_, instruction)| instruction))
        .collect::<Result<_, _>>()
        .ok()?;
    if instructions.len() < 4 {
        return None;
    }
    let small = |instruction: &Instruction<'_>| match instruction {
        Instruction::Op(op) => op.small_int().filter(|value| *value >= 1),
        _ => None,
    };
    let required = small(&instructions[0])?;
    let keys = small(&instructions[instructions.len() - 2])?;
    if instructions.last() != Some(&Instruction::Op(Opcode::CheckMultiSig)) {
        return None;
    }
    let pubkeys = &instructions[1..instructions.len() - 2];
    if pubkeys.len() as i64 != keys || required > keys {
        return None;
    }
    let all_keys = pubkeys.iter().all(|instruction| {
        matches!(instruction, Instruction::Push { data, .. } if data.len() == 33 || data.len() == 65)
    });
    all_keys.then_some((required as u8, keys as u8))
}

/// Outputs that can never be spent and may be left out of the UTXO set.
pub fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&Opcode::Return.byte()) || script.len() > MAX_SCRIPT_SIZE
}

pub fn is_standard_script_pubkey(script: &[u8]) -> bool {
    match classify_script_pubkey(script) {
        ScriptType::Unknown => false,
        ScriptType::NullData => script.len() <= MAX_OP_RETURN_RELAY,
        ScriptType::MultiSig { required, keys } => {
            (1..=MAX_STANDARD_MULTISIG_KEYS as u8).contains(&keys) && required >= 1
        }
        _ => true,
    }
}

pub fn is_standard_script_sig(script_sig: &[u8]) -> bool {
    script_sig.len() <= MAX_STANDARD_SCRIPTSIG_SIZE && is_push_only(script_sig)
}

/// Smallest value worth relaying for `output` at `dust_relay_fee` sat/kvB.
pub fn dust_threshold(output: &TxOut, dust_relay_fee: Amount) -> Amount {
    if is_unspendable(&output.script_pubkey) {
        return 0;
    }
    let output_size = 8 + varint_len(output.script_pubkey.len() as u64) + output.script_pubkey.len();
    // Spending input: outpoint, script length, sequence, plus a typical signature.
    let spend_size = if witness_program(&output.script_pubkey).is_some() {
        32 + 4 + 1 + 107 / 4 + 4
    } else {
        32 + 4 + 1 + 107 + 4
    };
    fee_for_size(dust_relay_fee, (output_size + spend_size) as u64)
}

pub fn is_dust(output: &TxOut, dust_relay_fee: Amount) -> bool {
    output.value < dust_threshold(output, dust_relay_fee)
}

/// Fee for `size` virtual bytes at `rate` satoshis per 1000 bytes; never rounds a positive rate to zero.
pub fn fee_for_size(rate: Amount, size: u64) -> Amount {
    let fee = rate.saturating_mul(size as i64) / 1000;
    if fee == 0 && size != 0 && rate > 0 {
        1
    } else {
        fee
    }
}

pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(Opcode::Dup.byte());
    script.push(Opcode::Hash160.byte());
    push_data(&mut script, pubkey_hash);
    script.push(Opcode::EqualVerify.byte());
    script.push(Opcode::CheckSig.byte());
    script
}

pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(Opcode::Hash160.byte());
    push_data(&mut script, script_hash);
    script.push(Opcode::Equal.byte());
    script
}

pub fn p2wpkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(22);
    script.push(OP_0);
    push_data(&mut script, pubkey_hash);
    script
}

pub fn p2wsh_script(script_hash: &[u8; 32]) -> Vec<u8> {
    let mut script = Vec::with_capacity(34);
    script.push(OP_0);
    push_data(&mut script, script_hash);
    script
}

pub fn multisig_script(required: u8, pubkeys: &[Vec<u8>]) -> Vec<u8> {
    let mut script = Vec::new();
    crate::opcode::push_int(&mut script, required as i64);
    for key in pubkeys {
        push_data(&mut script, key);
    }
    crate::opcode::push_int(&mut script, pubkeys.len() as i64);
    script.push(Opcode::CheckMultiSig.byte());
    script
}

pub fn null_data_script(payload: &[u8]) -> Vec<u8> {
    let mut script = vec![Opcode::Return.byte()];
    push_data(&mut script, payload);
    script
}
