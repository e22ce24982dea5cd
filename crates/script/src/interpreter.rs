use ripemd::{Digest as RipemdDigest, Ripemd160};
use secp256k1::{ecdsa::Signature, PublicKey};
use sha1::Sha1;
use utxod_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_OPS_PER_SCRIPT, MAX_PUBKEYS_PER_MULTISIG, MAX_SCRIPT_ELEMENT_SIZE,
    MAX_SCRIPT_SIZE, MAX_STACK_SIZE, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use utxod_consensus::money::Amount;
use utxod_consensus::{deployment_active, ConsensusParams, Deployment};
use utxod_primitives::hash::{hash160, sha256, sha256d};
use utxod_primitives::hex::bytes_to_hex;
use utxod_primitives::transaction::Transaction;

use crate::num::{cast_to_bool, parse_script_num, script_num_to_vec, DEFAULT_MAX_NUM_SIZE};
use crate::opcode::{check_minimal_push, is_push_only, push_data, Instruction, Instructions, Opcode};
use crate::secp::verify_digest;
use crate::sighash::{signature_hash, PrecomputedTxData, SigVersion, SighashType};
use crate::standard::{is_p2sh, witness_program};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;
pub const SCRIPT_VERIFY_WITNESS: ScriptFlags = 1 << 11;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM: ScriptFlags = 1 << 12;
pub const SCRIPT_VERIFY_MINIMALIF: ScriptFlags = 1 << 13;
pub const SCRIPT_VERIFY_NULLFAIL: ScriptFlags = 1 << 14;
pub const SCRIPT_VERIFY_WITNESS_PUBKEYTYPE: ScriptFlags = 1 << 15;
pub const SCRIPT_VERIFY_CONST_SCRIPTCODE: ScriptFlags = 1 << 16;

pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_MINIMALIF
    | SCRIPT_VERIFY_NULLFAIL
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_WITNESS
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM
    | SCRIPT_VERIFY_WITNESS_PUBKEYTYPE
    | SCRIPT_VERIFY_CONST_SCRIPTCODE;

/// Consensus flags for a block at `height`, following the buried deployments.
pub fn script_flags_for_height(height: i32, params: &ConsensusParams) -> ScriptFlags {
    let heights = &params.deployments;
    let mut flags = SCRIPT_VERIFY_P2SH;
    if deployment_active(height, heights, Deployment::Bip66) {
        flags |= SCRIPT_VERIFY_DERSIG;
    }
    if deployment_active(height, heights, Deployment::Bip65) {
        flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if deployment_active(height, heights, Deployment::Csv) {
        flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
    }
    if deployment_active(height, heights, Deployment::Segwit) {
        flags |= SCRIPT_VERIFY_WITNESS | SCRIPT_VERIFY_NULLDUMMY;
    }
    flags
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptError {
    EvalFalse,
    OpReturn,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    SigCount,
    PubkeyCount,
    Verify,
    EqualVerify,
    CheckMultiSigVerify,
    CheckSigVerify,
    NumEqualVerify,
    BadOpcode,
    DisabledOpcode,
    InvalidStackOperation,
    InvalidAltstackOperation,
    UnbalancedConditional,
    NegativeLockTime,
    UnsatisfiedLockTime,
    SigHashType,
    SigDer,
    MinimalData,
    NumOverflow,
    SigPushOnly,
    SigHighS,
    SigNullDummy,
    PubkeyType,
    CleanStack,
    MinimalIf,
    SigNullFail,
    DiscourageUpgradableNops,
    DiscourageUpgradableWitnessProgram,
    WitnessProgramWrongLength,
    WitnessProgramWitnessEmpty,
    WitnessProgramMismatch,
    WitnessMalleated,
    WitnessMalleatedP2sh,
    WitnessUnexpected,
    WitnessPubkeyType,
    OpCodeSeparator,
    SigFindAndDelete,
}

impl ScriptError {
    /// Stable reason code reported to peers and RPC callers.
    pub fn code(&self) -> &'static str {
        match self {
            ScriptError::EvalFalse => "eval-false",
            ScriptError::OpReturn => "op-return",
            ScriptError::ScriptSize => "script-size",
            ScriptError::PushSize => "push-size",
            ScriptError::OpCount => "op-count",
            ScriptError::StackSize => "stack-size",
            ScriptError::SigCount => "sig-count",
            ScriptError::PubkeyCount => "pubkey-count",
            ScriptError::Verify => "verify",
            ScriptError::EqualVerify => "equalverify",
            ScriptError::CheckMultiSigVerify => "checkmultisigverify",
            ScriptError::CheckSigVerify => "checksigverify",
            ScriptError::NumEqualVerify => "numequalverify",
            ScriptError::BadOpcode => "bad-opcode",
            ScriptError::DisabledOpcode => "disabled-opcode",
            ScriptError::InvalidStackOperation => "invalid-stack-operation",
            ScriptError::InvalidAltstackOperation => "invalid-altstack-operation",
            ScriptError::UnbalancedConditional => "unbalanced-conditional",
            ScriptError::NegativeLockTime => "negative-locktime",
            ScriptError::UnsatisfiedLockTime => "unsatisfied-locktime",
            ScriptError::SigHashType => "sig-hashtype",
            ScriptError::SigDer => "sig-der",
            ScriptError::MinimalData => "minimaldata",
            ScriptError::NumOverflow => "scriptnum-overflow",
            ScriptError::SigPushOnly => "sig-pushonly",
            ScriptError::SigHighS => "sig-high-s",
            ScriptError::SigNullDummy => "sig-nulldummy",
            ScriptError::PubkeyType => "pubkeytype",
            ScriptError::CleanStack => "cleanstack",
            ScriptError::MinimalIf => "minimalif",
            ScriptError::SigNullFail => "nullfail",
            ScriptError::DiscourageUpgradableNops => "discourage-upgradable-nops",
            ScriptError::DiscourageUpgradableWitnessProgram => {
                "discourage-upgradable-witness-program"
            }
            ScriptError::WitnessProgramWrongLength => "witness-program-wrong-length",
            ScriptError::WitnessProgramWitnessEmpty => "witness-program-witness-empty",
            ScriptError::WitnessProgramMismatch => "witness-program-mismatch",
            ScriptError::WitnessMalleated => "witness-malleated",
            ScriptError::WitnessMalleatedP2sh => "witness-malleated-p2sh",
            ScriptError::WitnessUnexpected => "witness-unexpected",
            ScriptError::WitnessPubkeyType => "witness-pubkeytype",
            ScriptError::OpCodeSeparator => "op-codeseparator",
            ScriptError::SigFindAndDelete => "sig-findanddelete",
        }
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ScriptError::EvalFalse => "script evaluated to false",
            ScriptError::OpReturn => "OP_RETURN was encountered",
            ScriptError::ScriptSize => "script is too large",
            ScriptError::PushSize => "push value size limit exceeded",
            ScriptError::OpCount => "operation limit exceeded",
            ScriptError::StackSize => "stack size limit exceeded",
            ScriptError::SigCount => "signature count negative or greater than pubkey count",
            ScriptError::PubkeyCount => "pubkey count negative or limit exceeded",
            ScriptError::Verify => "OP_VERIFY failed",
            ScriptError::EqualVerify => "OP_EQUALVERIFY failed",
            ScriptError::CheckMultiSigVerify => "OP_CHECKMULTISIGVERIFY failed",
            ScriptError::CheckSigVerify => "OP_CHECKSIGVERIFY failed",
            ScriptError::NumEqualVerify => "OP_NUMEQUALVERIFY failed",
            ScriptError::BadOpcode => "opcode missing or not understood",
            ScriptError::DisabledOpcode => "attempted to use a disabled opcode",
            ScriptError::InvalidStackOperation => "operation not valid with the current stack size",
            ScriptError::InvalidAltstackOperation => {
                "operation not valid with the current altstack size"
            }
            ScriptError::UnbalancedConditional => "invalid OP_IF construction",
            ScriptError::NegativeLockTime => "negative locktime",
            ScriptError::UnsatisfiedLockTime => "locktime requirement not satisfied",
            ScriptError::SigHashType => "signature hash type missing or not understood",
            ScriptError::SigDer => "non-canonical DER signature",
            ScriptError::MinimalData => "data push larger than necessary",
            ScriptError::NumOverflow => "script number overflow",
            ScriptError::SigPushOnly => "only push operators allowed in signatures",
            ScriptError::SigHighS => "non-canonical signature: S value is unnecessarily high",
            ScriptError::SigNullDummy => "dummy CHECKMULTISIG argument must be zero",
            ScriptError::PubkeyType => "public key is neither compressed or uncompressed",
            ScriptError::CleanStack => "stack size must be exactly one after execution",
            ScriptError::MinimalIf => "OP_IF/NOTIF argument must be minimal",
            ScriptError::SigNullFail => "signature must be zero for failed CHECK(MULTI)SIG operation",
            ScriptError::DiscourageUpgradableNops => "NOPx reserved for soft-fork upgrades",
            ScriptError::DiscourageUpgradableWitnessProgram => {
                "witness version reserved for soft-fork upgrades"
            }
            ScriptError::WitnessProgramWrongLength => "witness program has incorrect length",
            ScriptError::WitnessProgramWitnessEmpty => "witness program was passed an empty witness",
            ScriptError::WitnessProgramMismatch => "witness program hash mismatch",
            ScriptError::WitnessMalleated => "witness requires empty scriptSig",
            ScriptError::WitnessMalleatedP2sh => "witness requires only-redeemscript scriptSig",
            ScriptError::WitnessUnexpected => "witness provided for non-witness script",
            ScriptError::WitnessPubkeyType => "using non-compressed keys in segwit",
            ScriptError::OpCodeSeparator => "using OP_CODESEPARATOR in non-witness script",
            ScriptError::SigFindAndDelete => "signature is found in scriptCode",
        };
        f.write_str(message)
    }
}

impl std::error::Error for ScriptError {}

/// Signature and lock-time oracle consulted by the interpreter.
pub trait SignatureChecker {
    fn check_sig(
        &self,
        _sig: &[u8],
        _pubkey: &[u8],
        _script_code: &[u8],
        _sigversion: SigVersion,
    ) -> bool {
        false
    }

    fn check_lock_time(&self, _lock_time: i64) -> bool {
        false
    }

    fn check_sequence(&self, _sequence: i64) -> bool {
        false
    }
}

/// Fails every signature and lock-time check.
pub struct NoSignatureChecker;

impl SignatureChecker for NoSignatureChecker {}

pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    amount: Amount,
    precomputed: Option<&'a PrecomputedTxData>,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(
        tx: &'a Transaction,
        input_index: usize,
        amount: Amount,
        precomputed: Option<&'a PrecomputedTxData>,
    ) -> Self {
        Self {
            tx,
            input_index,
            amount,
            precomputed,
        }
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
        sigversion: SigVersion,
    ) -> bool {
        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
            return false;
        };
        let Some((&hash_type, der)) = sig_bytes.split_last() else {
            return false;
        };
        let Ok(mut sig) = Signature::from_der_lax(der) else {
            utxod_log::log_debug!(
                "unparseable signature (len {}): {}",
                sig_bytes.len(),
                bytes_to_hex(sig_bytes)
            );
            return false;
        };
        sig.normalize_s();
        let sighash = signature_hash(
            self.tx,
            self.input_index,
            script_code,
            self.amount,
            SighashType(hash_type as u32),
            sigversion,
            self.precomputed,
        );
        verify_digest(sighash, &sig, &pubkey)
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let threshold = LOCKTIME_THRESHOLD as i64;
        let tx_lock_time = self.tx.lock_time as i64;
        if !((tx_lock_time < threshold && lock_time < threshold)
            || (tx_lock_time >= threshold && lock_time >= threshold))
        {
            return false;
        }
        if lock_time > tx_lock_time {
            return false;
        }
        // A final input disables the transaction lock time altogether.
        match self.tx.vin.get(self.input_index) {
            Some(input) => input.sequence != SEQUENCE_FINAL,
            None => false,
        }
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let Some(input) = self.tx.vin.get(self.input_index) else {
            return false;
        };
        let tx_sequence = input.sequence as i64;
        if (self.tx.version as u32) < 2 {
            return false;
        }
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 != 0 {
            return false;
        }
        let mask = (SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK) as i64;
        let type_flag = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        let tx_masked = tx_sequence & mask;
        let masked = sequence & mask;
        if !((tx_masked < type_flag && masked < type_flag)
            || (tx_masked >= type_flag && masked >= type_flag))
        {
            return false;
        }
        masked <= tx_masked
    }
}

/// Verifies one input of `tx` against the output it spends.
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    script_pubkey: &[u8],
    amount: Amount,
    flags: ScriptFlags,
    precomputed: Option<&PrecomputedTxData>,
) -> Result<(), ScriptError> {
    let input = tx
        .vin
        .get(input_index)
        .ok_or(ScriptError::InvalidStackOperation)?;
    let checker = TransactionSignatureChecker::new(tx, input_index, amount, precomputed);
    verify_script(
        &input.script_sig,
        script_pubkey,
        &input.witness,
        flags,
        &checker,
    )
}

pub fn verify_script<C: SignatureChecker + ?Sized>(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &[Vec<u8>],
    flags: ScriptFlags,
    checker: &C,
) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker, SigVersion::Base)?;
    let stack_copy = if (flags & SCRIPT_VERIFY_P2SH) != 0 {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(&mut stack, script_pubkey, flags, checker, SigVersion::Base)?;
    if !top_is_true(&stack) {
        return Err(ScriptError::EvalFalse);
    }

    let mut had_witness = false;
    if (flags & SCRIPT_VERIFY_WITNESS) != 0 {
        if let Some((version, program)) = witness_program(script_pubkey) {
            had_witness = true;
            if !script_sig.is_empty() {
                return Err(ScriptError::WitnessMalleated);
            }
            verify_witness_program(witness, version, program, flags, checker)?;
            stack.truncate(1);
        }
    }

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_copy;
        // The scriptSig pushed at least the element that satisfied the hash check.
        let redeem_script = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
        eval_script(&mut stack, &redeem_script, flags, checker, SigVersion::Base)?;
        if !top_is_true(&stack) {
            return Err(ScriptError::EvalFalse);
        }

        if (flags & SCRIPT_VERIFY_WITNESS) != 0 {
            if let Some((version, program)) = witness_program(&redeem_script) {
                had_witness = true;
                let mut expected = Vec::with_capacity(redeem_script.len() + 1);
                push_data(&mut expected, &redeem_script);
                if script_sig != expected.as_slice() {
                    return Err(ScriptError::WitnessMalleatedP2sh);
                }
                verify_witness_program(witness, version, program, flags, checker)?;
                stack.truncate(1);
            }
        }
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }

    if (flags & SCRIPT_VERIFY_WITNESS) != 0 && !had_witness && !witness.is_empty() {
        return Err(ScriptError::WitnessUnexpected);
    }

    Ok(())
}

fn verify_witness_program<C: SignatureChecker + ?Sized>(
    witness: &[Vec<u8>],
    version: u8,
    program: &[u8],
    flags: ScriptFlags,
    checker: &C,
) -> Result<(), ScriptError> {
    if version != 0 {
        if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM) != 0 {
            return Err(ScriptError::DiscourageUpgradableWitnessProgram);
        }
        // Unknown versions are anyone-can-spend until a soft fork defines them.
        return Ok(());
    }

    let (mut stack, script) = match program.len() {
        32 => {
            let (witness_script, rest) = witness
                .split_last()
                .ok_or(ScriptError::WitnessProgramWitnessEmpty)?;
            if sha256(witness_script).as_slice() != program {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            (rest.to_vec(), witness_script.clone())
        }
        20 => {
            if witness.len() != 2 {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            (witness.to_vec(), p2wpkh_script_code(program))
        }
        _ => return Err(ScriptError::WitnessProgramWrongLength),
    };

    if stack.iter().any(|item| item.len() > MAX_SCRIPT_ELEMENT_SIZE) {
        return Err(ScriptError::PushSize);
    }
    eval_script(&mut stack, &script, flags, checker, SigVersion::WitnessV0)?;
    if stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    if !top_is_true(&stack) {
        return Err(ScriptError::EvalFalse);
    }
    Ok(())
}

/// The implicit P2PKH script a P2WPKH program is evaluated as.
pub fn p2wpkh_script_code(program: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(Opcode::Dup.byte());
    script.push(Opcode::Hash160.byte());
    push_data(&mut script, program);
    script.push(Opcode::EqualVerify.byte());
    script.push(Opcode::CheckSig.byte());
    script
}

fn top_is_true(stack: &[Vec<u8>]) -> bool {
    stack.last().map(|top| cast_to_bool(top)).unwrap_or(false)
}

pub fn eval_script<C: SignatureChecker + ?Sized>(
    stack: &mut Vec<Vec<u8>>,
    script: &[u8],
    flags: ScriptFlags,
    checker: &C,
    sigversion: SigVersion,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let require_minimal = (flags & SCRIPT_VERIFY_MINIMALDATA) != 0;
    let mut alt_stack: Vec<Vec<u8>> = Vec::new();
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut code_start = 0usize;

    for item in Instructions::new(script) {
        let (position, instruction) = item?;
        let exec = !exec_stack.contains(&false);

        if instruction.byte() > Opcode::Num16.byte() {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }

        let op = match instruction {
            Instruction::Push { opcode, data } => {
                if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                if exec {
                    if require_minimal && !check_minimal_push(data, opcode) {
                        return Err(ScriptError::MinimalData);
                    }
                    stack.push(data.to_vec());
                }
                check_stack_size(stack, &alt_stack)?;
                continue;
            }
            Instruction::Invalid(byte) => {
                if exec {
                    utxod_log::log_trace!("bad opcode 0x{byte:02x} at offset {}", position - 1);
                    return Err(ScriptError::BadOpcode);
                }
                continue;
            }
            Instruction::Op(op) => op,
        };

        if op.is_disabled() {
            return Err(ScriptError::DisabledOpcode);
        }
        if op == Opcode::CodeSeparator
            && sigversion == SigVersion::Base
            && (flags & SCRIPT_VERIFY_CONST_SCRIPTCODE) != 0
        {
            return Err(ScriptError::OpCodeSeparator);
        }
        let is_conditional = (Opcode::If.byte()..=Opcode::EndIf.byte()).contains(&op.byte());
        if !exec && !is_conditional {
            continue;
        }

        match op {
            Opcode::OneNegate
            | Opcode::Num1
            | Opcode::Num2
            | Opcode::Num3
            | Opcode::Num4
            | Opcode::Num5
            | Opcode::Num6
            | Opcode::Num7
            | Opcode::Num8
            | Opcode::Num9
            | Opcode::Num10
            | Opcode::Num11
            | Opcode::Num12
            | Opcode::Num13
            | Opcode::Num14
            | Opcode::Num15
            | Opcode::Num16 => {
                let value = op.small_int().ok_or(ScriptError::BadOpcode)?;
                stack.push(script_num_to_vec(value));
            }
            Opcode::Nop => {}
            Opcode::CheckLockTimeVerify => {
                if (flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY) == 0 {
                    if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                } else {
                    // Five bytes so that lock times up to 2^39-1 can be compared.
                    let lock_time = parse_script_num(top(stack, 1)?, require_minimal, 5)?;
                    if lock_time < 0 {
                        return Err(ScriptError::NegativeLockTime);
                    }
                    if !checker.check_lock_time(lock_time) {
                        return Err(ScriptError::UnsatisfiedLockTime);
                    }
                }
            }
            Opcode::CheckSequenceVerify => {
                if (flags & SCRIPT_VERIFY_CHECKSEQUENCEVERIFY) == 0 {
                    if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                } else {
                    let sequence = parse_script_num(top(stack, 1)?, require_minimal, 5)?;
                    if sequence < 0 {
                        return Err(ScriptError::NegativeLockTime);
                    }
                    if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 == 0
                        && !checker.check_sequence(sequence)
                    {
                        return Err(ScriptError::UnsatisfiedLockTime);
                    }
                }
            }
            Opcode::Nop1
            | Opcode::Nop4
            | Opcode::Nop5
            | Opcode::Nop6
            | Opcode::Nop7
            | Opcode::Nop8
            | Opcode::Nop9
            | Opcode::Nop10 => {
                if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                    return Err(ScriptError::DiscourageUpgradableNops);
                }
            }
            Opcode::If | Opcode::NotIf => {
                let mut value = false;
                if exec {
                    let condition = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                    if sigversion == SigVersion::WitnessV0
                        && (flags & SCRIPT_VERIFY_MINIMALIF) != 0
                        && (condition.len() > 1 || (condition.len() == 1 && condition[0] != 1))
                    {
                        return Err(ScriptError::MinimalIf);
                    }
                    value = cast_to_bool(&condition);
                    if op == Opcode::NotIf {
                        value = !value;
                    }
                }
                exec_stack.push(value);
            }
            Opcode::Else => {
                let last = exec_stack
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *last = !*last;
            }
            Opcode::EndIf => {
                exec_stack
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
            }
            Opcode::Verify => {
                if cast_to_bool(top(stack, 1)?) {
                    stack.pop();
                } else {
                    return Err(ScriptError::Verify);
                }
            }
            Opcode::Return => return Err(ScriptError::OpReturn),
            Opcode::ToAltStack => {
                let value = pop(stack)?;
                alt_stack.push(value);
            }
            Opcode::FromAltStack => {
                let value = alt_stack
                    .pop()
                    .ok_or(ScriptError::InvalidAltstackOperation)?;
                stack.push(value);
            }
            Opcode::TwoDrop => {
                require(stack, 2)?;
                stack.truncate(stack.len() - 2);
            }
            Opcode::TwoDup => {
                require(stack, 2)?;
                let start = stack.len() - 2;
                stack.extend_from_within(start..);
            }
            Opcode::ThreeDup => {
                require(stack, 3)?;
                let start = stack.len() - 3;
                stack.extend_from_within(start..);
            }
            Opcode::TwoOver => {
                require(stack, 4)?;
                let start = stack.len() - 4;
                stack.extend_from_within(start..start + 2);
            }
            Opcode::TwoRot => {
                require(stack, 6)?;
                let start = stack.len() - 6;
                let moved: Vec<Vec<u8>> = stack.drain(start..start + 2).collect();
                stack.extend(moved);
            }
            Opcode::TwoSwap => {
                require(stack, 4)?;
                let len = stack.len();
                stack.swap(len - 4, len - 2);
                stack.swap(len - 3, len - 1);
            }
            Opcode::IfDup => {
                let value = top(stack, 1)?;
                if cast_to_bool(value) {
                    let value = value.clone();
                    stack.push(value);
                }
            }
            Opcode::Depth => {
                let depth = stack.len() as i64;
                stack.push(script_num_to_vec(depth));
            }
            Opcode::Drop => {
                pop(stack)?;
            }
            Opcode::Dup => {
                let value = top(stack, 1)?.clone();
                stack.push(value);
            }
            Opcode::Nip => {
                require(stack, 2)?;
                let index = stack.len() - 2;
                stack.remove(index);
            }
            Opcode::Over => {
                let value = top(stack, 2)?.clone();
                stack.push(value);
            }
            Opcode::Pick | Opcode::Roll => {
                require(stack, 2)?;
                let depth = parse_script_num(&pop(stack)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                if depth < 0 || depth as usize >= stack.len() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let index = stack.len() - 1 - depth as usize;
                let value = if op == Opcode::Roll {
                    stack.remove(index)
                } else {
                    stack[index].clone()
                };
                stack.push(value);
            }
            Opcode::Rot => {
                require(stack, 3)?;
                let len = stack.len();
                stack.swap(len - 3, len - 2);
                stack.swap(len - 2, len - 1);
            }
            Opcode::Swap => {
                require(stack, 2)?;
                let len = stack.len();
                stack.swap(len - 2, len - 1);
            }
            Opcode::Tuck => {
                require(stack, 2)?;
                let value = top(stack, 1)?.clone();
                let index = stack.len() - 2;
                stack.insert(index, value);
            }
            Opcode::Size => {
                let size = top(stack, 1)?.len() as i64;
                stack.push(script_num_to_vec(size));
            }
            Opcode::Equal | Opcode::EqualVerify => {
                require(stack, 2)?;
                let b = pop(stack)?;
                let a = pop(stack)?;
                let equal = a == b;
                if op == Opcode::EqualVerify {
                    if !equal {
                        return Err(ScriptError::EqualVerify);
                    }
                } else {
                    stack.push(bool_to_vec(equal));
                }
            }
            Opcode::OneAdd
            | Opcode::OneSub
            | Opcode::Negate
            | Opcode::Abs
            | Opcode::Not
            | Opcode::ZeroNotEqual => {
                let value = parse_script_num(top(stack, 1)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                let result = match op {
                    Opcode::OneAdd => value + 1,
                    Opcode::OneSub => value - 1,
                    Opcode::Negate => -value,
                    Opcode::Abs => value.abs(),
                    Opcode::Not => (value == 0) as i64,
                    _ => (value != 0) as i64,
                };
                stack.pop();
                stack.push(script_num_to_vec(result));
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::BoolAnd
            | Opcode::BoolOr
            | Opcode::NumEqual
            | Opcode::NumEqualVerify
            | Opcode::NumNotEqual
            | Opcode::LessThan
            | Opcode::GreaterThan
            | Opcode::LessThanOrEqual
            | Opcode::GreaterThanOrEqual
            | Opcode::Min
            | Opcode::Max => {
                require(stack, 2)?;
                let a = parse_script_num(top(stack, 2)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                let b = parse_script_num(top(stack, 1)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                let result = match op {
                    Opcode::Add => a + b,
                    Opcode::Sub => a - b,
                    Opcode::BoolAnd => (a != 0 && b != 0) as i64,
                    Opcode::BoolOr => (a != 0 || b != 0) as i64,
                    Opcode::NumEqual | Opcode::NumEqualVerify => (a == b) as i64,
                    Opcode::NumNotEqual => (a != b) as i64,
                    Opcode::LessThan => (a < b) as i64,
                    Opcode::GreaterThan => (a > b) as i64,
                    Opcode::LessThanOrEqual => (a <= b) as i64,
                    Opcode::GreaterThanOrEqual => (a >= b) as i64,
                    Opcode::Min => a.min(b),
                    _ => a.max(b),
                };
                stack.truncate(stack.len() - 2);
                if op == Opcode::NumEqualVerify {
                    if result == 0 {
                        return Err(ScriptError::NumEqualVerify);
                    }
                } else {
                    stack.push(script_num_to_vec(result));
                }
            }
            Opcode::Within => {
                require(stack, 3)?;
                let x = parse_script_num(top(stack, 3)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                let min = parse_script_num(top(stack, 2)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                let max = parse_script_num(top(stack, 1)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
                stack.truncate(stack.len() - 3);
                stack.push(bool_to_vec(min <= x && x < max));
            }
            Opcode::Ripemd160 => {
                let data = pop(stack)?;
                let mut hasher = Ripemd160::new();
                hasher.update(data);
                stack.push(hasher.finalize().to_vec());
            }
            Opcode::Sha1 => {
                let data = pop(stack)?;
                let mut hasher = Sha1::new();
                hasher.update(data);
                stack.push(hasher.finalize().to_vec());
            }
            Opcode::Sha256 => {
                let data = pop(stack)?;
                stack.push(sha256(&data).to_vec());
            }
            Opcode::Hash160 => {
                let data = pop(stack)?;
                stack.push(hash160(&data).to_vec());
            }
            Opcode::Hash256 => {
                let data = pop(stack)?;
                stack.push(sha256d(&data).to_vec());
            }
            Opcode::CodeSeparator => {
                code_start = position;
            }
            Opcode::CheckSig | Opcode::CheckSigVerify => {
                require(stack, 2)?;
                let sig = top(stack, 2)?.clone();
                let pubkey = top(stack, 1)?.clone();
                let mut script_code = script[code_start..].to_vec();
                if sigversion == SigVersion::Base {
                    let found = find_and_delete_signature(&mut script_code, &sig);
                    if found > 0 && (flags & SCRIPT_VERIFY_CONST_SCRIPTCODE) != 0 {
                        return Err(ScriptError::SigFindAndDelete);
                    }
                }
                check_signature_encoding(&sig, flags)?;
                check_pubkey_encoding(&pubkey, flags, sigversion)?;
                let success = checker.check_sig(&sig, &pubkey, &script_code, sigversion);
                if !success && (flags & SCRIPT_VERIFY_NULLFAIL) != 0 && !sig.is_empty() {
                    return Err(ScriptError::SigNullFail);
                }
                stack.truncate(stack.len() - 2);
                if op == Opcode::CheckSigVerify {
                    if !success {
                        return Err(ScriptError::CheckSigVerify);
                    }
                } else {
                    stack.push(bool_to_vec(success));
                }
            }
            Opcode::CheckMultiSig | Opcode::CheckMultiSigVerify => {
                let success = eval_checkmultisig(
                    stack,
                    &script[code_start..],
                    flags,
                    checker,
                    sigversion,
                    &mut op_count,
                )?;
                if op == Opcode::CheckMultiSigVerify {
                    if !success {
                        return Err(ScriptError::CheckMultiSigVerify);
                    }
                } else {
                    stack.push(bool_to_vec(success));
                }
            }
            Opcode::Reserved
            | Opcode::Ver
            | Opcode::VerIf
            | Opcode::VerNotIf
            | Opcode::Reserved1
            | Opcode::Reserved2
            | Opcode::Cat
            | Opcode::Substr
            | Opcode::Left
            | Opcode::Right
            | Opcode::Invert
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::TwoMul
            | Opcode::TwoDiv
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::LShift
            | Opcode::RShift => return Err(ScriptError::BadOpcode),
        }

        check_stack_size(stack, &alt_stack)?;
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

/// Runs OP_CHECKMULTISIG against the stack, leaving the result for the caller to push.
fn eval_checkmultisig<C: SignatureChecker + ?Sized>(
    stack: &mut Vec<Vec<u8>>,
    script_code: &[u8],
    flags: ScriptFlags,
    checker: &C,
    sigversion: SigVersion,
    op_count: &mut usize,
) -> Result<bool, ScriptError> {
    let require_minimal = (flags & SCRIPT_VERIFY_MINIMALDATA) != 0;

    let mut i = 1usize;
    let key_count = parse_script_num(top(stack, i)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
    if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
        return Err(ScriptError::PubkeyCount);
    }
    let mut keys_left = key_count as usize;
    *op_count += keys_left;
    if *op_count > MAX_OPS_PER_SCRIPT {
        return Err(ScriptError::OpCount);
    }
    i += 1;
    let mut key_index = i;
    // Keys not yet consumed whose signatures must be null under NULLFAIL.
    let mut nullfail_skip = keys_left + 2;
    i += keys_left;
    let sig_count = parse_script_num(top(stack, i)?, require_minimal, DEFAULT_MAX_NUM_SIZE)?;
    if sig_count < 0 || sig_count as usize > keys_left {
        return Err(ScriptError::SigCount);
    }
    let mut sigs_left = sig_count as usize;
    i += 1;
    let mut sig_index = i;
    i += sigs_left;
    require(stack, i)?;

    let mut script_code = script_code.to_vec();
    if sigversion == SigVersion::Base {
        for k in 0..sigs_left {
            let sig = top(stack, sig_index + k)?.clone();
            let found = find_and_delete_signature(&mut script_code, &sig);
            if found > 0 && (flags & SCRIPT_VERIFY_CONST_SCRIPTCODE) != 0 {
                return Err(ScriptError::SigFindAndDelete);
            }
        }
    }

    let mut success = true;
    while success && sigs_left > 0 {
        let sig = top(stack, sig_index)?;
        let pubkey = top(stack, key_index)?;
        check_signature_encoding(sig, flags)?;
        check_pubkey_encoding(pubkey, flags, sigversion)?;
        if checker.check_sig(sig, pubkey, &script_code, sigversion) {
            sig_index += 1;
            sigs_left -= 1;
        }
        key_index += 1;
        keys_left -= 1;
        if sigs_left > keys_left {
            success = false;
        }
    }

    // Pop every argument except the dummy element.
    while i > 1 {
        i -= 1;
        if !success
            && (flags & SCRIPT_VERIFY_NULLFAIL) != 0
            && nullfail_skip == 0
            && !top(stack, 1)?.is_empty()
        {
            return Err(ScriptError::SigNullFail);
        }
        nullfail_skip = nullfail_skip.saturating_sub(1);
        stack.pop();
    }

    let dummy = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
    if (flags & SCRIPT_VERIFY_NULLDUMMY) != 0 && !dummy.is_empty() {
        return Err(ScriptError::SigNullDummy);
    }
    Ok(success)
}

/// Removes every push of `sig` found at an instruction boundary.
pub fn find_and_delete_signature(script: &mut Vec<u8>, sig: &[u8]) -> usize {
    if sig.is_empty() {
        return 0;
    }
    let mut pattern = Vec::with_capacity(sig.len() + 5);
    push_data(&mut pattern, sig);
    find_and_delete(script, &pattern)
}

fn find_and_delete(script: &mut Vec<u8>, pattern: &[u8]) -> usize {
    let mut found = 0usize;
    let mut result = Vec::with_capacity(script.len());
    let mut cursor = 0usize;
    let mut kept_from = 0usize;
    loop {
        result.extend_from_slice(&script[kept_from..cursor]);
        while script.len() - cursor >= pattern.len() && script[cursor..].starts_with(pattern) {
            cursor += pattern.len();
            found += 1;
        }
        kept_from = cursor;
        let mut instructions = Instructions::new(&script[cursor..]);
        match instructions.next() {
            Some(Ok((advance, _))) => cursor += advance,
            _ => break,
        }
    }
    if found > 0 {
        result.extend_from_slice(&script[kept_from..]);
        *script = result;
    }
    found
}

fn check_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    // An empty signature is a compact way to provide an invalid one.
    if sig.is_empty() {
        return Ok(());
    }
    if (flags & (SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_LOW_S | SCRIPT_VERIFY_STRICTENC)) != 0
        && !is_valid_signature_encoding(sig)
    {
        return Err(ScriptError::SigDer);
    }
    if (flags & SCRIPT_VERIFY_LOW_S) != 0 && !is_low_der_signature(sig) {
        return Err(ScriptError::SigHighS);
    }
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 {
        let hash_type = sig[sig.len() - 1] as u32;
        if !SighashType(hash_type).is_defined() {
            return Err(ScriptError::SigHashType);
        }
    }
    Ok(())
}

fn check_pubkey_encoding(
    pubkey: &[u8],
    flags: ScriptFlags,
    sigversion: SigVersion,
) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 && !is_compressed_or_uncompressed_pubkey(pubkey) {
        return Err(ScriptError::PubkeyType);
    }
    if (flags & SCRIPT_VERIFY_WITNESS_PUBKEYTYPE) != 0
        && sigversion == SigVersion::WitnessV0
        && !is_compressed_pubkey(pubkey)
    {
        return Err(ScriptError::WitnessPubkeyType);
    }
    Ok(())
}

/// Strict DER with a trailing hash type byte (BIP66).
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    let size = sig.len();
    if !(9..=73).contains(&size) {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != size - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= size {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != size {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

fn is_low_der_signature(sig: &[u8]) -> bool {
    if !is_valid_signature_encoding(sig) {
        return false;
    }
    let Ok(parsed) = Signature::from_der_lax(&sig[..sig.len() - 1]) else {
        return false;
    };
    let mut normalized = parsed;
    normalized.normalize_s();
    normalized == parsed
}

pub fn is_compressed_or_uncompressed_pubkey(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x04) => pubkey.len() == 65,
        Some(0x02) | Some(0x03) => pubkey.len() == 33,
        _ => false,
    }
}

pub fn is_compressed_pubkey(pubkey: &[u8]) -> bool {
    pubkey.len() == 33 && matches!(pubkey[0], 0x02 | 0x03)
}

fn check_stack_size(stack: &[Vec<u8>], alt_stack: &[Vec<u8>]) -> Result<(), ScriptError> {
    if stack.len() + alt_stack.len() > MAX_STACK_SIZE {
        return Err(ScriptError::StackSize);
    }
    Ok(())
}

fn require(stack: &[Vec<u8>], depth: usize) -> Result<(), ScriptError> {
    if stack.len() < depth {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(())
}

/// Element `depth` positions from the top; depth 1 is the top.
fn top(stack: &[Vec<u8>], depth: usize) -> Result<&Vec<u8>, ScriptError> {
    require(stack, depth)?;
    Ok(&stack[stack.len() - depth])
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn bool_to_vec(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}
