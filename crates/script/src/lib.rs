//! Script interpretation, signature hashing, and standardness rules.

pub mod interpreter;
pub mod num;
pub mod opcode;
mod secp;
pub mod sighash;
pub mod sigops;
pub mod standard;

pub use interpreter::{
    script_flags_for_height, verify_input, verify_script, ScriptError, ScriptFlags,
    SignatureChecker, TransactionSignatureChecker,
};
pub use sighash::{PrecomputedTxData, SigVersion, SighashType};
