use std::sync::OnceLock;

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};
use utxod_consensus::Hash256;

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

/// Verifies a low-S normalized signature over a 32-byte sighash.
pub(crate) fn verify_digest(digest: Hash256, sig: &Signature, pubkey: &PublicKey) -> bool {
    let msg = Message::from_digest(digest);
    secp256k1_verify().verify_ecdsa(&msg, sig, pubkey).is_ok()
}
