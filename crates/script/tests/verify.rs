use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use utxod_primitives::hash::{hash160, sha256};
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};
use utxod_primitives::OutPoint;
use utxod_script::interpreter::{
    p2wpkh_script_code, verify_input, ScriptError, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY,
    SCRIPT_VERIFY_NULLFAIL, SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_WITNESS,
    STANDARD_SCRIPT_VERIFY_FLAGS,
};
use utxod_script::opcode::{push_data, push_int, Opcode};
use utxod_script::sighash::{signature_hash, SigVersion, SighashType, SIGHASH_ALL};
use utxod_script::standard::{multisig_script, p2pkh_script, p2sh_script, p2wpkh_script, p2wsh_script};

const AMOUNT: i64 = 50_000;

fn key(seed: u8) -> (SecretKey, Vec<u8>) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[seed; 32]).expect("secret key");
    let public = PublicKey::from_secret_key(&secp, &secret).serialize().to_vec();
    (secret, public)
}

fn spending_tx() -> Transaction {
    Transaction {
        version: 2,
        vin: vec![TxIn::new(OutPoint::new([7; 32], 0), Vec::new(), 0xffff_fffe)],
        vout: vec![TxOut {
            value: AMOUNT - 1_000,
            script_pubkey: p2pkh_script(&[0x42; 20]),
        }],
        lock_time: 0,
    }
}

fn sign(tx: &Transaction, secret: &SecretKey, script_code: &[u8], sigversion: SigVersion) -> Vec<u8> {
    let digest = signature_hash(
        tx,
        0,
        script_code,
        AMOUNT,
        SighashType(SIGHASH_ALL),
        sigversion,
        None,
    );
    let secp = Secp256k1::new();
    let sig = secp.sign_ecdsa(&Message::from_digest(digest), secret);
    let mut out = sig.serialize_der().to_vec();
    out.push(SIGHASH_ALL as u8);
    out
}

#[test]
fn p2pkh_spend_verifies() {
    let (secret, public) = key(1);
    let script_pubkey = p2pkh_script(&hash160(&public));
    let mut tx = spending_tx();
    let sig = sign(&tx, &secret, &script_pubkey, SigVersion::Base);
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &sig);
    push_data(&mut script_sig, &public);
    tx.vin[0].script_sig = script_sig;

    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, STANDARD_SCRIPT_VERIFY_FLAGS, None),
        Ok(())
    );

    // Changing an output invalidates the SIGHASH_ALL signature.
    let mut tampered = tx.clone();
    tampered.vout[0].value -= 1;
    assert_eq!(
        verify_input(&tampered, 0, &script_pubkey, AMOUNT, SCRIPT_VERIFY_P2SH, None),
        Err(ScriptError::EvalFalse)
    );
    assert_eq!(
        verify_input(&tampered, 0, &script_pubkey, AMOUNT, SCRIPT_VERIFY_NULLFAIL, None),
        Err(ScriptError::SigNullFail)
    );
}

#[test]
fn p2wpkh_spend_commits_to_amount() {
    let (secret, public) = key(2);
    let program = hash160(&public);
    let script_pubkey = p2wpkh_script(&program);
    let mut tx = spending_tx();
    let sig = sign(&tx, &secret, &p2wpkh_script_code(&program), SigVersion::WitnessV0);
    tx.vin[0].witness = vec![sig, public];

    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, STANDARD_SCRIPT_VERIFY_FLAGS, None),
        Ok(())
    );
    assert!(verify_input(&tx, 0, &script_pubkey, AMOUNT + 1, STANDARD_SCRIPT_VERIFY_FLAGS, None).is_err());

    let mut malleated = tx.clone();
    malleated.vin[0].script_sig = vec![0x00];
    assert_eq!(
        verify_input(&malleated, 0, &script_pubkey, AMOUNT, STANDARD_SCRIPT_VERIFY_FLAGS, None),
        Err(ScriptError::WitnessMalleated)
    );
}

#[test]
fn witness_on_legacy_output_is_unexpected() {
    let (secret, public) = key(3);
    let script_pubkey = p2pkh_script(&hash160(&public));
    let mut tx = spending_tx();
    let sig = sign(&tx, &secret, &script_pubkey, SigVersion::Base);
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &sig);
    push_data(&mut script_sig, &public);
    tx.vin[0].script_sig = script_sig;
    tx.vin[0].witness = vec![vec![0x01]];

    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_WITNESS, None),
        Err(ScriptError::WitnessUnexpected)
    );
    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, SCRIPT_VERIFY_P2SH, None),
        Ok(())
    );
}

#[test]
fn p2sh_two_of_three_multisig() {
    let keys: Vec<(SecretKey, Vec<u8>)> = (10..13).map(key).collect();
    let pubkeys: Vec<Vec<u8>> = keys.iter().map(|(_, public)| public.clone()).collect();
    let redeem = multisig_script(2, &pubkeys);
    let script_pubkey = p2sh_script(&hash160(&redeem));
    let mut tx = spending_tx();

    let sig_a = sign(&tx, &keys[0].0, &redeem, SigVersion::Base);
    let sig_c = sign(&tx, &keys[2].0, &redeem, SigVersion::Base);
    let mut script_sig = vec![0x00];
    push_data(&mut script_sig, &sig_a);
    push_data(&mut script_sig, &sig_c);
    push_data(&mut script_sig, &redeem);
    tx.vin[0].script_sig = script_sig;
    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, STANDARD_SCRIPT_VERIFY_FLAGS, None),
        Ok(())
    );

    // Signatures out of key order cannot be matched.
    let mut swapped = Vec::new();
    push_int(&mut swapped, 0);
    push_data(&mut swapped, &sig_c);
    push_data(&mut swapped, &sig_a);
    push_data(&mut swapped, &redeem);
    tx.vin[0].script_sig = swapped;
    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, SCRIPT_VERIFY_P2SH, None),
        Err(ScriptError::EvalFalse)
    );
}

#[test]
fn p2wsh_pay_to_pubkey() {
    let (secret, public) = key(4);
    let mut witness_script = Vec::new();
    push_data(&mut witness_script, &public);
    witness_script.push(Opcode::CheckSig.byte());
    let script_pubkey = p2wsh_script(&sha256(&witness_script));
    let mut tx = spending_tx();
    let sig = sign(&tx, &secret, &witness_script, SigVersion::WitnessV0);
    tx.vin[0].witness = vec![sig, witness_script.clone()];
    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, STANDARD_SCRIPT_VERIFY_FLAGS, None),
        Ok(())
    );

    let mut wrong_script = witness_script.clone();
    wrong_script.insert(0, Opcode::Nop.byte());
    tx.vin[0].witness[1] = wrong_script;
    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, STANDARD_SCRIPT_VERIFY_FLAGS, None),
        Err(ScriptError::WitnessProgramMismatch)
    );

    tx.vin[0].witness.clear();
    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, STANDARD_SCRIPT_VERIFY_FLAGS, None),
        Err(ScriptError::WitnessProgramWitnessEmpty)
    );
}

#[test]
fn checklocktimeverify_against_transaction_lock_time() {
    let mut script_pubkey = Vec::new();
    push_int(&mut script_pubkey, 100);
    script_pubkey.push(Opcode::CheckLockTimeVerify.byte());

    let mut tx = spending_tx();
    tx.lock_time = 99;
    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, None),
        Err(ScriptError::UnsatisfiedLockTime)
    );
    tx.lock_time = 100;
    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, None),
        Ok(())
    );
    // Without the flag the opcode is a NOP.
    tx.lock_time = 0;
    assert_eq!(verify_input(&tx, 0, &script_pubkey, AMOUNT, 0, None), Ok(()));

    tx.lock_time = 100;
    tx.vin[0].sequence = 0xffff_ffff;
    assert_eq!(
        verify_input(&tx, 0, &script_pubkey, AMOUNT, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, None),
        Err(ScriptError::UnsatisfiedLockTime)
    );
}
