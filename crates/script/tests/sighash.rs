use utxod_primitives::hex::{bytes_to_hex, hex_to_bytes};
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};
use utxod_primitives::OutPoint;
use utxod_script::sighash::{
    legacy_signature_hash, signature_hash, PrecomputedTxData, SigVersion, SighashType,
    SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_NONE, SIGHASH_ONE, SIGHASH_SINGLE,
};

#[test]
fn sighash_type_flags() {
    let combined = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
    assert_eq!(combined.base_type(), SIGHASH_ALL);
    assert!(combined.has_anyone_can_pay());
    assert!(combined.is_defined());

    let none = SighashType(SIGHASH_NONE);
    assert_eq!(none.base_type(), SIGHASH_NONE);
    assert!(!none.has_anyone_can_pay());

    let single = SighashType(SIGHASH_SINGLE | SIGHASH_ANYONECANPAY);
    assert_eq!(single.base_type(), SIGHASH_SINGLE);
    assert!(single.has_anyone_can_pay());

    assert!(!SighashType(0).is_defined());
    assert!(!SighashType(0x04).is_defined());
    assert!(!SighashType(0x21).is_defined());
}

/// The native P2WPKH example from BIP143.
#[test]
fn bip143_native_p2wpkh_vector() {
    let raw = hex_to_bytes(concat!(
        "0100000002fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f",
        "0000000000eeffffffef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57",
        "b90ec68a0100000000ffffffff02202cb206000000001976a9148280b37df378db99f66f85",
        "c95a783a76ac7a6d5988ac9093510d000000001976a9143bde42dbee7e4dbe6a21b2d50ce2",
        "f0167faa815988ac11000000"
    ))
    .expect("hex");
    let tx = Transaction::consensus_decode(&raw).expect("decode");
    let script_code =
        hex_to_bytes("76a9141d0f172a0ecb48aee1be1f2687d2963ae33f71a188ac").expect("hex");

    let precomputed = PrecomputedTxData::new(&tx);
    assert_eq!(
        bytes_to_hex(&precomputed.hash_prevouts),
        "96b827c8483d4e9b96712b6713a7b68d6e8003a781feba36c31143470b4efd37"
    );
    assert_eq!(
        bytes_to_hex(&precomputed.hash_sequence),
        "52b0a642eea2fb7ae638c36f6252b6750293dbe574a806984b8e4d8548339a3b"
    );
    assert_eq!(
        bytes_to_hex(&precomputed.hash_outputs),
        "863ef3e1a92afbfdb97f31ad0fc7683ee943e9abcf2501590ff8f6551f47e5e5"
    );

    let expected = "c37af31116d1b27caf68aae9e3ac82f1477929014d5b917657d0eb49478cb670";
    let with_cache = signature_hash(
        &tx,
        1,
        &script_code,
        600_000_000,
        SighashType(SIGHASH_ALL),
        SigVersion::WitnessV0,
        Some(&precomputed),
    );
    let without_cache = signature_hash(
        &tx,
        1,
        &script_code,
        600_000_000,
        SighashType(SIGHASH_ALL),
        SigVersion::WitnessV0,
        None,
    );
    assert_eq!(bytes_to_hex(&with_cache), expected);
    assert_eq!(with_cache, without_cache);
}

fn two_in_one_out() -> Transaction {
    Transaction {
        version: 1,
        vin: vec![
            TxIn::new(OutPoint::new([1; 32], 0), Vec::new(), 0xffff_ffff),
            TxIn::new(OutPoint::new([2; 32], 1), Vec::new(), 0xffff_ffff),
        ],
        vout: vec![TxOut {
            value: 1_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

#[test]
fn legacy_single_without_matching_output_hashes_to_one() {
    let tx = two_in_one_out();
    let hash = legacy_signature_hash(&tx, 1, &[0x51], SighashType(SIGHASH_SINGLE));
    assert_eq!(hash, SIGHASH_ONE);
    let in_range = legacy_signature_hash(&tx, 0, &[0x51], SighashType(SIGHASH_SINGLE));
    assert_ne!(in_range, SIGHASH_ONE);
    assert_eq!(
        legacy_signature_hash(&tx, 5, &[0x51], SighashType(SIGHASH_ALL)),
        SIGHASH_ONE
    );
}

#[test]
fn legacy_hash_ignores_code_separators_and_other_inputs_under_anyonecanpay() {
    let tx = two_in_one_out();
    let plain = legacy_signature_hash(&tx, 0, &[0x51, 0x51], SighashType(SIGHASH_ALL));
    let separated = legacy_signature_hash(&tx, 0, &[0x51, 0xab, 0x51], SighashType(SIGHASH_ALL));
    assert_eq!(plain, separated);

    let acp = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
    let mut other = tx.clone();
    other.vin[1].prevout = OutPoint::new([9; 32], 7);
    assert_eq!(
        legacy_signature_hash(&tx, 0, &[0x51], acp),
        legacy_signature_hash(&other, 0, &[0x51], acp)
    );
    assert_ne!(
        legacy_signature_hash(&tx, 0, &[0x51], SighashType(SIGHASH_ALL)),
        legacy_signature_hash(&other, 0, &[0x51], SighashType(SIGHASH_ALL))
    );
}
