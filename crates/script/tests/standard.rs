use utxod_script::standard::{
    classify_script_pubkey, is_standard_script_pubkey, is_standard_script_sig, is_unspendable,
    multisig_script, null_data_script, witness_program, ScriptType,
};

#[test]
fn classify_p2pkh() {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[0x11; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Pkh);
}

#[test]
fn classify_p2sh() {
    let mut script = vec![0xa9, 0x14];
    script.extend_from_slice(&[0x22; 20]);
    script.push(0x87);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Sh);
}

#[test]
fn classify_p2wpkh() {
    let mut script = vec![0x00, 0x14];
    script.extend_from_slice(&[0x33; 20]);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Wpkh);
}

#[test]
fn classify_p2wsh() {
    let mut script = vec![0x00, 0x20];
    script.extend_from_slice(&[0x44; 32]);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Wsh);
    assert_eq!(witness_program(&script), Some((0, &script[2..])));
}

#[test]
fn classify_p2pk() {
    let mut script = vec![33];
    script.extend_from_slice(&[0x02; 33]);
    script.push(0xac);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Pk);
}

#[test]
fn classify_future_witness_version() {
    let mut script = vec![0x51, 0x20];
    script.extend_from_slice(&[0x55; 32]);
    assert_eq!(classify_script_pubkey(&script), ScriptType::WitnessUnknown);
    assert!(is_standard_script_pubkey(&script));
}

#[test]
fn classify_multisig_and_relay_limits() {
    let keys: Vec<Vec<u8>> = (0..3u8)
        .map(|i| {
            let mut key = vec![0x03; 33];
            key[1] = i;
            key
        })
        .collect();
    let two_of_three = multisig_script(2, &keys);
    assert_eq!(
        classify_script_pubkey(&two_of_three),
        ScriptType::MultiSig {
            required: 2,
            keys: 3
        }
    );
    assert!(is_standard_script_pubkey(&two_of_three));

    let mut four = keys.clone();
    four.push(vec![0x02; 33]);
    assert!(!is_standard_script_pubkey(&multisig_script(1, &four)));
    assert_eq!(
        classify_script_pubkey(&multisig_script(4, &keys)),
        ScriptType::Unknown
    );
}

#[test]
fn null_data_size_limit() {
    let small = null_data_script(&[0xab; 80]);
    assert_eq!(classify_script_pubkey(&small), ScriptType::NullData);
    assert!(is_standard_script_pubkey(&small));
    assert!(is_unspendable(&small));

    let large = null_data_script(&[0xab; 81]);
    assert!(!is_standard_script_pubkey(&large));
}

#[test]
fn classify_unknown() {
    let script = vec![0x51];
    assert_eq!(classify_script_pubkey(&script), ScriptType::Unknown);
    assert!(!is_standard_script_pubkey(&script));
}

#[test]
fn script_sig_must_be_push_only() {
    assert!(is_standard_script_sig(&[0x00, 0x01, 0x02]));
    assert!(!is_standard_script_sig(&[0x76]));
    assert!(!is_standard_script_sig(&vec![0x00; 1651]));
}
