use utxod_consensus::{consensus_params, Network};
use utxod_pow::difficulty::{
    calculate_next_work_required, compact_to_target, compact_to_u256, hash_meets_target,
    target_to_compact, CompactError, HeaderInfo,
};

#[test]
fn compact_to_target_roundtrip() {
    let bits = 0x1d00ffff;
    let target = compact_to_target(bits).expect("target");
    let back = target_to_compact(&target);
    assert_eq!(back, bits);
}

#[test]
fn compact_target_layout() {
    let bits = 0x207fffff;
    let target = compact_to_target(bits).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29], 0xff);
    assert_eq!(target[30], 0xff);
    assert_eq!(target[31], 0x7f);
}

#[test]
fn compact_sign_and_overflow() {
    assert_eq!(compact_to_u256(0x0492_3456), Err(CompactError::Negative));
    assert_eq!(compact_to_u256(0xff12_3456), Err(CompactError::Overflow));
    // A set sign bit with a zero mantissa is just zero.
    assert!(compact_to_u256(0x0080_0000).expect("zero").is_zero());
}

#[test]
fn hash_meets_target_cmp() {
    let target = [0x10u8; 32];
    let smaller = [0x00u8; 32];
    let larger = [0xffu8; 32];
    assert!(hash_meets_target(&smaller, &target));
    assert!(!hash_meets_target(&larger, &target));
}

fn retarget(first_time: i64, last_height: i64, last_time: i64, bits: u32) -> u32 {
    let params = consensus_params(Network::Mainnet);
    let last = HeaderInfo {
        height: last_height,
        time: last_time,
        bits,
    };
    calculate_next_work_required(&last, first_time, &params).expect("retarget")
}

#[test]
fn mainnet_retarget_vectors() {
    assert_eq!(
        retarget(1_261_130_161, 32_255, 1_262_152_739, 0x1d00ffff),
        0x1d00d86a
    );
    // Clamped at the proof-of-work limit.
    assert_eq!(
        retarget(1_231_006_505, 2_015, 1_233_061_996, 0x1d00ffff),
        0x1d00ffff
    );
    // Actual timespan below a quarter of the target.
    assert_eq!(
        retarget(1_279_008_237, 68_543, 1_279_297_671, 0x1c05a3f4),
        0x1c0168fd
    );
    // Actual timespan above four times the target.
    assert_eq!(
        retarget(1_263_163_443, 46_367, 1_269_211_443, 0x1c387f6f),
        0x1d00e1fd
    );
}
