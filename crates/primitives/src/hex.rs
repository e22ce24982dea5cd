//! Hex helpers for logs, config and tests.

use utxod_consensus::Hash256;

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

/// Display order: most significant byte first, the reverse of the stored bytes.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    bytes_to_hex(&reversed)
}

pub fn hex_to_bytes(input: &str) -> Option<Vec<u8>> {
    let input = input.trim();
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(input.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip_and_rejects_odd_input() {
        assert_eq!(bytes_to_hex(&[0x00, 0xab, 0x7f]), "00ab7f");
        assert_eq!(hex_to_bytes("00ab7f"), Some(vec![0x00, 0xab, 0x7f]));
        assert_eq!(hex_to_bytes("abc"), None);
        assert_eq!(hex_to_bytes("zz"), None);

        let mut hash = [0u8; 32];
        hash[0] = 0x01;
        assert!(hash256_to_hex(&hash).ends_with("01"));
    }
}
