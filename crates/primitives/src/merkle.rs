//! Transaction merkle trees.

use utxod_consensus::Hash256;

use crate::hash::sha256d;
use crate::transaction::Transaction;

/// Computes the merkle root and reports whether any level contained two
/// identical adjacent hashes, which lets distinct transaction lists share a root.
pub fn merkle_root(hashes: &[Hash256]) -> (Hash256, bool) {
    if hashes.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = hashes.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        for pair in layer.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if layer.len() % 2 == 1 {
            let last = layer[layer.len() - 1];
            layer.push(last);
        }
        layer = layer
            .chunks_exact(2)
            .map(|pair| {
                let mut data = [0u8; 64];
                data[..32].copy_from_slice(&pair[0]);
                data[32..].copy_from_slice(&pair[1]);
                sha256d(&data)
            })
            .collect();
    }
    (layer[0], mutated)
}

/// Merkle root over witness ids with the coinbase slot zeroed (BIP141).
pub fn witness_merkle_root(transactions: &[Transaction]) -> Hash256 {
    let leaves: Vec<Hash256> = transactions
        .iter()
        .enumerate()
        .map(|(index, tx)| if index == 0 { [0u8; 32] } else { tx.wtxid() })
        .collect();
    merkle_root(&leaves).0
}
