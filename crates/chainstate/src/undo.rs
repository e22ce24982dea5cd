use utxod_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use utxod_primitives::outpoint::OutPoint;

use crate::utxo::UtxoEntry;

const BLOCK_UNDO_VERSION: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

/// Outputs a connected block consumed, in input order across its
/// non-coinbase transactions. Disconnecting replays them in reverse.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub spent: Vec<SpentOutput>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.spent.len() as u64);
        for spent in &self.spent {
            spent.outpoint.consensus_encode(&mut encoder);
            encoder.write_var_bytes(&spent.entry.encode());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let spent_len = decoder.read_varint()? as usize;
        let mut spent = Vec::with_capacity(spent_len.min(decoder.remaining() / 36));
        for _ in 0..spent_len {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let entry_bytes = decoder.read_var_bytes()?;
            let entry = UtxoEntry::decode(&entry_bytes)
                .map_err(|_| DecodeError::InvalidData("invalid utxo entry in undo"))?;
            spent.push(SpentOutput { outpoint, entry });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { spent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = BlockUndo::default().encode();
        bytes[0] = 9;
        assert!(matches!(
            BlockUndo::decode(&bytes),
            Err(DecodeError::InvalidData(_))
        ));
    }

    #[test]
    fn preserves_spend_order() {
        let undo = BlockUndo {
            spent: (0..3u32)
                .map(|index| SpentOutput {
                    outpoint: OutPoint::new([index as u8; 32], index),
                    entry: UtxoEntry {
                        value: 1_000 + index as i64,
                        script_pubkey: vec![0x51],
                        height: 5,
                        is_coinbase: index == 0,
                    },
                })
                .collect(),
        };
        assert_eq!(BlockUndo::decode(&undo.encode()).expect("decode"), undo);
    }
}
