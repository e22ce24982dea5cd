//! Transaction types and serialization (BIP144 witness layout).

use utxod_consensus::constants::{SEQUENCE_FINAL, WITNESS_SCALE_FACTOR};
use utxod_consensus::money::{money_range, Amount};
use utxod_consensus::Hash256;

use crate::encoding::{
    read_vec, varint_len, write_vec, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

const WITNESS_MARKER: u8 = 0x00;
const WITNESS_FLAG: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Witness stack; empty for inputs without witness data.
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        }
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self::new(prevout, script_sig, sequence))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    /// Full serialization, including witness data when present.
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder, self.has_witness());
        encoder.into_inner()
    }

    /// Serialization with witness data stripped; this is what the txid commits to.
    pub fn consensus_encode_without_witness(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder, false);
        encoder.into_inner()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode_without_witness())
    }

    pub fn wtxid(&self) -> Hash256 {
        if self.is_coinbase() {
            return [0u8; 32];
        }
        sha256d(&self.consensus_encode())
    }

    pub fn base_size(&self) -> usize {
        let mut size = 4 + varint_len(self.vin.len() as u64) + 4;
        for input in &self.vin {
            size += 36 + varint_len(input.script_sig.len() as u64) + input.script_sig.len() + 4;
        }
        size += varint_len(self.vout.len() as u64);
        for output in &self.vout {
            size += 8 + varint_len(output.script_pubkey.len() as u64) + output.script_pubkey.len();
        }
        size
    }

    pub fn total_size(&self) -> usize {
        if !self.has_witness() {
            return self.base_size();
        }
        let mut size = self.base_size() + 2;
        for input in &self.vin {
            size += varint_len(input.witness.len() as u64);
            for item in &input.witness {
                size += varint_len(item.len() as u64) + item.len();
            }
        }
        size
    }

    pub fn weight(&self) -> u64 {
        let base = self.base_size() as u64;
        let total = self.total_size() as u64;
        base * (WITNESS_SCALE_FACTOR as u64 - 1) + total
    }

    /// Virtual size in bytes, rounded up.
    pub fn vsize(&self) -> u64 {
        self.weight().div_ceil(WITNESS_SCALE_FACTOR as u64)
    }

    /// Sum of output values, or `None` if any value or the running sum leaves the money range.
    pub fn value_out(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.vout {
            if !money_range(output.value) {
                return None;
            }
            total = total.checked_add(output.value)?;
            if !money_range(total) {
                return None;
            }
        }
        Some(total)
    }

    /// True when any input opts into replacement (BIP125).
    pub fn signals_rbf(&self) -> bool {
        self.vin
            .iter()
            .any(|input| input.sequence < SEQUENCE_FINAL - 1)
    }

    fn encode_into(&self, encoder: &mut Encoder, with_witness: bool) {
        encoder.write_i32_le(self.version);
        if with_witness {
            encoder.write_u8(WITNESS_MARKER);
            encoder.write_u8(WITNESS_FLAG);
        }
        write_vec(encoder, &self.vin);
        write_vec(encoder, &self.vout);
        if with_witness {
            for input in &self.vin {
                encoder.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, TransactionDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(TransactionDecodeError::Decode(DecodeError::TrailingBytes));
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, TransactionDecodeError> {
        let version = decoder.read_i32_le()?;
        let mut vin: Vec<TxIn> = read_vec(decoder)?;
        let mut flags = 0u8;
        let vout = if vin.is_empty() {
            // An empty input list is the extended-format marker; a zero flag
            // byte here doubles as an empty output list.
            flags = decoder.read_u8()?;
            if flags != 0 {
                vin = read_vec(decoder)?;
                read_vec(decoder)?
            } else {
                Vec::new()
            }
        } else {
            read_vec(decoder)?
        };

        if flags & WITNESS_FLAG != 0 {
            flags ^= WITNESS_FLAG;
            for input in vin.iter_mut() {
                let count = decoder.read_varint()?;
                let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
                let mut stack = Vec::with_capacity(count.min(decoder.remaining()));
                for _ in 0..count {
                    stack.push(decoder.read_var_bytes()?);
                }
                input.witness = stack;
            }
            if vin.iter().all(|input| input.witness.is_empty()) {
                return Err(TransactionDecodeError::InvalidTransactionFormat(
                    "superfluous witness record",
                ));
            }
        }
        if flags != 0 {
            return Err(TransactionDecodeError::InvalidTransactionFormat(
                "unknown transaction optional data",
            ));
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionDecodeError {
    Decode(DecodeError),
    InvalidTransactionFormat(&'static str),
}

impl From<DecodeError> for TransactionDecodeError {
    fn from(error: DecodeError) -> Self {
        TransactionDecodeError::Decode(error)
    }
}

impl std::fmt::Display for TransactionDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionDecodeError::Decode(error) => write!(f, "{error}"),
            TransactionDecodeError::InvalidTransactionFormat(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for TransactionDecodeError {}
