//! JSON views for the read-only queries and transaction submission.
//!
//! The transport that carries requests is out of scope here; `dispatch`
//! maps a method name and positional params to a result or an error code.

use serde::Serialize;
use serde_json::{json, Value};
use utxod_consensus::hash256_from_hex;
use utxod_consensus::money::COIN;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::Transaction;
use utxod_primitives::{bytes_to_hex, hash256_to_hex, hex_to_bytes};
use utxod_storage::KeyValueStore;

use crate::mempool::{MempoolEntry, MempoolErrorKind};
use crate::node::{Node, NodeError};

pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
pub const RPC_INTERNAL_ERROR: i64 = -32603;
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
pub const RPC_INVALID_PARAMETER: i64 = -8;
pub const RPC_DESERIALIZATION_ERROR: i64 = -22;
pub const RPC_VERIFY_ERROR: i64 = -25;
pub const RPC_VERIFY_REJECTED: i64 = -26;
pub const RPC_VERIFY_ALREADY_IN_CHAIN: i64 = -27;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "code": self.code, "message": self.message })
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

impl From<NodeError> for RpcError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Mempool(err) => {
                let code = match err.kind {
                    MempoolErrorKind::MissingInput => RPC_VERIFY_ERROR,
                    MempoolErrorKind::AlreadyInChain => RPC_VERIFY_ALREADY_IN_CHAIN,
                    MempoolErrorKind::Internal => RPC_INTERNAL_ERROR,
                    _ => RPC_VERIFY_REJECTED,
                };
                RpcError::new(code, err.message)
            }
            other => RpcError::new(RPC_INTERNAL_ERROR, other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ChainTipView {
    hash: String,
    height: i32,
    chainwork: String,
    time: u32,
    mediantime: i64,
}

#[derive(Serialize)]
struct UtxoView {
    bestblock: String,
    confirmations: i64,
    value: f64,
    amount_sat: i64,
    script_pubkey: String,
    height: u32,
    coinbase: bool,
}

#[derive(Serialize)]
struct MempoolEntryView {
    txid: String,
    fee: i64,
    size: usize,
    vsize: u64,
    time: u64,
    height: i32,
    ancestorcount: usize,
    ancestorsize: u64,
    ancestorfees: i64,
    descendantcount: usize,
    descendantsize: u64,
    descendantfees: i64,
    depends: Vec<String>,
    spentby: Vec<String>,
    bip125_replaceable: bool,
}

#[derive(Serialize)]
struct MempoolInfoView {
    size: usize,
    bytes: usize,
    orphans: usize,
    mempoolminfee: i64,
    revision: u64,
}

pub fn dispatch<S: KeyValueStore + 'static>(
    node: &Node<S>,
    method: &str,
    params: &[Value],
) -> Result<Value, RpcError> {
    match method {
        "getchaintip" => Ok(chain_tip(node)),
        "getutxo" => {
            let txid = hash_param(params, 0)?;
            let index = params
                .get(1)
                .and_then(Value::as_u64)
                .and_then(|index| u32::try_from(index).ok())
                .ok_or_else(|| RpcError::new(RPC_INVALID_PARAMETER, "missing or invalid vout"))?;
            utxo(node, &OutPoint::new(txid, index))
        }
        "getmempoolentry" => {
            let txid = hash_param(params, 0)?;
            node.get_mempool_entry(&txid)
                .map(|entry| mempool_entry(&entry, node.is_replaceable(&txid)))
                .ok_or_else(|| {
                    RpcError::new(RPC_INVALID_ADDRESS_OR_KEY, "Transaction not in mempool")
                })
        }
        "getmempoolinfo" => Ok(mempool_info(node)),
        "sendrawtransaction" | "submittransaction" => {
            let raw = params
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::new(RPC_INVALID_PARAMETER, "missing raw transaction"))?;
            submit_transaction(node, raw)
        }
        other => Err(RpcError::new(
            RPC_METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    }
}

fn hash_param(params: &[Value], index: usize) -> Result<[u8; 32], RpcError> {
    let raw = params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::new(RPC_INVALID_PARAMETER, "missing txid"))?;
    hash256_from_hex(raw).map_err(|_| RpcError::new(RPC_INVALID_PARAMETER, "txid must be 64 hex characters"))
}

pub fn chain_tip<S: KeyValueStore + 'static>(node: &Node<S>) -> Value {
    let tip = node.get_chain_tip();
    to_json(&ChainTipView {
        hash: hash256_to_hex(&tip.hash),
        height: tip.height,
        chainwork: format!("{:064x}", tip.chainwork),
        time: tip.time,
        mediantime: tip.median_time_past,
    })
}

/// `null` unless the outpoint is unspent on the active chain.
pub fn utxo<S: KeyValueStore + 'static>(
    node: &Node<S>,
    outpoint: &OutPoint,
) -> Result<Value, RpcError> {
    let tip = node.get_chain_tip();
    let Some(entry) = node.get_utxo(outpoint)? else {
        return Ok(Value::Null);
    };
    Ok(to_json(&UtxoView {
        bestblock: hash256_to_hex(&tip.hash),
        confirmations: i64::from(tip.height) - i64::from(entry.height) + 1,
        value: entry.value as f64 / COIN as f64,
        amount_sat: entry.value,
        script_pubkey: bytes_to_hex(&entry.script_pubkey),
        height: entry.height,
        coinbase: entry.is_coinbase,
    }))
}

pub fn mempool_entry(entry: &MempoolEntry, replaceable: bool) -> Value {
    to_json(&MempoolEntryView {
        txid: hash256_to_hex(&entry.txid),
        fee: entry.fee,
        size: entry.size,
        vsize: entry.vsize,
        time: entry.time,
        height: entry.height,
        ancestorcount: entry.ancestor_count,
        ancestorsize: entry.ancestor_vsize,
        ancestorfees: entry.ancestor_fees,
        descendantcount: entry.descendant_count,
        descendantsize: entry.descendant_vsize,
        descendantfees: entry.descendant_fees,
        depends: entry.parents.iter().map(hash256_to_hex).collect(),
        spentby: entry.children.iter().map(hash256_to_hex).collect(),
        bip125_replaceable: replaceable,
    })
}

pub fn mempool_info<S: KeyValueStore + 'static>(node: &Node<S>) -> Value {
    let info = node.mempool_info();
    to_json(&MempoolInfoView {
        size: info.size,
        bytes: info.bytes,
        orphans: info.orphans,
        mempoolminfee: info.min_fee_rate,
        revision: info.revision,
    })
}

/// Decodes `raw_hex` and routes it through the writer; returns the txid.
pub fn submit_transaction<S: KeyValueStore + 'static>(
    node: &Node<S>,
    raw_hex: &str,
) -> Result<Value, RpcError> {
    let bytes = hex_to_bytes(raw_hex.trim())
        .ok_or_else(|| RpcError::new(RPC_DESERIALIZATION_ERROR, "TX decode failed"))?;
    let tx = Transaction::consensus_decode(&bytes)
        .map_err(|err| RpcError::new(RPC_DESERIALIZATION_ERROR, format!("TX decode failed: {err:?}")))?;
    let txid = tx.txid();
    for index in 0..tx.vout.len() as u32 {
        if node.get_utxo(&OutPoint::new(txid, index))?.is_some() {
            return Err(RpcError::new(
                RPC_VERIFY_ALREADY_IN_CHAIN,
                "transaction already in block chain",
            ));
        }
    }
    let acceptance = node.submit_transaction(tx)?;
    Ok(Value::String(hash256_to_hex(&acceptance.txid)))
}

fn to_json<T: Serialize>(view: &T) -> Value {
    serde_json::to_value(view).unwrap_or(Value::Null)
}
