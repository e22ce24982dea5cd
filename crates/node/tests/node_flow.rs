mod common;

use common::*;
use serde_json::json;
use utxod::interface::Severity;
use utxod::{rpc, MempoolErrorKind, NodeError, SyncConfig};
use utxod_consensus::constants::{MAX_BIP125_RBF_SEQUENCE, SEQUENCE_FINAL};
use utxod_primitives::hash256_to_hex;
use utxod_primitives::outpoint::OutPoint;

#[test]
fn submitted_transaction_is_queryable() {
    let harness = Harness::new();
    let (coin, value) = harness.coinbase_coin(1);
    let tx = spend(coin, value, 10_000, SEQUENCE_FINAL);
    let txid = tx.txid();

    let accepted = harness.node.submit_transaction(tx).expect("accepted");
    assert_eq!(accepted.txid, txid);
    assert_eq!(accepted.fee, 10_000);

    let entry = harness.node.get_mempool_entry(&txid).expect("in mempool");
    assert_eq!(entry.fee, 10_000);
    assert_eq!(entry.ancestor_count, 1);
    assert_eq!(harness.node.mempool_info().size, 1);

    let view = rpc::dispatch(&harness.node, "getmempoolentry", &[json!(hash256_to_hex(&txid))])
        .expect("rpc entry");
    assert_eq!(view["fee"], json!(10_000));
    assert_eq!(view["bip125_replaceable"], json!(false));

    // The coin stays unspent in the chain view until a block confirms it.
    assert!(harness.node.get_utxo(&coin).expect("utxo").is_some());
}

#[test]
fn double_submission_and_missing_inputs_are_rejected() {
    let harness = Harness::new();
    let (coin, value) = harness.coinbase_coin(1);
    let tx = spend(coin, value, 10_000, SEQUENCE_FINAL);
    harness.node.submit_transaction(tx.clone()).expect("accepted");

    match harness.node.submit_transaction(tx) {
        Err(NodeError::Mempool(err)) => assert_eq!(err.kind, MempoolErrorKind::AlreadyInMempool),
        other => panic!("unexpected result: {other:?}"),
    }

    let unknown = spend(OutPoint::new([9u8; 32], 0), 50_000, 1_000, SEQUENCE_FINAL);
    let err = rpc::submit_transaction(
        &harness.node,
        &utxod_primitives::bytes_to_hex(&unknown.consensus_encode()),
    )
    .expect_err("orphan");
    assert_eq!(err.code, rpc::RPC_VERIFY_ERROR);
    assert_eq!(harness.node.mempool_info().orphans, 1);
}

#[test]
fn connected_block_confirms_mempool_transaction() {
    let harness = Harness::new();
    let (coin, value) = harness.coinbase_coin(1);
    let tx = spend(coin, value, 10_000, SEQUENCE_FINAL);
    let txid = tx.txid();
    harness.node.submit_transaction(tx.clone()).expect("accepted");

    let block = mine(&harness.tip_header(), 102, 1, vec![tx.clone()]);
    harness.node.on_block_received(5, block.clone());
    harness.node.process_pending();

    assert_eq!(harness.node.get_chain_tip().hash, block.hash());
    assert!(harness.node.get_mempool_entry(&txid).is_none());
    assert!(harness.node.get_utxo(&coin).expect("utxo").is_none());
    let created = harness
        .node
        .get_utxo(&OutPoint::new(txid, 0))
        .expect("utxo")
        .expect("created output");
    assert_eq!(created.height, 102);
    assert_eq!(created.value, value - 10_000);

    match harness.node.submit_transaction(tx) {
        Err(NodeError::Mempool(err)) => assert_eq!(err.kind, MempoolErrorKind::AlreadyInChain),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(harness.node.mempool_info().orphans, 0);
}

#[test]
fn reorg_returns_transactions_to_the_mempool() {
    let harness = Harness::new();
    let parent = harness.tip_header();
    let (coin, value) = harness.coinbase_coin(1);
    let tx = spend(coin, value, 10_000, SEQUENCE_FINAL);
    let txid = tx.txid();
    harness.node.submit_transaction(tx.clone()).expect("accepted");

    let confirming = mine(&parent, 102, 1, vec![tx]);
    harness.node.submit_block(confirming.clone()).expect("queued");
    harness.node.process_pending();
    assert!(harness.node.get_mempool_entry(&txid).is_none());

    let fork_a = mine(&parent, 102, 2, Vec::new());
    let fork_b = mine(&fork_a.header, 103, 2, Vec::new());
    harness.node.submit_block(fork_a).expect("queued");
    harness.node.process_pending();
    assert_eq!(harness.node.get_chain_tip().hash, confirming.hash());

    harness.node.submit_block(fork_b.clone()).expect("queued");
    harness.node.process_pending();
    assert_eq!(harness.node.get_chain_tip().hash, fork_b.hash());
    let entry = harness.node.get_mempool_entry(&txid).expect("reinserted");
    assert_eq!(entry.fee, 10_000);
    assert!(harness.node.get_utxo(&coin).expect("utxo").is_some());
}

#[test]
fn opt_in_replacement_through_the_node() {
    let harness = Harness::new();
    let (coin, value) = harness.coinbase_coin(1);
    let original = spend(coin, value, 10_000, MAX_BIP125_RBF_SEQUENCE);
    harness.node.submit_transaction(original.clone()).expect("original");
    assert!(harness.node.is_replaceable(&original.txid()));

    let replacement = spend(coin, value, 30_000, SEQUENCE_FINAL);
    let accepted = harness
        .node
        .submit_transaction(replacement.clone())
        .expect("replacement");
    assert_eq!(accepted.replaced, vec![original.txid()]);
    assert!(harness.node.get_mempool_entry(&original.txid()).is_none());
    assert!(harness.node.get_mempool_entry(&replacement.txid()).is_some());

    // The replacement did not signal, so it is final in the pool.
    let third = spend(coin, value, 60_000, SEQUENCE_FINAL);
    match harness.node.submit_transaction(third) {
        Err(NodeError::Mempool(err)) => assert_eq!(err.kind, MempoolErrorKind::ConflictingInput),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn orphan_block_waits_for_its_parent() {
    let harness = Harness::new();
    harness.node.add_peer(7);
    harness.transport.take();

    let first = mine(&harness.tip_header(), 102, 3, Vec::new());
    let second = mine(&first.header, 103, 3, Vec::new());

    harness.node.on_block_received(7, second.clone());
    harness.node.process_pending();
    assert_eq!(harness.node.sync().orphan_block_count(), 1);
    assert!(harness
        .transport
        .take()
        .iter()
        .any(|sent| matches!(sent, Sent::Headers(7, _))));

    harness.node.on_block_received(7, first);
    harness.node.process_pending();
    assert_eq!(harness.node.sync().orphan_block_count(), 0);
    assert_eq!(harness.node.get_chain_tip().hash, second.hash());
    assert_eq!(harness.node.get_chain_tip().height, 103);
}

#[test]
fn malformed_and_invalid_blocks_penalize_the_sender() {
    let harness = Harness::new();
    harness.node.add_peer(3);
    harness.node.add_peer(4);
    harness.transport.take();
    let tip = harness.node.get_chain_tip();

    let mut mutated = mine(&harness.tip_header(), 102, 4, Vec::new());
    mutated.header.merkle_root = [0xaa; 32];
    regrind(&mut mutated.header);
    harness.node.on_block_received(3, mutated);
    harness.node.process_pending();
    assert!(harness
        .transport
        .take()
        .iter()
        .any(|sent| matches!(sent, Sent::Misbehavior(3, Severity::Minor, reason) if reason == "bad-txnmrklroot")));

    let subsidy = harness.blocks[100].transactions[0].vout[0].value;
    let greedy = mine_paying(&harness.tip_header(), 102, 5, Vec::new(), subsidy + 1);
    harness.node.on_block_received(4, greedy);
    harness.node.process_pending();
    let sent = harness.transport.take();
    assert!(
        sent.iter()
            .any(|sent| matches!(sent, Sent::Misbehavior(4, Severity::Severe, reason) if reason == "bad-cb-amount")),
        "sent: {sent:?}"
    );
    assert_eq!(harness.node.get_chain_tip(), tip);
}

#[test]
fn timed_out_block_request_moves_to_another_peer() {
    let harness = Harness::with_sync_config(SyncConfig {
        block_timeout_secs: 5,
        ..SyncConfig::default()
    });
    harness.node.add_peer(1);
    harness.node.add_peer(2);
    harness.transport.take();

    let block = mine(&harness.tip_header(), 102, 6, Vec::new());
    let hash = block.hash();
    harness.node.on_headers_received(1, vec![block.header.clone()]);
    harness.node.process_pending();

    let first = harness
        .transport
        .take()
        .into_iter()
        .find_map(|sent| match sent {
            Sent::Block(peer, requested) if requested == hash => Some(peer),
            _ => None,
        })
        .expect("block requested");
    assert_eq!(harness.node.sync().blocks_in_flight(), 1);

    harness.node.tick(utxod::mempool::now_secs() + 60);
    let retry = harness
        .transport
        .take()
        .into_iter()
        .find_map(|sent| match sent {
            Sent::Block(peer, requested) if requested == hash => Some(peer),
            _ => None,
        })
        .expect("block re-requested");
    assert_ne!(retry, first);
    assert_eq!(harness.node.sync().blocks_in_flight(), 1);

    harness.node.on_block_received(retry, block);
    harness.node.process_pending();
    assert_eq!(harness.node.get_chain_tip().hash, hash);
    assert_eq!(harness.node.sync().blocks_in_flight(), 0);
}

#[test]
fn node_writer_thread_processes_submissions() {
    let harness = Harness::new();
    harness.node.start().expect("start writer");
    assert!(harness.node.is_running());

    let (coin, value) = harness.coinbase_coin(2);
    let tx = spend(coin, value, 5_000, SEQUENCE_FINAL);
    let accepted = harness.node.submit_transaction(tx).expect("accepted");
    assert!(harness.node.get_mempool_entry(&accepted.txid).is_some());

    harness.node.shutdown();
    assert!(!harness.node.is_running());
    assert!(matches!(
        harness.node.submit_transaction(spend(coin, value, 6_000, SEQUENCE_FINAL)),
        Err(NodeError::WriterStopped)
    ));
}
