mod common;

use std::sync::Arc;

use common::*;
use utxod_chainstate::{BlockAcceptance, ChainStateError, ChainStateOptions, ValidationError};
use utxod_consensus::money::COIN;
use utxod_primitives::outpoint::OutPoint;
use utxod_storage::memory::MemoryStore;

#[test]
fn resubmitted_block_is_already_known() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = open_chain(
        Arc::new(MemoryStore::new()),
        dir.path(),
        ChainStateOptions::default(),
    );
    let genesis = genesis_header(&state);
    let a = mine(&genesis, 1, 1, Vec::new());

    let first = state.accept_block(&a, NOW).expect("accept");
    assert_eq!(
        first,
        BlockAcceptance::Stored {
            hash: a.hash(),
            height: 1
        }
    );
    state.activate_best_chain_fully().expect("activate");
    let info = state.utxo_set_info().expect("utxo info");

    let second = state.accept_block(&a, NOW).expect("accept again");
    assert_eq!(second, BlockAcceptance::AlreadyKnown);
    let steps = state.activate_best_chain_fully().expect("activate again");
    assert!(steps.is_empty());
    assert_eq!(state.utxo_set_info().expect("utxo info"), info);
    assert_eq!(state.tip().hash, a.hash());
}

#[test]
fn reorg_waits_for_more_cumulative_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = open_chain(
        Arc::new(MemoryStore::new()),
        dir.path(),
        ChainStateOptions::default(),
    );
    let genesis = genesis_header(&state);
    let a = mine(&genesis, 1, 1, Vec::new());
    let b = mine(&genesis, 1, 2, Vec::new());
    let c = mine(&b.header, 2, 2, Vec::new());

    submit(&state, &a);
    assert_eq!(state.tip().hash, a.hash());

    // Same work as A: the first block seen keeps the tip.
    submit(&state, &b);
    assert_eq!(state.tip().hash, a.hash());
    assert_eq!(
        state.utxo(&coinbase_outpoint(&b)).expect("utxo lookup"),
        None
    );

    state.accept_block(&c, NOW).expect("accept c");
    let steps = state.activate_best_chain_fully().expect("activate");
    assert_eq!(steps.len(), 1);
    let step = &steps[0];
    assert_eq!(step.disconnected.len(), 1);
    assert_eq!(step.disconnected[0].hash(), a.hash());
    let connected: Vec<_> = step.connected.iter().map(|block| block.hash()).collect();
    assert_eq!(connected, vec![b.hash(), c.hash()]);

    let tip = state.tip();
    assert_eq!(tip.hash, c.hash());
    assert_eq!(tip.height, 2);
    assert_eq!(state.utxo(&coinbase_outpoint(&a)).expect("utxo lookup"), None);
    let b_coin = state
        .utxo(&coinbase_outpoint(&b))
        .expect("utxo lookup")
        .expect("b coinbase");
    assert_eq!(b_coin.value, 50 * COIN);
    assert_eq!(b_coin.height, 1);
    assert!(b_coin.is_coinbase);
    assert!(state
        .utxo(&coinbase_outpoint(&c))
        .expect("utxo lookup")
        .is_some());
    assert_eq!(state.utxo_set_info().expect("utxo info").txouts, 2);

    let a_info = state.block_info(&a.hash()).expect("a indexed");
    assert!(!a_info.in_active_chain);
    assert!(a_info.has_data());
    assert!(!a_info.is_failed());
}

#[test]
fn disconnect_restores_spent_outputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = open_chain(
        Arc::new(MemoryStore::new()),
        dir.path(),
        ChainStateOptions::default(),
    );
    let genesis = genesis_header(&state);
    let chain = mine_chain(&genesis, 1, 101, 1);
    for block in &chain {
        state.accept_block(block, NOW).expect("accept");
    }
    state.activate_best_chain_fully().expect("activate");
    assert_eq!(state.tip().height, 101);

    let funding = coinbase_outpoint(&chain[0]);
    let before = state.utxo_set_info().expect("utxo info");
    let spent_entry = state.utxo(&funding).expect("lookup").expect("mature coinbase");

    let payment = spend(funding, 50 * COIN - 10_000);
    let payment_out = OutPoint::new(payment.txid(), 0);
    let tip_header = chain[100].header.clone();
    let x = mine(&tip_header, 102, 1, vec![payment]);
    submit(&state, &x);
    assert_eq!(state.tip().hash, x.hash());
    assert_eq!(state.utxo(&funding).expect("lookup"), None);
    assert!(state.utxo(&payment_out).expect("lookup").is_some());

    let y1 = mine(&tip_header, 102, 2, Vec::new());
    let y2 = mine(&y1.header, 103, 2, Vec::new());
    state.accept_block(&y1, NOW).expect("accept y1");
    state.accept_block(&y2, NOW).expect("accept y2");
    state.activate_best_chain_fully().expect("reorg");

    assert_eq!(state.tip().hash, y2.hash());
    assert_eq!(state.utxo(&funding).expect("lookup"), Some(spent_entry));
    assert_eq!(state.utxo(&payment_out).expect("lookup"), None);
    let after = state.utxo_set_info().expect("utxo info");
    let minted: i64 = [&y1, &y2]
        .iter()
        .flat_map(|block| block.transactions[0].vout.iter())
        .map(|output| output.value)
        .sum();
    assert_eq!(after.txouts, before.txouts + 2);
    assert_eq!(after.total_amount, before.total_amount + minted);
}

#[test]
fn failed_block_poisons_its_branch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = open_chain(
        Arc::new(MemoryStore::new()),
        dir.path(),
        ChainStateOptions::default(),
    );
    let genesis = genesis_header(&state);
    let a1 = mine(&genesis, 1, 1, Vec::new());
    submit(&state, &a1);
    let on_a1 = state.utxo_set_info().expect("utxo info");

    let b1 = mine(&genesis, 1, 2, Vec::new());
    let missing = OutPoint::new([0x42; 32], 0);
    let b2 = mine(&b1.header, 2, 2, vec![spend(missing, COIN)]);
    let b3 = mine(&b2.header, 3, 2, Vec::new());
    for block in [&b1, &b2, &b3] {
        state.accept_block(block, NOW).expect("accept side branch");
    }
    let steps = state.activate_best_chain_fully().expect("activate");

    let (failed_hash, err) = steps
        .iter()
        .find_map(|step| step.invalid.clone())
        .expect("b2 rejected");
    assert_eq!(failed_hash, b2.hash());
    assert_eq!(err, ValidationError::MissingInputs(missing));

    // Back on the original chain with nothing of the side branch left.
    assert_eq!(state.tip().hash, a1.hash());
    assert!(state
        .utxo(&coinbase_outpoint(&a1))
        .expect("lookup")
        .is_some());
    assert_eq!(state.utxo(&coinbase_outpoint(&b1)).expect("lookup"), None);
    assert_eq!(state.utxo_set_info().expect("utxo info"), on_a1);
    assert!(state.block_info(&b2.hash()).expect("b2").is_failed());
    assert!(state.block_info(&b3.hash()).expect("b3").is_failed());
    assert!(!state.block_info(&b1.hash()).expect("b1").is_failed());

    let again = state.accept_block(&b2, NOW).expect_err("b2 stays invalid");
    assert!(matches!(again, ChainStateError::Validation(_)));

    let b4 = mine(&b3.header, 4, 2, Vec::new());
    let err = state.accept_block(&b4, NOW).expect_err("child of invalid");
    assert_eq!(
        err.validation(),
        Some(&ValidationError::InvalidHeader("bad-prevblk"))
    );
}

#[test]
fn orphan_block_reports_missing_parent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = open_chain(
        Arc::new(MemoryStore::new()),
        dir.path(),
        ChainStateOptions::default(),
    );
    let genesis = genesis_header(&state);
    let a = mine(&genesis, 1, 1, Vec::new());
    let b = mine(&a.header, 2, 1, Vec::new());

    let err = state.accept_block(&b, NOW).expect_err("parent unknown");
    assert!(matches!(err, ChainStateError::MissingParent(hash) if hash == a.hash()));

    submit(&state, &a);
    submit(&state, &b);
    assert_eq!(state.tip().height, 2);
}

#[test]
fn headers_first_then_bodies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = open_chain(
        Arc::new(MemoryStore::new()),
        dir.path(),
        ChainStateOptions::default(),
    );
    let genesis = genesis_header(&state);
    let chain = mine_chain(&genesis, 1, 5, 7);
    let headers: Vec<_> = chain.iter().map(|block| block.header.clone()).collect();

    let accepted = state.accept_headers(&headers, NOW).expect("headers");
    assert_eq!(accepted.accepted, 5);
    assert_eq!(accepted.last, Some(chain[4].hash()));
    assert_eq!(state.best_header().expect("best header").height, 5);
    assert_eq!(state.tip().height, 0);

    let wanted = state.blocks_to_download(3, |_| false);
    let expected: Vec<_> = chain[..3].iter().map(|block| block.hash()).collect();
    assert_eq!(wanted, expected);
    let skipped = state.blocks_to_download(3, |hash| *hash == chain[0].hash());
    assert_eq!(skipped[0], chain[1].hash());

    let again = state.accept_headers(&headers, NOW).expect("headers again");
    assert_eq!(again.accepted, 0);

    // Bodies out of order: nothing connects until the gap is filled.
    state.accept_block(&chain[1], NOW).expect("body 2");
    state.activate_best_chain_fully().expect("activate");
    assert_eq!(state.tip().height, 0);
    for block in &chain {
        state.accept_block(block, NOW).expect("body");
    }
    state.activate_best_chain_fully().expect("activate");
    assert_eq!(state.tip().hash, chain[4].hash());
    assert!(state.blocks_to_download(10, |_| false).is_empty());
}

#[test]
fn rejects_header_from_the_future() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = open_chain(
        Arc::new(MemoryStore::new()),
        dir.path(),
        ChainStateOptions::default(),
    );
    let genesis = genesis_header(&state);
    let block = mine(&genesis, 1, 1, Vec::new());
    let too_early = block.header.time as i64 - 3 * 60 * 60;

    let err = state
        .accept_headers(&[block.header.clone()], too_early)
        .expect_err("too far ahead");
    assert_eq!(err.validation(), Some(&ValidationError::TimeTooNew));
    assert!(state.block_info(&block.hash()).is_none());

    // Not marked invalid, so it is accepted once the clock catches up.
    submit(&state, &block);
    assert_eq!(state.tip().hash, block.hash());
}
