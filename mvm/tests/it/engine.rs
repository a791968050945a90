use std::time::Duration;

use alloy::primitives::Address;
use mvm::machine::Store;
use tokio_util::sync::CancellationToken;

use crate::{BIRTH, Harness};

#[mvm_macros::test]
async fn chain_events_are_replayed_once(mut harness: Harness) {
    harness.start_group(3, 2);
    let process = harness.add_process().await;
    let contract: Address = process.address.parse().unwrap();

    let first = harness.random_event(&process, 1);
    let second = harness.random_event(&process, 2);
    let stale = harness.random_event(&process, 1);
    harness.chain().emit_event(contract, BIRTH + 3, &second).unwrap();
    harness.chain().emit_event(contract, BIRTH + 1, &first).unwrap();
    harness.chain().emit_event(contract, BIRTH + 12, &stale).unwrap();

    harness.run_engines(Duration::from_millis(200)).await;
    harness.tick().await;

    for i in 0..harness.len() {
        assert_eq!(harness.delivered(i), &[first.clone(), second.clone()]);
        assert_eq!(harness.db(i).read_offset(process.id).unwrap(), 3);
    }

    harness.tick().await;
    for i in 0..harness.len() {
        assert_eq!(harness.delivered(i).len(), 2);
    }
}

#[mvm_macros::test]
async fn gaps_hold_back_later_events(mut harness: Harness) {
    harness.start_group(1, 1);
    let process = harness.add_process().await;
    let contract: Address = process.address.parse().unwrap();

    let events: Vec<_> = (1..=3)
        .map(|nonce| harness.random_event(&process, nonce))
        .collect();
    harness.chain().set_height(BIRTH + 29);
    harness.chain().emit_event(contract, BIRTH, &events[0]).unwrap();
    harness.chain().emit_event(contract, BIRTH + 20, &events[2]).unwrap();

    harness.run_engines(Duration::from_millis(400)).await;
    harness.tick().await;
    assert_eq!(harness.delivered(0), &events[..1]);

    // The window holding nonce 3 has already been scanned, so it is never admitted, even once nonce 2 appears.
    harness.chain().emit_event(contract, BIRTH + 30, &events[1]).unwrap();
    harness.chain().set_height(BIRTH + 39);
    harness.run_engines(Duration::from_millis(400)).await;
    harness.tick().await;
    assert_eq!(harness.delivered(0), &events[..2]);
}

#[mvm_macros::test]
async fn unreachable_chain_stops_the_engine(mut harness: Harness) {
    harness.start_group(1, 1);
    harness.add_process().await;
    harness.chain().set_offline(true);

    let result = tokio::time::timeout(Duration::from_secs(5), harness.run_engine(0)).await;
    let err = result.expect("engine kept retrying").unwrap_err();
    assert!(format!("{err:#}").contains("connection refused"), "{err:#}");
}

#[mvm_macros::test]
async fn disabled_process_stops_its_loops(mut harness: Harness) {
    harness.start_group(1, 1);
    let process = harness.add_process().await;
    let contract: Address = process.address.parse().unwrap();
    let event = harness.random_event(&process, 1);
    harness.deliver_event(&event);
    harness.tick().await;
    assert_eq!(harness.queued(0, contract), vec![1]);

    let cancel = CancellationToken::new();
    let engine = harness.spawn_engine(0, cancel.clone());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!harness.chain().log_queries().is_empty());
    assert!(!harness.chain().sent().is_empty());

    harness.machine(0).disable_process(process.id).unwrap();
    // Let any step already in flight finish.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let queries = harness.chain().log_queries().len();
    let sent = harness.chain().sent().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.chain().log_queries().len(), queries);
    assert_eq!(harness.chain().sent().len(), sent);

    cancel.cancel();
    engine.await.unwrap().unwrap();
}
