use std::time::Duration;

use alloy::{consensus::TxEnvelope, eips::eip2718::Decodable2718, primitives::U256};
use mvm::{
    encoding::Event,
    error::{EngineError, MachineError},
    machine::{Process, ProcessPlatform, Store},
    quorum::contracts,
};
use rand::Rng;
use uuid::Uuid;

use crate::{BIRTH, Harness};

#[mvm_macros::test]
async fn group_event_is_signed_by_quorum(mut harness: Harness) {
    harness.start_group(4, 3);
    let process = harness.add_process().await;
    let event = harness.random_event(&process, 1);

    harness.deliver_event(&event);
    harness.flush();

    for i in 0..harness.len() {
        let db = harness.db(i);
        let signed = db.read_signed(process.id, 1).unwrap().unwrap();
        assert_eq!(signed.with_signature(Vec::new()), event);
        harness
            .machine(i)
            .signer()
            .verify_proof(&event, &signed.signature)
            .unwrap();
        assert!(db.read_pending(process.id, 1).unwrap().is_none());
        assert!(
            db.read_partial_signatures(process.id, 1)
                .unwrap()
                .is_empty()
        );
        assert_eq!(db.count_pending().unwrap(), 0);
    }
}

#[mvm_macros::test]
async fn partials_may_arrive_before_their_event(mut harness: Harness) {
    harness.start_group(3, 2);
    let process = harness.add_process().await;
    let event = harness.random_event(&process, 1);

    harness.deliver_event_to(&event, &[0]);
    harness.flush();
    assert!(harness.db(0).read_signed(process.id, 1).unwrap().is_none());
    assert_eq!(
        harness
            .db(1)
            .read_partial_signatures(process.id, 1)
            .unwrap()
            .len(),
        1
    );

    harness.deliver_event_to(&event, &[1, 2]);
    harness.flush();
    for i in 0..harness.len() {
        assert!(harness.db(i).read_signed(process.id, 1).unwrap().is_some());
    }
}

#[mvm_macros::test]
async fn no_signature_below_threshold(mut harness: Harness) {
    harness.start_group(3, 3);
    let process = harness.add_process().await;
    let event = harness.random_event(&process, 1);

    harness.deliver_event_to(&event, &[0, 1]);
    harness.flush();
    harness.tick().await;
    for i in 0..harness.len() {
        assert!(harness.db(i).read_signed(process.id, 1).unwrap().is_none());
    }
    assert_eq!(harness.db(0).count_pending().unwrap(), 1);

    harness.deliver_event_to(&event, &[2]);
    harness.flush();
    for i in 0..harness.len() {
        assert!(harness.db(i).read_signed(process.id, 1).unwrap().is_some());
    }
}

#[mvm_macros::test]
async fn redelivered_event_is_a_no_op(mut harness: Harness) {
    harness.start_group(3, 2);
    let process = harness.add_process().await;
    let event = harness.random_event(&process, 1);

    harness.deliver_event(&event);
    harness.flush();
    let signed = harness.db(0).read_signed(process.id, 1).unwrap().unwrap();

    harness.deliver_event(&event);
    harness.flush();
    assert_eq!(
        harness.db(0).read_signed(process.id, 1).unwrap().unwrap(),
        signed
    );
    assert_eq!(harness.db(0).count_pending().unwrap(), 0);
}

#[mvm_macros::test]
async fn young_contracts_are_not_bound(mut harness: Harness) {
    harness.start_group(1, 1);
    let (address, tx) = harness.deploy_contract();
    let process = Process::new(
        Uuid::from_u128(9),
        ProcessPlatform::Quorum,
        address.to_string(),
    );

    harness.chain().set_height(BIRTH + 127);
    let err = harness
        .machine(0)
        .add_process(process.clone(), tx.as_slice())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::AddressTooYoung { .. })
    ));
    assert!(harness.db(0).read_process(process.id).unwrap().is_none());

    harness.chain().set_height(BIRTH + 128);
    harness
        .machine(0)
        .add_process(process.clone(), tx.as_slice())
        .await
        .unwrap();
    assert_eq!(
        harness.db(0).read_process(process.id).unwrap(),
        Some(process.clone())
    );

    // Binding the same process again is accepted without another verification.
    harness.chain().set_offline(true);
    harness
        .machine(0)
        .add_process(process, tx.as_slice())
        .await
        .unwrap();
}

#[mvm_macros::test]
async fn disabled_processes_reject_events(mut harness: Harness) {
    harness.start_group(1, 1);
    let process = harness.add_process().await;
    harness.machine(0).disable_process(process.id).unwrap();

    let event = harness.random_event(&process, 1);
    let err = harness.machine(0).handle_group_event(event).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MachineError>(),
        Some(MachineError::ProcessDisabled(_))
    ));
    assert!(harness.db(0).read_process(process.id).unwrap().unwrap().disabled);
}

#[mvm_macros::test]
async fn signed_events_are_submitted_by_the_keyed_engine(mut harness: Harness) {
    harness.start_group(3, 2);
    let process = harness.add_process().await;
    let events: Vec<_> = (1..=3)
        .map(|nonce| harness.random_event(&process, nonce))
        .collect();
    for event in &events {
        harness.deliver_event(event);
    }
    harness.flush();
    harness.tick().await;

    harness.run_engines(Duration::from_millis(200)).await;

    let contract = process.address.parse().unwrap();
    let notifier = harness.notifier(contract);
    let sent = harness.chain().sent();
    assert!(sent.len() >= 3, "only {} transactions sent", sent.len());
    // The contract never advances its nonce here, so the same events are submitted again every tick.
    for (i, raw) in sent.iter().enumerate() {
        let TxEnvelope::Legacy(tx) = TxEnvelope::decode_2718(&mut &raw[..]).unwrap() else {
            panic!("not a legacy transaction");
        };
        // Only the first member holds an engine key.
        assert_eq!(tx.recover_signer().unwrap(), notifier);
        assert_eq!(tx.tx().nonce, i as u64);
        if let Some(event) = events.get(i) {
            let signed = harness
                .db(0)
                .read_signed(process.id, event.nonce)
                .unwrap()
                .unwrap();
            assert_eq!(
                tx.tx().input.to_vec(),
                contracts::mixin_call(&signed).unwrap()
            );
        }
    }
}

#[mvm_macros::test]
async fn signed_events_over_budget_expire_oldest_first(mut harness: Harness) {
    let id = Uuid::from_u128(77);
    let events: Vec<_> = (1..=3)
        .map(|nonce| Event {
            process: id,
            nonce,
            asset: Uuid::from_u128(5),
            amount: U256::from(1000),
            extra: Vec::new(),
            timestamp: 1,
            signature: Vec::new(),
        })
        .collect();
    // The cost of a signed event depends on its proof, so budget for the two dearest possible events.
    let dearest = events
        .iter()
        .map(|e| harness.estimate_cost(&e.with_signature(vec![0xff; 65])))
        .max()
        .unwrap();
    harness.set_retention_budget(2 * dearest);
    harness.start_group(1, 1);
    let process = harness.add_process_with_id(id).await;

    for event in &events {
        harness.deliver_event(event);
    }
    harness.flush();
    harness.tick().await;

    let remaining: Vec<_> = harness
        .db(0)
        .list_signed(process.id, 10)
        .unwrap()
        .into_iter()
        .map(|e| e.nonce)
        .collect();
    assert_eq!(remaining, vec![2, 3]);
}

#[mvm_macros::test]
async fn every_signed_event_reaches_the_engine(mut harness: Harness) {
    harness.set_batch_limit(2);
    harness.start_group(1, 1);
    let process = harness.add_process().await;
    let contract = process.address.parse().unwrap();

    for nonce in 2..=6 {
        let event = harness.random_event(&process, nonce);
        harness.deliver_event(&event);
    }
    harness.flush();
    for _ in 0..3 {
        harness.tick().await;
    }
    assert_eq!(harness.queued(0, contract), vec![2, 3, 4, 5, 6]);

    // A lower nonce signed after later ones have been delivered is still handed over.
    let late = harness.random_event(&process, 1);
    harness.deliver_event(&late);
    harness.flush();
    harness.tick().await;
    assert_eq!(harness.queued(0, contract), vec![1, 2, 3, 4, 5, 6]);
}

#[mvm_macros::test]
async fn junk_partials_do_not_crowd_out_honest_ones(mut harness: Harness) {
    harness.start_group(3, 2);
    let process = harness.add_process().await;
    let event = harness.random_event(&process, 1);
    let flood = |harness: &mut Harness| {
        for _ in 0..50 {
            let junk: Vec<u8> = (0..65).map(|_| harness.rng().r#gen()).collect();
            harness
                .machine(2)
                .handle_partial_signature(process.id, 1, junk)
                .unwrap();
        }
    };

    // Member 0's partial reaches member 2 after a flood, before member 2 has seen the event.
    flood(&mut harness);
    harness.deliver_event_to(&event, &[0]);
    harness.flush();
    assert!(harness.db(2).read_signed(process.id, 1).unwrap().is_none());
    // A second flood evicts it.
    flood(&mut harness);

    harness.machine(2).handle_group_event(event.clone()).unwrap();
    assert!(harness.db(2).read_signed(process.id, 1).unwrap().is_none());

    // Member 0 resends its partial while the event waits for a quorum.
    harness.tick().await;
    let signed = harness.db(2).read_signed(process.id, 1).unwrap().unwrap();
    harness
        .machine(2)
        .signer()
        .verify_proof(&event, &signed.signature)
        .unwrap();
}
