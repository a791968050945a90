use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use mvm::{
    db::Db,
    error::StoreError,
    machine::{Process, ProcessPlatform, Store},
};
use rand::Rng;
use uuid::Uuid;

use crate::Harness;

fn process() -> Process {
    Process::new(
        Uuid::from_u128(42),
        ProcessPlatform::Quorum,
        "0x4242424242424242424242424242424242424242",
    )
}

#[mvm_macros::test]
async fn signing_is_atomic_for_concurrent_readers(mut harness: Harness) {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Db::new(Some(dir.path()), 1024 * 1024).unwrap());
    let process = process();
    let events: Vec<_> = (1..=100)
        .map(|nonce| harness.random_event(&process, nonce))
        .collect();
    for event in &events {
        db.write_pending(event, &event.id().unwrap()).unwrap();
    }

    let id = process.id;
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let db = db.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut reads = 0;
            while !done.load(Ordering::SeqCst) || reads == 0 {
                for nonce in 1..=100 {
                    let tx = db.read().unwrap();
                    let pending = tx.pending_events().unwrap().get(id, nonce).unwrap();
                    let signed = tx.signed_events().unwrap().get(id, nonce).unwrap();
                    assert!(
                        pending.is_some() != signed.is_some(),
                        "nonce {nonce} is pending: {}, signed: {}",
                        pending.is_some(),
                        signed.is_some()
                    );
                    reads += 1;
                }
            }
        })
    };

    for event in &events {
        db.write_signed_and_expire_pending(&event.with_signature(vec![1; 65]))
            .unwrap();
    }
    done.store(true, Ordering::SeqCst);
    reader.join().unwrap();

    assert_eq!(db.count_pending().unwrap(), 0);
    assert_eq!(db.list_signed(process.id, 1000).unwrap().len(), 100);
}

#[mvm_macros::test]
async fn idempotency_survives_restart(mut harness: Harness) {
    let dir = tempfile::tempdir().unwrap();
    let process = process();
    let event = harness.random_event(&process, 1);
    let id = event.id().unwrap();

    {
        let db = Db::new(Some(dir.path()), 1024 * 1024).unwrap();
        db.write_pending(&event, &id).unwrap();
        db.write_partial_signatures(process.id, 1, &[vec![7; 65]])
            .unwrap();
    }

    let db = Db::new(Some(dir.path()), 1024 * 1024).unwrap();
    assert!(db.event_seen(&id).unwrap());
    let err = db.write_pending(&event, &id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::DuplicateEvent(_))
    ));
    assert_eq!(
        db.read_partial_signatures(process.id, 1).unwrap(),
        vec![vec![7; 65]]
    );
}

#[mvm_macros::test]
async fn offsets_only_move_forward(mut harness: Harness) {
    let db = Db::new::<&str>(None, 1024 * 1024).unwrap();
    let process = process();
    let mut highest = 0;
    for _ in 0..200 {
        let offset = harness.rng().gen_range(0..1000);
        let moved = db.write_offset(process.id, offset).unwrap();
        assert_eq!(moved, offset > highest);
        highest = highest.max(offset);
        assert_eq!(db.read_offset(process.id).unwrap(), highest);
    }
}
