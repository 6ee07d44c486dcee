mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::new_store;
use strata::{Error, IsolationLevel};

const RC: IsolationLevel = IsolationLevel::ReadCommitted;
const RR: IsolationLevel = IsolationLevel::RepeatableRead;

fn committed_rows(engine: &strata::Engine, n: usize) -> Vec<u64> {
    let x = engine.begin_transaction(RC).unwrap();
    let uids = (0..n)
        .map(|i| engine.insert_record(x, format!("row {i}").as_bytes()).unwrap())
        .collect();
    engine.commit(x).unwrap();
    uids
}

#[test]
fn crossed_deletes_abort_exactly_one_transaction() {
    let store = new_store();
    let engine = &store.engine;
    let rows = committed_rows(engine, 2);
    let (a, b) = (rows[0], rows[1]);

    let x1 = engine.begin_transaction(RC).unwrap();
    let x2 = engine.begin_transaction(RC).unwrap();
    assert!(engine.delete_record(x1, a).unwrap());
    assert!(engine.delete_record(x2, b).unwrap());

    let (r1, r2) = thread::scope(|s| {
        let first = s.spawn(|| engine.delete_record(x1, b));
        thread::sleep(Duration::from_millis(100));
        let second = s.spawn(|| engine.delete_record(x2, a));
        (first.join().unwrap(), second.join().unwrap())
    });

    let (winner, loser) = match (&r1, &r2) {
        (Ok(true), Err(Error::ConcurrentUpdate { xid })) => {
            assert_eq!(*xid, x2);
            (x1, x2)
        }
        (Err(Error::ConcurrentUpdate { xid }), Ok(true)) => {
            assert_eq!(*xid, x1);
            (x2, x1)
        }
        other => panic!("expected one deadlock victim, got {other:?}"),
    };
    engine.commit(winner).unwrap();
    engine.abort(loser).unwrap();

    let reader = engine.begin_transaction(RC).unwrap();
    assert_eq!(engine.read_record(reader, a).unwrap(), None);
    assert_eq!(engine.read_record(reader, b).unwrap(), None);
}

#[test]
fn waiter_resumes_after_holder_commits() {
    let store = new_store();
    let engine = &store.engine;
    let uid = committed_rows(engine, 1)[0];

    let holder = engine.begin_transaction(RC).unwrap();
    let rc_waiter = engine.begin_transaction(RC).unwrap();
    let rr_waiter = engine.begin_transaction(RR).unwrap();
    assert!(engine.delete_record(holder, uid).unwrap());

    thread::scope(|s| {
        let rc = s.spawn(|| engine.delete_record(rc_waiter, uid));
        let rr = s.spawn(|| engine.delete_record(rr_waiter, uid));
        thread::sleep(Duration::from_millis(100));
        assert!(!rc.is_finished());
        assert!(!rr.is_finished());
        engine.commit(holder).unwrap();

        // gone for read committed; a version skip for repeatable read, once
        // the read committed waiter lets go of the lock
        assert!(!rc.join().unwrap().unwrap());
        engine.commit(rc_waiter).unwrap();
        assert!(matches!(
            rr.join().unwrap(),
            Err(Error::ConcurrentUpdate { xid }) if xid == rr_waiter
        ));
    });
    engine.abort(rr_waiter).unwrap();
}

#[test]
fn waiter_takes_over_after_holder_aborts() {
    let store = new_store();
    let engine = &store.engine;
    let uid = committed_rows(engine, 1)[0];

    let holder = engine.begin_transaction(RC).unwrap();
    let waiter = engine.begin_transaction(RC).unwrap();
    assert!(engine.delete_record(holder, uid).unwrap());

    thread::scope(|s| {
        let handle = s.spawn(|| engine.delete_record(waiter, uid));
        thread::sleep(Duration::from_millis(50));
        engine.abort(holder).unwrap();
        assert!(handle.join().unwrap().unwrap());
    });
    engine.commit(waiter).unwrap();
}

#[test]
fn parallel_writers_do_not_collide() {
    let store = new_store();
    let _dir = store.dir;
    let engine = Arc::new(store.engine);
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let x = engine.begin_transaction(RC).unwrap();
                let mut written = Vec::new();
                for i in 0..100 {
                    let payload = format!("thread {t} row {i}").into_bytes();
                    let uid = loop {
                        match engine.insert_record(x, &payload) {
                            Ok(uid) => break uid,
                            Err(e) if e.is_retryable() => thread::yield_now(),
                            Err(e) => panic!("insert failed: {e}"),
                        }
                    };
                    written.push((uid, payload));
                }
                engine.commit(x).unwrap();
                written
            })
        })
        .collect();

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }
    let mut uids: Vec<_> = all.iter().map(|(uid, _)| *uid).collect();
    uids.sort();
    uids.dedup();
    assert_eq!(uids.len(), 800);

    let reader = engine.begin_transaction(RR).unwrap();
    for (uid, payload) in &all {
        assert_eq!(engine.read_record(reader, *uid).unwrap().as_ref(), Some(payload));
    }
}
