use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use sqlbridge_core::{ErrorKind, Pool};
use sqlbridge_test_support::FakeDriver;

const INSERT: &str = "INSERT INTO ledger VALUES (?)";

#[test]
fn concurrent_inserts_coalesce_into_fewer_executions() {
    let fake = FakeDriver::new("fake-group");
    fake.register();
    let pool = Pool::builder("fake-group", "host=h")
        .max_conns(2)
        .start()
        .expect("pool start");

    let successes = Arc::new(AtomicUsize::new(0));
    // Everyone binds before anyone executes, so all ten rows land in one
    // batch.
    let barrier = Arc::new(std::sync::Barrier::new(10));
    let mut handles = Vec::new();
    for n in 0..10 {
        let pool = pool.clone();
        let successes = successes.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            let mut group = pool.group_insert_prepare(INSERT).expect("group prepare");
            group.bind_int64(n);
            barrier.wait();
            let kind = group.execute().expect("group execute");
            assert!(!kind.is_error());
            successes.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for handle in handles {
        handle.join().expect("thread join");
    }

    assert_eq!(successes.load(Ordering::Relaxed), 10);
    // Every bound row reached the backend...
    assert_eq!(fake.insert_row_count(), 10);
    // ...in fewer executions than callers (typically one per batch).
    let executions = fake.insert_execute_count();
    assert!(
        executions < 10,
        "expected coalescing, saw {executions} executions"
    );
}

#[test]
fn sequential_group_inserts_run_independently() {
    let fake = FakeDriver::new("fake-group-seq");
    fake.register();
    let pool = Pool::builder("fake-group-seq", "host=h")
        .max_conns(1)
        .start()
        .expect("pool start");

    for n in 0..3 {
        let mut group = pool.group_insert_prepare(INSERT).expect("group prepare");
        group.bind_int64(n);
        group.execute().expect("group execute");
    }

    assert_eq!(fake.insert_execute_count(), 3);
    assert_eq!(fake.insert_row_count(), 3);
}

#[test]
fn every_participant_receives_the_batch_error() {
    let fake = FakeDriver::new("fake-group-err")
        .fail_executes(INSERT, ErrorKind::QueryConstraint, 1);
    fake.register();
    let pool = Pool::builder("fake-group-err", "host=h")
        .max_conns(1)
        .start()
        .expect("pool start");

    let barrier = Arc::new(std::sync::Barrier::new(4));
    let mut handles = Vec::new();
    for n in 0..4 {
        let pool = pool.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            let mut group = pool.group_insert_prepare(INSERT).expect("group prepare");
            group.bind_int64(n);
            barrier.wait();
            group.execute()
        }));
    }

    let mut constraint_errors = 0;
    let mut successes = 0;
    for handle in handles {
        match handle.join().expect("thread join") {
            Err(err) if err.kind() == ErrorKind::QueryConstraint => constraint_errors += 1,
            Ok(_) => successes += 1,
            Err(other) => panic!("unexpected error {other}"),
        }
    }

    // At least one batch hit the scripted constraint failure and every
    // member of that batch saw it; participants that landed in a later
    // batch (after the entry was sealed) succeed.
    assert!(constraint_errors >= 1);
    assert_eq!(constraint_errors + successes, 4);
}

#[test]
fn joiners_after_execution_get_a_fresh_batch() {
    let fake = FakeDriver::new("fake-group-fresh");
    fake.register();
    let pool = Pool::builder("fake-group-fresh", "host=h")
        .max_conns(1)
        .start()
        .expect("pool start");

    let mut first = pool.group_insert_prepare(INSERT).expect("group prepare");
    first.bind_int64(1);
    first.execute().expect("execute");

    // The key map no longer holds the executed entry; this opens a new one.
    let mut second = pool.group_insert_prepare(INSERT).expect("group prepare");
    second.bind_int64(2);
    second.execute().expect("execute");

    assert_eq!(fake.insert_execute_count(), 2);
    assert_eq!(fake.insert_row_count(), 2);
}
