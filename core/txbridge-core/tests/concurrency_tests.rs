//! Completions fired from engine threads against a host with an execution
//! lock.

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use txbridge_core::bindings::{
    Completion, Delivery, HostRuntime, InterpreterLock, with_host,
};
use txbridge_core::memory::MemoryCluster;
use txbridge_core::{
    BridgeError, BridgeSettings, Callbacks, Content, DocumentId, EngineHandle, ErrorCategory,
    TransactionConfig, TransactionOps,
};

fn locked_engine(cluster: &MemoryCluster) -> (Arc<InterpreterLock>, EngineHandle) {
    let lock = Arc::new(InterpreterLock::new());
    let runtime: Arc<dyn HostRuntime> = lock.clone();
    let engine = EngineHandle::create(cluster, &TransactionConfig::new(), runtime).unwrap();
    (lock, engine)
}

fn doc(key: &str) -> DocumentId {
    DocumentId::new("b", "s", "c", key)
}

fn body(n: usize) -> Content {
    Content::json(&json!({ "n": n })).unwrap()
}

#[test]
fn callbacks_from_engine_threads_run_under_the_host_lock() {
    let cluster = MemoryCluster::new();
    let (lock, engine) = locked_engine(&cluster);
    let ctx = engine.create_context(None).unwrap();
    let (tx, rx) = mpsc::channel();

    const OPS: usize = 64;
    for i in 0..OPS {
        let ok_tx = tx.clone();
        let err_tx = tx.clone();
        let ok_lock = Arc::clone(&lock);
        let err_lock = Arc::clone(&lock);
        // inserts of distinct keys do not depend on each other's order
        ctx.insert_with(
            doc(&format!("k{i}")),
            body(i),
            Callbacks::new(
                move |_| ok_tx.send(ok_lock.is_held_by_current_thread()).unwrap(),
                move |_| err_tx.send(err_lock.is_held_by_current_thread()).unwrap(),
            ),
        )
        .unwrap();
    }
    drop(tx);

    let observed: Vec<bool> = rx.iter().collect();
    assert_eq!(observed.len(), OPS);
    assert!(observed.iter().all(|held| *held));
    assert!(!lock.is_held());
    ctx.commit().unwrap();
    assert_eq!(cluster.store().len(), OPS);
}

#[test]
fn blocking_wait_inside_the_host_lock_does_not_deadlock() {
    let cluster = MemoryCluster::new();
    let (lock, engine) = locked_engine(&cluster);
    let ctx = engine.create_context(None).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    with_host(lock.as_ref(), || {
        // callback needs the lock this thread holds
        let counter = Arc::clone(&fired);
        ctx.insert_with(
            doc("a"),
            body(1),
            Callbacks::new(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                |err| panic!("insert failed: {err}"),
            ),
        )
        .unwrap();
        // blocking wait releases the lock so the callback above can finish
        let read = loop {
            match ctx.get(doc("a")) {
                Ok(read) => break read,
                Err(err) if err.category() == Some(ErrorCategory::DocumentNotFound) => {
                    thread::sleep(Duration::from_millis(1))
                }
                Err(err) => panic!("get failed: {err}"),
            }
        };
        assert_eq!(read.content(), &body(1));
        assert!(lock.is_held_by_current_thread());
    });

    ctx.commit().unwrap();
    for _ in 0..500 {
        if fired.load(Ordering::SeqCst) > 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn engine_driven_logic_runs_under_the_host_lock() {
    let cluster = MemoryCluster::new();
    let (lock, engine) = locked_engine(&cluster);

    let observer = Arc::clone(&lock);
    engine
        .run(None, move |ctx| {
            assert!(observer.is_held_by_current_thread());
            ctx.insert(doc("logic"), body(7))?;
            assert!(observer.is_held_by_current_thread());
            Ok(())
        })
        .unwrap();
    assert!(cluster.store().contains(&doc("logic")));
    assert!(!lock.is_held());
}

#[test]
fn concurrent_transactions_from_many_host_threads() {
    let cluster = MemoryCluster::new();
    let (lock, engine) = locked_engine(&cluster);
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                with_host(lock.as_ref(), || {
                    let ctx = engine.create_context(None).unwrap();
                    for i in 0..10 {
                        ctx.insert(doc(&format!("t{t}-{i}")), body(i)).unwrap();
                    }
                    ctx.commit().unwrap();
                });
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(cluster.store().len(), 80);
    assert_eq!(engine.live_contexts(), 0);
}

#[test]
fn racing_fulfillments_deliver_exactly_once() {
    let lock = Arc::new(InterpreterLock::new());
    let runtime: Arc<dyn HostRuntime> = lock.clone();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&hits);
    let callbacks = Callbacks::new(
        move |_: usize| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        |err| panic!("error side ran: {err}"),
    );
    let (completion, pending) = Completion::new("commit", Delivery::Callback(callbacks), runtime, None);
    let completion = Arc::new(completion);

    let winners: usize = (0..8)
        .map(|i| {
            let completion = Arc::clone(&completion);
            thread::spawn(move || completion.fulfill(Ok(i)))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| match handle.join().unwrap() {
            Ok(()) => 1,
            Err(BridgeError::AlreadyFulfilled("commit")) => 0,
            Err(other) => panic!("unexpected {other}"),
        })
        .sum();
    assert_eq!(winners, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(pending.is_fulfilled());
}

#[test]
fn watchdog_bounds_a_lost_completion() {
    let cluster = MemoryCluster::new();
    let lock = Arc::new(InterpreterLock::new());
    let runtime: Arc<dyn HostRuntime> = lock.clone();
    let settings = BridgeSettings::new().with_completion_watchdog(Duration::from_millis(30));
    let engine =
        EngineHandle::create_with_settings(&cluster, &TransactionConfig::new(), settings, runtime)
            .unwrap();
    assert_eq!(
        engine.settings().completion_watchdog(),
        Some(Duration::from_millis(30))
    );

    // a fast engine finishes well within the watchdog
    let ctx = engine.create_context(None).unwrap();
    ctx.insert(doc("w"), body(1)).unwrap();

    // a completion nobody fulfills trips it, without holding the lock
    let (completion, pending) = Completion::<()>::new(
        "get",
        Delivery::Blocking,
        engine.runtime(),
        engine.settings().completion_watchdog(),
    );
    let err = with_host(lock.as_ref(), || pending.wait()).unwrap_err();
    assert!(matches!(err, BridgeError::CompletionTimeout(limit) if limit == Duration::from_millis(30)));
    drop(completion);
    assert!(!lock.is_held());
}
