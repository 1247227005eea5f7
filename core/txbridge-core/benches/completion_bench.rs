// Completion bridge benchmarks
//
// Section 1: bare completion (blocking channel vs callback under the host lock)
// Section 2: end-to-end dispatch through the in-memory engine

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;
use std::sync::Arc;
use std::sync::mpsc;
use txbridge_core::bindings::{Completion, Delivery, FreeThreaded, HostRuntime, InterpreterLock};
use txbridge_core::memory::MemoryCluster;
use txbridge_core::{Callbacks, Content, DocumentId, EngineHandle, TransactionConfig, TransactionOps};

// ═══════════════════════════════════════════════════════════════════════════
// Section 1: bare completion
// ═══════════════════════════════════════════════════════════════════════════

fn bench_completion(c: &mut Criterion) {
    let mut group = c.benchmark_group("completion");
    let free: Arc<dyn HostRuntime> = Arc::new(FreeThreaded);
    let locked: Arc<dyn HostRuntime> = Arc::new(InterpreterLock::new());

    group.bench_function("blocking_same_thread", |b| {
        b.iter(|| {
            let (completion, pending) =
                Completion::new("get", Delivery::Blocking, Arc::clone(&free), None);
            completion.fulfill(Ok(black_box(1u64))).unwrap();
            pending.wait().unwrap()
        })
    });

    group.bench_function("blocking_cross_thread", |b| {
        b.iter(|| {
            let (completion, pending) =
                Completion::new("get", Delivery::Blocking, Arc::clone(&locked), None);
            let callback = completion.into_callback();
            std::thread::spawn(move || callback(Ok(black_box(1u64))));
            pending.wait().unwrap()
        })
    });

    group.bench_function("callback_under_lock", |b| {
        b.iter(|| {
            let (tx, rx) = mpsc::channel();
            let callbacks = Callbacks::new(move |v: u64| tx.send(v).unwrap(), |_| {});
            let (completion, _pending) =
                Completion::new("get", Delivery::Callback(callbacks), Arc::clone(&locked), None);
            completion.fulfill(Ok(black_box(1u64))).unwrap();
            rx.recv().unwrap()
        })
    });

    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// Section 2: dispatch through the in-memory engine
// ═══════════════════════════════════════════════════════════════════════════

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let cluster = MemoryCluster::new();
    let id = DocumentId::new("b", "s", "c", "hot");
    cluster
        .store()
        .upsert(id.clone(), Content::json(&json!({ "qty": 1 })).unwrap());
    let runtime: Arc<dyn HostRuntime> = Arc::new(InterpreterLock::new());
    let engine = EngineHandle::create(&cluster, &TransactionConfig::new(), runtime).unwrap();
    let ctx = engine.create_context(None).unwrap();

    group.bench_function("get_blocking", |b| {
        b.iter(|| ctx.get(black_box(id.clone())).unwrap())
    });

    group.bench_function("get_callback", |b| {
        b.iter(|| {
            let (tx, rx) = mpsc::channel();
            ctx.get_with(
                black_box(id.clone()),
                Callbacks::new(move |doc| tx.send(doc).unwrap(), |_| {}),
            )
            .unwrap();
            rx.recv().unwrap()
        })
    });

    group.finish();
    drop(ctx);
    engine.destroy();
}

criterion_group!(benches, bench_completion, bench_dispatch);
criterion_main!(benches);
