//! Host runtime execution lock.
//!
//! A managed host (an interpreter with a global lock, for example) only lets
//! one thread touch host objects at a time. The engine completes work on
//! threads the host has never seen, so every re-entry goes through
//! [`HostRuntime::enter`], and every blocking wait goes through
//! [`HostRuntime::detach`] so the waiting thread does not starve the
//! completion threads that need the lock.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

/// Execution context of the host the bridge serves.
pub trait HostRuntime: Send + Sync + 'static {
    /// Run `f` holding the host execution lock. Reentrant: a thread that
    /// already holds the lock just runs `f`. The lock is released on every
    /// exit path, unwinding included.
    fn enter(&self, f: &mut dyn FnMut());

    /// Run `f` with the host execution lock released if the current thread
    /// holds it, restoring it afterwards.
    fn detach(&self, f: &mut (dyn FnMut() + Send));

    fn name(&self) -> &'static str {
        "host"
    }
}

/// Run `f` under the host lock and hand back its result.
pub fn with_host<R>(runtime: &dyn HostRuntime, f: impl FnOnce() -> R) -> R {
    let mut f = Some(f);
    let mut out = None;
    runtime.enter(&mut || {
        if let Some(f) = f.take() {
            out = Some(f());
        }
    });
    match out {
        Some(value) => value,
        None => unreachable!("{} runtime did not run the scoped closure", runtime.name()),
    }
}

/// Run `f` with the host lock released and hand back its result.
pub fn with_detached<R: Send>(runtime: &dyn HostRuntime, f: impl FnOnce() -> R + Send) -> R {
    let mut f = Some(f);
    let mut out = None;
    runtime.detach(&mut || {
        if let Some(f) = f.take() {
            out = Some(f());
        }
    });
    match out {
        Some(value) => value,
        None => unreachable!("{} runtime did not run the detached closure", runtime.name()),
    }
}

/// Runtime for hosts without an execution lock (plain C callers).
#[derive(Debug, Default, Clone, Copy)]
pub struct FreeThreaded;

impl HostRuntime for FreeThreaded {
    fn enter(&self, f: &mut dyn FnMut()) {
        f()
    }

    fn detach(&self, f: &mut (dyn FnMut() + Send)) {
        f()
    }

    fn name(&self) -> &'static str {
        "free-threaded"
    }
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A reentrant global lock with save/restore semantics, modelled on an
/// interpreter lock.
///
/// `detach` fully releases the lock (whatever the recursion depth) and
/// restores the same depth afterwards.
#[derive(Debug, Default)]
pub struct InterpreterLock {
    state: Mutex<LockState>,
    released: Condvar,
    acquisitions: AtomicU64,
}

impl InterpreterLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Number of times a thread took the lock from the unlocked state.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    fn acquire(&self, depth: usize) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += depth;
            return;
        }
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = depth;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_one();
        }
    }

    /// Drop the lock entirely if this thread owns it; returns the saved depth.
    fn save(&self) -> usize {
        let mut state = self.state.lock();
        if state.owner != Some(thread::current().id()) {
            return 0;
        }
        let depth = state.depth;
        state.owner = None;
        state.depth = 0;
        self.released.notify_one();
        depth
    }
}

struct Held<'a>(&'a InterpreterLock);

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

struct Saved<'a> {
    lock: &'a InterpreterLock,
    depth: usize,
}

impl Drop for Saved<'_> {
    fn drop(&mut self) {
        if self.depth > 0 {
            self.lock.acquire(self.depth);
        }
    }
}

impl HostRuntime for InterpreterLock {
    fn enter(&self, f: &mut dyn FnMut()) {
        self.acquire(1);
        let _held = Held(self);
        f()
    }

    fn detach(&self, f: &mut (dyn FnMut() + Send)) {
        let depth = self.save();
        let _saved = Saved { lock: self, depth };
        f()
    }

    fn name(&self) -> &'static str {
        "interpreter-lock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn enter_is_reentrant_and_released() {
        let lock = InterpreterLock::new();
        with_host(&lock, || {
            assert!(lock.is_held_by_current_thread());
            with_host(&lock, || assert!(lock.is_held_by_current_thread()));
            assert!(lock.is_held_by_current_thread());
        });
        assert!(!lock.is_held());
        assert_eq!(lock.acquisitions(), 1);
    }

    #[test]
    fn detach_releases_nested_depth_and_restores_it() {
        let lock = Arc::new(InterpreterLock::new());
        with_host(&*lock, || {
            with_host(&*lock, || {
                let other = Arc::clone(&lock);
                with_detached(&*lock, move || {
                    // another thread can take the lock while we are detached
                    std::thread::spawn(move || with_host(&*other, || other.is_held_by_current_thread()))
                        .join()
                        .unwrap()
                });
                assert!(lock.is_held_by_current_thread());
            });
            assert!(lock.is_held_by_current_thread());
        });
        assert!(!lock.is_held());
    }

    #[test]
    fn lock_released_on_unwind() {
        let lock = InterpreterLock::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_host(&lock, || panic!("host callback blew up"));
        }));
        assert!(result.is_err());
        assert!(!lock.is_held());
    }

    #[test]
    fn mutual_exclusion_across_threads() {
        let lock = Arc::new(InterpreterLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        with_host(&*lock, || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_without_holding_is_a_plain_call() {
        let lock = InterpreterLock::new();
        assert_eq!(with_detached(&lock, || 7), 7);
        assert!(!lock.is_held());
        assert_eq!(with_host(&FreeThreaded, || 3), 3);
    }
}
