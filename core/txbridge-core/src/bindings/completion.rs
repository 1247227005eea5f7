//! Completion bridge.
//!
//! Every dispatched operation gets one [`Completion`] (the write side, handed
//! to the engine as its callback) and one [`PendingCall`] (the read side,
//! returned to the caller). The sink is picked at dispatch time: a one-shot
//! channel for blocking callers, or a stored callback pair that runs under the
//! host execution lock.

use super::runtime::{HostRuntime, with_detached, with_host};
use super::translator::translate;
use crate::error::{BridgeError, BridgeResult, TransactionError};
use crate::native::{NativeCallback, NativeError, codes};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;
use tracing::{debug, error, warn};

const PENDING: u8 = 0;
const FULFILLED: u8 = 1;

/// Where a call stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Fulfilled,
}

/// Host-supplied success/error pair. Exactly one of the two runs.
pub struct Callbacks<T> {
    on_success: Box<dyn FnOnce(T) + Send>,
    on_error: Box<dyn FnOnce(TransactionError) + Send>,
}

impl<T: 'static> Callbacks<T> {
    pub fn new(
        on_success: impl FnOnce(T) + Send + 'static,
        on_error: impl FnOnce(TransactionError) + Send + 'static,
    ) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        }
    }

    /// Adapt the success side to a different result type.
    pub fn contramap<U>(self, f: impl FnOnce(U) -> T + Send + 'static) -> Callbacks<U> {
        let on_success = self.on_success;
        Callbacks {
            on_success: Box::new(move |value| on_success(f(value))),
            on_error: self.on_error,
        }
    }

    fn invoke(self, result: Result<T, TransactionError>) {
        let Callbacks {
            on_success,
            on_error,
        } = self;
        match result {
            Ok(value) => {
                drop(on_error);
                on_success(value)
            }
            Err(err) => {
                drop(on_success);
                on_error(err)
            }
        }
    }
}

/// How the caller wants the result of one call.
pub enum Delivery<T> {
    Blocking,
    Callback(Callbacks<T>),
}

impl<T> Delivery<T> {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Delivery::Blocking)
    }
}

impl<T> From<Option<Callbacks<T>>> for Delivery<T> {
    fn from(callbacks: Option<Callbacks<T>>) -> Self {
        match callbacks {
            Some(callbacks) => Delivery::Callback(callbacks),
            None => Delivery::Blocking,
        }
    }
}

enum Sink<T> {
    Channel(SyncSender<Result<T, TransactionError>>),
    Callback {
        callbacks: Callbacks<T>,
        runtime: Arc<dyn HostRuntime>,
    },
}

struct Shared<T> {
    operation: &'static str,
    state: AtomicU8,
    sink: Mutex<Option<Sink<T>>>,
}

impl<T> Shared<T> {
    fn state(&self) -> CompletionState {
        match self.state.load(Ordering::Acquire) {
            PENDING => CompletionState::Pending,
            _ => CompletionState::Fulfilled,
        }
    }
}

/// Write side of one call. Fulfilled at most once; dropping it while still
/// pending delivers a request-canceled error so the caller never hangs on a
/// completion the engine lost.
pub struct Completion<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Completion<T> {
    pub fn new(
        operation: &'static str,
        delivery: Delivery<T>,
        runtime: Arc<dyn HostRuntime>,
        watchdog: Option<Duration>,
    ) -> (Completion<T>, PendingCall<T>) {
        let (sink, receiver) = match delivery {
            Delivery::Blocking => {
                let (tx, rx) = mpsc::sync_channel(1);
                (Sink::Channel(tx), Some(rx))
            }
            Delivery::Callback(callbacks) => (
                Sink::Callback {
                    callbacks,
                    runtime: Arc::clone(&runtime),
                },
                None,
            ),
        };
        let shared = Arc::new(Shared {
            operation,
            state: AtomicU8::new(PENDING),
            sink: Mutex::new(Some(sink)),
        });
        let pending = PendingCall {
            shared: Arc::clone(&shared),
            receiver,
            runtime,
            watchdog,
        };
        (Completion { shared }, pending)
    }

    pub fn operation(&self) -> &'static str {
        self.shared.operation
    }

    pub fn state(&self) -> CompletionState {
        self.shared.state()
    }

    /// Deliver the engine's outcome. Native errors go through the translator
    /// here, so both sinks see the same categorized error.
    pub fn fulfill(&self, result: Result<T, NativeError>) -> BridgeResult<()> {
        if self
            .shared
            .state
            .compare_exchange(PENDING, FULFILLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!(
                operation = self.shared.operation,
                "completion fulfilled more than once"
            );
            return Err(BridgeError::AlreadyFulfilled(self.shared.operation));
        }

        let sink = self.shared.sink.lock().take();
        let result = result.map_err(translate);
        debug!(
            operation = self.shared.operation,
            ok = result.is_ok(),
            "completion fulfilled"
        );
        match sink {
            Some(Sink::Channel(tx)) => {
                if tx.send(result).is_err() {
                    warn!(
                        operation = self.shared.operation,
                        "waiter gave up before completion; result discarded"
                    );
                }
            }
            Some(Sink::Callback { callbacks, runtime }) => {
                with_host(runtime.as_ref(), move || callbacks.invoke(result));
            }
            None => {
                error!(operation = self.shared.operation, "completion sink missing");
            }
        }
        Ok(())
    }

    /// Turn this completion into the callback the engine invokes.
    pub fn into_callback(self) -> NativeCallback<T> {
        Box::new(move |result| {
            let _ = self.fulfill(result);
        })
    }

    /// Like [`into_callback`](Self::into_callback) for an engine call whose
    /// success type differs from the caller's.
    pub fn map_into<U>(self, f: impl FnOnce(U) -> T + Send + 'static) -> NativeCallback<U> {
        Box::new(move |result: Result<U, NativeError>| {
            let _ = self.fulfill(result.map(f));
        })
    }
}

impl<T: Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        if self.shared.state() == CompletionState::Pending {
            warn!(
                operation = self.shared.operation,
                "completion dropped without a result"
            );
            let _ = self.fulfill(Err(NativeError::other(
                codes::REQUEST_CANCELED,
                format!("{} was dropped by the engine without completing", self.shared.operation),
            )));
        }
    }
}

/// Read side of one call.
pub struct PendingCall<T> {
    shared: Arc<Shared<T>>,
    receiver: Option<Receiver<Result<T, TransactionError>>>,
    runtime: Arc<dyn HostRuntime>,
    watchdog: Option<Duration>,
}

impl<T: Send + 'static> PendingCall<T> {
    pub fn operation(&self) -> &'static str {
        self.shared.operation
    }

    pub fn state(&self) -> CompletionState {
        self.shared.state()
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state() == CompletionState::Fulfilled
    }

    /// True when the result is collected with [`wait`](Self::wait) rather
    /// than handed to callbacks.
    pub fn is_blocking(&self) -> bool {
        self.receiver.is_some()
    }

    /// Block until the call completes. The host execution lock is released
    /// for the whole wait.
    pub fn wait(self) -> BridgeResult<T> {
        let operation = self.shared.operation;
        let Some(receiver) = self.receiver else {
            return Err(BridgeError::InvalidArgument(format!(
                "{operation} was dispatched with callbacks; there is nothing to wait for"
            )));
        };
        let watchdog = self.watchdog;
        let received = with_detached(self.runtime.as_ref(), move || match watchdog {
            Some(limit) => receiver.recv_timeout(limit),
            None => receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        });
        match received {
            Ok(result) => result.map_err(BridgeError::from),
            Err(RecvTimeoutError::Timeout) => {
                let limit = watchdog.unwrap_or_default();
                warn!(operation, ?limit, "completion watchdog expired");
                Err(BridgeError::CompletionTimeout(limit))
            }
            Err(RecvTimeoutError::Disconnected) => Err(translate(NativeError::other(
                codes::REQUEST_CANCELED,
                format!("{operation} completion channel closed"),
            ))
            .into()),
        }
    }
}

impl<T> std::fmt::Debug for PendingCall<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("operation", &self.shared.operation)
            .field("state", &self.shared.state())
            .field("blocking", &self.receiver.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::runtime::{FreeThreaded, InterpreterLock};
    use crate::error::ErrorCategory;
    use std::sync::atomic::AtomicUsize;

    fn free() -> Arc<dyn HostRuntime> {
        Arc::new(FreeThreaded)
    }

    #[test]
    fn blocking_delivers_value() {
        let (completion, pending) = Completion::new("get", Delivery::Blocking, free(), None);
        assert!(pending.is_blocking());
        let callback = completion.into_callback();
        std::thread::spawn(move || callback(Ok(41 + 1))).join().unwrap();
        assert!(pending.is_fulfilled());
        assert_eq!(pending.wait().unwrap(), 42);
    }

    #[test]
    fn blocking_delivers_translated_error() {
        let (completion, pending) = Completion::<u32>::new("get", Delivery::Blocking, free(), None);
        completion
            .fulfill(Err(NativeError::DocumentNotFound("b.s.c/k".into())))
            .unwrap();
        match pending.wait() {
            Err(BridgeError::Transaction(e)) => {
                assert_eq!(e.category(), ErrorCategory::DocumentNotFound)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn second_fulfill_is_rejected() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let callbacks = Callbacks::new(
            move |_: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_| panic!("error side must not run"),
        );
        let (completion, pending) =
            Completion::new("commit", Delivery::Callback(callbacks), free(), None);
        completion.fulfill(Ok(1)).unwrap();
        assert!(matches!(
            completion.fulfill(Ok(2)),
            Err(BridgeError::AlreadyFulfilled("commit"))
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(pending.is_fulfilled());
    }

    #[test]
    fn dropped_completion_reports_cancellation() {
        let (completion, pending) = Completion::<u32>::new("query", Delivery::Blocking, free(), None);
        drop(completion.into_callback());
        match pending.wait() {
            Err(BridgeError::Transaction(e)) => {
                assert_eq!(e.category(), ErrorCategory::Generic);
                assert_eq!(
                    e.native(),
                    &NativeError::other(
                        codes::REQUEST_CANCELED,
                        "query was dropped by the engine without completing"
                    )
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn watchdog_gives_up_and_late_result_is_discarded() {
        let (completion, pending) = Completion::<u32>::new(
            "get",
            Delivery::Blocking,
            free(),
            Some(Duration::from_millis(20)),
        );
        assert!(matches!(
            pending.wait(),
            Err(BridgeError::CompletionTimeout(_))
        ));
        assert!(completion.fulfill(Ok(1)).is_ok());
    }

    #[test]
    fn callback_runs_under_host_lock() {
        let lock = Arc::new(InterpreterLock::new());
        let observer = Arc::clone(&lock);
        let (tx, rx) = mpsc::channel();
        let callbacks = Callbacks::new(
            move |value: u32| {
                tx.send((value, observer.is_held_by_current_thread())).unwrap();
            },
            |_| {},
        );
        let runtime: Arc<dyn HostRuntime> = lock.clone();
        let (completion, pending) =
            Completion::new("insert", Delivery::Callback(callbacks), runtime, None);
        std::thread::spawn(move || completion.fulfill(Ok(9)).unwrap())
            .join()
            .unwrap();
        assert_eq!(rx.recv().unwrap(), (9, true));
        assert!(!lock.is_held());
        assert!(matches!(
            pending.wait(),
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn contramap_adapts_success_type() {
        let (tx, rx) = mpsc::channel();
        let callbacks = Callbacks::new(move |s: String| tx.send(s).unwrap(), |_| {})
            .contramap(|n: u32| n.to_string());
        let (completion, _pending) =
            Completion::new("get", Delivery::Callback(callbacks), free(), None);
        completion.fulfill(Ok(12)).unwrap();
        assert_eq!(rx.recv().unwrap(), "12");
    }
}
