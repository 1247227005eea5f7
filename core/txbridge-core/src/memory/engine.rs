//! Engine: worker pool, in-flight tracking and the attempt loop.

use super::ClusterState;
use super::context::MemoryContext;
use crate::config::{TransactionConfig, TransactionOptions};
use crate::native::{
    AttemptLogic, FinalErrorKind, NativeCallback, NativeContext, NativeEngine, NativeError, codes,
};
use crate::types::TransactionResult;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::cell::RefCell;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Attempts per transaction before the engine gives up.
pub(crate) const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Default)]
struct InFlightState {
    count: usize,
    closed: bool,
}

/// Counts calls between acceptance and completion so that `close` can wait
/// for them.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    state: Mutex<InFlightState>,
    drained: Condvar,
}

impl InFlight {
    fn begin(self: &Arc<Self>) -> Result<InFlightGuard, NativeError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(engine_closed());
        }
        state.count += 1;
        Ok(InFlightGuard {
            tracker: Arc::clone(self),
        })
    }

    fn ensure_open(&self) -> Result<(), NativeError> {
        if self.state.lock().closed {
            return Err(engine_closed());
        }
        Ok(())
    }

    /// Stop accepting calls and wait for the accepted ones, except those
    /// whose completion the current thread is delivering.
    fn close_and_drain(&self) {
        let own = delivering_here(self);
        let mut state = self.state.lock();
        state.closed = true;
        while state.count > own {
            self.drained.wait(&mut state);
        }
    }

    fn count(&self) -> usize {
        self.state.lock().count
    }
}

fn engine_closed() -> NativeError {
    NativeError::other(codes::ENGINE_CLOSED, "transactions engine is closed")
}

thread_local! {
    /// Trackers whose completions this thread is delivering right now.
    static DELIVERING: RefCell<Vec<*const InFlight>> = const { RefCell::new(Vec::new()) };
}

fn delivering_here(tracker: &InFlight) -> usize {
    let key = tracker as *const InFlight;
    DELIVERING.with(|d| d.borrow().iter().filter(|&&p| p == key).count())
}

/// Pops the delivery mark on every exit path, unwinding included.
struct DeliveryMark(*const InFlight);

impl Drop for DeliveryMark {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(pos) = d.iter().rposition(|&p| p == self.0) {
                d.remove(pos);
            }
        });
    }
}

/// Held for the lifetime of one accepted call.
pub(crate) struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl InFlightGuard {
    /// Hand the outcome to the caller, then release the call.
    fn deliver(self, f: impl FnOnce()) {
        let key = Arc::as_ptr(&self.tracker);
        DELIVERING.with(|d| d.borrow_mut().push(key));
        let _mark = DeliveryMark(key);
        f();
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.tracker.state.lock();
        state.count -= 1;
        if state.count == 0 {
            self.tracker.drained.notify_all();
        }
    }
}

/// State shared by an engine and all contexts it created.
pub(crate) struct EngineState {
    pub(crate) cluster: Arc<ClusterState>,
    pub(crate) config: TransactionConfig,
    pool: ThreadPool,
    in_flight: Arc<InFlight>,
}

impl EngineState {
    /// Run `job` on the worker pool, or fail fast when the engine is closed.
    pub(crate) fn spawn<T: Send + 'static>(
        &self,
        done: NativeCallback<T>,
        job: impl FnOnce() -> Result<T, NativeError> + Send + 'static,
    ) {
        match self.in_flight.begin() {
            Ok(guard) => self.pool.spawn(move || {
                let result = job();
                guard.deliver(|| done(result));
            }),
            Err(err) => done(Err(err)),
        }
    }
}

/// In-memory transactions engine.
pub struct MemoryEngine {
    state: Arc<EngineState>,
}

impl MemoryEngine {
    pub(crate) fn new(cluster: Arc<ClusterState>, config: TransactionConfig) -> Result<Self, NativeError> {
        let threads = num_cpus::get().max(2);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("txbridge-engine-{i}"))
            .build()
            .map_err(|e| NativeError::other(codes::REQUEST_CANCELED, format!("failed to start worker pool: {e}")))?;
        info!(threads, "in-memory transactions engine started");
        Ok(Self {
            state: Arc::new(EngineState {
                cluster,
                config,
                pool,
                in_flight: Arc::new(InFlight::default()),
            }),
        })
    }

    /// Calls accepted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.count()
    }

    fn context(&self, options: Option<&TransactionOptions>) -> MemoryContext {
        let config = match options {
            Some(options) => self.state.config.merged_with(options),
            None => self.state.config.clone(),
        };
        MemoryContext::new(Arc::clone(&self.state), config)
    }
}

impl NativeEngine for MemoryEngine {
    fn config(&self) -> &TransactionConfig {
        &self.state.config
    }

    fn new_context(
        &self,
        options: Option<&TransactionOptions>,
    ) -> Result<Arc<dyn NativeContext>, NativeError> {
        self.state.in_flight.ensure_open()?;
        Ok(Arc::new(self.context(options)))
    }

    fn run(
        &self,
        options: Option<&TransactionOptions>,
        logic: AttemptLogic,
        done: NativeCallback<TransactionResult>,
    ) {
        let guard = match self.state.in_flight.begin() {
            Ok(guard) => guard,
            Err(err) => return done(Err(err)),
        };
        let context = self.context(options);
        let spawned = thread::Builder::new()
            .name("txbridge-run".to_string())
            .spawn(move || {
                let result = attempt_loop(&context, &logic);
                guard.deliver(|| done(result));
            });
        if let Err(e) = spawned {
            // the callback went down with the closure and reports cancellation
            error!(error = %e, "failed to start transaction thread");
        }
    }

    fn close(&self) {
        let pending = self.state.in_flight.count();
        if pending > 0 {
            debug!(pending, "waiting for in-flight calls before close");
        }
        self.state.in_flight.close_and_drain();
        info!("in-memory transactions engine closed");
    }
}

/// Run attempts until one commits, a failure is final, the transaction
/// expires, or the attempt budget is spent.
fn attempt_loop(context: &MemoryContext, logic: &AttemptLogic) -> Result<TransactionResult, NativeError> {
    let native: Arc<dyn NativeContext> = Arc::new(context.clone());
    loop {
        let attempt = context.attempt_number();
        let outcome = logic(&native).and_then(|()| context.commit_attempt());
        let err = match outcome {
            Ok(result) => {
                debug!(transaction_id = %result.transaction_id, attempt, "transaction committed");
                return Ok(result);
            }
            Err(err) => err,
        };
        if let NativeError::Transaction { .. } = err {
            if let Err(rollback_err) = context.rollback_attempt() {
                warn!(error = %rollback_err, attempt, "rollback after final error did not complete");
            }
            return Err(err);
        }

        let (retry, rollback, to_raise) = match &err {
            NativeError::OperationFailed {
                retry,
                rollback,
                to_raise,
                ..
            } => (*retry, *rollback, *to_raise),
            _ => (false, true, FinalErrorKind::Failed),
        };
        if rollback {
            if let Err(rollback_err) = context.rollback_attempt() {
                warn!(error = %rollback_err, attempt, "rollback after failed attempt did not complete");
            }
        }

        let expired = context.is_expired();
        if retry && !expired && attempt < MAX_ATTEMPTS {
            debug!(error = %err, attempt, "retrying transaction");
            if let Err(start_err) = context.start_new_attempt() {
                return Err(context.final_error(FinalErrorKind::Failed, start_err));
            }
            continue;
        }

        let kind = if expired { FinalErrorKind::Expired } else { to_raise };
        return Err(context.final_error(kind, err));
    }
}
