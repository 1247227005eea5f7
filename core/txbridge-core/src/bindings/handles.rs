//! Engine and context handles.
//!
//! [`EngineHandle`] is the single owner of a native engine: it is not
//! `Clone`, and closing happens exactly once, either through
//! [`EngineHandle::destroy`] or on drop. [`ContextHandle`] keeps the native
//! engine allocation alive but stops dispatching once its engine is gone.

use super::BridgeShared;
use super::completion::{Callbacks, Completion, Delivery, PendingCall};
use super::dispatch::{Dispatcher, Operation, OperationResult, TransactionOps};
use super::invoker::{AttemptContext, LogicError, wrap_logic};
use super::runtime::{HostRuntime, with_detached};
use super::translator::translate;
use crate::config::{BridgeSettings, TransactionConfig, TransactionOptions};
use crate::error::{BridgeError, BridgeResult};
use crate::native::{NativeCluster, NativeEngine};
use crate::types::TransactionResult;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Owner of one native transactions engine.
pub struct EngineHandle {
    native: Arc<dyn NativeEngine>,
    shared: Arc<BridgeShared>,
}

impl EngineHandle {
    /// Build an engine on `cluster`. Blocks while the engine connects; the
    /// host execution lock is released meanwhile.
    pub fn create(
        cluster: &dyn NativeCluster,
        config: &TransactionConfig,
        runtime: Arc<dyn HostRuntime>,
    ) -> BridgeResult<Self> {
        Self::create_with_settings(cluster, config, BridgeSettings::default(), runtime)
    }

    #[instrument(skip_all, fields(runtime = runtime.name()))]
    pub fn create_with_settings(
        cluster: &dyn NativeCluster,
        config: &TransactionConfig,
        settings: BridgeSettings,
        runtime: Arc<dyn HostRuntime>,
    ) -> BridgeResult<Self> {
        config.validate()?;
        if !cluster.is_connected() {
            return Err(BridgeError::Connection(
                "cluster connection is closed or was never opened".to_string(),
            ));
        }
        let native = with_detached(runtime.as_ref(), || cluster.create_transactions(config))
            .map_err(|e| BridgeError::Transaction(translate(e)))?;
        info!(
            timeout = ?config.effective_timeout(),
            durability = config.effective_durability().as_str(),
            "transactions engine created"
        );
        Ok(Self {
            native,
            shared: Arc::new(BridgeShared::new(runtime, settings)),
        })
    }

    pub fn config(&self) -> &TransactionConfig {
        self.native.config()
    }

    pub fn settings(&self) -> &BridgeSettings {
        self.shared.settings()
    }

    pub fn runtime(&self) -> Arc<dyn HostRuntime> {
        Arc::clone(self.shared.runtime())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Contexts created from this engine and not yet destroyed.
    pub fn live_contexts(&self) -> usize {
        self.shared.live_contexts()
    }

    /// Start a caller-driven transaction. Does not block.
    pub fn create_context(&self, options: Option<&TransactionOptions>) -> BridgeResult<ContextHandle> {
        self.shared.ensure_open("create_context")?;
        if let Some(options) = options {
            options.validate()?;
        }
        let native = self
            .native
            .new_context(options)
            .map_err(|e| BridgeError::Transaction(translate(e)))?;
        let context = ContextHandle {
            dispatcher: Dispatcher::new(native, Arc::clone(&self.shared)),
            _engine: Arc::clone(&self.native),
            shared: Arc::clone(&self.shared),
        };
        self.shared.context_opened();
        debug!(transaction_id = %context.transaction_id(), "transaction context created");
        Ok(context)
    }

    /// Run `logic` in the engine's attempt loop and wait for the outcome.
    pub fn run<F>(&self, options: Option<&TransactionOptions>, logic: F) -> BridgeResult<TransactionResult>
    where
        F: Fn(&AttemptContext) -> Result<(), LogicError> + Send + Sync + 'static,
    {
        self.start_run(options, logic, Delivery::Blocking)?.wait()
    }

    /// Run `logic` in the engine's attempt loop; the outcome goes to `callbacks`.
    pub fn run_with<F>(
        &self,
        options: Option<&TransactionOptions>,
        logic: F,
        callbacks: Callbacks<TransactionResult>,
    ) -> BridgeResult<()>
    where
        F: Fn(&AttemptContext) -> Result<(), LogicError> + Send + Sync + 'static,
    {
        self.start_run(options, logic, Delivery::Callback(callbacks))
            .map(drop)
    }

    fn start_run<F>(
        &self,
        options: Option<&TransactionOptions>,
        logic: F,
        delivery: Delivery<TransactionResult>,
    ) -> BridgeResult<PendingCall<TransactionResult>>
    where
        F: Fn(&AttemptContext) -> Result<(), LogicError> + Send + Sync + 'static,
    {
        self.shared.ensure_open("run")?;
        if let Some(options) = options {
            options.validate()?;
        }
        let (completion, pending) = Completion::new(
            "run",
            delivery,
            self.runtime(),
            self.settings().completion_watchdog(),
        );
        let logic = wrap_logic(logic, Arc::clone(&self.shared));
        self.native.run(options, logic, completion.into_callback());
        Ok(pending)
    }

    /// Close the engine, blocking until in-flight work has drained.
    #[instrument(skip(self))]
    pub fn destroy(self) {
        self.close();
    }

    /// Close the engine through a shared reference. The first caller blocks
    /// until in-flight work has drained; later callers return at once.
    /// Called from inside a completion callback it does not wait for the
    /// call being delivered.
    pub fn close(&self) {
        if !self.shared.mark_closed() {
            return;
        }
        let live = self.shared.live_contexts();
        if live > 0 {
            warn!(live, "closing transactions engine with live contexts");
        }
        let native = &self.native;
        with_detached(self.shared.runtime().as_ref(), || native.close());
        info!("transactions engine closed");
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("closed", &self.is_closed())
            .field("live_contexts", &self.live_contexts())
            .finish()
    }
}

/// One caller-driven transaction.
///
/// Operations on a context must be serialized by the caller; the engine does
/// not support concurrent dispatch against one attempt.
pub struct ContextHandle {
    dispatcher: Dispatcher,
    _engine: Arc<dyn NativeEngine>,
    shared: Arc<BridgeShared>,
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle").finish_non_exhaustive()
    }
}

impl ContextHandle {
    pub fn transaction_id(&self) -> String {
        self.dispatcher.transaction_id()
    }

    pub fn attempt_id(&self) -> String {
        self.dispatcher.attempt_id()
    }

    /// Dispatch any operation with the chosen delivery.
    pub fn dispatch(
        &self,
        operation: Operation,
        delivery: Delivery<OperationResult>,
    ) -> BridgeResult<PendingCall<OperationResult>> {
        self.dispatcher.dispatch(operation, delivery)
    }

    /// Discard the current attempt and start a fresh one.
    pub fn new_attempt(&self) -> BridgeResult<()> {
        self.dispatcher.new_attempt(Delivery::Blocking)?.wait()
    }

    pub fn new_attempt_with(&self, callbacks: Callbacks<()>) -> BridgeResult<()> {
        self.dispatcher
            .new_attempt(Delivery::Callback(callbacks))
            .map(drop)
    }

    pub fn commit(&self) -> BridgeResult<TransactionResult> {
        self.dispatcher.commit(Delivery::Blocking)?.wait()
    }

    pub fn commit_with(&self, callbacks: Callbacks<TransactionResult>) -> BridgeResult<()> {
        self.dispatcher
            .commit(Delivery::Callback(callbacks))
            .map(drop)
    }

    pub fn rollback(&self) -> BridgeResult<()> {
        self.dispatcher.rollback(Delivery::Blocking)?.wait()
    }

    pub fn rollback_with(&self, callbacks: Callbacks<()>) -> BridgeResult<()> {
        self.dispatcher
            .rollback(Delivery::Callback(callbacks))
            .map(drop)
    }

    /// Release the context. Does not block.
    pub fn destroy(self) {
        debug!(transaction_id = %self.transaction_id(), "transaction context destroyed");
    }
}

impl TransactionOps for ContextHandle {
    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.shared.context_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::runtime::FreeThreaded;
    use crate::memory::MemoryCluster;
    use crate::types::DocumentId;

    fn runtime() -> Arc<dyn HostRuntime> {
        Arc::new(FreeThreaded)
    }

    #[test]
    fn disconnected_cluster_is_a_connection_error() {
        let cluster = MemoryCluster::new();
        cluster.disconnect();
        let err = EngineHandle::create(&cluster, &TransactionConfig::new(), runtime()).unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
    }

    #[test]
    fn contexts_are_counted() {
        let cluster = MemoryCluster::new();
        let engine = EngineHandle::create(&cluster, &TransactionConfig::new(), runtime()).unwrap();
        let first = engine.create_context(None).unwrap();
        let second = engine.create_context(None).unwrap();
        assert_eq!(engine.live_contexts(), 2);
        assert_ne!(first.transaction_id(), second.transaction_id());
        first.destroy();
        drop(second);
        assert_eq!(engine.live_contexts(), 0);
        engine.destroy();
    }

    #[test]
    fn dispatch_after_destroy_is_rejected() {
        let cluster = MemoryCluster::new();
        let engine = EngineHandle::create(&cluster, &TransactionConfig::new(), runtime()).unwrap();
        let ctx = engine.create_context(None).unwrap();
        engine.destroy();
        let err = ctx.get(DocumentId::new("b", "s", "c", "k")).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
        assert!(matches!(ctx.commit(), Err(BridgeError::InvalidArgument(_))));
    }
}
