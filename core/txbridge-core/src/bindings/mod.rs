//! The bridge layer between a host runtime and the native transactions engine.
//!
//! Shared by every language binding (Python, C) so that validation, error
//! categories and completion semantics stay identical across hosts.
//!
//! - [`runtime`]: the host execution lock model
//! - [`translator`]: native error to host category mapping
//! - [`completion`]: blocking and callback delivery of one call
//! - [`dispatch`]: transactional operations against one attempt
//! - [`handles`]: engine and context lifecycle
//! - [`invoker`]: host transaction logic run once per attempt

pub mod completion;
pub mod dispatch;
pub mod handles;
pub mod invoker;
pub mod runtime;
pub mod translator;

pub use completion::{Callbacks, Completion, CompletionState, Delivery, PendingCall};
pub use dispatch::{Dispatcher, Operation, OperationKind, OperationResult, TransactionOps};
pub use handles::{ContextHandle, EngineHandle};
pub use invoker::{AttemptContext, LogicError};
pub use runtime::{FreeThreaded, HostRuntime, InterpreterLock, with_detached, with_host};
pub use translator::{category_for_code, translate};

use crate::config::BridgeSettings;
use crate::error::{BridgeError, BridgeResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// State shared by an engine handle and everything derived from it.
pub(crate) struct BridgeShared {
    runtime: Arc<dyn HostRuntime>,
    settings: BridgeSettings,
    closed: AtomicBool,
    live_contexts: AtomicUsize,
}

impl BridgeShared {
    pub(crate) fn new(runtime: Arc<dyn HostRuntime>, settings: BridgeSettings) -> Self {
        Self {
            runtime,
            settings,
            closed: AtomicBool::new(false),
            live_contexts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn HostRuntime> {
        &self.runtime
    }

    pub(crate) fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip to closed; true only for the caller that actually closed it.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn ensure_open(&self, operation: &str) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(BridgeError::InvalidArgument(format!(
                "{operation} called on a destroyed transactions engine"
            )));
        }
        Ok(())
    }

    pub(crate) fn context_opened(&self) {
        self.live_contexts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn context_closed(&self) {
        self.live_contexts.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::Acquire)
    }
}
