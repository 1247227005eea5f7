//! Transaction logic invoker.
//!
//! Wraps host logic so the engine can run it once per attempt. Recognized
//! transaction errors go back to the engine unchanged; anything else the
//! logic raises becomes a non-retryable operation failure so the engine rolls
//! the attempt back instead of committing partial work.

use super::BridgeShared;
use super::dispatch::{Dispatcher, TransactionOps};
use super::runtime::with_host;
use crate::error::{BridgeError, TransactionError};
use crate::native::{AttemptLogic, ErrorClass, FinalErrorKind, NativeContext, NativeError};
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Error returned by host transaction logic.
#[derive(Debug, Error)]
pub enum LogicError {
    /// A bridge call inside the logic failed; transaction errors among these
    /// are handed back to the engine as-is.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Anything raised by the host itself.
    #[error("{0}")]
    Host(Box<dyn StdError + Send + Sync>),
}

impl LogicError {
    pub fn host(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        LogicError::Host(err.into())
    }
}

impl From<TransactionError> for LogicError {
    fn from(err: TransactionError) -> Self {
        LogicError::Bridge(BridgeError::Transaction(err))
    }
}

/// The view of one attempt handed to host logic. Clones share the attempt.
#[derive(Clone)]
pub struct AttemptContext {
    dispatcher: Dispatcher,
}

impl AttemptContext {
    pub fn transaction_id(&self) -> String {
        self.dispatcher.transaction_id()
    }

    pub fn attempt_id(&self) -> String {
        self.dispatcher.attempt_id()
    }
}

impl TransactionOps for AttemptContext {
    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

pub(crate) fn wrap_logic<F>(logic: F, shared: Arc<BridgeShared>) -> AttemptLogic
where
    F: Fn(&AttemptContext) -> Result<(), LogicError> + Send + Sync + 'static,
{
    Arc::new(move |native: &Arc<dyn NativeContext>| {
        let attempt = AttemptContext {
            dispatcher: Dispatcher::new(Arc::clone(native), Arc::clone(&shared)),
        };
        debug!(attempt_id = %attempt.attempt_id(), "invoking transaction logic");
        // the error value is consumed under the host lock
        with_host(shared.runtime().as_ref(), || {
            logic(&attempt).map_err(into_native_signal)
        })
    })
}

fn into_native_signal(err: LogicError) -> NativeError {
    match err {
        LogicError::Bridge(BridgeError::Transaction(err)) => {
            debug!(category = %err.category(), "transaction logic raised a transaction error");
            err.into_native()
        }
        other => {
            warn!(error = %other, "transaction logic raised a host error; rolling back");
            NativeError::OperationFailed {
                class: ErrorClass::FailOther,
                message: other.to_string(),
                retry: false,
                rollback: true,
                to_raise: FinalErrorKind::Failed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::translator::translate;

    #[test]
    fn host_errors_become_rollback_failures() {
        let signal = into_native_signal(LogicError::host("boom"));
        match signal {
            NativeError::OperationFailed {
                class,
                message,
                retry,
                rollback,
                to_raise,
            } => {
                assert_eq!(class, ErrorClass::FailOther);
                assert_eq!(message, "boom");
                assert!(!retry);
                assert!(rollback);
                assert_eq!(to_raise, FinalErrorKind::Failed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transaction_errors_pass_through() {
        let native = NativeError::retryable(ErrorClass::FailWriteWriteConflict, "conflict");
        let signal = into_native_signal(translate(native.clone()).into());
        assert_eq!(signal, native);
    }

    #[test]
    fn other_bridge_errors_are_host_failures() {
        let signal = into_native_signal(
            BridgeError::InvalidArgument("insert requires a payload".into()).into(),
        );
        assert!(matches!(
            signal,
            NativeError::OperationFailed {
                class: ErrorClass::FailOther,
                retry: false,
                ..
            }
        ));
    }
}
