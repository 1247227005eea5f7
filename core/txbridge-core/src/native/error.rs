//! Native error taxonomy: what the transactions engine throws.
//!
//! These values never reach the host directly; the bindings translator
//! (`bindings::translator`) maps every one of them onto an [`ErrorCategory`].
//!
//! [`ErrorCategory`]: crate::error::ErrorCategory

use std::fmt;
use thiserror::Error;

/// Numeric native error codes that travel inside [`NativeError::Other`].
pub mod codes {
    /// Request canceled before it produced a result.
    pub const REQUEST_CANCELED: i32 = 2;
    /// Invalid argument rejected by the engine.
    pub const INVALID_ARGUMENT: i32 = 3;
    /// Statement or payload failed to parse.
    pub const PARSING_FAILURE: i32 = 8;
    /// Feature not available on this cluster.
    pub const FEATURE_NOT_AVAILABLE: i32 = 15;
    /// Key-value document not found.
    pub const DOCUMENT_NOT_FOUND: i32 = 101;
    /// Key-value document already exists.
    pub const DOCUMENT_EXISTS: i32 = 105;
    /// Engine shut down while the request was queued.
    pub const ENGINE_CLOSED: i32 = 1001;
}

/// Classification of a failed operation inside an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    FailDocNotFound,
    FailDocAlreadyExists,
    FailCasMismatch,
    FailWriteWriteConflict,
    FailTransient,
    FailAmbiguous,
    FailHard,
    FailExpiry,
    FailOther,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::FailDocNotFound => "fail_doc_not_found",
            ErrorClass::FailDocAlreadyExists => "fail_doc_already_exists",
            ErrorClass::FailCasMismatch => "fail_cas_mismatch",
            ErrorClass::FailWriteWriteConflict => "fail_write_write_conflict",
            ErrorClass::FailTransient => "fail_transient",
            ErrorClass::FailAmbiguous => "fail_ambiguous",
            ErrorClass::FailHard => "fail_hard",
            ErrorClass::FailExpiry => "fail_expiry",
            ErrorClass::FailOther => "fail_other",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which final transaction error an operation failure turns into once the
/// engine gives up on the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinalErrorKind {
    Failed,
    Expired,
    CommitAmbiguous,
}

impl fmt::Display for FinalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FinalErrorKind::Failed => "failed",
            FinalErrorKind::Expired => "expired",
            FinalErrorKind::CommitAmbiguous => "commit ambiguous",
        })
    }
}

/// Errors produced by the native engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NativeError {
    /// Terminal transaction outcome raised after the engine stopped retrying
    #[error("transaction {kind}: {message}")]
    Transaction {
        kind: FinalErrorKind,
        message: String,
        transaction_id: String,
        cause: Option<Box<NativeError>>,
    },

    /// A single operation failed; flags tell the engine what to do next
    #[error("transaction operation failed ({class}): {message}")]
    OperationFailed {
        class: ErrorClass,
        message: String,
        retry: bool,
        rollback: bool,
        to_raise: FinalErrorKind,
    },

    #[error("document exists: {0}")]
    DocumentExists(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("feature not available: {0}")]
    FeatureNotAvailable(String),

    #[error("query parsing failure: {message}\nStatement: {statement}")]
    QueryParsingFailure { message: String, statement: String },

    /// Anything else, tagged with a numeric native error code
    #[error("native error {code}: {message}")]
    Other { code: i32, message: String },
}

impl NativeError {
    /// Operation failure that rolls the attempt back without retrying.
    pub fn operation_failed(class: ErrorClass, message: impl Into<String>) -> Self {
        NativeError::OperationFailed {
            class,
            message: message.into(),
            retry: false,
            rollback: true,
            to_raise: FinalErrorKind::Failed,
        }
    }

    /// Operation failure the engine may retry with a fresh attempt.
    pub fn retryable(class: ErrorClass, message: impl Into<String>) -> Self {
        NativeError::OperationFailed {
            class,
            message: message.into(),
            retry: true,
            rollback: true,
            to_raise: FinalErrorKind::Failed,
        }
    }

    /// Operation failure caused by the transaction running out of time.
    pub fn expired(message: impl Into<String>) -> Self {
        NativeError::OperationFailed {
            class: ErrorClass::FailExpiry,
            message: message.into(),
            retry: false,
            rollback: true,
            to_raise: FinalErrorKind::Expired,
        }
    }

    pub fn other(code: i32, message: impl Into<String>) -> Self {
        NativeError::Other {
            code,
            message: message.into(),
        }
    }

    /// Whether the engine may start another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NativeError::OperationFailed { retry: true, .. })
    }

    /// The message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            NativeError::Transaction { message, .. }
            | NativeError::OperationFailed { message, .. }
            | NativeError::QueryParsingFailure { message, .. }
            | NativeError::Other { message, .. } => message.clone(),
            NativeError::DocumentExists(id)
            | NativeError::DocumentNotFound(id)
            | NativeError::FeatureNotAvailable(id) => id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_failed_display_includes_class() {
        let err = NativeError::retryable(ErrorClass::FailCasMismatch, "cas changed");
        assert_eq!(
            err.to_string(),
            "transaction operation failed (fail_cas_mismatch): cas changed"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn expired_raises_expired() {
        match NativeError::expired("out of time") {
            NativeError::OperationFailed {
                to_raise, retry, ..
            } => {
                assert_eq!(to_raise, FinalErrorKind::Expired);
                assert!(!retry);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn message_strips_prefix() {
        let err = NativeError::other(codes::REQUEST_CANCELED, "dropped");
        assert_eq!(err.message(), "dropped");
        assert_eq!(err.to_string(), "native error 2: dropped");
    }
}
