//! Error types for the transactions bridge.
//!
//! All public APIs return `BridgeResult<T>`; no panics in library code.
//! Failures reported by the native engine reach callers as a
//! [`TransactionError`], whose [`ErrorCategory`] is drawn from a closed set.

use crate::native::{ErrorClass, NativeError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Closed set of host-visible transaction error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    TransactionFailed,
    TransactionExpired,
    TransactionCommitAmbiguous,
    TransactionOperationFailed,
    FeatureNotAvailable,
    QueryParsingFailure,
    DocumentExists,
    DocumentNotFound,
    /// Wrapped native error that matched no specific category
    Generic,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::TransactionFailed,
        ErrorCategory::TransactionExpired,
        ErrorCategory::TransactionCommitAmbiguous,
        ErrorCategory::TransactionOperationFailed,
        ErrorCategory::FeatureNotAvailable,
        ErrorCategory::QueryParsingFailure,
        ErrorCategory::DocumentExists,
        ErrorCategory::DocumentNotFound,
        ErrorCategory::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::TransactionFailed => "transaction_failed",
            ErrorCategory::TransactionExpired => "transaction_expired",
            ErrorCategory::TransactionCommitAmbiguous => "transaction_commit_ambiguous",
            ErrorCategory::TransactionOperationFailed => "transaction_operation_failed",
            ErrorCategory::FeatureNotAvailable => "feature_not_available",
            ErrorCategory::QueryParsingFailure => "query_parsing_failure",
            ErrorCategory::DocumentExists => "document_exists",
            ErrorCategory::DocumentNotFound => "document_not_found",
            ErrorCategory::Generic => "generic",
        }
    }

    /// Name of the exception type a host binding raises for this category.
    pub fn host_type_name(&self) -> &'static str {
        match self {
            ErrorCategory::TransactionFailed => "TransactionFailed",
            ErrorCategory::TransactionExpired => "TransactionExpired",
            ErrorCategory::TransactionCommitAmbiguous => "TransactionCommitAmbiguous",
            ErrorCategory::TransactionOperationFailed => "TransactionOperationFailed",
            ErrorCategory::FeatureNotAvailable => "FeatureUnavailableError",
            ErrorCategory::QueryParsingFailure => "ParsingFailedError",
            ErrorCategory::DocumentExists => "DocumentExistsError",
            ErrorCategory::DocumentNotFound => "DocumentNotFoundError",
            ErrorCategory::Generic => "TransactionsError",
        }
    }

    pub fn parse_category(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic payload of the error that caused a transaction-level failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerCause {
    pub message: String,
    pub error_class: Option<ErrorClass>,
    pub retry: bool,
    pub rollback: bool,
}

/// A native failure after translation, as delivered to the host.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{category}: {message}")]
pub struct TransactionError {
    category: ErrorCategory,
    message: String,
    inner_cause: Option<InnerCause>,
    origin: NativeError,
}

impl TransactionError {
    pub(crate) fn new(
        category: ErrorCategory,
        message: String,
        inner_cause: Option<InnerCause>,
        origin: NativeError,
    ) -> Self {
        Self {
            category,
            message,
            inner_cause,
            origin,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn inner_cause(&self) -> Option<&InnerCause> {
        self.inner_cause.as_ref()
    }

    /// The native error this was translated from.
    pub fn native(&self) -> &NativeError {
        &self.origin
    }

    /// Hand the original native error back, e.g. to re-raise it into the engine.
    pub fn into_native(self) -> NativeError {
        self.origin
    }
}

/// Unified error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed identity, missing payload, foreign prior result, destroyed handle
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration value rejected before reaching the engine
    #[error("configuration error: {0}")]
    Config(String),

    /// Cluster handle unusable for creating a transactions engine
    #[error("connection error: {0}")]
    Connection(String),

    /// Failure reported by the native engine, already translated
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Blocking wait gave up before the engine completed the call
    #[error("completion not delivered within {0:?}")]
    CompletionTimeout(Duration),

    /// A completion was fulfilled a second time
    #[error("{0} completion was already fulfilled")]
    AlreadyFulfilled(&'static str),

    /// Engine returned a result of the wrong shape for the operation
    #[error("unexpected result: expected {expected}, got {actual}")]
    UnexpectedResult {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Category of the underlying transaction error, if any.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            BridgeError::Transaction(e) => Some(e.category()),
            _ => None,
        }
    }
}

/// Result type alias for all bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_names_round_trip() {
        for category in ErrorCategory::ALL {
            assert_eq!(ErrorCategory::parse_category(category.as_str()), Some(category));
        }
        assert_eq!(ErrorCategory::parse_category("nope"), None);
    }

    #[test]
    fn error_display_invalid_argument() {
        let err = BridgeError::InvalidArgument("insert requires a payload".to_string());
        assert_eq!(err.to_string(), "invalid argument: insert requires a payload");
        assert_eq!(err.category(), None);
    }

    #[test]
    fn error_display_transaction() {
        let err: BridgeError = TransactionError::new(
            ErrorCategory::DocumentNotFound,
            "b.s.c/k".to_string(),
            None,
            NativeError::DocumentNotFound("b.s.c/k".to_string()),
        )
        .into();
        assert_eq!(err.to_string(), "document_not_found: b.s.c/k");
        assert_eq!(err.category(), Some(ErrorCategory::DocumentNotFound));
    }

    #[test]
    fn serde_errors_convert() {
        let err: BridgeError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, BridgeError::Serialization(_)));
    }
}
