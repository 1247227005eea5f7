//! Error Translator: native errors to host-visible categories.
//!
//! [`translate`] is total: every [`NativeError`] lands in exactly one
//! [`ErrorCategory`], with `Generic` as the catch-all for codes nobody
//! registered.

use crate::error::{ErrorCategory, InnerCause, TransactionError};
use crate::native::{FinalErrorKind, NativeError, codes};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Native error code → category, built once per process.
static CODE_REGISTRY: LazyLock<HashMap<i32, ErrorCategory>> = LazyLock::new(|| {
    HashMap::from([
        (codes::DOCUMENT_NOT_FOUND, ErrorCategory::DocumentNotFound),
        (codes::DOCUMENT_EXISTS, ErrorCategory::DocumentExists),
        (codes::FEATURE_NOT_AVAILABLE, ErrorCategory::FeatureNotAvailable),
        (codes::PARSING_FAILURE, ErrorCategory::QueryParsingFailure),
    ])
});

/// Category registered for a native error code.
pub fn category_for_code(code: i32) -> ErrorCategory {
    CODE_REGISTRY
        .get(&code)
        .copied()
        .unwrap_or(ErrorCategory::Generic)
}

/// Map a native error to the host error it surfaces as.
pub fn translate(error: NativeError) -> TransactionError {
    let (category, message, inner) = match &error {
        NativeError::Transaction {
            kind,
            message,
            cause,
            ..
        } => {
            let category = match kind {
                FinalErrorKind::Failed => ErrorCategory::TransactionFailed,
                FinalErrorKind::Expired => ErrorCategory::TransactionExpired,
                FinalErrorKind::CommitAmbiguous => ErrorCategory::TransactionCommitAmbiguous,
            };
            (category, message.clone(), cause.as_deref().map(inner_cause))
        }
        NativeError::OperationFailed { message, .. } => (
            ErrorCategory::TransactionOperationFailed,
            message.clone(),
            Some(inner_cause(&error)),
        ),
        NativeError::DocumentExists(id) => (ErrorCategory::DocumentExists, id.clone(), None),
        NativeError::DocumentNotFound(id) => (ErrorCategory::DocumentNotFound, id.clone(), None),
        NativeError::FeatureNotAvailable(what) => {
            (ErrorCategory::FeatureNotAvailable, what.clone(), None)
        }
        NativeError::QueryParsingFailure { message, .. } => {
            (ErrorCategory::QueryParsingFailure, message.clone(), None)
        }
        NativeError::Other { code, message } => (category_for_code(*code), message.clone(), None),
    };
    tracing::debug!(category = %category, native = %error, "translated native error");
    TransactionError::new(category, message, inner, error)
}

fn inner_cause(error: &NativeError) -> InnerCause {
    match error {
        NativeError::OperationFailed {
            class,
            message,
            retry,
            rollback,
            ..
        } => InnerCause {
            message: message.clone(),
            error_class: Some(*class),
            retry: *retry,
            rollback: *rollback,
        },
        other => InnerCause {
            message: other.to_string(),
            error_class: None,
            retry: false,
            rollback: false,
        },
    }
}
