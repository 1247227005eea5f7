//! Python exception hierarchy and `BridgeError` → `PyErr` conversion.

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyType};
use tracing::warn;
use txbridge_core::{BridgeError, ErrorCategory, LogicError, TransactionError};

// ═══════════════════════════════════════════════════════
// Exception hierarchy
// ═══════════════════════════════════════════════════════

pyo3::create_exception!(txbridge_native, TransactionsError, pyo3::exceptions::PyException, "Base exception for all transaction errors.");
pyo3::create_exception!(txbridge_native, TransactionFailed, TransactionsError, "The transaction failed and was rolled back.");
pyo3::create_exception!(txbridge_native, TransactionExpired, TransactionsError, "The transaction ran out of time.");
pyo3::create_exception!(txbridge_native, TransactionCommitAmbiguous, TransactionsError, "The commit outcome is unknown.");
pyo3::create_exception!(txbridge_native, TransactionOperationFailed, TransactionsError, "An operation inside the attempt failed.");
pyo3::create_exception!(txbridge_native, FeatureUnavailableError, TransactionsError, "The cluster does not support the requested feature.");
pyo3::create_exception!(txbridge_native, ParsingFailedError, TransactionsError, "The query statement could not be parsed.");
pyo3::create_exception!(txbridge_native, DocumentExistsError, TransactionsError, "The document already exists.");
pyo3::create_exception!(txbridge_native, DocumentNotFoundError, TransactionsError, "The document does not exist.");
pyo3::create_exception!(txbridge_native, InvalidArgumentError, TransactionsError, "An argument was rejected before dispatch.");
pyo3::create_exception!(txbridge_native, ConfigurationError, TransactionsError, "A configuration value was rejected.");
pyo3::create_exception!(txbridge_native, ConnectionError, TransactionsError, "The cluster connection is unusable.");
pyo3::create_exception!(txbridge_native, CompletionTimeoutError, TransactionsError, "A blocking call gave up waiting for the engine.");

/// Exception type raised for a transaction error category.
pub(crate) fn category_type(py: Python<'_>, category: ErrorCategory) -> Bound<'_, PyType> {
    match category {
        ErrorCategory::TransactionFailed => py.get_type_bound::<TransactionFailed>(),
        ErrorCategory::TransactionExpired => py.get_type_bound::<TransactionExpired>(),
        ErrorCategory::TransactionCommitAmbiguous => py.get_type_bound::<TransactionCommitAmbiguous>(),
        ErrorCategory::TransactionOperationFailed => py.get_type_bound::<TransactionOperationFailed>(),
        ErrorCategory::FeatureNotAvailable => py.get_type_bound::<FeatureUnavailableError>(),
        ErrorCategory::QueryParsingFailure => py.get_type_bound::<ParsingFailedError>(),
        ErrorCategory::DocumentExists => py.get_type_bound::<DocumentExistsError>(),
        ErrorCategory::DocumentNotFound => py.get_type_bound::<DocumentNotFoundError>(),
        ErrorCategory::Generic => py.get_type_bound::<TransactionsError>(),
    }
}

/// Carries the translated error on the exception instance so that raising it
/// from transaction logic hands the original error back to the engine.
#[pyclass(name = "_NativeError", module = "txbridge_native", frozen)]
pub(crate) struct NativeErrorRef {
    error: TransactionError,
}

#[pymethods]
impl NativeErrorRef {
    fn __repr__(&self) -> String {
        format!("<native {}>", self.error)
    }
}

fn decorate(py: Python<'_>, err: &PyErr, error: TransactionError) -> PyResult<()> {
    let value = err.value_bound(py);
    value.setattr("category", error.category().as_str())?;
    match error.inner_cause() {
        Some(cause) => {
            let dict = PyDict::new_bound(py);
            dict.set_item("message", &cause.message)?;
            dict.set_item("error_class", cause.error_class.map(|c| c.as_str()))?;
            dict.set_item("retry", cause.retry)?;
            dict.set_item("rollback", cause.rollback)?;
            value.setattr("inner_cause", dict)?;
        }
        None => value.setattr("inner_cause", py.None())?,
    }
    value.setattr("_native", Py::new(py, NativeErrorRef { error })?)?;
    Ok(())
}

fn transaction_err(py: Python<'_>, error: TransactionError) -> PyErr {
    let err = PyErr::from_type_bound(category_type(py, error.category()), error.to_string());
    if let Err(e) = decorate(py, &err, error) {
        warn!(error = %e, "could not attach error details to exception");
    }
    err
}

/// Map a bridge error to the matching Python exception.
pub(crate) fn to_py_err(py: Python<'_>, err: BridgeError) -> PyErr {
    match err {
        BridgeError::Transaction(error) => transaction_err(py, error),
        BridgeError::InvalidArgument(msg) => InvalidArgumentError::new_err(msg),
        BridgeError::Config(msg) => ConfigurationError::new_err(msg),
        BridgeError::Connection(msg) => ConnectionError::new_err(msg),
        err @ BridgeError::CompletionTimeout(_) => CompletionTimeoutError::new_err(err.to_string()),
        other => TransactionsError::new_err(other.to_string()),
    }
}

/// The exception instance handed to an error callback.
pub(crate) fn exception_instance(py: Python<'_>, err: BridgeError) -> PyObject {
    to_py_err(py, err).into_value(py).into_any()
}

/// Turn an exception raised by transaction logic into the engine's signal.
pub(crate) fn logic_error(py: Python<'_>, err: PyErr) -> LogicError {
    let value = err.value_bound(py);
    if let Ok(native) = value.getattr("_native") {
        if let Ok(native) = native.downcast::<NativeErrorRef>() {
            return LogicError::from(native.get().error.clone());
        }
    }
    LogicError::host(err.to_string())
}

pub(crate) fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add("TransactionsError", py.get_type_bound::<TransactionsError>())?;
    for category in ErrorCategory::ALL {
        if category != ErrorCategory::Generic {
            m.add(category.host_type_name(), category_type(py, category))?;
        }
    }
    m.add("InvalidArgumentError", py.get_type_bound::<InvalidArgumentError>())?;
    m.add("ConfigurationError", py.get_type_bound::<ConfigurationError>())?;
    m.add("ConnectionError", py.get_type_bound::<ConnectionError>())?;
    m.add("CompletionTimeoutError", py.get_type_bound::<CompletionTimeoutError>())?;
    m.add_class::<NativeErrorRef>()?;
    Ok(())
}
