//! txbridge PyO3 Native Python Bindings
//!
//! Exposes the transactions bridge to Python. Every operation can be called
//! blocking (returns the result, raises on failure) or with a
//! `callback`/`errback` pair, which then receives the result or the exception
//! instance on an engine thread while holding the GIL.

#![allow(clippy::useless_conversion)]

mod classes;
mod convert;
mod errors;
mod runtime;

use classes::{
    Cluster, PyAttemptContext, PyGetResult, PyQueryResult, PyTransactionConfig,
    PyTransactionOptions, PyTransactionQueryOptions, TransactionContext, Transactions,
    content_from_py, transaction_result_to_py,
};
use errors::{InvalidArgumentError, exception_instance, logic_error, to_py_err};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyInt, PyString};
use std::sync::Arc;
use tracing::warn;
use txbridge_core::bindings::Delivery;
use txbridge_core::{
    BridgeError, BridgeSettings, Callbacks, DocumentId, EngineHandle, HostRuntime, Operation,
    OperationKind, OperationResult, TransactionConfig, TransactionOps,
};

pub use runtime::GilRuntime;

// ═══════════════════════════════════════════════════════
// Callback plumbing
// ═══════════════════════════════════════════════════════

fn report_callback_error(py: Python<'_>, side: &str, err: PyErr) {
    warn!(side, error = %err, "python completion callback raised");
    err.print(py);
}

/// Pair `callback` and `errback` into [`Callbacks`]. Both or neither must be
/// given; neither means the call blocks.
fn callbacks<T: Send + 'static>(
    callback: Option<PyObject>,
    errback: Option<PyObject>,
    to_py: impl FnOnce(Python<'_>, T) -> PyResult<PyObject> + Send + 'static,
) -> PyResult<Option<Callbacks<T>>> {
    match (callback, errback) {
        (None, None) => Ok(None),
        (Some(callback), Some(errback)) => Ok(Some(Callbacks::new(
            move |value| {
                Python::with_gil(|py| {
                    if let Err(err) = to_py(py, value).and_then(|obj| callback.call1(py, (obj,))) {
                        report_callback_error(py, "callback", err);
                    }
                })
            },
            move |error| {
                Python::with_gil(|py| {
                    let exc = exception_instance(py, BridgeError::Transaction(error));
                    if let Err(err) = errback.call1(py, (exc,)) {
                        report_callback_error(py, "errback", err);
                    }
                })
            },
        ))),
        _ => Err(InvalidArgumentError::new_err(
            "callback and errback must be supplied together",
        )),
    }
}

fn operation_result_to_py(py: Python<'_>, result: OperationResult) -> PyResult<PyObject> {
    Ok(match result {
        OperationResult::Document(inner) => Py::new(py, PyGetResult { inner })?.into_any(),
        OperationResult::Removed => py.None(),
        OperationResult::Query(inner) => Py::new(py, PyQueryResult { inner })?.into_any(),
    })
}

fn unit_to_py(py: Python<'_>, (): ()) -> PyResult<PyObject> {
    Ok(py.None())
}

fn parse_kind(op: &Bound<'_, PyAny>) -> PyResult<OperationKind> {
    let py = op.py();
    if op.is_instance_of::<PyString>() {
        let name: String = op.extract()?;
        return name.parse().map_err(|e| to_py_err(py, e));
    }
    if op.is_instance_of::<PyInt>() {
        let code: u8 = op
            .extract()
            .map_err(|_| InvalidArgumentError::new_err("operation code out of range"))?;
        return OperationKind::from_code(code)
            .ok_or_else(|| InvalidArgumentError::new_err(format!("unknown operation code {code}")));
    }
    Err(InvalidArgumentError::new_err(
        "op must be an operation name or code",
    ))
}

// ═══════════════════════════════════════════════════════
// Engine lifecycle
// ═══════════════════════════════════════════════════════

/// Create a transactions engine on `cluster`. Blocks while connecting.
#[pyfunction]
#[pyo3(signature = (cluster, config=None, settings=None))]
fn create_transactions(
    py: Python<'_>,
    cluster: PyRef<'_, Cluster>,
    config: Option<PyRef<'_, PyTransactionConfig>>,
    settings: Option<&Bound<'_, PyDict>>,
) -> PyResult<Transactions> {
    let config = config.map(|c| c.inner.clone()).unwrap_or_else(TransactionConfig::new);
    let settings = match settings {
        Some(dict) => BridgeSettings::from_kwargs(convert::kwargs(Some(dict))?)
            .map_err(|e| to_py_err(py, e))?,
        None => BridgeSettings::default(),
    };
    let runtime: Arc<dyn HostRuntime> = Arc::new(GilRuntime);
    EngineHandle::create_with_settings(&cluster.inner, &config, settings, runtime)
        .map(Transactions::new)
        .map_err(|e| to_py_err(py, e))
}

/// Close the engine, waiting for in-flight transactions. Idempotent.
#[pyfunction]
fn destroy_transactions(transactions: PyRef<'_, Transactions>) {
    if let Some(handle) = transactions.take() {
        // other threads may still hold the engine mid-call; close drains them
        handle.close();
    }
}

#[pyfunction]
#[pyo3(signature = (transactions, options=None))]
fn create_transaction_context(
    py: Python<'_>,
    transactions: PyRef<'_, Transactions>,
    options: Option<PyRef<'_, PyTransactionOptions>>,
) -> PyResult<TransactionContext> {
    let engine = transactions.handle()?;
    engine
        .create_context(options.as_ref().map(|o| &o.inner))
        .map(TransactionContext::new)
        .map_err(|e| to_py_err(py, e))
}

#[pyfunction]
fn destroy_transaction_context(context: PyRef<'_, TransactionContext>) {
    if let Some(handle) = context.take() {
        if let Ok(handle) = Arc::try_unwrap(handle) {
            handle.destroy();
        }
    }
}

// ═══════════════════════════════════════════════════════
// Caller-driven transactions
// ═══════════════════════════════════════════════════════

/// Discard the current attempt and start a new one.
#[pyfunction]
#[pyo3(signature = (context, callback=None, errback=None))]
fn create_new_attempt_context(
    py: Python<'_>,
    context: PyRef<'_, TransactionContext>,
    callback: Option<PyObject>,
    errback: Option<PyObject>,
) -> PyResult<()> {
    let handle = context.handle()?;
    let result = match callbacks(callback, errback, unit_to_py)? {
        Some(callbacks) => handle.new_attempt_with(callbacks),
        None => handle.new_attempt(),
    };
    result.map_err(|e| to_py_err(py, e))
}

/// Run one key-value operation. `op` is an operation name or code.
///
/// GET and INSERT take the document identity; REPLACE and REMOVE take
/// `txn_get_result`. Returns the resulting document (or `None` for REMOVE)
/// when blocking, `None` in callback mode.
#[pyfunction]
#[pyo3(signature = (
    context, op, bucket=None, scope=None, collection=None, key=None,
    value=None, flags=None, txn_get_result=None, callback=None, errback=None
))]
#[allow(clippy::too_many_arguments)]
fn transaction_op(
    py: Python<'_>,
    context: PyRef<'_, TransactionContext>,
    op: &Bound<'_, PyAny>,
    bucket: Option<String>,
    scope: Option<String>,
    collection: Option<String>,
    key: Option<String>,
    value: Option<&Bound<'_, PyAny>>,
    flags: Option<u32>,
    txn_get_result: Option<PyRef<'_, PyGetResult>>,
    callback: Option<PyObject>,
    errback: Option<PyObject>,
) -> PyResult<PyObject> {
    let kind = parse_kind(op)?;
    let id = match (bucket, scope, collection, key) {
        (None, None, None, None) => None,
        (bucket, scope, collection, key) => Some(DocumentId::new(
            bucket.unwrap_or_default(),
            scope.unwrap_or_default(),
            collection.unwrap_or_default(),
            key.unwrap_or_default(),
        )),
    };
    let content = value.map(|v| content_from_py(v, flags)).transpose()?;
    let prior = txn_get_result.map(|r| r.inner.clone());
    let operation =
        Operation::from_parts(kind, id, content, prior).map_err(|e| to_py_err(py, e))?;

    let handle = context.handle()?;
    match callbacks(callback, errback, operation_result_to_py)? {
        Some(callbacks) => {
            handle
                .dispatch(operation, Delivery::Callback(callbacks))
                .map_err(|e| to_py_err(py, e))?;
            Ok(py.None())
        }
        None => {
            let result = handle
                .dispatch(operation, Delivery::Blocking)
                .and_then(|pending| pending.wait())
                .map_err(|e| to_py_err(py, e))?;
            operation_result_to_py(py, result)
        }
    }
}

/// Run a query inside the current attempt.
#[pyfunction]
#[pyo3(signature = (context, statement, options=None, callback=None, errback=None))]
fn transaction_query_op(
    py: Python<'_>,
    context: PyRef<'_, TransactionContext>,
    statement: String,
    options: Option<PyRef<'_, PyTransactionQueryOptions>>,
    callback: Option<PyObject>,
    errback: Option<PyObject>,
) -> PyResult<PyObject> {
    let options = options.map(|o| o.inner.clone()).unwrap_or_default();
    let handle = context.handle()?;
    match callbacks(callback, errback, |py, result| {
        Ok(Py::new(py, PyQueryResult { inner: result })?.into_any())
    })? {
        Some(callbacks) => {
            handle
                .query_with(&statement, &options, callbacks)
                .map_err(|e| to_py_err(py, e))?;
            Ok(py.None())
        }
        None => {
            let inner = handle
                .query(&statement, &options)
                .map_err(|e| to_py_err(py, e))?;
            Ok(Py::new(py, PyQueryResult { inner })?.into_any())
        }
    }
}

/// Commit the attempt. Returns `{"transaction_id", "unstaging_complete"}`
/// when blocking.
#[pyfunction]
#[pyo3(signature = (context, callback=None, errback=None))]
fn transaction_commit(
    py: Python<'_>,
    context: PyRef<'_, TransactionContext>,
    callback: Option<PyObject>,
    errback: Option<PyObject>,
) -> PyResult<PyObject> {
    let handle = context.handle()?;
    match callbacks(callback, errback, transaction_result_to_py)? {
        Some(callbacks) => {
            handle.commit_with(callbacks).map_err(|e| to_py_err(py, e))?;
            Ok(py.None())
        }
        None => {
            let result = handle.commit().map_err(|e| to_py_err(py, e))?;
            transaction_result_to_py(py, result)
        }
    }
}

#[pyfunction]
#[pyo3(signature = (context, callback=None, errback=None))]
fn transaction_rollback(
    py: Python<'_>,
    context: PyRef<'_, TransactionContext>,
    callback: Option<PyObject>,
    errback: Option<PyObject>,
) -> PyResult<()> {
    let handle = context.handle()?;
    let result = match callbacks(callback, errback, unit_to_py)? {
        Some(callbacks) => handle.rollback_with(callbacks),
        None => handle.rollback(),
    };
    result.map_err(|e| to_py_err(py, e))
}

// ═══════════════════════════════════════════════════════
// Engine-driven transactions
// ═══════════════════════════════════════════════════════

/// Run `logic(attempt)` in the engine's attempt loop until it commits or
/// fails for good. Raising a transaction exception from `logic` hands that
/// error to the engine; any other exception rolls the attempt back.
#[pyfunction]
#[pyo3(signature = (transactions, logic, options=None, callback=None, errback=None))]
fn run_transaction(
    py: Python<'_>,
    transactions: PyRef<'_, Transactions>,
    logic: PyObject,
    options: Option<PyRef<'_, PyTransactionOptions>>,
    callback: Option<PyObject>,
    errback: Option<PyObject>,
) -> PyResult<PyObject> {
    if !logic.bind(py).is_callable() {
        return Err(InvalidArgumentError::new_err("logic must be callable"));
    }
    let engine = transactions.handle()?;
    let options = options.map(|o| o.inner.clone());
    let logic = move |attempt: &txbridge_core::AttemptContext| {
        Python::with_gil(|py| {
            let ctx = Py::new(py, PyAttemptContext { inner: attempt.clone() })
                .map_err(|e| logic_error(py, e))?;
            logic
                .call1(py, (ctx,))
                .map(drop)
                .map_err(|e| logic_error(py, e))
        })
    };
    match callbacks(callback, errback, transaction_result_to_py)? {
        Some(callbacks) => {
            engine
                .run_with(options.as_ref(), logic, callbacks)
                .map_err(|e| to_py_err(py, e))?;
            Ok(py.None())
        }
        None => {
            let result = engine
                .run(options.as_ref(), logic)
                .map_err(|e| to_py_err(py, e))?;
            transaction_result_to_py(py, result)
        }
    }
}

/// Install a `tracing` subscriber printing to stderr. `TXBRIDGE_LOG` and
/// `RUST_LOG` take precedence over `level`.
#[pyfunction]
#[pyo3(signature = (level="info"))]
fn enable_logging(level: &str) {
    txbridge_core::logging::init_with_level(level);
}

// ═══════════════════════════════════════════════════════
// Module
// ═══════════════════════════════════════════════════════

#[pymodule]
fn txbridge_native(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    classes::register(m)?;
    errors::register(m)?;
    m.add_function(wrap_pyfunction!(create_transactions, m)?)?;
    m.add_function(wrap_pyfunction!(destroy_transactions, m)?)?;
    m.add_function(wrap_pyfunction!(create_transaction_context, m)?)?;
    m.add_function(wrap_pyfunction!(destroy_transaction_context, m)?)?;
    m.add_function(wrap_pyfunction!(create_new_attempt_context, m)?)?;
    m.add_function(wrap_pyfunction!(transaction_op, m)?)?;
    m.add_function(wrap_pyfunction!(transaction_query_op, m)?)?;
    m.add_function(wrap_pyfunction!(transaction_commit, m)?)?;
    m.add_function(wrap_pyfunction!(transaction_rollback, m)?)?;
    m.add_function(wrap_pyfunction!(run_transaction, m)?)?;
    m.add_function(wrap_pyfunction!(enable_logging, m)?)?;
    Ok(())
}
