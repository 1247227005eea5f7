//! Python classes: the in-memory cluster, config objects, engine and context
//! handles, and the result wrappers.

use crate::convert::{json_to_py, map_to_py, py_to_json};
use crate::errors::{InvalidArgumentError, to_py_err};
use parking_lot::Mutex;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict, PyList};
use std::sync::Arc;
use txbridge_core::memory::{FaultPoint, MemoryCluster};
use txbridge_core::native::{ErrorClass, NativeError};
use txbridge_core::{
    AttemptContext, BridgeError, Content, ContextHandle, DocumentId, EngineHandle, QueryResult,
    TransactionConfig, TransactionGetResult, TransactionOps, TransactionOptions,
    TransactionQueryOptions, TransactionResult,
};

/// Build a document payload from a host value. `bytes` are stored as-is,
/// anything else is encoded as JSON. `flags` overrides the format flags.
pub(crate) fn content_from_py(value: &Bound<'_, PyAny>, flags: Option<u32>) -> PyResult<Content> {
    let py = value.py();
    let content = if let Ok(bytes) = value.downcast::<PyBytes>() {
        Content::binary(bytes.as_bytes())
    } else {
        Content::json(&py_to_json(value)?).map_err(|e| to_py_err(py, e))?
    };
    Ok(match flags {
        Some(flags) => Content::new(content.data, flags),
        None => content,
    })
}

/// Decoded body when it is JSON, the raw bytes otherwise.
fn content_to_py(py: Python<'_>, content: &Content) -> PyResult<PyObject> {
    if content.is_json() {
        let value = content.to_json().map_err(|e| to_py_err(py, e))?;
        json_to_py(py, &value)
    } else {
        Ok(PyBytes::new_bound(py, &content.data).into_any().unbind())
    }
}

pub(crate) fn transaction_result_to_py(py: Python<'_>, result: TransactionResult) -> PyResult<PyObject> {
    let dict = PyDict::new_bound(py);
    dict.set_item("transaction_id", result.transaction_id)?;
    dict.set_item("unstaging_complete", result.unstaging_complete)?;
    Ok(dict.into_any().unbind())
}

// ═══════════════════════════════════════════════════════
// Cluster
// ═══════════════════════════════════════════════════════

/// In-memory cluster the engines run against.
#[pyclass(module = "txbridge_native", frozen)]
pub struct Cluster {
    pub(crate) inner: MemoryCluster,
}

#[pymethods]
impl Cluster {
    #[new]
    fn new() -> Self {
        Cluster {
            inner: MemoryCluster::new(),
        }
    }

    /// Write a committed document outside any transaction; returns its cas.
    #[pyo3(signature = (bucket, scope, collection, key, value, flags=None))]
    fn upsert(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        key: &str,
        value: &Bound<'_, PyAny>,
        flags: Option<u32>,
    ) -> PyResult<u64> {
        let content = content_from_py(value, flags)?;
        Ok(self
            .inner
            .store()
            .upsert(DocumentId::new(bucket, scope, collection, key), content))
    }

    /// Committed body of a document, or `None`.
    fn get(
        &self,
        py: Python<'_>,
        bucket: &str,
        scope: &str,
        collection: &str,
        key: &str,
    ) -> PyResult<Option<PyObject>> {
        match self
            .inner
            .store()
            .get(&DocumentId::new(bucket, scope, collection, key))
        {
            Some(doc) => content_to_py(py, &doc.content).map(Some),
            None => Ok(None),
        }
    }

    fn contains(&self, bucket: &str, scope: &str, collection: &str, key: &str) -> bool {
        self.inner
            .store()
            .contains(&DocumentId::new(bucket, scope, collection, key))
    }

    fn __len__(&self) -> usize {
        self.inner.store().len()
    }

    fn disconnect(&self) {
        self.inner.disconnect();
    }

    fn set_query_support(&self, enabled: bool) {
        self.inner.set_query_support(enabled);
    }

    /// Make the next operation at `point` fail.
    #[pyo3(signature = (point, message, retryable=false))]
    fn fail_next(&self, py: Python<'_>, point: &str, message: &str, retryable: bool) -> PyResult<()> {
        let point: FaultPoint = point.parse().map_err(|e| to_py_err(py, e))?;
        let error = if retryable {
            NativeError::retryable(ErrorClass::FailTransient, message)
        } else {
            NativeError::operation_failed(ErrorClass::FailOther, message)
        };
        self.inner.fail_next(point, error);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════
// Config objects
// ═══════════════════════════════════════════════════════

macro_rules! kwargs_class {
    ($py_name:ident, $name:literal, $inner:ty) => {
        #[pyclass(module = "txbridge_native", name = $name, frozen)]
        pub struct $py_name {
            pub(crate) inner: $inner,
        }

        #[pymethods]
        impl $py_name {
            #[new]
            #[pyo3(signature = (**kwargs))]
            fn new(py: Python<'_>, kwargs: Option<&Bound<'_, PyDict>>) -> PyResult<Self> {
                let kwargs = crate::convert::kwargs(kwargs)?;
                <$inner>::from_kwargs(kwargs)
                    .map(|inner| $py_name { inner })
                    .map_err(|e| to_py_err(py, e))
            }

            /// The explicitly supplied fields, durations in milliseconds.
            fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
                map_to_py(py, &self.inner.to_dict())
            }

            fn __repr__(&self) -> String {
                format!(
                    "{}({})",
                    $name,
                    serde_json::Value::Object(self.inner.to_dict())
                )
            }
        }
    };
}

kwargs_class!(PyTransactionConfig, "TransactionConfig", TransactionConfig);
kwargs_class!(PyTransactionOptions, "TransactionOptions", TransactionOptions);
kwargs_class!(PyTransactionQueryOptions, "TransactionQueryOptions", TransactionQueryOptions);

// ═══════════════════════════════════════════════════════
// Handles
// ═══════════════════════════════════════════════════════

/// A transactions engine. Destroy it with `destroy_transactions`.
#[pyclass(module = "txbridge_native", frozen)]
pub struct Transactions {
    handle: Mutex<Option<Arc<EngineHandle>>>,
}

impl Transactions {
    pub(crate) fn new(handle: EngineHandle) -> Self {
        Transactions {
            handle: Mutex::new(Some(Arc::new(handle))),
        }
    }

    /// The live engine. The lock is released before the caller blocks.
    pub(crate) fn handle(&self) -> PyResult<Arc<EngineHandle>> {
        self.handle
            .lock()
            .clone()
            .ok_or_else(|| InvalidArgumentError::new_err("transactions engine was destroyed"))
    }

    pub(crate) fn take(&self) -> Option<Arc<EngineHandle>> {
        self.handle.lock().take()
    }
}

#[pymethods]
impl Transactions {
    #[getter]
    fn closed(&self) -> bool {
        self.handle.lock().as_ref().map_or(true, |h| h.is_closed())
    }

    #[getter]
    fn live_contexts(&self) -> usize {
        self.handle.lock().as_ref().map_or(0, |h| h.live_contexts())
    }

    /// Effective configuration as supplied at creation.
    fn config<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        map_to_py(py, &self.handle()?.config().to_dict())
    }

    fn __repr__(&self) -> String {
        format!("Transactions(closed={})", self.closed())
    }
}

/// A caller-driven transaction.
#[pyclass(module = "txbridge_native", frozen)]
pub struct TransactionContext {
    handle: Mutex<Option<Arc<ContextHandle>>>,
}

impl TransactionContext {
    pub(crate) fn new(handle: ContextHandle) -> Self {
        TransactionContext {
            handle: Mutex::new(Some(Arc::new(handle))),
        }
    }

    pub(crate) fn handle(&self) -> PyResult<Arc<ContextHandle>> {
        self.handle
            .lock()
            .clone()
            .ok_or_else(|| InvalidArgumentError::new_err("transaction context was destroyed"))
    }

    pub(crate) fn take(&self) -> Option<Arc<ContextHandle>> {
        self.handle.lock().take()
    }
}

#[pymethods]
impl TransactionContext {
    #[getter]
    fn transaction_id(&self) -> PyResult<String> {
        Ok(self.handle()?.transaction_id())
    }

    #[getter]
    fn attempt_id(&self) -> PyResult<String> {
        Ok(self.handle()?.attempt_id())
    }

    fn __repr__(&self) -> String {
        match self.handle.lock().as_ref() {
            Some(h) => format!("TransactionContext(transaction_id={:?})", h.transaction_id()),
            None => "TransactionContext(<destroyed>)".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════

/// A document as seen by one attempt.
#[pyclass(module = "txbridge_native", name = "TransactionGetResult", frozen)]
pub struct PyGetResult {
    pub(crate) inner: TransactionGetResult,
}

#[pymethods]
impl PyGetResult {
    #[getter]
    fn key(&self) -> &str {
        self.inner.key()
    }

    #[getter]
    fn bucket(&self) -> &str {
        &self.inner.id().bucket
    }

    #[getter]
    fn scope(&self) -> &str {
        &self.inner.id().scope
    }

    #[getter]
    fn collection(&self) -> &str {
        &self.inner.id().collection
    }

    #[getter]
    fn cas(&self) -> u64 {
        self.inner.cas()
    }

    #[getter]
    fn flags(&self) -> u32 {
        self.inner.content().flags
    }

    #[getter]
    fn transaction_id(&self) -> &str {
        self.inner.transaction_id()
    }

    #[getter]
    fn attempt_id(&self) -> &str {
        self.inner.attempt_id()
    }

    /// Raw body bytes.
    #[getter]
    fn content<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new_bound(py, &self.inner.content().data)
    }

    /// Body decoded from JSON when flagged as JSON, raw bytes otherwise.
    #[getter]
    fn value(&self, py: Python<'_>) -> PyResult<PyObject> {
        content_to_py(py, self.inner.content())
    }

    fn __repr__(&self) -> String {
        format!(
            "TransactionGetResult(id={:?}, cas={})",
            self.inner.id().to_string(),
            self.inner.cas()
        )
    }
}

/// Raw body of a transactional query.
#[pyclass(module = "txbridge_native", name = "TransactionQueryResult", frozen)]
pub struct PyQueryResult {
    pub(crate) inner: QueryResult,
}

#[pymethods]
impl PyQueryResult {
    #[getter]
    fn raw<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new_bound(py, self.inner.raw())
    }

    /// The whole response body.
    fn body(&self, py: Python<'_>) -> PyResult<PyObject> {
        let body = self.inner.to_json().map_err(|e| to_py_err(py, e))?;
        json_to_py(py, &body)
    }

    /// The `results` rows.
    fn rows<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyList>> {
        let rows = self.inner.rows().map_err(|e| to_py_err(py, e))?;
        let list = PyList::empty_bound(py);
        for row in &rows {
            list.append(json_to_py(py, row)?)?;
        }
        Ok(list)
    }
}

// ═══════════════════════════════════════════════════════
// Attempt context handed to run_transaction logic
// ═══════════════════════════════════════════════════════

/// The attempt a `run_transaction` logic function works in.
#[pyclass(module = "txbridge_native", name = "AttemptContext", frozen)]
pub struct PyAttemptContext {
    pub(crate) inner: AttemptContext,
}

fn doc_result(py: Python<'_>, result: Result<TransactionGetResult, BridgeError>) -> PyResult<PyGetResult> {
    result
        .map(|inner| PyGetResult { inner })
        .map_err(|e| to_py_err(py, e))
}

#[pymethods]
impl PyAttemptContext {
    #[getter]
    fn transaction_id(&self) -> String {
        self.inner.transaction_id()
    }

    #[getter]
    fn attempt_id(&self) -> String {
        self.inner.attempt_id()
    }

    fn get(
        &self,
        py: Python<'_>,
        bucket: &str,
        scope: &str,
        collection: &str,
        key: &str,
    ) -> PyResult<PyGetResult> {
        let id = DocumentId::new(bucket, scope, collection, key);
        doc_result(py, self.inner.get(id))
    }

    #[pyo3(signature = (bucket, scope, collection, key, value, flags=None))]
    fn insert(
        &self,
        py: Python<'_>,
        bucket: &str,
        scope: &str,
        collection: &str,
        key: &str,
        value: &Bound<'_, PyAny>,
        flags: Option<u32>,
    ) -> PyResult<PyGetResult> {
        let id = DocumentId::new(bucket, scope, collection, key);
        let content = content_from_py(value, flags)?;
        doc_result(py, self.inner.insert(id, content))
    }

    #[pyo3(signature = (txn_get_result, value, flags=None))]
    fn replace(
        &self,
        py: Python<'_>,
        txn_get_result: PyRef<'_, PyGetResult>,
        value: &Bound<'_, PyAny>,
        flags: Option<u32>,
    ) -> PyResult<PyGetResult> {
        let content = content_from_py(value, flags)?;
        doc_result(py, self.inner.replace(&txn_get_result.inner, content))
    }

    fn remove(&self, py: Python<'_>, txn_get_result: PyRef<'_, PyGetResult>) -> PyResult<()> {
        self.inner
            .remove(&txn_get_result.inner)
            .map_err(|e| to_py_err(py, e))
    }

    #[pyo3(signature = (statement, options=None))]
    fn query(
        &self,
        py: Python<'_>,
        statement: String,
        options: Option<PyRef<'_, PyTransactionQueryOptions>>,
    ) -> PyResult<PyQueryResult> {
        let options = options.map(|o| o.inner.clone()).unwrap_or_default();
        self.inner
            .query(&statement, &options)
            .map(|inner| PyQueryResult { inner })
            .map_err(|e| to_py_err(py, e))
    }
}

pub(crate) fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Cluster>()?;
    m.add_class::<PyTransactionConfig>()?;
    m.add_class::<PyTransactionOptions>()?;
    m.add_class::<PyTransactionQueryOptions>()?;
    m.add_class::<Transactions>()?;
    m.add_class::<TransactionContext>()?;
    m.add_class::<PyGetResult>()?;
    m.add_class::<PyQueryResult>()?;
    m.add_class::<PyAttemptContext>()?;
    Ok(())
}
