//! txbridge C FFI Bindings
//!
//! C-compatible entry points for the transactions bridge. Handles are opaque
//! boxed pointers; every fallible call returns a status code and leaves a
//! message for [`txb_last_error_message`] on the calling thread.
//!
//! Configuration travels as JSON object text using the same keyword names as
//! the other bindings (durations in milliseconds). A null or empty string
//! means "no options".

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

use libc::{c_char, c_int, c_void};
use serde_json::Value;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;
use std::slice;
use std::sync::Arc;
use tracing::debug;
use txbridge_core::bindings::{Delivery, Dispatcher};
use txbridge_core::config::Kwargs;
use txbridge_core::memory::MemoryCluster;
use txbridge_core::types::flags;
use txbridge_core::{
    AttemptContext, BridgeError, BridgeSettings, Callbacks, Content, ContextHandle, DocumentId,
    EngineHandle, ErrorCategory, FreeThreaded, HostRuntime, LogicError, Operation, OperationKind,
    OperationResult, QueryResult, TransactionConfig, TransactionError, TransactionGetResult,
    TransactionOps, TransactionOptions, TransactionQueryOptions,
};

/// Opaque handle to an in-memory cluster
pub struct TxbCluster {
    cluster: MemoryCluster,
}

/// Opaque handle to a transactions engine
pub struct TxbEngine {
    engine: EngineHandle,
}

/// Opaque handle to a caller-driven transaction
pub struct TxbContext {
    context: ContextHandle,
}

/// The attempt handed to [`TxbLogicFn`]; valid only during that call
pub struct TxbAttempt {
    attempt: AttemptContext,
}

/// Opaque document result
pub struct TxbGetResult {
    result: TransactionGetResult,
    key: CString,
    transaction_id: CString,
}

/// Opaque query result
pub struct TxbQueryResult {
    result: QueryResult,
}

/// Status codes
pub const TXB_OK: c_int = 0;
pub const TXB_ERR_NULL_PTR: c_int = -1;
pub const TXB_ERR_INVALID_UTF8: c_int = -2;
pub const TXB_ERR_INVALID_ARGUMENT: c_int = -3;
pub const TXB_ERR_CONFIG: c_int = -4;
pub const TXB_ERR_CONNECTION: c_int = -5;
pub const TXB_ERR_TRANSACTION_FAILED: c_int = -10;
pub const TXB_ERR_TRANSACTION_EXPIRED: c_int = -11;
pub const TXB_ERR_COMMIT_AMBIGUOUS: c_int = -12;
pub const TXB_ERR_OPERATION_FAILED: c_int = -13;
pub const TXB_ERR_FEATURE_NOT_AVAILABLE: c_int = -14;
pub const TXB_ERR_QUERY_PARSING: c_int = -15;
pub const TXB_ERR_DOCUMENT_EXISTS: c_int = -16;
pub const TXB_ERR_DOCUMENT_NOT_FOUND: c_int = -17;
pub const TXB_ERR_GENERIC: c_int = -18;
pub const TXB_ERR_COMPLETION_TIMEOUT: c_int = -20;
pub const TXB_ERR_INTERNAL: c_int = -21;

/// Completion of [`txb_kv_op_async`]. `result` is owned by the callee (free
/// it with [`txb_get_result_free`]) and is null on error and for REMOVE.
/// `message` is only valid during the call.
pub type TxbKvCallback =
    extern "C" fn(user_data: *mut c_void, status: c_int, result: *mut TxbGetResult, message: *const c_char);

/// Completion of [`txb_commit_async`].
pub type TxbCommitCallback =
    extern "C" fn(user_data: *mut c_void, status: c_int, unstaging_complete: c_int, message: *const c_char);

/// Completion of [`txb_query_async`]. `result` is owned by the callee (free
/// it with [`txb_query_result_free`]) and is null on error.
pub type TxbQueryCallback =
    extern "C" fn(user_data: *mut c_void, status: c_int, result: *mut TxbQueryResult, message: *const c_char);

/// Completion of [`txb_rollback_async`].
pub type TxbStatusCallback = extern "C" fn(user_data: *mut c_void, status: c_int, message: *const c_char);

/// Transaction logic for [`txb_run`]. Returning a status other than
/// `TXB_OK` fails the attempt; returning the status of a failed
/// `txb_attempt_*` call hands that error back to the engine.
pub type TxbLogicFn = extern "C" fn(user_data: *mut c_void, attempt: *const TxbAttempt) -> c_int;

// ═══════════════════════════════════════════════════════════════
// Diagnostics
// ═══════════════════════════════════════════════════════════════

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
    static LAST_TRANSACTION_ERROR: RefCell<Option<TransactionError>> = const { RefCell::new(None) };
}

fn to_cstring(text: impl Into<String>) -> CString {
    let mut text = text.into();
    text.retain(|c| c != '\0');
    CString::new(text).unwrap_or_default()
}

fn set_last_error(message: impl Into<String>) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(to_cstring(message)));
}

fn category_status(category: ErrorCategory) -> c_int {
    match category {
        ErrorCategory::TransactionFailed => TXB_ERR_TRANSACTION_FAILED,
        ErrorCategory::TransactionExpired => TXB_ERR_TRANSACTION_EXPIRED,
        ErrorCategory::TransactionCommitAmbiguous => TXB_ERR_COMMIT_AMBIGUOUS,
        ErrorCategory::TransactionOperationFailed => TXB_ERR_OPERATION_FAILED,
        ErrorCategory::FeatureNotAvailable => TXB_ERR_FEATURE_NOT_AVAILABLE,
        ErrorCategory::QueryParsingFailure => TXB_ERR_QUERY_PARSING,
        ErrorCategory::DocumentExists => TXB_ERR_DOCUMENT_EXISTS,
        ErrorCategory::DocumentNotFound => TXB_ERR_DOCUMENT_NOT_FOUND,
        ErrorCategory::Generic => TXB_ERR_GENERIC,
    }
}

fn error_status(err: &BridgeError) -> c_int {
    match err {
        BridgeError::InvalidArgument(_) => TXB_ERR_INVALID_ARGUMENT,
        BridgeError::Config(_) => TXB_ERR_CONFIG,
        BridgeError::Connection(_) => TXB_ERR_CONNECTION,
        BridgeError::Transaction(e) => category_status(e.category()),
        BridgeError::CompletionTimeout(_) => TXB_ERR_COMPLETION_TIMEOUT,
        _ => TXB_ERR_INTERNAL,
    }
}

/// Record `err` for this thread and return its status code.
fn fail(err: BridgeError) -> c_int {
    let status = error_status(&err);
    set_last_error(err.to_string());
    if let BridgeError::Transaction(e) = err {
        LAST_TRANSACTION_ERROR.with(|slot| *slot.borrow_mut() = Some(e));
    }
    status
}

/// Message of the last failed call on this thread, or null. The pointer is
/// valid until the next failing call on the same thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_last_error_message() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

/// Static name of a status code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_status_name(status: c_int) -> *const c_char {
    let name: &CStr = match status {
        TXB_OK => c"ok",
        TXB_ERR_NULL_PTR => c"null_pointer",
        TXB_ERR_INVALID_UTF8 => c"invalid_utf8",
        TXB_ERR_INVALID_ARGUMENT => c"invalid_argument",
        TXB_ERR_CONFIG => c"configuration",
        TXB_ERR_CONNECTION => c"connection",
        TXB_ERR_TRANSACTION_FAILED => c"transaction_failed",
        TXB_ERR_TRANSACTION_EXPIRED => c"transaction_expired",
        TXB_ERR_COMMIT_AMBIGUOUS => c"transaction_commit_ambiguous",
        TXB_ERR_OPERATION_FAILED => c"transaction_operation_failed",
        TXB_ERR_FEATURE_NOT_AVAILABLE => c"feature_not_available",
        TXB_ERR_QUERY_PARSING => c"query_parsing_failure",
        TXB_ERR_DOCUMENT_EXISTS => c"document_exists",
        TXB_ERR_DOCUMENT_NOT_FOUND => c"document_not_found",
        TXB_ERR_GENERIC => c"generic",
        TXB_ERR_COMPLETION_TIMEOUT => c"completion_timeout",
        _ => c"internal",
    };
    name.as_ptr()
}

/// Install a stderr subscriber. `TXBRIDGE_LOG` / `RUST_LOG` override `level`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_enable_logging(level: *const c_char) {
    let level = if level.is_null() {
        "info"
    } else {
        CStr::from_ptr(level).to_str().unwrap_or("info")
    };
    txbridge_core::logging::init_with_level(level);
}

// ═══════════════════════════════════════════════════════════════
// Argument helpers
// ═══════════════════════════════════════════════════════════════

unsafe fn str_arg<'a>(ptr: *const c_char) -> Result<Option<&'a str>, c_int> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr).to_str().map(Some).map_err(|_| {
        set_last_error("argument is not valid UTF-8");
        TXB_ERR_INVALID_UTF8
    })
}

unsafe fn kwargs_arg(json: *const c_char) -> Result<Kwargs, c_int> {
    let Some(text) = str_arg(json)? else {
        return Ok(Kwargs::new());
    };
    if text.trim().is_empty() {
        return Ok(Kwargs::new());
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(fail(BridgeError::Config(
            "options must be a JSON object".to_string(),
        ))),
        Err(e) => Err(fail(BridgeError::Config(format!("options are not valid JSON: {e}")))),
    }
}

unsafe fn options_arg(json: *const c_char) -> Result<Option<TransactionOptions>, c_int> {
    let kwargs = kwargs_arg(json)?;
    if kwargs.is_empty() {
        return Ok(None);
    }
    TransactionOptions::from_kwargs(kwargs).map(Some).map_err(fail)
}

/// Document identity; all four parts null means "none given".
unsafe fn id_arg(
    bucket: *const c_char,
    scope: *const c_char,
    collection: *const c_char,
    key: *const c_char,
) -> Result<Option<DocumentId>, c_int> {
    let parts = [str_arg(bucket)?, str_arg(scope)?, str_arg(collection)?, str_arg(key)?];
    if parts.iter().all(Option::is_none) {
        return Ok(None);
    }
    let [bucket, scope, collection, key] = parts.map(Option::unwrap_or_default);
    Ok(Some(DocumentId::new(bucket, scope, collection, key)))
}

/// Payload bytes; `flags == 0` selects the JSON format flag.
unsafe fn content_arg(value: *const u8, value_len: usize, flags: u32) -> Option<Content> {
    if value.is_null() {
        return None;
    }
    let data = slice::from_raw_parts(value, value_len).to_vec();
    Some(Content::new(data, if flags == 0 { flags::JSON } else { flags }))
}

#[allow(clippy::too_many_arguments)]
unsafe fn operation_arg(
    op: c_int,
    bucket: *const c_char,
    scope: *const c_char,
    collection: *const c_char,
    key: *const c_char,
    value: *const u8,
    value_len: usize,
    flags: u32,
    prior: *const TxbGetResult,
) -> Result<Operation, c_int> {
    let kind = u8::try_from(op)
        .ok()
        .and_then(OperationKind::from_code)
        .ok_or_else(|| fail(BridgeError::InvalidArgument(format!("unknown operation code {op}"))))?;
    let id = id_arg(bucket, scope, collection, key)?;
    let content = content_arg(value, value_len, flags);
    let prior = if prior.is_null() {
        None
    } else {
        Some((*prior).result.clone())
    };
    Operation::from_parts(kind, id, content, prior).map_err(fail)
}

fn boxed_result(result: TransactionGetResult) -> *mut TxbGetResult {
    let key = to_cstring(result.key());
    let transaction_id = to_cstring(result.transaction_id());
    Box::into_raw(Box::new(TxbGetResult {
        result,
        key,
        transaction_id,
    }))
}

/// Host pointer carried to engine threads. The caller guarantees it may be
/// used from any thread until its callback has run.
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

fn runtime() -> Arc<dyn HostRuntime> {
    Arc::new(FreeThreaded)
}

// ═══════════════════════════════════════════════════════════════
// Cluster
// ═══════════════════════════════════════════════════════════════

/// Create an in-memory cluster
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_cluster_new() -> *mut TxbCluster {
    Box::into_raw(Box::new(TxbCluster {
        cluster: MemoryCluster::new(),
    }))
}

/// Write a committed document outside any transaction
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_cluster_upsert(
    cluster: *mut TxbCluster,
    bucket: *const c_char,
    scope: *const c_char,
    collection: *const c_char,
    key: *const c_char,
    value: *const u8,
    value_len: usize,
    flags: u32,
) -> c_int {
    if cluster.is_null() || value.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    let id = match id_arg(bucket, scope, collection, key) {
        Ok(Some(id)) => id,
        Ok(None) => return fail(BridgeError::InvalidArgument("document identity required".to_string())),
        Err(status) => return status,
    };
    if let Err(e) = id.validate() {
        return fail(e);
    }
    let Some(content) = content_arg(value, value_len, flags) else {
        return TXB_ERR_NULL_PTR;
    };
    (*cluster).cluster.store().upsert(id, content);
    TXB_OK
}

/// Number of committed documents
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_cluster_len(cluster: *const TxbCluster) -> usize {
    if cluster.is_null() {
        return 0;
    }
    (*cluster).cluster.store().len()
}

/// Mark the cluster connection closed
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_cluster_disconnect(cluster: *mut TxbCluster) {
    if !cluster.is_null() {
        (*cluster).cluster.disconnect();
    }
}

/// Free a cluster. Engines created from it keep working.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_cluster_free(cluster: *mut TxbCluster) {
    if !cluster.is_null() {
        drop(Box::from_raw(cluster));
    }
}

// ═══════════════════════════════════════════════════════════════
// Engine lifecycle
// ═══════════════════════════════════════════════════════════════

/// Create a transactions engine. `config_json` and `settings_json` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_engine_create(
    cluster: *mut TxbCluster,
    config_json: *const c_char,
    settings_json: *const c_char,
    out_engine: *mut *mut TxbEngine,
) -> c_int {
    if cluster.is_null() || out_engine.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    let config = match kwargs_arg(config_json).and_then(|k| TransactionConfig::from_kwargs(k).map_err(fail)) {
        Ok(config) => config,
        Err(status) => return status,
    };
    let settings = match kwargs_arg(settings_json).and_then(|k| BridgeSettings::from_kwargs(k).map_err(fail)) {
        Ok(settings) => settings,
        Err(status) => return status,
    };
    match EngineHandle::create_with_settings(&(*cluster).cluster, &config, settings, runtime()) {
        Ok(engine) => {
            *out_engine = Box::into_raw(Box::new(TxbEngine { engine }));
            TXB_OK
        }
        Err(e) => fail(e),
    }
}

/// Close an engine, blocking until in-flight work drains, and free it
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_engine_destroy(engine: *mut TxbEngine) {
    if !engine.is_null() {
        Box::from_raw(engine).engine.destroy();
    }
}

/// Start a caller-driven transaction. `options_json` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_context_create(
    engine: *mut TxbEngine,
    options_json: *const c_char,
    out_context: *mut *mut TxbContext,
) -> c_int {
    if engine.is_null() || out_context.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    let options = match options_arg(options_json) {
        Ok(options) => options,
        Err(status) => return status,
    };
    match (*engine).engine.create_context(options.as_ref()) {
        Ok(context) => {
            *out_context = Box::into_raw(Box::new(TxbContext { context }));
            TXB_OK
        }
        Err(e) => fail(e),
    }
}

/// Free a transaction context
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_context_destroy(context: *mut TxbContext) {
    if !context.is_null() {
        Box::from_raw(context).context.destroy();
    }
}

/// Discard the current attempt and start a new one
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_new_attempt(context: *mut TxbContext) -> c_int {
    if context.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    match (*context).context.new_attempt() {
        Ok(()) => TXB_OK,
        Err(e) => fail(e),
    }
}

// ═══════════════════════════════════════════════════════════════
// Operations
// ═══════════════════════════════════════════════════════════════

#[allow(clippy::too_many_arguments)]
unsafe fn kv_blocking(
    dispatcher: &Dispatcher,
    op: c_int,
    bucket: *const c_char,
    scope: *const c_char,
    collection: *const c_char,
    key: *const c_char,
    value: *const u8,
    value_len: usize,
    flags: u32,
    prior: *const TxbGetResult,
    out_result: *mut *mut TxbGetResult,
) -> c_int {
    let operation = match operation_arg(op, bucket, scope, collection, key, value, value_len, flags, prior) {
        Ok(operation) => operation,
        Err(status) => return status,
    };
    let result = dispatcher
        .dispatch(operation, Delivery::Blocking)
        .and_then(|pending| pending.wait());
    match result {
        Ok(OperationResult::Document(doc)) => {
            if !out_result.is_null() {
                *out_result = boxed_result(doc);
            }
            TXB_OK
        }
        Ok(_) => {
            if !out_result.is_null() {
                *out_result = ptr::null_mut();
            }
            TXB_OK
        }
        Err(e) => fail(e),
    }
}

/// Run a key-value operation and wait for it.
///
/// `op` is 0 GET, 1 INSERT, 2 REPLACE, 3 REMOVE. GET and INSERT take the
/// identity; REPLACE and REMOVE take `prior`. `out_result` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_kv_op(
    context: *mut TxbContext,
    op: c_int,
    bucket: *const c_char,
    scope: *const c_char,
    collection: *const c_char,
    key: *const c_char,
    value: *const u8,
    value_len: usize,
    flags: u32,
    prior: *const TxbGetResult,
    out_result: *mut *mut TxbGetResult,
) -> c_int {
    if context.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    kv_blocking(
        (*context).context.dispatcher(),
        op,
        bucket,
        scope,
        collection,
        key,
        value,
        value_len,
        flags,
        prior,
        out_result,
    )
}

/// Start a key-value operation; `callback` receives the outcome on an
/// engine thread. A non-OK return means the callback will not run.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_kv_op_async(
    context: *mut TxbContext,
    op: c_int,
    bucket: *const c_char,
    scope: *const c_char,
    collection: *const c_char,
    key: *const c_char,
    value: *const u8,
    value_len: usize,
    flags: u32,
    prior: *const TxbGetResult,
    callback: Option<TxbKvCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(callback) = callback else {
        return TXB_ERR_NULL_PTR;
    };
    if context.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    let operation = match operation_arg(op, bucket, scope, collection, key, value, value_len, flags, prior) {
        Ok(operation) => operation,
        Err(status) => return status,
    };
    let user_data = UserData(user_data);
    let callbacks = Callbacks::new(
        move |result: OperationResult| {
            let doc = match result {
                OperationResult::Document(doc) => boxed_result(doc),
                _ => ptr::null_mut(),
            };
            callback(user_data.get(), TXB_OK, doc, ptr::null());
        },
        move |error: TransactionError| {
            let message = to_cstring(error.to_string());
            callback(
                user_data.get(),
                category_status(error.category()),
                ptr::null_mut(),
                message.as_ptr(),
            );
        },
    );
    match (*context)
        .context
        .dispatch(operation, Delivery::Callback(callbacks))
    {
        Ok(_) => TXB_OK,
        Err(e) => fail(e),
    }
}

/// Run a query in the current attempt. `options_json` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_query(
    context: *mut TxbContext,
    statement: *const c_char,
    options_json: *const c_char,
    out_result: *mut *mut TxbQueryResult,
) -> c_int {
    if context.is_null() || statement.is_null() || out_result.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    query_blocking((*context).context.dispatcher(), statement, options_json, out_result)
}

unsafe fn query_args<'a>(
    statement: *const c_char,
    options_json: *const c_char,
) -> Result<(&'a str, TransactionQueryOptions), c_int> {
    let statement = str_arg(statement)?.ok_or(TXB_ERR_NULL_PTR)?;
    let options = TransactionQueryOptions::from_kwargs(kwargs_arg(options_json)?).map_err(fail)?;
    Ok((statement, options))
}

unsafe fn query_blocking(
    dispatcher: &Dispatcher,
    statement: *const c_char,
    options_json: *const c_char,
    out_result: *mut *mut TxbQueryResult,
) -> c_int {
    let (statement, options) = match query_args(statement, options_json) {
        Ok(args) => args,
        Err(status) => return status,
    };
    let result = dispatcher
        .query(statement, &options, Delivery::Blocking)
        .and_then(|pending| pending.wait());
    match result {
        Ok(result) => {
            *out_result = Box::into_raw(Box::new(TxbQueryResult { result }));
            TXB_OK
        }
        Err(e) => fail(e),
    }
}

/// Start a query; `callback` receives the outcome on an engine thread
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_query_async(
    context: *mut TxbContext,
    statement: *const c_char,
    options_json: *const c_char,
    callback: Option<TxbQueryCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(callback) = callback else {
        return TXB_ERR_NULL_PTR;
    };
    if context.is_null() || statement.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    let (statement, options) = match query_args(statement, options_json) {
        Ok(args) => args,
        Err(status) => return status,
    };
    let user_data = UserData(user_data);
    let callbacks = Callbacks::new(
        move |result: QueryResult| {
            let result = Box::into_raw(Box::new(TxbQueryResult { result }));
            callback(user_data.get(), TXB_OK, result, ptr::null());
        },
        move |error: TransactionError| {
            let message = to_cstring(error.to_string());
            callback(
                user_data.get(),
                category_status(error.category()),
                ptr::null_mut(),
                message.as_ptr(),
            );
        },
    );
    match (*context).context.query_with(statement, &options, callbacks) {
        Ok(()) => TXB_OK,
        Err(e) => fail(e),
    }
}

/// Commit and wait. `out_unstaging_complete` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_commit(context: *mut TxbContext, out_unstaging_complete: *mut c_int) -> c_int {
    if context.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    match (*context).context.commit() {
        Ok(result) => {
            if !out_unstaging_complete.is_null() {
                *out_unstaging_complete = c_int::from(result.unstaging_complete);
            }
            debug!(transaction_id = %result.transaction_id, "commit via ffi");
            TXB_OK
        }
        Err(e) => fail(e),
    }
}

/// Start a commit; `callback` receives the outcome on an engine thread
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_commit_async(
    context: *mut TxbContext,
    callback: Option<TxbCommitCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(callback) = callback else {
        return TXB_ERR_NULL_PTR;
    };
    if context.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    let user_data = UserData(user_data);
    let callbacks = Callbacks::new(
        move |result: txbridge_core::TransactionResult| {
            callback(
                user_data.get(),
                TXB_OK,
                c_int::from(result.unstaging_complete),
                ptr::null(),
            );
        },
        move |error: TransactionError| {
            let message = to_cstring(error.to_string());
            callback(
                user_data.get(),
                category_status(error.category()),
                0,
                message.as_ptr(),
            );
        },
    );
    match (*context).context.commit_with(callbacks) {
        Ok(()) => TXB_OK,
        Err(e) => fail(e),
    }
}

/// Roll back and wait
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_rollback(context: *mut TxbContext) -> c_int {
    if context.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    match (*context).context.rollback() {
        Ok(()) => TXB_OK,
        Err(e) => fail(e),
    }
}

/// Start a rollback; `callback` receives the outcome on an engine thread
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_rollback_async(
    context: *mut TxbContext,
    callback: Option<TxbStatusCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(callback) = callback else {
        return TXB_ERR_NULL_PTR;
    };
    if context.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    let user_data = UserData(user_data);
    let callbacks = Callbacks::new(
        move |()| callback(user_data.get(), TXB_OK, ptr::null()),
        move |error: TransactionError| {
            let message = to_cstring(error.to_string());
            callback(user_data.get(), category_status(error.category()), message.as_ptr());
        },
    );
    match (*context).context.rollback_with(callbacks) {
        Ok(()) => TXB_OK,
        Err(e) => fail(e),
    }
}

// ═══════════════════════════════════════════════════════════════
// Engine-driven transactions
// ═══════════════════════════════════════════════════════════════

fn logic_outcome(status: c_int) -> Result<(), LogicError> {
    if status == TXB_OK {
        return Ok(());
    }
    let raised = LAST_TRANSACTION_ERROR.with(|slot| slot.borrow_mut().take());
    match raised {
        Some(error) if category_status(error.category()) == status => Err(LogicError::from(error)),
        _ => Err(LogicError::host(format!("transaction logic returned status {status}"))),
    }
}

/// Run `logic` in the engine's attempt loop until it commits or fails.
/// `logic` may run several times and on engine threads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_run(
    engine: *mut TxbEngine,
    options_json: *const c_char,
    logic: Option<TxbLogicFn>,
    user_data: *mut c_void,
    out_unstaging_complete: *mut c_int,
) -> c_int {
    let Some(logic) = logic else {
        return TXB_ERR_NULL_PTR;
    };
    if engine.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    let options = match options_arg(options_json) {
        Ok(options) => options,
        Err(status) => return status,
    };
    let user_data = UserData(user_data);
    let result = (*engine).engine.run(options.as_ref(), move |attempt: &AttemptContext| {
        LAST_TRANSACTION_ERROR.with(|slot| slot.borrow_mut().take());
        let handle = TxbAttempt {
            attempt: attempt.clone(),
        };
        logic_outcome(logic(user_data.get(), &handle))
    });
    match result {
        Ok(result) => {
            if !out_unstaging_complete.is_null() {
                *out_unstaging_complete = c_int::from(result.unstaging_complete);
            }
            TXB_OK
        }
        Err(e) => fail(e),
    }
}

/// [`txb_kv_op`] inside [`TxbLogicFn`]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_attempt_kv_op(
    attempt: *const TxbAttempt,
    op: c_int,
    bucket: *const c_char,
    scope: *const c_char,
    collection: *const c_char,
    key: *const c_char,
    value: *const u8,
    value_len: usize,
    flags: u32,
    prior: *const TxbGetResult,
    out_result: *mut *mut TxbGetResult,
) -> c_int {
    if attempt.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    kv_blocking(
        (*attempt).attempt.dispatcher(),
        op,
        bucket,
        scope,
        collection,
        key,
        value,
        value_len,
        flags,
        prior,
        out_result,
    )
}

/// [`txb_query`] inside [`TxbLogicFn`]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_attempt_query(
    attempt: *const TxbAttempt,
    statement: *const c_char,
    options_json: *const c_char,
    out_result: *mut *mut TxbQueryResult,
) -> c_int {
    if attempt.is_null() || statement.is_null() || out_result.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    query_blocking((*attempt).attempt.dispatcher(), statement, options_json, out_result)
}

// ═══════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════

#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_get_result_key(result: *const TxbGetResult) -> *const c_char {
    if result.is_null() {
        return ptr::null();
    }
    (*result).key.as_ptr()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_get_result_transaction_id(result: *const TxbGetResult) -> *const c_char {
    if result.is_null() {
        return ptr::null();
    }
    (*result).transaction_id.as_ptr()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_get_result_cas(result: *const TxbGetResult) -> u64 {
    if result.is_null() {
        return 0;
    }
    (*result).result.cas()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_get_result_flags(result: *const TxbGetResult) -> u32 {
    if result.is_null() {
        return 0;
    }
    (*result).result.content().flags
}

/// Borrow the document body; valid until the result is freed
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_get_result_content(
    result: *const TxbGetResult,
    out_value: *mut *const u8,
    out_len: *mut usize,
) -> c_int {
    if result.is_null() || out_value.is_null() || out_len.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    let data = &(*result).result.content().data;
    *out_value = data.as_ptr();
    *out_len = data.len();
    TXB_OK
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_get_result_free(result: *mut TxbGetResult) {
    if !result.is_null() {
        drop(Box::from_raw(result));
    }
}

/// Borrow the raw query response body
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_query_result_body(
    result: *const TxbQueryResult,
    out_body: *mut *const u8,
    out_len: *mut usize,
) -> c_int {
    if result.is_null() || out_body.is_null() || out_len.is_null() {
        return TXB_ERR_NULL_PTR;
    }
    let raw = (*result).result.raw();
    *out_body = raw.as_ptr();
    *out_len = raw.len();
    TXB_OK
}

/// Number of rows in the `results` array, or -1 when the body is malformed
#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_query_result_row_count(result: *const TxbQueryResult) -> i64 {
    if result.is_null() {
        return -1;
    }
    match (*result).result.rows() {
        Ok(rows) => i64::try_from(rows.len()).unwrap_or(i64::MAX),
        Err(e) => {
            fail(e);
            -1
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn txb_query_result_free(result: *mut TxbQueryResult) {
    if !result.is_null() {
        drop(Box::from_raw(result));
    }
}
