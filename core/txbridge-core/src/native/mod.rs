//! Native collaborator interfaces.
//!
//! The bridge never sees inside the transactions engine. It talks to three
//! traits: a cluster connection that can build an engine, the engine itself,
//! and a per-transaction context. Every asynchronous method takes a
//! [`NativeCallback`] that the engine invokes exactly once, from whatever
//! thread it likes.

pub mod error;

pub use error::{ErrorClass, FinalErrorKind, NativeError, codes};

use crate::config::{QueryProfile, ScanConsistency, TransactionConfig, TransactionOptions};
use crate::types::{Content, DocumentId, QueryResult, TransactionGetResult, TransactionResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Completion closure handed to the engine for one asynchronous call.
pub type NativeCallback<T> = Box<dyn FnOnce(Result<T, NativeError>) + Send + 'static>;

/// Transaction logic the engine runs once per attempt.
pub type AttemptLogic =
    Arc<dyn Fn(&Arc<dyn NativeContext>) -> Result<(), NativeError> + Send + Sync + 'static>;

/// Connection the engine is built on.
pub trait NativeCluster: Send + Sync {
    /// False once the connection has been closed or was never opened.
    fn is_connected(&self) -> bool;

    /// Build a transactions engine. May block on network setup.
    fn create_transactions(
        &self,
        config: &TransactionConfig,
    ) -> Result<Arc<dyn NativeEngine>, NativeError>;
}

/// The native transactions engine.
pub trait NativeEngine: Send + Sync {
    fn config(&self) -> &TransactionConfig;

    /// Start a transaction driven by the caller. Cheap and non-blocking.
    fn new_context(
        &self,
        options: Option<&TransactionOptions>,
    ) -> Result<Arc<dyn NativeContext>, NativeError>;

    /// Run `logic` in the engine's own attempt loop, committing after the
    /// logic succeeds and retrying or rolling back as the engine sees fit.
    fn run(
        &self,
        options: Option<&TransactionOptions>,
        logic: AttemptLogic,
        done: NativeCallback<TransactionResult>,
    );

    /// Stop accepting work and block until in-flight calls have completed.
    fn close(&self);
}

/// One logical transaction and its current attempt.
///
/// Not safe for concurrent dispatch against the same attempt; callers
/// serialize their operations.
pub trait NativeContext: Send + Sync {
    fn transaction_id(&self) -> String;

    fn attempt_id(&self) -> String;

    fn new_attempt(&self, done: NativeCallback<()>);

    fn get(&self, id: DocumentId, done: NativeCallback<TransactionGetResult>);

    fn insert(&self, id: DocumentId, content: Content, done: NativeCallback<TransactionGetResult>);

    fn replace(
        &self,
        prior: TransactionGetResult,
        content: Content,
        done: NativeCallback<TransactionGetResult>,
    );

    fn remove(&self, prior: TransactionGetResult, done: NativeCallback<()>);

    fn query(&self, statement: String, request: QueryRequest, done: NativeCallback<QueryResult>);

    fn commit(&self, done: NativeCallback<TransactionResult>);

    fn rollback(&self, done: NativeCallback<()>);
}

/// Query options in the engine's wire shape: parameter values are already
/// JSON-encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub raw: BTreeMap<String, Vec<u8>>,
    pub positional_parameters: Vec<Vec<u8>>,
    pub named_parameters: BTreeMap<String, Vec<u8>>,
    pub scan_consistency: Option<ScanConsistency>,
    pub profile: QueryProfile,
    pub adhoc: bool,
    pub metrics: bool,
    pub read_only: bool,
    pub scan_cap: Option<u64>,
    pub scan_wait: Option<Duration>,
    pub pipeline_batch: Option<u64>,
    pub pipeline_cap: Option<u64>,
    pub max_parallelism: Option<u64>,
    pub client_context_id: Option<String>,
    /// `bucket.scope` used to resolve unqualified keyspaces
    pub query_context: Option<String>,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            raw: BTreeMap::new(),
            positional_parameters: Vec::new(),
            named_parameters: BTreeMap::new(),
            scan_consistency: None,
            profile: QueryProfile::Off,
            adhoc: true,
            metrics: false,
            read_only: false,
            scan_cap: None,
            scan_wait: None,
            pipeline_batch: None,
            pipeline_cap: None,
            max_parallelism: None,
            client_context_id: None,
            query_context: None,
        }
    }
}
