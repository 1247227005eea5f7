//! In-memory reference engine.
//!
//! A deterministic stand-in for the native transactions engine so the bridge
//! can be exercised end to end without a cluster. It stages writes per
//! attempt, checks version preconditions at commit, retries retryable
//! failures and honors the transaction timeout. It does not implement the
//! distributed commit protocol.
//!
//! ```
//! use std::sync::Arc;
//! use txbridge_core::bindings::{EngineHandle, FreeThreaded, TransactionOps};
//! use txbridge_core::config::TransactionConfig;
//! use txbridge_core::memory::MemoryCluster;
//! use txbridge_core::types::{Content, DocumentId};
//!
//! let cluster = MemoryCluster::new();
//! let engine = EngineHandle::create(&cluster, &TransactionConfig::new(), Arc::new(FreeThreaded)).unwrap();
//! let ctx = engine.create_context(None).unwrap();
//! let id = DocumentId::new("b", "s", "c", "k");
//! ctx.insert(id.clone(), Content::binary(b"v".to_vec())).unwrap();
//! ctx.commit().unwrap();
//! assert!(cluster.store().contains(&id));
//! engine.destroy();
//! ```

mod context;
mod engine;
mod query;
mod store;

pub use context::MemoryContext;
pub use engine::MemoryEngine;
pub use store::{DocumentStore, Mutation, StagedEntry, StagedMutations, StagedView, StoredDocument};

use crate::config::TransactionConfig;
use crate::error::BridgeError;
use crate::native::{NativeCluster, NativeEngine, NativeError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Engine operations a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Get,
    Insert,
    Replace,
    Remove,
    Query,
    Commit,
    Rollback,
}

impl FaultPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultPoint::Get => "get",
            FaultPoint::Insert => "insert",
            FaultPoint::Replace => "replace",
            FaultPoint::Remove => "remove",
            FaultPoint::Query => "query",
            FaultPoint::Commit => "commit",
            FaultPoint::Rollback => "rollback",
        }
    }
}

impl FromStr for FaultPoint {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(FaultPoint::Get),
            "insert" => Ok(FaultPoint::Insert),
            "replace" => Ok(FaultPoint::Replace),
            "remove" => Ok(FaultPoint::Remove),
            "query" => Ok(FaultPoint::Query),
            "commit" => Ok(FaultPoint::Commit),
            "rollback" => Ok(FaultPoint::Rollback),
            other => Err(BridgeError::InvalidArgument(format!(
                "unknown fault point: {other}"
            ))),
        }
    }
}

/// Queued failures, consumed one per matching operation.
#[derive(Debug, Default)]
pub struct FaultInjector {
    queued: Mutex<HashMap<FaultPoint, VecDeque<NativeError>>>,
}

impl FaultInjector {
    pub fn fail_next(&self, point: FaultPoint, error: NativeError) {
        self.queued.lock().entry(point).or_default().push_back(error);
    }

    pub(crate) fn take(&self, point: FaultPoint) -> Option<NativeError> {
        let error = self.queued.lock().get_mut(&point)?.pop_front();
        if let Some(error) = &error {
            debug!(?point, %error, "injecting fault");
        }
        error
    }

    pub fn pending(&self, point: FaultPoint) -> usize {
        self.queued.lock().get(&point).map_or(0, VecDeque::len)
    }

    pub fn clear(&self) {
        self.queued.lock().clear();
    }
}

pub(crate) struct ClusterState {
    pub(crate) store: DocumentStore,
    pub(crate) faults: FaultInjector,
    connected: AtomicBool,
    query_enabled: AtomicBool,
}

impl ClusterState {
    pub(crate) fn query_enabled(&self) -> bool {
        self.query_enabled.load(Ordering::Acquire)
    }
}

/// An in-memory "cluster": a committed document store plus switches for
/// connectivity and query support.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ClusterState {
                store: DocumentStore::new(),
                faults: FaultInjector::default(),
                connected: AtomicBool::new(true),
                query_enabled: AtomicBool::new(true),
            }),
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.state.store
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.state.faults
    }

    /// Queue `error` for the next operation at `point`.
    pub fn fail_next(&self, point: FaultPoint, error: NativeError) {
        self.state.faults.fail_next(point, error);
    }

    pub fn disconnect(&self) {
        self.state.connected.store(false, Ordering::Release);
    }

    pub fn set_query_support(&self, enabled: bool) {
        self.state.query_enabled.store(enabled, Ordering::Release);
    }
}

impl NativeCluster for MemoryCluster {
    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    fn create_transactions(
        &self,
        config: &TransactionConfig,
    ) -> Result<Arc<dyn NativeEngine>, NativeError> {
        let engine = MemoryEngine::new(Arc::clone(&self.state), config.clone())?;
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::codes;

    #[test]
    fn faults_are_consumed_in_order() {
        let cluster = MemoryCluster::new();
        cluster.fail_next(FaultPoint::Get, NativeError::other(codes::INVALID_ARGUMENT, "first"));
        cluster.fail_next(FaultPoint::Get, NativeError::other(codes::INVALID_ARGUMENT, "second"));
        assert_eq!(cluster.faults().pending(FaultPoint::Get), 2);
        assert_eq!(
            cluster.faults().take(FaultPoint::Get).map(|e| e.message()),
            Some("first".to_string())
        );
        assert!(cluster.faults().take(FaultPoint::Commit).is_none());
        cluster.faults().clear();
        assert_eq!(cluster.faults().pending(FaultPoint::Get), 0);
    }

    #[test]
    fn fault_points_parse() {
        assert_eq!("Commit".parse::<FaultPoint>().unwrap(), FaultPoint::Commit);
        assert_eq!(FaultPoint::Query.as_str().parse::<FaultPoint>().unwrap(), FaultPoint::Query);
        assert!("flush".parse::<FaultPoint>().is_err());
    }

    #[test]
    fn disconnect_is_observable() {
        let cluster = MemoryCluster::new();
        assert!(cluster.is_connected());
        cluster.clone().disconnect();
        assert!(!cluster.is_connected());
    }
}
