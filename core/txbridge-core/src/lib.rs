//! # txbridge: transactions across a language boundary
//!
//! Exposes an asynchronous, multi-document ACID transactions engine to a
//! managed host (Python, C). The engine is an opaque collaborator behind the
//! [`native`] traits; this crate is the layer in between:
//!
//! - marshals configuration and operation arguments ([`config`])
//! - dispatches transactional GET/INSERT/REPLACE/REMOVE/QUERY ([`bindings::dispatch`])
//! - turns engine callbacks fired on arbitrary threads into blocking results
//!   or host callbacks run under the host's execution lock ([`bindings::completion`])
//! - translates native failures into a closed set of host error categories
//!   ([`bindings::translator`])
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use txbridge_core::bindings::{EngineHandle, FreeThreaded, TransactionOps};
//! use txbridge_core::config::TransactionConfig;
//! use txbridge_core::memory::MemoryCluster;
//! use txbridge_core::types::{Content, DocumentId};
//!
//! # fn main() -> txbridge_core::BridgeResult<()> {
//! let cluster = MemoryCluster::new();
//! let engine = EngineHandle::create(&cluster, &TransactionConfig::new(), Arc::new(FreeThreaded))?;
//!
//! let id = DocumentId::new("shop", "_default", "orders", "order-1");
//! engine.run(None, move |ctx| {
//!     ctx.insert(id.clone(), Content::json(&json!({ "qty": 3 }))?)?;
//!     Ok(())
//! })?;
//!
//! engine.destroy();
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`bindings`] - the bridge components shared by every host binding
//! - [`config`] - transaction config, per-transaction options, query options
//! - [`error`] - [`BridgeError`] and the host-visible [`TransactionError`]
//! - [`native`] - collaborator traits and the native error taxonomy
//! - [`memory`] - in-memory reference engine for tests and demos
//! - [`types`] - document identity, payloads and results
//! - [`logging`] - optional `tracing-subscriber` setup

pub mod bindings;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod native;
pub mod types;

pub use bindings::{
    AttemptContext, Callbacks, ContextHandle, EngineHandle, FreeThreaded, HostRuntime,
    InterpreterLock, LogicError, Operation, OperationKind, OperationResult, TransactionOps,
};
pub use config::{
    BridgeSettings, DurabilityLevel, QueryProfile, ScanConsistency, TransactionConfig,
    TransactionOptions, TransactionQueryOptions,
};
pub use error::{BridgeError, BridgeResult, ErrorCategory, InnerCause, TransactionError};
pub use types::{Content, DocumentId, QueryResult, TransactionGetResult, TransactionResult};
