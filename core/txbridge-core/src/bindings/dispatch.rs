//! Operation dispatcher.
//!
//! Turns one host request into one native call against the current attempt.
//! Argument problems are reported synchronously, before anything reaches the
//! engine; everything after that arrives through the [`PendingCall`].

use super::BridgeShared;
use super::completion::{Callbacks, Completion, Delivery, PendingCall};
use crate::config::TransactionQueryOptions;
use crate::error::{BridgeError, BridgeResult};
use crate::native::{NativeCallback, NativeContext};
use crate::types::{Content, DocumentId, QueryResult, TransactionGetResult, TransactionResult};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Kind of a transactional operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Get,
    Insert,
    Replace,
    Remove,
    Query,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Get => "get",
            OperationKind::Insert => "insert",
            OperationKind::Replace => "replace",
            OperationKind::Remove => "remove",
            OperationKind::Query => "query",
        }
    }

    /// Numeric codes used by the bindings.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(OperationKind::Get),
            1 => Some(OperationKind::Insert),
            2 => Some(OperationKind::Replace),
            3 => Some(OperationKind::Remove),
            4 => Some(OperationKind::Query),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            OperationKind::Get => 0,
            OperationKind::Insert => 1,
            OperationKind::Replace => 2,
            OperationKind::Remove => 3,
            OperationKind::Query => 4,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(OperationKind::Get),
            "insert" => Ok(OperationKind::Insert),
            "replace" => Ok(OperationKind::Replace),
            "remove" => Ok(OperationKind::Remove),
            "query" => Ok(OperationKind::Query),
            other => Err(BridgeError::InvalidArgument(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

/// One transactional operation. REPLACE and REMOVE identify their document
/// through the prior result they mutate.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Get {
        id: DocumentId,
    },
    Insert {
        id: DocumentId,
        content: Content,
    },
    Replace {
        prior: TransactionGetResult,
        content: Content,
    },
    Remove {
        prior: TransactionGetResult,
    },
    Query {
        statement: String,
        options: TransactionQueryOptions,
    },
}

impl Operation {
    /// Build a key-value operation from loosely typed host arguments.
    ///
    /// REPLACE and REMOVE take the identity from `prior`; when an identity is
    /// also given it must name the same document.
    pub fn from_parts(
        kind: OperationKind,
        id: Option<DocumentId>,
        content: Option<Content>,
        prior: Option<TransactionGetResult>,
    ) -> BridgeResult<Self> {
        let need_id = |id: Option<DocumentId>| {
            id.ok_or_else(|| {
                BridgeError::InvalidArgument(format!("{kind} requires a document identity"))
            })
        };
        let need_prior = |prior: Option<TransactionGetResult>| -> BridgeResult<TransactionGetResult> {
            let prior = prior.ok_or_else(|| {
                BridgeError::InvalidArgument(format!(
                    "{kind} requires the result of a previous get, insert or replace"
                ))
            })?;
            if let Some(id) = &id {
                if id != prior.id() {
                    return Err(BridgeError::InvalidArgument(format!(
                        "{kind} on {id} was given a prior result for {}",
                        prior.id()
                    )));
                }
            }
            Ok(prior)
        };
        let need_content = |content: Option<Content>| {
            content.ok_or_else(|| {
                BridgeError::InvalidArgument(format!("{kind} requires a document payload"))
            })
        };

        let operation = match kind {
            OperationKind::Get => Operation::Get {
                id: need_id(id.clone())?,
            },
            OperationKind::Insert => Operation::Insert {
                id: need_id(id.clone())?,
                content: need_content(content)?,
            },
            OperationKind::Replace => Operation::Replace {
                prior: need_prior(prior)?,
                content: need_content(content)?,
            },
            OperationKind::Remove => Operation::Remove {
                prior: need_prior(prior)?,
            },
            OperationKind::Query => {
                return Err(BridgeError::InvalidArgument(
                    "query operations take a statement, not a document identity".to_string(),
                ));
            }
        };
        operation.validate()?;
        Ok(operation)
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Get { .. } => OperationKind::Get,
            Operation::Insert { .. } => OperationKind::Insert,
            Operation::Replace { .. } => OperationKind::Replace,
            Operation::Remove { .. } => OperationKind::Remove,
            Operation::Query { .. } => OperationKind::Query,
        }
    }

    /// Checks that need no knowledge of the current attempt.
    pub fn validate(&self) -> BridgeResult<()> {
        match self {
            Operation::Get { id } => id.validate(),
            Operation::Insert { id, content } => check_insert(id, content),
            Operation::Replace { prior, .. } | Operation::Remove { prior } => prior.id().validate(),
            Operation::Query { statement, options } => {
                if statement.trim().is_empty() {
                    return Err(BridgeError::InvalidArgument(
                        "query statement is empty".to_string(),
                    ));
                }
                options.validate()
            }
        }
    }
}

fn check_insert(id: &DocumentId, content: &Content) -> BridgeResult<()> {
    id.validate()?;
    if content.is_empty() {
        return Err(BridgeError::InvalidArgument(format!(
            "insert of {id} requires a non-empty payload"
        )));
    }
    Ok(())
}

/// Successful outcome of a dispatched [`Operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Document(TransactionGetResult),
    Removed,
    Query(QueryResult),
}

impl OperationResult {
    pub fn variant_name(&self) -> &'static str {
        match self {
            OperationResult::Document(_) => "document",
            OperationResult::Removed => "removed",
            OperationResult::Query(_) => "query",
        }
    }

    pub fn into_document(self) -> BridgeResult<TransactionGetResult> {
        match self {
            OperationResult::Document(doc) => Ok(doc),
            other => Err(BridgeError::UnexpectedResult {
                expected: "document",
                actual: other.variant_name(),
            }),
        }
    }

    pub fn into_query(self) -> BridgeResult<QueryResult> {
        match self {
            OperationResult::Query(result) => Ok(result),
            other => Err(BridgeError::UnexpectedResult {
                expected: "query",
                actual: other.variant_name(),
            }),
        }
    }
}

/// Issues operations against one native attempt.
#[derive(Clone)]
pub struct Dispatcher {
    native: Arc<dyn NativeContext>,
    shared: Arc<BridgeShared>,
}

impl Dispatcher {
    pub(crate) fn new(native: Arc<dyn NativeContext>, shared: Arc<BridgeShared>) -> Self {
        Self { native, shared }
    }

    pub fn transaction_id(&self) -> String {
        self.native.transaction_id()
    }

    pub fn attempt_id(&self) -> String {
        self.native.attempt_id()
    }

    /// Dispatch any operation; the result comes back as an [`OperationResult`].
    pub fn dispatch(
        &self,
        operation: Operation,
        delivery: Delivery<OperationResult>,
    ) -> BridgeResult<PendingCall<OperationResult>> {
        match operation {
            Operation::Get { id } => self.get_as(id, delivery, OperationResult::Document),
            Operation::Insert { id, content } => {
                self.insert_as(id, content, delivery, OperationResult::Document)
            }
            Operation::Replace { prior, content } => {
                self.replace_as(prior, content, delivery, OperationResult::Document)
            }
            Operation::Remove { prior } => {
                self.remove_as(prior, delivery, |()| OperationResult::Removed)
            }
            Operation::Query { statement, options } => {
                self.query_as(statement, &options, delivery, OperationResult::Query)
            }
        }
    }

    pub fn get(
        &self,
        id: DocumentId,
        delivery: Delivery<TransactionGetResult>,
    ) -> BridgeResult<PendingCall<TransactionGetResult>> {
        self.get_as(id, delivery, |doc| doc)
    }

    pub fn insert(
        &self,
        id: DocumentId,
        content: Content,
        delivery: Delivery<TransactionGetResult>,
    ) -> BridgeResult<PendingCall<TransactionGetResult>> {
        self.insert_as(id, content, delivery, |doc| doc)
    }

    pub fn replace(
        &self,
        prior: TransactionGetResult,
        content: Content,
        delivery: Delivery<TransactionGetResult>,
    ) -> BridgeResult<PendingCall<TransactionGetResult>> {
        self.replace_as(prior, content, delivery, |doc| doc)
    }

    pub fn remove(
        &self,
        prior: TransactionGetResult,
        delivery: Delivery<()>,
    ) -> BridgeResult<PendingCall<()>> {
        self.remove_as(prior, delivery, |()| ())
    }

    pub fn query(
        &self,
        statement: impl Into<String>,
        options: &TransactionQueryOptions,
        delivery: Delivery<QueryResult>,
    ) -> BridgeResult<PendingCall<QueryResult>> {
        self.query_as(statement.into(), options, delivery, |result| result)
    }

    pub fn new_attempt(&self, delivery: Delivery<()>) -> BridgeResult<PendingCall<()>> {
        self.shared.ensure_open("new_attempt")?;
        Ok(self.submit("new_attempt", delivery, |()| (), |ctx, done| {
            ctx.new_attempt(done)
        }))
    }

    pub fn commit(
        &self,
        delivery: Delivery<TransactionResult>,
    ) -> BridgeResult<PendingCall<TransactionResult>> {
        self.shared.ensure_open("commit")?;
        Ok(self.submit("commit", delivery, |result| result, |ctx, done| {
            ctx.commit(done)
        }))
    }

    pub fn rollback(&self, delivery: Delivery<()>) -> BridgeResult<PendingCall<()>> {
        self.shared.ensure_open("rollback")?;
        Ok(self.submit("rollback", delivery, |()| (), |ctx, done| {
            ctx.rollback(done)
        }))
    }

    fn get_as<U: Send + 'static>(
        &self,
        id: DocumentId,
        delivery: Delivery<U>,
        wrap: impl FnOnce(TransactionGetResult) -> U + Send + 'static,
    ) -> BridgeResult<PendingCall<U>> {
        self.shared.ensure_open("get")?;
        id.validate()?;
        debug!(target: "txbridge::dispatch", op = "get", id = %id, "dispatching");
        Ok(self.submit("get", delivery, wrap, move |ctx, done| ctx.get(id, done)))
    }

    fn insert_as<U: Send + 'static>(
        &self,
        id: DocumentId,
        content: Content,
        delivery: Delivery<U>,
        wrap: impl FnOnce(TransactionGetResult) -> U + Send + 'static,
    ) -> BridgeResult<PendingCall<U>> {
        self.shared.ensure_open("insert")?;
        check_insert(&id, &content)?;
        debug!(target: "txbridge::dispatch", op = "insert", id = %id, bytes = content.data.len(), "dispatching");
        Ok(self.submit("insert", delivery, wrap, move |ctx, done| {
            ctx.insert(id, content, done)
        }))
    }

    fn replace_as<U: Send + 'static>(
        &self,
        prior: TransactionGetResult,
        content: Content,
        delivery: Delivery<U>,
        wrap: impl FnOnce(TransactionGetResult) -> U + Send + 'static,
    ) -> BridgeResult<PendingCall<U>> {
        self.shared.ensure_open("replace")?;
        self.check_prior("replace", &prior)?;
        debug!(target: "txbridge::dispatch", op = "replace", id = %prior.id(), cas = prior.cas(), "dispatching");
        Ok(self.submit("replace", delivery, wrap, move |ctx, done| {
            ctx.replace(prior, content, done)
        }))
    }

    fn remove_as<U: Send + 'static>(
        &self,
        prior: TransactionGetResult,
        delivery: Delivery<U>,
        wrap: impl FnOnce(()) -> U + Send + 'static,
    ) -> BridgeResult<PendingCall<U>> {
        self.shared.ensure_open("remove")?;
        self.check_prior("remove", &prior)?;
        debug!(target: "txbridge::dispatch", op = "remove", id = %prior.id(), cas = prior.cas(), "dispatching");
        Ok(self.submit("remove", delivery, wrap, move |ctx, done| {
            ctx.remove(prior, done)
        }))
    }

    fn query_as<U: Send + 'static>(
        &self,
        statement: String,
        options: &TransactionQueryOptions,
        delivery: Delivery<U>,
        wrap: impl FnOnce(QueryResult) -> U + Send + 'static,
    ) -> BridgeResult<PendingCall<U>> {
        self.shared.ensure_open("query")?;
        if statement.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "query statement is empty".to_string(),
            ));
        }
        let request = options.to_native()?;
        debug!(target: "txbridge::dispatch", op = "query", statement = %statement, "dispatching");
        Ok(self.submit("query", delivery, wrap, move |ctx, done| {
            ctx.query(statement, request, done)
        }))
    }

    /// A prior result is only valid within the attempt that produced it.
    ///
    /// Only the transaction and attempt ids are checked here. A result from
    /// earlier in the same attempt passes, and a version mismatch is left to
    /// the engine, which reports it asynchronously as an operation failure.
    fn check_prior(&self, operation: &str, prior: &TransactionGetResult) -> BridgeResult<()> {
        prior.id().validate()?;
        let transaction_id = self.native.transaction_id();
        if prior.transaction_id() != transaction_id {
            return Err(BridgeError::InvalidArgument(format!(
                "{operation} of {} uses a result from transaction {}, not {transaction_id}",
                prior.id(),
                prior.transaction_id()
            )));
        }
        let attempt_id = self.native.attempt_id();
        if prior.attempt_id() != attempt_id {
            return Err(BridgeError::InvalidArgument(format!(
                "{operation} of {} uses a stale result from attempt {}, current attempt is {attempt_id}",
                prior.id(),
                prior.attempt_id()
            )));
        }
        Ok(())
    }

    fn submit<N: Send + 'static, U: Send + 'static>(
        &self,
        operation: &'static str,
        delivery: Delivery<U>,
        wrap: impl FnOnce(N) -> U + Send + 'static,
        start: impl FnOnce(&dyn NativeContext, NativeCallback<N>),
    ) -> PendingCall<U> {
        let (completion, pending) = Completion::new(
            operation,
            delivery,
            Arc::clone(self.shared.runtime()),
            self.shared.settings().completion_watchdog(),
        );
        start(self.native.as_ref(), completion.map_into(wrap));
        pending
    }
}

/// Blocking and callback forms of every transactional operation, for any
/// type that can reach a [`Dispatcher`].
pub trait TransactionOps {
    fn dispatcher(&self) -> &Dispatcher;

    fn get(&self, id: DocumentId) -> BridgeResult<TransactionGetResult> {
        self.dispatcher().get(id, Delivery::Blocking)?.wait()
    }

    fn get_with(&self, id: DocumentId, callbacks: Callbacks<TransactionGetResult>) -> BridgeResult<()> {
        self.dispatcher()
            .get(id, Delivery::Callback(callbacks))
            .map(drop)
    }

    fn insert(&self, id: DocumentId, content: Content) -> BridgeResult<TransactionGetResult> {
        self.dispatcher()
            .insert(id, content, Delivery::Blocking)?
            .wait()
    }

    fn insert_with(
        &self,
        id: DocumentId,
        content: Content,
        callbacks: Callbacks<TransactionGetResult>,
    ) -> BridgeResult<()> {
        self.dispatcher()
            .insert(id, content, Delivery::Callback(callbacks))
            .map(drop)
    }

    fn replace(
        &self,
        prior: &TransactionGetResult,
        content: Content,
    ) -> BridgeResult<TransactionGetResult> {
        self.dispatcher()
            .replace(prior.clone(), content, Delivery::Blocking)?
            .wait()
    }

    fn replace_with(
        &self,
        prior: &TransactionGetResult,
        content: Content,
        callbacks: Callbacks<TransactionGetResult>,
    ) -> BridgeResult<()> {
        self.dispatcher()
            .replace(prior.clone(), content, Delivery::Callback(callbacks))
            .map(drop)
    }

    fn remove(&self, prior: &TransactionGetResult) -> BridgeResult<()> {
        self.dispatcher()
            .remove(prior.clone(), Delivery::Blocking)?
            .wait()
    }

    fn remove_with(&self, prior: &TransactionGetResult, callbacks: Callbacks<()>) -> BridgeResult<()> {
        self.dispatcher()
            .remove(prior.clone(), Delivery::Callback(callbacks))
            .map(drop)
    }

    fn query(&self, statement: &str, options: &TransactionQueryOptions) -> BridgeResult<QueryResult> {
        self.dispatcher()
            .query(statement, options, Delivery::Blocking)?
            .wait()
    }

    fn query_with(
        &self,
        statement: &str,
        options: &TransactionQueryOptions,
        callbacks: Callbacks<QueryResult>,
    ) -> BridgeResult<()> {
        self.dispatcher()
            .query(statement, options, Delivery::Callback(callbacks))
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::flags;

    fn id(key: &str) -> DocumentId {
        DocumentId::new("b", "s", "c", key)
    }

    fn prior(key: &str) -> TransactionGetResult {
        TransactionGetResult::new(id(key), 7, Content::new(b"{}".to_vec(), flags::JSON), "tx", "a1")
    }

    #[test]
    fn kind_codes_and_names() {
        for code in 0..5 {
            let kind = OperationKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert!(OperationKind::from_code(9).is_none());
        assert_eq!("REPLACE".parse::<OperationKind>().unwrap(), OperationKind::Replace);
        assert!("upsert".parse::<OperationKind>().is_err());
    }

    #[test]
    fn insert_requires_payload() {
        let err = Operation::from_parts(OperationKind::Insert, Some(id("k")), None, None).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        let empty = Content::new(Vec::new(), flags::JSON);
        let err = Operation::from_parts(OperationKind::Insert, Some(id("k")), Some(empty), None)
            .unwrap_err();
        assert!(err.to_string().contains("non-empty payload"));
    }

    #[test]
    fn replace_rejects_prior_for_other_key() {
        let err = Operation::from_parts(
            OperationKind::Replace,
            Some(id("order-2")),
            Some(Content::binary(b"x".to_vec())),
            Some(prior("order-1")),
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        let remove =
            Operation::from_parts(OperationKind::Remove, None, None, Some(prior("order-1"))).unwrap();
        assert_eq!(remove.kind(), OperationKind::Remove);
    }

    #[test]
    fn get_requires_complete_identity() {
        let err = Operation::from_parts(
            OperationKind::Get,
            Some(DocumentId::new("b", "s", "", "k")),
            None,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("collection"));
        assert!(Operation::from_parts(OperationKind::Get, None, None, None).is_err());
    }

    #[test]
    fn query_validation() {
        let op = Operation::Query {
            statement: "  ".to_string(),
            options: TransactionQueryOptions::new(),
        };
        assert!(op.validate().is_err());
        assert!(Operation::from_parts(OperationKind::Query, None, None, None).is_err());
    }

    #[test]
    fn result_projection() {
        let doc = OperationResult::Document(prior("k"));
        assert_eq!(doc.clone().into_document().unwrap().key(), "k");
        assert!(matches!(
            OperationResult::Removed.into_document(),
            Err(BridgeError::UnexpectedResult {
                expected: "document",
                actual: "removed"
            })
        ));
        assert!(doc.into_query().is_err());
    }
}
