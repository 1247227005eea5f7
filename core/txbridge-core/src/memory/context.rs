//! One transaction of the in-memory engine.

use super::FaultPoint;
use super::engine::EngineState;
use super::query;
use super::store::{StagedMutations, StagedView, cas_mismatch};
use crate::config::TransactionConfig;
use crate::native::{
    ErrorClass, FinalErrorKind, NativeCallback, NativeContext, NativeError, QueryRequest,
};
use crate::types::{Content, DocumentId, QueryResult, TransactionGetResult, TransactionResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptStatus {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttemptStatus::Active => "active",
            AttemptStatus::Committed => "committed",
            AttemptStatus::RolledBack => "rolled back",
        })
    }
}

#[derive(Debug)]
struct AttemptState {
    id: String,
    number: u32,
    staged: StagedMutations,
    status: AttemptStatus,
}

impl AttemptState {
    fn first() -> Self {
        Self {
            id: new_id(),
            number: 1,
            staged: StagedMutations::new(),
            status: AttemptStatus::Active,
        }
    }
}

fn new_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

struct ContextInner {
    transaction_id: String,
    engine: Arc<EngineState>,
    config: TransactionConfig,
    started: Instant,
    attempt: Mutex<AttemptState>,
}

/// A transaction of the in-memory engine. Cloning shares the transaction.
#[derive(Clone)]
pub struct MemoryContext {
    inner: Arc<ContextInner>,
}

impl MemoryContext {
    pub(crate) fn new(engine: Arc<EngineState>, config: TransactionConfig) -> Self {
        let context = Self {
            inner: Arc::new(ContextInner {
                transaction_id: new_id(),
                engine,
                config,
                started: Instant::now(),
                attempt: Mutex::new(AttemptState::first()),
            }),
        };
        debug!(transaction_id = %context.inner.transaction_id, "transaction started");
        context
    }

    pub fn transaction_id(&self) -> &str {
        &self.inner.transaction_id
    }

    pub fn attempt_number(&self) -> u32 {
        self.inner.attempt.lock().number
    }

    /// Writes staged by the current attempt.
    pub fn staged_count(&self) -> usize {
        self.inner.attempt.lock().staged.len()
    }

    pub fn is_expired(&self) -> bool {
        self.inner.started.elapsed() >= self.inner.config.effective_timeout()
    }

    fn injected(&self, point: FaultPoint) -> Result<(), NativeError> {
        match self.inner.engine.cluster.faults.take(point) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_live(&self, attempt: &AttemptState) -> Result<(), NativeError> {
        if self.is_expired() {
            return Err(NativeError::expired(format!(
                "transaction {} exceeded its {:?} timeout",
                self.inner.transaction_id,
                self.inner.config.effective_timeout()
            )));
        }
        if attempt.status != AttemptStatus::Active {
            return Err(NativeError::operation_failed(
                ErrorClass::FailOther,
                format!("attempt {} is already {}", attempt.id, attempt.status),
            ));
        }
        Ok(())
    }

    fn check_prior(&self, attempt: &AttemptState, prior: &TransactionGetResult) -> Result<(), NativeError> {
        if prior.attempt_id() != attempt.id {
            return Err(NativeError::operation_failed(
                ErrorClass::FailOther,
                format!(
                    "{} was read by attempt {}, not the current attempt {}",
                    prior.id(),
                    prior.attempt_id(),
                    attempt.id
                ),
            ));
        }
        Ok(())
    }

    fn result(&self, attempt: &AttemptState, id: DocumentId, cas: u64, content: Content) -> TransactionGetResult {
        TransactionGetResult::new(id, cas, content, self.inner.transaction_id.clone(), attempt.id.clone())
    }

    /// Version of `id` as the current attempt sees it.
    fn visible_cas(&self, attempt: &AttemptState, id: &DocumentId) -> Result<u64, NativeError> {
        match attempt.staged.view(id) {
            Some(StagedView::Present { cas, .. }) => Ok(cas),
            Some(StagedView::Removed) => Err(NativeError::operation_failed(
                ErrorClass::FailDocNotFound,
                format!("{id} was removed earlier in this attempt"),
            )),
            None => self
                .inner
                .engine
                .cluster
                .store
                .get(id)
                .map(|doc| doc.cas)
                .ok_or_else(|| {
                    NativeError::retryable(
                        ErrorClass::FailDocNotFound,
                        format!("{id} was removed by another transaction"),
                    )
                }),
        }
    }

    // ════════════════════════════════════════════
    // Synchronous operations
    // ════════════════════════════════════════════

    fn get_document(&self, id: DocumentId) -> Result<TransactionGetResult, NativeError> {
        self.injected(FaultPoint::Get)?;
        let attempt = self.inner.attempt.lock();
        self.check_live(&attempt)?;
        match attempt.staged.view(&id) {
            Some(StagedView::Present { content, cas }) => {
                let content = content.clone();
                Ok(self.result(&attempt, id, cas, content))
            }
            Some(StagedView::Removed) => Err(NativeError::DocumentNotFound(id.to_string())),
            None => match self.inner.engine.cluster.store.get(&id) {
                Some(doc) => Ok(self.result(&attempt, id, doc.cas, doc.content)),
                None => Err(NativeError::DocumentNotFound(id.to_string())),
            },
        }
    }

    fn insert_document(&self, id: DocumentId, content: Content) -> Result<TransactionGetResult, NativeError> {
        self.injected(FaultPoint::Insert)?;
        let mut attempt = self.inner.attempt.lock();
        self.check_live(&attempt)?;
        let store = &self.inner.engine.cluster.store;
        if attempt.staged.entry(&id).is_none() && store.contains(&id) {
            return Err(NativeError::DocumentExists(id.to_string()));
        }
        let cas = store.next_cas();
        attempt.staged.insert(id.clone(), content.clone(), cas)?;
        Ok(self.result(&attempt, id, cas, content))
    }

    fn replace_document(
        &self,
        prior: TransactionGetResult,
        content: Content,
    ) -> Result<TransactionGetResult, NativeError> {
        self.injected(FaultPoint::Replace)?;
        let mut attempt = self.inner.attempt.lock();
        self.check_live(&attempt)?;
        self.check_prior(&attempt, &prior)?;
        let id = prior.id().clone();
        if self.visible_cas(&attempt, &id)? != prior.cas() {
            return Err(cas_mismatch(&id));
        }
        let cas = self.inner.engine.cluster.store.next_cas();
        attempt.staged.replace(id.clone(), content.clone(), prior.cas(), cas)?;
        Ok(self.result(&attempt, id, cas, content))
    }

    fn remove_document(&self, prior: TransactionGetResult) -> Result<(), NativeError> {
        self.injected(FaultPoint::Remove)?;
        let mut attempt = self.inner.attempt.lock();
        self.check_live(&attempt)?;
        self.check_prior(&attempt, &prior)?;
        let id = prior.id().clone();
        if self.visible_cas(&attempt, &id)? != prior.cas() {
            return Err(cas_mismatch(&id));
        }
        let cas = self.inner.engine.cluster.store.next_cas();
        attempt.staged.remove(id, prior.cas(), cas)
    }

    fn run_query(&self, statement: String, request: QueryRequest) -> Result<QueryResult, NativeError> {
        self.injected(FaultPoint::Query)?;
        let cluster = &self.inner.engine.cluster;
        if !cluster.query_enabled() {
            return Err(NativeError::FeatureNotAvailable(
                "query service is not enabled on this cluster".to_string(),
            ));
        }
        let plan = query::plan(&statement, &request)?;
        let attempt = self.inner.attempt.lock();
        self.check_live(&attempt)?;

        let (bucket, scope, collection) = plan.keyspace();
        let mut documents: BTreeMap<DocumentId, Content> = cluster
            .store
            .scan(bucket, scope, collection)
            .into_iter()
            .map(|(id, doc)| (id, doc.content))
            .collect();
        for (id, _) in attempt
            .staged
            .iter()
            .filter(|(id, _)| id.in_keyspace(bucket, scope, collection))
        {
            match attempt.staged.view(id) {
                Some(StagedView::Present { content, .. }) => {
                    documents.insert(id.clone(), content.clone());
                }
                _ => {
                    documents.remove(id);
                }
            }
        }
        query::execute(&plan, &request, documents)
    }

    /// Make the current attempt's writes visible.
    pub(crate) fn commit_attempt(&self) -> Result<TransactionResult, NativeError> {
        self.injected(FaultPoint::Commit)?;
        let mut attempt = self.inner.attempt.lock();
        self.check_live(&attempt)?;
        let applied = self.inner.engine.cluster.store.commit(&attempt.staged)?;
        attempt.staged.clear();
        attempt.status = AttemptStatus::Committed;
        debug!(
            transaction_id = %self.inner.transaction_id,
            attempt_id = %attempt.id,
            applied,
            "attempt committed"
        );
        Ok(TransactionResult {
            transaction_id: self.inner.transaction_id.clone(),
            unstaging_complete: true,
        })
    }

    /// Discard the current attempt's writes.
    pub(crate) fn rollback_attempt(&self) -> Result<(), NativeError> {
        self.injected(FaultPoint::Rollback)?;
        let mut attempt = self.inner.attempt.lock();
        if attempt.status == AttemptStatus::Committed {
            return Err(NativeError::operation_failed(
                ErrorClass::FailOther,
                format!("attempt {} is already committed", attempt.id),
            ));
        }
        let discarded = attempt.staged.len();
        attempt.staged.clear();
        attempt.status = AttemptStatus::RolledBack;
        debug!(attempt_id = %attempt.id, discarded, "attempt rolled back");
        Ok(())
    }

    pub(crate) fn start_new_attempt(&self) -> Result<(), NativeError> {
        let mut attempt = self.inner.attempt.lock();
        if attempt.status == AttemptStatus::Committed {
            return Err(NativeError::operation_failed(
                ErrorClass::FailOther,
                "transaction is already committed",
            ));
        }
        if self.is_expired() {
            return Err(NativeError::expired(format!(
                "transaction {} expired before a new attempt could start",
                self.inner.transaction_id
            )));
        }
        let number = attempt.number + 1;
        *attempt = AttemptState {
            id: new_id(),
            number,
            staged: StagedMutations::new(),
            status: AttemptStatus::Active,
        };
        debug!(attempt_id = %attempt.id, number = attempt.number, "new attempt");
        Ok(())
    }

    /// Wrap `cause` into the error that ends the transaction.
    pub(crate) fn final_error(&self, kind: FinalErrorKind, cause: NativeError) -> NativeError {
        if let NativeError::Transaction { .. } = cause {
            return cause;
        }
        NativeError::Transaction {
            kind,
            message: format!(
                "transaction {} {kind}: {}",
                self.inner.transaction_id,
                cause.message()
            ),
            transaction_id: self.inner.transaction_id.clone(),
            cause: Some(Box::new(cause)),
        }
    }

    fn spawn<T: Send + 'static>(
        &self,
        done: NativeCallback<T>,
        job: impl FnOnce(&MemoryContext) -> Result<T, NativeError> + Send + 'static,
    ) {
        let context = self.clone();
        self.inner.engine.spawn(done, move || job(&context));
    }
}

impl NativeContext for MemoryContext {
    fn transaction_id(&self) -> String {
        self.inner.transaction_id.clone()
    }

    fn attempt_id(&self) -> String {
        self.inner.attempt.lock().id.clone()
    }

    fn new_attempt(&self, done: NativeCallback<()>) {
        self.spawn(done, |ctx| ctx.start_new_attempt());
    }

    fn get(&self, id: DocumentId, done: NativeCallback<TransactionGetResult>) {
        self.spawn(done, move |ctx| ctx.get_document(id));
    }

    fn insert(&self, id: DocumentId, content: Content, done: NativeCallback<TransactionGetResult>) {
        self.spawn(done, move |ctx| ctx.insert_document(id, content));
    }

    fn replace(
        &self,
        prior: TransactionGetResult,
        content: Content,
        done: NativeCallback<TransactionGetResult>,
    ) {
        self.spawn(done, move |ctx| ctx.replace_document(prior, content));
    }

    fn remove(&self, prior: TransactionGetResult, done: NativeCallback<()>) {
        self.spawn(done, move |ctx| ctx.remove_document(prior));
    }

    fn query(&self, statement: String, request: QueryRequest, done: NativeCallback<QueryResult>) {
        self.spawn(done, move |ctx| ctx.run_query(statement, request));
    }

    fn commit(&self, done: NativeCallback<TransactionResult>) {
        self.spawn(done, |ctx| {
            ctx.commit_attempt().map_err(|err| {
                let kind = match &err {
                    NativeError::OperationFailed { to_raise, .. } => *to_raise,
                    _ => FinalErrorKind::Failed,
                };
                if let Err(rollback_err) = ctx.rollback_attempt() {
                    debug!(error = %rollback_err, "rollback after failed commit did not complete");
                }
                ctx.final_error(kind, err)
            })
        });
    }

    fn rollback(&self, done: NativeCallback<()>) {
        self.spawn(done, |ctx| ctx.rollback_attempt());
    }
}

impl fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryContext")
            .field("transaction_id", &self.inner.transaction_id)
            .field("attempt", &*self.inner.attempt.lock())
            .finish()
    }
}
