//! Committed documents and per-attempt staged mutations.

use crate::native::{ErrorClass, NativeError};
use crate::types::{Content, DocumentId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A committed document and its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub content: Content,
    pub cas: u64,
}

/// Committed document store.
///
/// Reads are lock-free; commits take `commit_lock` so that validating and
/// applying a batch of staged mutations is atomic with respect to other
/// commits.
#[derive(Debug)]
pub struct DocumentStore {
    documents: DashMap<DocumentId, StoredDocument>,
    /// Next version token. Starts at 1; 0 is never handed out.
    next_cas: AtomicU64,
    commit_lock: Mutex<()>,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            next_cas: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
        }
    }

    /// Allocate a fresh version token.
    pub fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Write a document outside any transaction (seeding, tests).
    pub fn upsert(&self, id: DocumentId, content: Content) -> u64 {
        let _commit = self.commit_lock.lock();
        let cas = self.next_cas();
        self.documents.insert(id, StoredDocument { content, cas });
        cas
    }

    pub fn get(&self, id: &DocumentId) -> Option<StoredDocument> {
        self.documents.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.documents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Committed documents of one keyspace, ordered by key.
    pub fn scan(&self, bucket: &str, scope: &str, collection: &str) -> BTreeMap<DocumentId, StoredDocument> {
        self.documents
            .iter()
            .filter(|entry| entry.key().in_keyspace(bucket, scope, collection))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Validate every precondition of `staged`, then apply all of it.
    /// Nothing is written when any precondition fails.
    pub fn commit(&self, staged: &StagedMutations) -> Result<usize, NativeError> {
        let _commit = self.commit_lock.lock();

        for (id, entry) in staged.iter() {
            let current = self.documents.get(id).map(|doc| doc.cas);
            let conflict = match (&entry.mutation, current) {
                (Mutation::Insert { .. }, Some(_)) => true,
                (Mutation::Insert { .. }, None) => false,
                (
                    Mutation::Replace { expected_cas, .. } | Mutation::Remove { expected_cas },
                    current,
                ) => current != Some(*expected_cas),
            };
            if conflict {
                return Err(NativeError::retryable(
                    ErrorClass::FailWriteWriteConflict,
                    format!("{id} was changed by another transaction"),
                ));
            }
        }

        for (id, entry) in staged.iter() {
            match &entry.mutation {
                Mutation::Insert { content } | Mutation::Replace { content, .. } => {
                    let cas = self.next_cas();
                    self.documents.insert(
                        id.clone(),
                        StoredDocument {
                            content: content.clone(),
                            cas,
                        },
                    );
                }
                Mutation::Remove { .. } => {
                    self.documents.remove(id);
                }
            }
        }
        Ok(staged.len())
    }
}

/// A write staged by an attempt and not yet visible to others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Insert { content: Content },
    Replace { content: Content, expected_cas: u64 },
    Remove { expected_cas: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEntry {
    pub mutation: Mutation,
    /// Version token handed back to the caller for this staged write.
    pub staged_cas: u64,
}

/// What an attempt currently sees for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedView<'a> {
    Present { content: &'a Content, cas: u64 },
    Removed,
}

/// Writes of one attempt, readable by that attempt only.
#[derive(Debug, Default, Clone)]
pub struct StagedMutations {
    entries: BTreeMap<DocumentId, StagedEntry>,
}

impl StagedMutations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DocumentId, &StagedEntry)> {
        self.entries.iter()
    }

    pub fn entry(&self, id: &DocumentId) -> Option<&StagedEntry> {
        self.entries.get(id)
    }

    pub fn view(&self, id: &DocumentId) -> Option<StagedView<'_>> {
        self.entries.get(id).map(|entry| match &entry.mutation {
            Mutation::Insert { content } | Mutation::Replace { content, .. } => StagedView::Present {
                content,
                cas: entry.staged_cas,
            },
            Mutation::Remove { .. } => StagedView::Removed,
        })
    }

    /// Stage an insert. A document this attempt removed becomes a replace of
    /// the committed version.
    pub fn insert(&mut self, id: DocumentId, content: Content, staged_cas: u64) -> Result<(), NativeError> {
        let mutation = match self.entries.get(&id).map(|entry| &entry.mutation) {
            Some(Mutation::Remove { expected_cas }) => Mutation::Replace {
                content,
                expected_cas: *expected_cas,
            },
            Some(_) => return Err(NativeError::DocumentExists(id.to_string())),
            None => Mutation::Insert { content },
        };
        self.entries.insert(id, StagedEntry { mutation, staged_cas });
        Ok(())
    }

    /// Stage a replace of a document whose visible version is `prior_cas`.
    pub fn replace(
        &mut self,
        id: DocumentId,
        content: Content,
        prior_cas: u64,
        staged_cas: u64,
    ) -> Result<(), NativeError> {
        let mutation = match self.entries.get(&id) {
            Some(entry) if entry.staged_cas != prior_cas => {
                return Err(cas_mismatch(&id));
            }
            Some(StagedEntry {
                mutation: Mutation::Insert { .. },
                ..
            }) => Mutation::Insert { content },
            Some(StagedEntry {
                mutation: Mutation::Replace { expected_cas, .. },
                ..
            }) => Mutation::Replace {
                content,
                expected_cas: *expected_cas,
            },
            Some(StagedEntry {
                mutation: Mutation::Remove { .. },
                ..
            }) => {
                return Err(NativeError::operation_failed(
                    ErrorClass::FailDocNotFound,
                    format!("{id} was removed earlier in this attempt"),
                ));
            }
            None => Mutation::Replace {
                content,
                expected_cas: prior_cas,
            },
        };
        self.entries.insert(id, StagedEntry { mutation, staged_cas });
        Ok(())
    }

    /// Stage a remove of a document whose visible version is `prior_cas`.
    pub fn remove(&mut self, id: DocumentId, prior_cas: u64, staged_cas: u64) -> Result<(), NativeError> {
        let next = match self.entries.get(&id) {
            Some(entry) if entry.staged_cas != prior_cas => return Err(cas_mismatch(&id)),
            // removing an own insert leaves nothing to commit
            Some(StagedEntry {
                mutation: Mutation::Insert { .. },
                ..
            }) => None,
            Some(StagedEntry {
                mutation: Mutation::Replace { expected_cas, .. },
                ..
            }) => Some(Mutation::Remove {
                expected_cas: *expected_cas,
            }),
            Some(StagedEntry {
                mutation: Mutation::Remove { .. },
                ..
            }) => {
                return Err(NativeError::operation_failed(
                    ErrorClass::FailDocNotFound,
                    format!("{id} was removed earlier in this attempt"),
                ));
            }
            None => Some(Mutation::Remove {
                expected_cas: prior_cas,
            }),
        };
        match next {
            Some(mutation) => {
                self.entries.insert(id, StagedEntry { mutation, staged_cas });
            }
            None => {
                self.entries.remove(&id);
            }
        }
        Ok(())
    }
}

pub(crate) fn cas_mismatch(id: &DocumentId) -> NativeError {
    NativeError::retryable(
        ErrorClass::FailCasMismatch,
        format!("{id} has changed since it was read"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(key: &str) -> DocumentId {
        DocumentId::new("b", "s", "c", key)
    }

    fn doc(qty: u32) -> Content {
        Content::json(&json!({ "qty": qty })).unwrap()
    }

    #[test]
    fn staged_writes_are_read_back() {
        let mut staged = StagedMutations::new();
        staged.insert(id("a"), doc(1), 10).unwrap();
        assert_eq!(
            staged.view(&id("a")),
            Some(StagedView::Present {
                content: &doc(1),
                cas: 10
            })
        );
        staged.replace(id("a"), doc(2), 10, 11).unwrap();
        assert!(matches!(
            staged.entry(&id("a")).unwrap().mutation,
            Mutation::Insert { .. }
        ));
        staged.remove(id("a"), 11, 12).unwrap();
        assert!(staged.is_empty());
    }

    #[test]
    fn stale_staged_cas_is_rejected() {
        let mut staged = StagedMutations::new();
        staged.replace(id("a"), doc(2), 5, 11).unwrap();
        let err = staged.replace(id("a"), doc(3), 5, 12).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn duplicate_insert_is_document_exists() {
        let mut staged = StagedMutations::new();
        staged.insert(id("a"), doc(1), 10).unwrap();
        assert_eq!(
            staged.insert(id("a"), doc(1), 11),
            Err(NativeError::DocumentExists("b.s.c/a".to_string()))
        );
    }

    #[test]
    fn commit_applies_all_or_nothing() {
        let store = DocumentStore::new();
        let cas_a = store.upsert(id("a"), doc(1));
        let cas_b = store.upsert(id("b"), doc(1));

        let mut staged = StagedMutations::new();
        staged.replace(id("a"), doc(2), cas_a, store.next_cas()).unwrap();
        staged.replace(id("b"), doc(2), cas_b, store.next_cas()).unwrap();
        store.upsert(id("b"), doc(9));

        assert!(store.commit(&staged).unwrap_err().is_retryable());
        assert_eq!(store.get(&id("a")).unwrap().content, doc(1));

        let mut staged = StagedMutations::new();
        staged.replace(id("a"), doc(2), cas_a, store.next_cas()).unwrap();
        staged.insert(id("c"), doc(3), store.next_cas()).unwrap();
        assert_eq!(store.commit(&staged).unwrap(), 2);
        assert_eq!(store.get(&id("a")).unwrap().content, doc(2));
        assert!(store.get(&id("a")).unwrap().cas > cas_a);
        assert_eq!(store.scan("b", "s", "c").len(), 3);
    }
}
