//! Document identity, payloads and operation results shared by the bridge
//! and the native engine.

use crate::error::{BridgeError, BridgeResult};
use std::fmt;

/// Common format flags stored next to a document body.
pub mod flags {
    pub const JSON: u32 = 0x0200_0000;
    pub const BINARY: u32 = 0x0300_0000;
    pub const STRING: u32 = 0x0400_0000;

    /// Upper byte carries the format; the rest is reserved for compression bits.
    pub const FORMAT_MASK: u32 = 0xFF00_0000;
}

/// Fully qualified document identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub key: String,
}

impl DocumentId {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Every part must be present; the engine cannot route a partial identity.
    pub fn validate(&self) -> BridgeResult<()> {
        for (part, value) in [
            ("bucket", &self.bucket),
            ("scope", &self.scope),
            ("collection", &self.collection),
            ("key", &self.key),
        ] {
            if value.is_empty() {
                return Err(BridgeError::InvalidArgument(format!(
                    "document identity is missing its {part}"
                )));
            }
        }
        Ok(())
    }

    /// True when the document lives in `bucket.scope.collection`.
    pub fn in_keyspace(&self, bucket: &str, scope: &str, collection: &str) -> bool {
        self.bucket == bucket && self.scope == scope && self.collection == collection
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}/{}",
            self.bucket, self.scope, self.collection, self.key
        )
    }
}

/// Opaque document body plus its format flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub data: Vec<u8>,
    pub flags: u32,
}

impl Content {
    pub fn new(data: impl Into<Vec<u8>>, flags: u32) -> Self {
        Self {
            data: data.into(),
            flags,
        }
    }

    /// Encode a JSON value with the JSON format flag.
    pub fn json(value: &serde_json::Value) -> BridgeResult<Self> {
        Ok(Self::new(serde_json::to_vec(value)?, flags::JSON))
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, flags::BINARY)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_json(&self) -> bool {
        self.flags & flags::FORMAT_MASK == flags::JSON
    }

    /// Decode the body as JSON regardless of the flags.
    pub fn to_json(&self) -> BridgeResult<serde_json::Value> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// A document as seen by one attempt.
///
/// Besides the body it carries the transaction and attempt ids it was read
/// or written under; REPLACE and REMOVE use them as the optimistic-concurrency
/// token and reject results that belong to another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionGetResult {
    id: DocumentId,
    cas: u64,
    content: Content,
    transaction_id: String,
    attempt_id: String,
}

impl TransactionGetResult {
    pub fn new(
        id: DocumentId,
        cas: u64,
        content: Content,
        transaction_id: impl Into<String>,
        attempt_id: impl Into<String>,
    ) -> Self {
        Self {
            id,
            cas,
            content,
            transaction_id: transaction_id.into(),
            attempt_id: attempt_id.into(),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.id.key
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn into_content(self) -> Content {
        self.content
    }
}

/// Raw response body of a transactional query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    raw: Vec<u8>,
}

impl QueryResult {
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn to_json(&self) -> BridgeResult<serde_json::Value> {
        Ok(serde_json::from_slice(&self.raw)?)
    }

    /// The `results` array of the body, empty when absent.
    pub fn rows(&self) -> BridgeResult<Vec<serde_json::Value>> {
        match self.to_json()? {
            serde_json::Value::Object(mut body) => match body.remove("results") {
                Some(serde_json::Value::Array(rows)) => Ok(rows),
                _ => Ok(Vec::new()),
            },
            _ => Err(BridgeError::Serialization(
                "query body is not a JSON object".to_string(),
            )),
        }
    }
}

/// Outcome of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub unstaging_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_rejects_missing_parts() {
        let id = DocumentId::new("b", "", "c", "k");
        let err = id.validate().unwrap_err();
        assert!(err.to_string().contains("scope"));
        assert!(DocumentId::new("b", "s", "c", "k").validate().is_ok());
    }

    #[test]
    fn json_content_is_flagged() {
        let content = Content::json(&json!({"qty": 3})).unwrap();
        assert!(content.is_json());
        assert_eq!(content.to_json().unwrap(), json!({"qty": 3}));
        assert!(!Content::binary(vec![1, 2]).is_json());
    }

    #[test]
    fn query_rows_extracts_results() {
        let result = QueryResult::new(br#"{"results":[{"a":1},{"a":2}],"status":"success"}"#.to_vec());
        assert_eq!(result.rows().unwrap().len(), 2);
        assert!(QueryResult::new(b"[]".to_vec()).rows().is_err());
    }

    #[test]
    fn display_document_id() {
        let id = DocumentId::new("b", "s", "c", "order-1");
        assert_eq!(id.to_string(), "b.s.c/order-1");
    }
}
