//! Options for queries issued inside a transaction.

use super::{Kwargs, QueryProfile, ScanConsistency, duration_ms, from_kwargs, to_dict};
use crate::error::{BridgeError, BridgeResult};
use crate::native::QueryRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Host-level query options. `to_native()` encodes them into a [`QueryRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionQueryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    positional_parameters: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    named_parameters: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scan_consistency: Option<ScanConsistency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile: Option<QueryProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    adhoc: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metrics: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scan_cap: Option<u64>,
    #[serde(default, with = "duration_ms", skip_serializing_if = "Option::is_none")]
    scan_wait: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pipeline_batch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pipeline_cap: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_parallelism: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bucket_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope_name: Option<String>,
}

impl TransactionQueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_kwargs(kwargs: Kwargs) -> BridgeResult<Self> {
        let options: Self = from_kwargs("query options", kwargs)?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_dict(&self) -> Kwargs {
        to_dict(self)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.positional_parameters.is_some() && self.named_parameters.is_some() {
            return Err(BridgeError::Config(
                "positional_parameters and named_parameters are mutually exclusive".to_string(),
            ));
        }
        if self.bucket_name.is_some() != self.scope_name.is_some() {
            return Err(BridgeError::Config(
                "bucket_name and scope_name must be given together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_positional_parameters(mut self, params: Vec<Value>) -> Self {
        self.positional_parameters = Some(params);
        self
    }

    pub fn with_named_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named_parameters
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value);
        self
    }

    pub fn with_raw(mut self, name: impl Into<String>, value: Value) -> Self {
        self.raw
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value);
        self
    }

    pub fn with_scan_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    pub fn with_profile(mut self, profile: QueryProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn with_scan_cap(mut self, cap: u64) -> Self {
        self.scan_cap = Some(cap);
        self
    }

    pub fn with_client_context_id(mut self, id: impl Into<String>) -> Self {
        self.client_context_id = Some(id.into());
        self
    }

    pub fn with_query_context(mut self, bucket: impl Into<String>, scope: impl Into<String>) -> Self {
        self.bucket_name = Some(bucket.into());
        self.scope_name = Some(scope.into());
        self
    }

    /// Encode into the engine's request shape. Named parameters gain the
    /// `$` prefix the query service expects.
    pub fn to_native(&self) -> BridgeResult<QueryRequest> {
        self.validate()?;
        let encode = |value: &Value| serde_json::to_vec(value).map_err(BridgeError::from);

        let mut request = QueryRequest::default();
        if let Some(raw) = &self.raw {
            for (name, value) in raw {
                request.raw.insert(name.clone(), encode(value)?);
            }
        }
        if let Some(params) = &self.positional_parameters {
            request.positional_parameters = params.iter().map(encode).collect::<BridgeResult<_>>()?;
        }
        if let Some(params) = &self.named_parameters {
            for (name, value) in params {
                let name = if name.starts_with('$') {
                    name.clone()
                } else {
                    format!("${name}")
                };
                request.named_parameters.insert(name, encode(value)?);
            }
        }
        request.scan_consistency = self.scan_consistency;
        request.profile = self.profile.unwrap_or_default();
        request.adhoc = self.adhoc.unwrap_or(true);
        request.metrics = self.metrics.unwrap_or(false);
        request.read_only = self.read_only.unwrap_or(false);
        request.scan_cap = self.scan_cap;
        request.scan_wait = self.scan_wait;
        request.pipeline_batch = self.pipeline_batch;
        request.pipeline_cap = self.pipeline_cap;
        request.max_parallelism = self.max_parallelism;
        request.client_context_id = self.client_context_id.clone();
        if let (Some(bucket), Some(scope)) = (&self.bucket_name, &self.scope_name) {
            request.query_context = Some(format!("{bucket}.{scope}"));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn named_parameters_are_encoded_and_prefixed() {
        let options = TransactionQueryOptions::new()
            .with_named_parameter("qty", json!(3))
            .with_named_parameter("$name", json!("widget"));
        let request = options.to_native().unwrap();
        assert_eq!(request.named_parameters.get("$qty"), Some(&b"3".to_vec()));
        assert_eq!(
            request.named_parameters.get("$name"),
            Some(&br#""widget""#.to_vec())
        );
        assert!(request.adhoc);
    }

    #[test]
    fn positional_and_named_are_exclusive() {
        let kwargs = json!({"positional_parameters": [1], "named_parameters": {"a": 1}});
        let result = TransactionQueryOptions::from_kwargs(kwargs.as_object().unwrap().clone());
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn query_context_needs_both_parts() {
        let kwargs = json!({"bucket_name": "b"});
        assert!(TransactionQueryOptions::from_kwargs(kwargs.as_object().unwrap().clone()).is_err());

        let request = TransactionQueryOptions::new()
            .with_query_context("b", "s")
            .to_native()
            .unwrap();
        assert_eq!(request.query_context.as_deref(), Some("b.s"));
    }

    #[test]
    fn to_dict_round_trips_supplied_fields() {
        let kwargs = json!({
            "profile": "timings",
            "scan_cap": 100,
            "scan_wait": 250,
            "raw": {"use_fts": true},
            "client_context_id": "ctx-1"
        });
        let kwargs = kwargs.as_object().unwrap().clone();
        let options = TransactionQueryOptions::from_kwargs(kwargs.clone()).unwrap();
        assert_eq!(options.to_dict(), kwargs);

        let request = options.to_native().unwrap();
        assert_eq!(request.profile, QueryProfile::Timings);
        assert_eq!(request.scan_wait, Some(Duration::from_millis(250)));
        assert_eq!(request.raw.get("use_fts"), Some(&b"true".to_vec()));
    }
}
