//! Engine-wide `TransactionConfig` and per-transaction `TransactionOptions`.

use super::{DurabilityLevel, Kwargs, ScanConsistency, duration_ms, from_kwargs, to_dict};
use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Transaction timeout used when neither config nor options set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Durability used when neither config nor options set one.
pub const DEFAULT_DURABILITY: DurabilityLevel = DurabilityLevel::Majority;

/// Collection holding the engine's transaction metadata documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetadataCollection {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl MetadataCollection {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for MetadataCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// A metadata collection must be given as a full triple or not at all.
fn resolve_metadata(
    bucket: &Option<String>,
    scope: &Option<String>,
    collection: &Option<String>,
) -> BridgeResult<Option<MetadataCollection>> {
    match (bucket, scope, collection) {
        (None, None, None) => Ok(None),
        (Some(b), Some(s), Some(c)) if !b.is_empty() && !s.is_empty() && !c.is_empty() => {
            Ok(Some(MetadataCollection::new(b, s, c)))
        }
        _ => {
            let missing: Vec<&str> = [
                ("metadata_bucket", bucket),
                ("metadata_scope", scope),
                ("metadata_collection", collection),
            ]
            .into_iter()
            .filter(|(_, v)| v.as_deref().is_none_or(str::is_empty))
            .map(|(name, _)| name)
            .collect();
            Err(BridgeError::Config(format!(
                "metadata collection must be a complete bucket/scope/collection triple; missing {}",
                missing.join(", ")
            )))
        }
    }
}

fn check_positive(name: &str, value: Option<Duration>) -> BridgeResult<()> {
    if value == Some(Duration::ZERO) {
        return Err(BridgeError::Config(format!("{name} must be greater than zero")));
    }
    Ok(())
}

/// Engine-wide transactions configuration.
///
/// Built once (from keywords or the `with_*` builder), never mutated
/// afterwards, and shared by every attempt of every transaction the engine runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    durability_level: Option<DurabilityLevel>,
    #[serde(default, with = "duration_ms", skip_serializing_if = "Option::is_none")]
    timeout: Option<Duration>,
    #[serde(default, with = "duration_ms", skip_serializing_if = "Option::is_none")]
    kv_timeout: Option<Duration>,
    #[serde(default, with = "duration_ms", skip_serializing_if = "Option::is_none")]
    cleanup_window: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cleanup_lost_attempts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cleanup_client_attempts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scan_consistency: Option<ScanConsistency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_collection: Option<String>,
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from host keyword arguments.
    ///
    /// # Errors
    ///
    /// `BridgeError::Config` for unknown keys, mistyped values, zero
    /// timeouts, or a partial metadata collection triple.
    pub fn from_kwargs(kwargs: Kwargs) -> BridgeResult<Self> {
        let config: Self = from_kwargs("transaction config", kwargs)?;
        config.validate()?;
        Ok(config)
    }

    /// Keyword projection holding only the fields that were set.
    pub fn to_dict(&self) -> Kwargs {
        to_dict(self)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        check_positive("timeout", self.timeout)?;
        check_positive("kv_timeout", self.kv_timeout)?;
        check_positive("cleanup_window", self.cleanup_window)?;
        resolve_metadata(
            &self.metadata_bucket,
            &self.metadata_scope,
            &self.metadata_collection,
        )?;
        Ok(())
    }

    pub fn with_durability_level(mut self, level: DurabilityLevel) -> Self {
        self.durability_level = Some(level);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = Some(timeout);
        self
    }

    pub fn with_cleanup_window(mut self, window: Duration) -> Self {
        self.cleanup_window = Some(window);
        self
    }

    pub fn with_cleanup_lost_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_lost_attempts = Some(enabled);
        self
    }

    pub fn with_cleanup_client_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_client_attempts = Some(enabled);
        self
    }

    pub fn with_scan_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    pub fn with_metadata_collection(mut self, collection: MetadataCollection) -> Self {
        self.metadata_bucket = Some(collection.bucket);
        self.metadata_scope = Some(collection.scope);
        self.metadata_collection = Some(collection.collection);
        self
    }

    pub fn durability_level(&self) -> Option<DurabilityLevel> {
        self.durability_level
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn kv_timeout(&self) -> Option<Duration> {
        self.kv_timeout
    }

    pub fn cleanup_window(&self) -> Option<Duration> {
        self.cleanup_window
    }

    pub fn cleanup_lost_attempts(&self) -> Option<bool> {
        self.cleanup_lost_attempts
    }

    pub fn cleanup_client_attempts(&self) -> Option<bool> {
        self.cleanup_client_attempts
    }

    pub fn scan_consistency(&self) -> Option<ScanConsistency> {
        self.scan_consistency
    }

    pub fn metadata_collection(&self) -> Option<MetadataCollection> {
        resolve_metadata(
            &self.metadata_bucket,
            &self.metadata_scope,
            &self.metadata_collection,
        )
        .ok()
        .flatten()
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn effective_durability(&self) -> DurabilityLevel {
        self.durability_level.unwrap_or(DEFAULT_DURABILITY)
    }

    /// Apply per-transaction overrides on top of this config.
    pub fn merged_with(&self, options: &TransactionOptions) -> TransactionConfig {
        let mut merged = self.clone();
        if options.durability_level.is_some() {
            merged.durability_level = options.durability_level;
        }
        if options.timeout.is_some() {
            merged.timeout = options.timeout;
        }
        if options.kv_timeout.is_some() {
            merged.kv_timeout = options.kv_timeout;
        }
        if options.scan_consistency.is_some() {
            merged.scan_consistency = options.scan_consistency;
        }
        if let Some(collection) = options.metadata_collection() {
            merged = merged.with_metadata_collection(collection);
        }
        merged
    }
}

/// Per-transaction overrides of [`TransactionConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    durability_level: Option<DurabilityLevel>,
    #[serde(default, with = "duration_ms", skip_serializing_if = "Option::is_none")]
    timeout: Option<Duration>,
    #[serde(default, with = "duration_ms", skip_serializing_if = "Option::is_none")]
    kv_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scan_consistency: Option<ScanConsistency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_collection: Option<String>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_kwargs(kwargs: Kwargs) -> BridgeResult<Self> {
        let options: Self = from_kwargs("transaction options", kwargs)?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_dict(&self) -> Kwargs {
        to_dict(self)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        check_positive("timeout", self.timeout)?;
        check_positive("kv_timeout", self.kv_timeout)?;
        resolve_metadata(
            &self.metadata_bucket,
            &self.metadata_scope,
            &self.metadata_collection,
        )?;
        Ok(())
    }

    pub fn with_durability_level(mut self, level: DurabilityLevel) -> Self {
        self.durability_level = Some(level);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = Some(timeout);
        self
    }

    pub fn with_scan_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    pub fn with_metadata_collection(mut self, collection: MetadataCollection) -> Self {
        self.metadata_bucket = Some(collection.bucket);
        self.metadata_scope = Some(collection.scope);
        self.metadata_collection = Some(collection.collection);
        self
    }

    pub fn durability_level(&self) -> Option<DurabilityLevel> {
        self.durability_level
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn kv_timeout(&self) -> Option<Duration> {
        self.kv_timeout
    }

    pub fn scan_consistency(&self) -> Option<ScanConsistency> {
        self.scan_consistency
    }

    pub fn metadata_collection(&self) -> Option<MetadataCollection> {
        resolve_metadata(
            &self.metadata_bucket,
            &self.metadata_scope,
            &self.metadata_collection,
        )
        .ok()
        .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(value: serde_json::Value) -> Kwargs {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn to_dict_contains_only_supplied_fields() {
        let input = kwargs(json!({"durability_level": "majority", "timeout": 10000}));
        let config = TransactionConfig::from_kwargs(input.clone()).unwrap();
        assert_eq!(config.to_dict(), input);
        assert_eq!(config.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.kv_timeout(), None);
    }

    #[test]
    fn partial_metadata_triple_is_a_config_error() {
        let input = kwargs(json!({"metadata_bucket": "b", "metadata_collection": "c"}));
        match TransactionConfig::from_kwargs(input) {
            Err(BridgeError::Config(msg)) => {
                assert!(msg.contains("metadata_scope"));
                assert!(!msg.contains("metadata_bucket,"));
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn full_metadata_triple_is_accepted() {
        let input = kwargs(json!({
            "metadata_bucket": "meta",
            "metadata_scope": "_default",
            "metadata_collection": "atr"
        }));
        let config = TransactionConfig::from_kwargs(input).unwrap();
        assert_eq!(
            config.metadata_collection(),
            Some(MetadataCollection::new("meta", "_default", "atr"))
        );
    }

    #[test]
    fn unknown_and_mistyped_keys_are_rejected() {
        assert!(matches!(
            TransactionConfig::from_kwargs(kwargs(json!({"expiry": 5}))),
            Err(BridgeError::Config(_))
        ));
        assert!(matches!(
            TransactionConfig::from_kwargs(kwargs(json!({"timeout": "soon"}))),
            Err(BridgeError::Config(_))
        ));
        assert!(matches!(
            TransactionConfig::from_kwargs(kwargs(json!({"timeout": 0}))),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn options_override_config() {
        let config = TransactionConfig::new()
            .with_durability_level(DurabilityLevel::Majority)
            .with_timeout(Duration::from_secs(10));
        let options = TransactionOptions::new()
            .with_timeout(Duration::from_secs(2))
            .with_metadata_collection(MetadataCollection::new("b", "s", "c"));
        let merged = config.merged_with(&options);
        assert_eq!(merged.effective_timeout(), Duration::from_secs(2));
        assert_eq!(merged.effective_durability(), DurabilityLevel::Majority);
        assert_eq!(
            merged.metadata_collection().map(|m| m.to_string()),
            Some("b.s.c".to_string())
        );
        // the original is untouched
        assert_eq!(config.timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = TransactionConfig::new();
        assert_eq!(config.effective_timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.effective_durability(), DEFAULT_DURABILITY);
        assert!(config.to_dict().is_empty());
    }

    #[test]
    fn options_partial_triple_rejected() {
        let input = kwargs(json!({"metadata_scope": "s"}));
        assert!(matches!(
            TransactionOptions::from_kwargs(input),
            Err(BridgeError::Config(_))
        ));
    }
}
