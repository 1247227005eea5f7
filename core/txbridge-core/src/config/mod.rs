//! Config/Options Marshaller.
//!
//! Host code hands over keyword-style maps (`serde_json::Map`); this module
//! turns them into the immutable structs the native engine consumes and
//! projects them back with `to_dict()`. Only fields that were explicitly
//! supplied appear in the projection, so nothing guesses native defaults.
//!
//! Durations travel as integer milliseconds.

pub mod bridge;
pub mod durability;
pub mod query;
pub mod transaction;

pub use bridge::BridgeSettings;
pub use durability::{DurabilityLevel, QueryProfile, ScanConsistency};
pub use query::TransactionQueryOptions;
pub use transaction::{MetadataCollection, TransactionConfig, TransactionOptions};

use crate::error::{BridgeError, BridgeResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Keyword arguments as received from a host.
pub type Kwargs = Map<String, Value>;

/// Deserialize keyword arguments, reporting type mismatches and unknown
/// keys as configuration errors.
pub(crate) fn from_kwargs<T: DeserializeOwned>(kind: &str, kwargs: Kwargs) -> BridgeResult<T> {
    serde_json::from_value(Value::Object(kwargs))
        .map_err(|e| BridgeError::Config(format!("invalid {kind}: {e}")))
}

/// Project a config struct back into keyword form.
pub(crate) fn to_dict<T: Serialize>(value: &T) -> Kwargs {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// serde adapter for `Option<Duration>` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
