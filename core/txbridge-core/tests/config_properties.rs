//! `to_dict` holds exactly the keyword fields that were supplied.

use proptest::prelude::*;
use serde_json::{Map, Value, json};
use txbridge_core::config::Kwargs;
use txbridge_core::{TransactionConfig, TransactionOptions, TransactionQueryOptions};

fn durability() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(json!("none")),
        Just(json!("majority")),
        Just(json!("majority_and_persist_to_active")),
        Just(json!("persist_to_majority")),
    ]
}

fn consistency() -> impl Strategy<Value = Value> {
    prop_oneof![Just(json!("not_bounded")), Just(json!("request_plus"))]
}

fn millis() -> impl Strategy<Value = Value> {
    (1u64..86_400_000).prop_map(Value::from)
}

fn name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,11}"
}

fn metadata() -> impl Strategy<Value = Option<(String, String, String)>> {
    proptest::option::of((name(), name(), name()))
}

fn insert(map: &mut Kwargs, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        map.insert(key.to_string(), value);
    }
}

fn insert_metadata(map: &mut Kwargs, metadata: Option<(String, String, String)>) {
    if let Some((bucket, scope, collection)) = metadata {
        map.insert("metadata_bucket".to_string(), json!(bucket));
        map.insert("metadata_scope".to_string(), json!(scope));
        map.insert("metadata_collection".to_string(), json!(collection));
    }
}

prop_compose! {
    fn config_kwargs()(
        durability_level in proptest::option::of(durability()),
        timeout in proptest::option::of(millis()),
        kv_timeout in proptest::option::of(millis()),
        cleanup_window in proptest::option::of(millis()),
        cleanup_lost_attempts in proptest::option::of(any::<bool>().prop_map(Value::from)),
        cleanup_client_attempts in proptest::option::of(any::<bool>().prop_map(Value::from)),
        scan_consistency in proptest::option::of(consistency()),
        metadata in metadata(),
    ) -> Kwargs {
        let mut map = Map::new();
        insert(&mut map, "durability_level", durability_level);
        insert(&mut map, "timeout", timeout);
        insert(&mut map, "kv_timeout", kv_timeout);
        insert(&mut map, "cleanup_window", cleanup_window);
        insert(&mut map, "cleanup_lost_attempts", cleanup_lost_attempts);
        insert(&mut map, "cleanup_client_attempts", cleanup_client_attempts);
        insert(&mut map, "scan_consistency", scan_consistency);
        insert_metadata(&mut map, metadata);
        map
    }
}

prop_compose! {
    fn options_kwargs()(
        durability_level in proptest::option::of(durability()),
        timeout in proptest::option::of(millis()),
        kv_timeout in proptest::option::of(millis()),
        scan_consistency in proptest::option::of(consistency()),
        metadata in metadata(),
    ) -> Kwargs {
        let mut map = Map::new();
        insert(&mut map, "durability_level", durability_level);
        insert(&mut map, "timeout", timeout);
        insert(&mut map, "kv_timeout", kv_timeout);
        insert(&mut map, "scan_consistency", scan_consistency);
        insert_metadata(&mut map, metadata);
        map
    }
}

prop_compose! {
    fn query_kwargs()(
        positional in proptest::option::of(proptest::collection::vec(any::<i64>().prop_map(Value::from), 0..4)),
        read_only in proptest::option::of(any::<bool>().prop_map(Value::from)),
        metrics in proptest::option::of(any::<bool>().prop_map(Value::from)),
        scan_cap in proptest::option::of((1u64..10_000).prop_map(Value::from)),
        scan_wait in proptest::option::of(millis()),
        client_context_id in proptest::option::of(name().prop_map(Value::from)),
        query_context in proptest::option::of((name(), name())),
    ) -> Kwargs {
        let mut map = Map::new();
        insert(&mut map, "positional_parameters", positional.map(Value::from));
        insert(&mut map, "read_only", read_only);
        insert(&mut map, "metrics", metrics);
        insert(&mut map, "scan_cap", scan_cap);
        insert(&mut map, "scan_wait", scan_wait);
        insert(&mut map, "client_context_id", client_context_id);
        if let Some((bucket, scope)) = query_context {
            map.insert("bucket_name".to_string(), json!(bucket));
            map.insert("scope_name".to_string(), json!(scope));
        }
        map
    }
}

proptest! {
    #[test]
    fn transaction_config_round_trips(kwargs in config_kwargs()) {
        let config = TransactionConfig::from_kwargs(kwargs.clone()).unwrap();
        prop_assert_eq!(config.to_dict(), kwargs.clone());
        let again = TransactionConfig::from_kwargs(config.to_dict()).unwrap();
        prop_assert_eq!(again, config);
    }

    #[test]
    fn transaction_options_round_trip(kwargs in options_kwargs()) {
        let options = TransactionOptions::from_kwargs(kwargs.clone()).unwrap();
        prop_assert_eq!(options.to_dict(), kwargs);
    }

    #[test]
    fn query_options_round_trip(kwargs in query_kwargs()) {
        let options = TransactionQueryOptions::from_kwargs(kwargs.clone()).unwrap();
        prop_assert_eq!(options.to_dict(), kwargs);
        prop_assert!(options.to_native().is_ok());
    }

    #[test]
    fn merged_options_override_config(config in config_kwargs(), options in options_kwargs()) {
        let config = TransactionConfig::from_kwargs(config).unwrap();
        let options = TransactionOptions::from_kwargs(options).unwrap();
        let merged = config.merged_with(&options);
        prop_assert_eq!(merged.timeout(), options.timeout().or(config.timeout()));
        prop_assert_eq!(
            merged.durability_level(),
            options.durability_level().or(config.durability_level())
        );
        prop_assert_eq!(merged.cleanup_window(), config.cleanup_window());
    }
}
