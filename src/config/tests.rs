use super::types::*;
use super::{zip_targets, RelayConfig};
use std::path::Path;

fn valid_config() -> RelayConfig {
    RelayConfig {
        endpoint_name: "home".into(),
        ..RelayConfig::default()
    }
}

#[test]
fn test_load_toml_config() {
    let cfg = RelayConfig::load(Path::new("config.toml")).unwrap();
    assert!(!cfg.endpoint_name.is_empty());
    assert_eq!(cfg.consumer.targets.len(), 2);
    assert_eq!(cfg.consumer.targets[0].pattern, "/api/**");
    cfg.validate().unwrap();
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "endpoint_name": "office",
        "store": { "backend": "etcd", "etcd": { "endpoints": ["http://10.0.0.1:2379"] } },
        "dedup": { "backend": "etcd", "ttl_secs": 60 },
        "consumer": {
            "workers": 4,
            "targets": [
                {"pattern": "/api/**", "target": "http://backend.local"},
                {"pattern": "**", "target": "http://localhost:3010"}
            ]
        }
    }"#;
    let tmp = std::env::temp_dir().join("relay_tunnel_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = RelayConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.consumer.workers, 4);
    assert_eq!(cfg.store.backend, "etcd");
    assert_eq!(cfg.store.etcd.key_prefix, "/relay");
    assert_eq!(cfg.dedup.ttl_secs, 60);
    assert_eq!(cfg.dedup.namespace, "relay-consumer");
    assert_eq!(cfg.consumer.targets[1].target, "http://localhost:3010");
    cfg.validate().unwrap();
}

#[test]
fn test_load_unsupported_extension_fails() {
    let tmp = std::env::temp_dir().join("relay_tunnel_test_config.yaml");
    std::fs::write(&tmp, "endpoint_name: x").unwrap();
    let result = RelayConfig::load(&tmp);
    std::fs::remove_file(&tmp).ok();
    assert!(result.is_err());
}

#[test]
fn test_defaults() {
    let cfg = RelayConfig::default();
    assert_eq!(cfg.consumer.workers, 8);
    assert_eq!(cfg.consumer.forward_timeout_secs, 30.0);
    assert_eq!(cfg.consumer.expire_secs, 120.0);
    assert!(cfg.consumer.cleaning);
    assert_eq!(cfg.consumer.chunk_bytes, 921_600);
    assert_eq!(cfg.gateway.timeout_secs, 60.0);
    assert_eq!(cfg.gateway.shutdown_timeout_secs, 5);
    assert_eq!(cfg.dedup.ttl_secs, 300);
    assert_eq!(cfg.store.backend, "memory");
}

#[test]
fn test_validate_valid_config() {
    assert!(valid_config().validate().is_ok());
}

#[test]
fn test_validate_empty_endpoint_fails() {
    assert!(RelayConfig::default().validate().is_err());
}

#[test]
fn test_validate_endpoint_with_slash_fails() {
    let cfg = RelayConfig {
        endpoint_name: "a/b".into(),
        ..RelayConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_workers_fails() {
    let mut cfg = valid_config();
    cfg.consumer.workers = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_chunk_bytes_fails() {
    let mut cfg = valid_config();
    cfg.consumer.chunk_bytes = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_bad_target_url_fails() {
    let mut cfg = valid_config();
    cfg.consumer.targets = vec![TargetConfig::new("/api/**", "not a url")];
    assert!(cfg.validate().is_err());

    cfg.consumer.targets = vec![TargetConfig::new("/api/**", "ftp://backend.local")];
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_unknown_backend_fails() {
    let mut cfg = valid_config();
    cfg.store.backend = "firestore".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_etcd_dedup_requires_etcd_store() {
    let mut cfg = valid_config();
    cfg.dedup.backend = "etcd".into();
    assert!(cfg.validate().is_err());

    cfg.store.backend = "etcd".into();
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_etcd_store_without_endpoints_fails() {
    let mut cfg = valid_config();
    cfg.store.backend = "etcd".into();
    cfg.store.etcd.endpoints.clear();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_effective_targets_fallback() {
    let cfg = valid_config();
    assert_eq!(cfg.effective_targets(), vec![TargetConfig::fallback()]);
}

#[test]
fn test_zip_targets_keeps_order() {
    let patterns = vec!["/api/**".to_string(), "**".to_string()];
    let targets = vec!["http://a".to_string(), "http://b".to_string()];
    let zipped = zip_targets(&patterns, &targets).unwrap();
    assert_eq!(zipped[0], TargetConfig::new("/api/**", "http://a"));
    assert_eq!(zipped[1], TargetConfig::new("**", "http://b"));
}

#[test]
fn test_zip_targets_length_mismatch_fails() {
    let patterns = vec!["/api/**".to_string()];
    assert!(zip_targets(&patterns, &[]).is_err());
}

#[test]
fn test_requests_collection() {
    assert_eq!(valid_config().requests_collection(), "endpoints/home/requests");
}

#[test]
fn test_validate_rejects_bad_durations() {
    for bad in [-1.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e300] {
        let mut cfg = valid_config();
        cfg.gateway.timeout_secs = bad;
        assert!(cfg.validate().is_err(), "gateway timeout {}", bad);

        let mut cfg = valid_config();
        cfg.consumer.forward_timeout_secs = bad;
        assert!(cfg.validate().is_err(), "forward timeout {}", bad);

        let mut cfg = valid_config();
        cfg.consumer.expire_secs = bad;
        assert!(cfg.validate().is_err(), "expire {}", bad);
    }
}

#[test]
fn test_validate_zero_durations() {
    let mut cfg = valid_config();
    cfg.consumer.expire_secs = 0.0;
    assert!(cfg.validate().is_ok());

    cfg.gateway.timeout_secs = 0.0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_bad_duration_accessors_do_not_panic() {
    let mut cfg = valid_config();
    cfg.consumer.expire_secs = -1.0;
    cfg.gateway.timeout_secs = f64::INFINITY;
    assert_eq!(cfg.consumer.expire(), std::time::Duration::ZERO);
    assert_eq!(cfg.gateway.timeout(), std::time::Duration::ZERO);
}

#[test]
fn test_split_roles_need_shared_store() {
    let mut cfg = valid_config();
    assert!(cfg.validate_split_role().is_err());

    cfg.store.backend = "etcd".into();
    assert!(cfg.validate_split_role().is_ok());
}
