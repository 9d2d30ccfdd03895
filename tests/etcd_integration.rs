//! Integration tests for the etcd document store and claim cache.
//!
//! These tests require Docker (via testcontainers) and fail at container
//! startup in environments without it.
//!
//! Run with: `cargo test --test etcd_integration`

use relay_tunnel::config::EtcdConfig;
use relay_tunnel::dedup::{DedupCache, EtcdDedup};
use relay_tunnel::etcd::EtcdClient;
use relay_tunnel::record;
use relay_tunnel::store::{ChangeKind, DocumentStore, EtcdStore, Snapshot};

use http::HeaderMap;
use serde_json::json;
use std::time::Duration;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

const COLLECTION: &str = "endpoints/it/requests";

/// Start an etcd container and return a connected client and its config.
async fn start_etcd() -> (EtcdClient, EtcdConfig, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("quay.io/coreos/etcd", "v3.5.17")
        .with_exposed_port(2379_u16.tcp())
        .with_env_var("ETCD_ADVERTISE_CLIENT_URLS", "http://0.0.0.0:2379")
        .with_env_var("ETCD_LISTEN_CLIENT_URLS", "http://0.0.0.0:2379")
        .start()
        .await
        .expect("failed to start etcd container");

    let host = container.get_host().await.expect("get host");
    let port = container.get_host_port_ipv4(2379).await.expect("get port");
    let endpoint = format!("http://{}:{}", host, port);

    // Wait for etcd to be ready
    let http = reqwest::Client::new();
    for _ in 0..30 {
        if let Ok(resp) = http
            .post(format!("{}/v3/maintenance/status", endpoint))
            .json(&json!({}))
            .send()
            .await
        {
            if resp.status().is_success() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let cfg = EtcdConfig {
        endpoints: vec![endpoint],
        key_prefix: "/relay-it".to_string(),
        ..EtcdConfig::default()
    };
    let client = EtcdClient::connect(&cfg).await.expect("connect to etcd");
    (client, cfg, container)
}

async fn store() -> (DocumentStore, EtcdClient, EtcdConfig, ContainerAsync<GenericImage>) {
    let (client, cfg, container) = start_etcd().await;
    let store = DocumentStore::Etcd(EtcdStore::new(client.clone(), &cfg.key_prefix));
    (store, client, cfg, container)
}

async fn next_snapshot(stream: &mut relay_tunnel::store::ChangeStream) -> Snapshot {
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("watch timed out")
        .expect("watch ended")
        .expect("watch failed")
}

#[tokio::test]
async fn test_etcd_store_add_get_update_delete() {
    let (store, _client, _cfg, _container) = store().await;

    let doc = store
        .add(
            COLLECTION,
            record::new_request("GET", "/api/x?y=1", &HeaderMap::new(), b"hi"),
        )
        .await
        .unwrap();
    assert!(doc.path.starts_with(COLLECTION));
    assert!(doc.data["created"].as_i64().unwrap() > 0);

    let got = store.get(&doc.path).await.unwrap().unwrap();
    assert_eq!(got.data["request"]["httpInfo"]["requestURI"], "/api/x?y=1");

    let first = record::inline_response(200, &HeaderMap::new(), b"ok");
    assert!(store.update_if_absent(&doc.path, "response", first).await.unwrap());
    let second = record::error_response("late");
    assert!(!store.update_if_absent(&doc.path, "response", second).await.unwrap());
    let got = store.get(&doc.path).await.unwrap().unwrap();
    assert_eq!(got.data["response"]["statusCode"], 200);

    assert_eq!(store.list(COLLECTION).await.unwrap().len(), 1);
    store.delete(&doc.path).await.unwrap();
    assert!(store.get(&doc.path).await.unwrap().is_none());
    assert!(store.list(COLLECTION).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_etcd_list_skips_sub_collections() {
    let (store, _client, _cfg, _container) = store().await;

    let doc = store.add(COLLECTION, json!({ "created": 1 })).await.unwrap();
    let bodies = record::response_bodies(&doc.path);
    store.add(&bodies, record::chunk(0, b"ab")).await.unwrap();
    store.add(&bodies, record::chunk(1, b"cd")).await.unwrap();

    assert_eq!(store.list(COLLECTION).await.unwrap().len(), 1);
    let chunks = store.list(&bodies).await.unwrap();
    assert_eq!(chunks.len(), 2);
    let first = record::decode_chunk(&chunks[0]).unwrap();
    assert_eq!(first.size, 2);
}

#[tokio::test]
async fn test_etcd_watch_collection_reports_kinds() {
    let (store, _client, _cfg, _container) = store().await;

    let existing = store.add(COLLECTION, json!({ "created": 1 })).await.unwrap();
    let mut stream = store.watch_collection(COLLECTION).await.unwrap();

    let initial = next_snapshot(&mut stream).await;
    assert_eq!(initial.changes.len(), 1);
    assert_eq!(initial.changes[0].kind, ChangeKind::Added);
    assert_eq!(initial.changes[0].doc.path, existing.path);

    let added = store.add(COLLECTION, json!({ "created": 2 })).await.unwrap();
    let snap = next_snapshot(&mut stream).await;
    assert_eq!(snap.changes[0].kind, ChangeKind::Added);
    assert_eq!(snap.changes[0].doc.path, added.path);

    store
        .update(&added.path, "response", record::error_response("x"))
        .await
        .unwrap();
    let snap = next_snapshot(&mut stream).await;
    assert_eq!(snap.changes[0].kind, ChangeKind::Modified);

    // Chunk writes under the record are not part of the collection.
    store
        .add(&record::response_bodies(&added.path), record::chunk(0, b"z"))
        .await
        .unwrap();
    store.delete(&added.path).await.unwrap();
    let snap = next_snapshot(&mut stream).await;
    assert_eq!(snap.changes[0].kind, ChangeKind::Removed);
    assert_eq!(snap.changes[0].doc.path, added.path);
}

#[tokio::test]
async fn test_etcd_watch_document_sees_response() {
    let (store, _client, _cfg, _container) = store().await;

    let doc = store.add(COLLECTION, json!({ "created": 1 })).await.unwrap();
    let mut stream = store.watch_document(&doc.path).await.unwrap();
    let initial = next_snapshot(&mut stream).await;
    assert!(record::RecordResponse::decode(&initial.changes[0].doc.data).is_none());

    let response = record::inline_response(204, &HeaderMap::new(), b"");
    store.update(&doc.path, "response", response).await.unwrap();
    let snap = next_snapshot(&mut stream).await;
    match record::RecordResponse::decode(&snap.changes[0].doc.data) {
        Some(record::RecordResponse::Complete { status, .. }) => assert_eq!(status, 204),
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_etcd_dedup_claim_is_shared() {
    let (client, cfg, _container) = start_etcd().await;
    let ttl = Duration::from_secs(30);

    let a = EtcdDedup::new(client.clone(), &cfg.key_prefix, "consumers", ttl);
    let b = EtcdDedup::new(client.clone(), &cfg.key_prefix, "consumers", ttl);
    assert!(a.try_claim("rec-1").await.unwrap());
    assert!(!b.try_claim("rec-1").await.unwrap());
    assert!(b.try_claim("rec-2").await.unwrap());

    // Another namespace claims independently.
    let other = DedupCache::Etcd(EtcdDedup::new(client, &cfg.key_prefix, "others", ttl));
    assert!(other.try_claim("rec-1").await);
}
