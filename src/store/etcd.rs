use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    is_direct_child, new_document_id, now_millis, resolve_server_timestamps, Change, ChangeKind,
    ChangeStream, Document, Snapshot,
};
use crate::etcd::client::{
    b64_decode, b64_encode, prefix_range_end, Compare, DeleteRangeRequest, KeyValue, PutRequest,
    RangeRequest, RequestOp, TxnRequest, WatchCreate, WatchCreateRequest,
};
use crate::etcd::EtcdClient;

const UPDATE_ATTEMPTS: usize = 8;

/// Document store on etcd. Each document is one key holding its JSON
/// encoding, at `<key_prefix>/<document path>`.
///
/// Server timestamps are taken from this process's clock at write time.
#[derive(Clone)]
pub struct EtcdStore {
    client: EtcdClient,
    prefix: String,
}

impl EtcdStore {
    pub fn new(client: EtcdClient, key_prefix: &str) -> Self {
        Self {
            client,
            prefix: key_prefix.trim_end_matches('/').to_string(),
        }
    }

    fn key(&self, path: &str) -> String {
        format!("{}/{}", self.prefix, path)
    }

    fn path_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?.strip_prefix('/')
    }

    fn decode_kv(&self, kv: &KeyValue) -> Result<Document> {
        let key = b64_decode(&kv.key)?;
        let path = self
            .path_of(&key)
            .ok_or_else(|| anyhow!("key outside store prefix: {}", key))?
            .to_string();
        let data = if kv.value.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&b64_decode(&kv.value)?)?
        };
        Ok(Document::new(path, data))
    }

    async fn get_kv(&self, path: &str) -> Result<Option<KeyValue>> {
        let resp = self
            .client
            .range(&RangeRequest {
                key: b64_encode(&self.key(path)),
                range_end: String::new(),
                keys_only: None,
            })
            .await?;
        Ok(resp.kvs.into_iter().next())
    }

    pub async fn add(&self, collection: &str, mut data: Value) -> Result<Document> {
        if !data.is_object() {
            bail!("document data must be an object");
        }
        resolve_server_timestamps(&mut data, now_millis());

        let path = format!("{}/{}", collection, new_document_id());
        let key = b64_encode(&self.key(&path));
        let created = self
            .client
            .txn(&TxnRequest {
                compare: vec![Compare::key_absent(key.clone())],
                success: vec![RequestOp {
                    request_put: PutRequest {
                        key,
                        value: b64_encode(&data.to_string()),
                        lease: None,
                    },
                }],
                failure: vec![],
            })
            .await?;
        if !created {
            bail!("etcd store: document id collision at {}", path);
        }
        Ok(Document::new(path, data))
    }

    pub async fn get(&self, path: &str) -> Result<Option<Document>> {
        match self.get_kv(path).await? {
            Some(kv) => Ok(Some(self.decode_kv(&kv)?)),
            None => Ok(None),
        }
    }

    pub async fn update(&self, path: &str, field: &str, value: Value) -> Result<()> {
        self.write_field(path, field, value, false).await.map(|_| ())
    }

    pub async fn update_if_absent(&self, path: &str, field: &str, value: Value) -> Result<bool> {
        self.write_field(path, field, value, true).await
    }

    /// Read-modify-write guarded by the key's mod revision.
    async fn write_field(
        &self,
        path: &str,
        field: &str,
        mut value: Value,
        only_if_absent: bool,
    ) -> Result<bool> {
        resolve_server_timestamps(&mut value, now_millis());

        for attempt in 1..=UPDATE_ATTEMPTS {
            let kv = self
                .get_kv(path)
                .await?
                .ok_or_else(|| anyhow!("document not found: {}", path))?;
            let revision = kv
                .mod_revision
                .ok_or_else(|| anyhow!("etcd store: missing mod_revision for {}", path))?;
            let mut doc = self.decode_kv(&kv)?;
            let obj = doc
                .data
                .as_object_mut()
                .ok_or_else(|| anyhow!("document is not an object: {}", path))?;
            if only_if_absent && obj.get(field).is_some_and(|v| !v.is_null()) {
                return Ok(false);
            }
            obj.insert(field.to_string(), value.clone());

            let key = b64_encode(&self.key(path));
            let applied = self
                .client
                .txn(&TxnRequest {
                    compare: vec![Compare::mod_revision_is(key.clone(), revision)],
                    success: vec![RequestOp {
                        request_put: PutRequest {
                            key,
                            value: b64_encode(&doc.data.to_string()),
                            lease: None,
                        },
                    }],
                    failure: vec![],
                })
                .await?;
            if applied {
                return Ok(true);
            }
            debug!("etcd store: update contention, path={}, attempt={}", path, attempt);
        }
        bail!("etcd store: update of {} kept conflicting", path)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete_range(&DeleteRangeRequest {
                key: b64_encode(&self.key(path)),
                range_end: String::new(),
            })
            .await?;
        Ok(())
    }

    pub async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        Ok(self.list_at(collection).await?.0)
    }

    /// Direct children plus the store revision the listing was taken at.
    async fn list_at(&self, collection: &str) -> Result<(Vec<Document>, i64)> {
        let prefix = format!("{}/", self.key(collection));
        let resp = self
            .client
            .range(&RangeRequest {
                key: b64_encode(&prefix),
                range_end: prefix_range_end(&prefix),
                keys_only: None,
            })
            .await?;
        let revision = resp.header.and_then(|h| h.revision).unwrap_or(0);
        let mut docs = Vec::with_capacity(resp.kvs.len());
        for kv in &resp.kvs {
            let doc = self.decode_kv(kv)?;
            if is_direct_child(collection, &doc.path) {
                docs.push(doc);
            }
        }
        Ok((docs, revision))
    }

    pub async fn watch_collection(&self, collection: &str) -> Result<ChangeStream> {
        let (docs, revision) = self.list_at(collection).await?;
        let initial = docs
            .into_iter()
            .enumerate()
            .map(|(i, doc)| Change {
                kind: ChangeKind::Added,
                doc,
                old_index: -1,
                new_index: i as i64,
            })
            .collect();

        let prefix = format!("{}/", self.key(collection));
        let create = WatchCreate {
            key: b64_encode(&prefix),
            range_end: prefix_range_end(&prefix),
            start_revision: Some(revision + 1),
        };
        let collection = collection.to_string();
        self.spawn_watch(initial, create, move |path| is_direct_child(&collection, path))
            .await
    }

    pub async fn watch_document(&self, path: &str) -> Result<ChangeStream> {
        let resp = self
            .client
            .range(&RangeRequest {
                key: b64_encode(&self.key(path)),
                range_end: String::new(),
                keys_only: None,
            })
            .await?;
        let revision = resp.header.and_then(|h| h.revision).unwrap_or(0);
        let mut initial = Vec::new();
        if let Some(kv) = resp.kvs.first() {
            initial.push(Change {
                kind: ChangeKind::Added,
                doc: self.decode_kv(kv)?,
                old_index: -1,
                new_index: 0,
            });
        }

        let create = WatchCreate {
            key: b64_encode(&self.key(path)),
            range_end: String::new(),
            start_revision: Some(revision + 1),
        };
        let path = path.to_string();
        self.spawn_watch(initial, create, move |p| p == path).await
    }

    async fn spawn_watch<F>(
        &self,
        initial: Vec<Change>,
        create: WatchCreate,
        matches: F,
    ) -> Result<ChangeStream>
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        let mut watch = self
            .client
            .watch_stream(&WatchCreateRequest {
                create_request: create,
            })
            .await?;
        let store = self.clone();

        Ok(ChangeStream::spawn(move |tx| async move {
            if tx.send(Ok(Snapshot { changes: initial })).await.is_err() {
                return;
            }
            while let Some(resp) = watch.next_response().await {
                if let Some(err) = resp.error {
                    let _ = tx.send(Err(anyhow!("etcd watch error: {}", err))).await;
                    return;
                }
                let Some(result) = resp.result else { continue };
                if result.canceled {
                    let reason = result.cancel_reason.unwrap_or_default();
                    let _ = tx.send(Err(anyhow!("etcd watch canceled: {}", reason))).await;
                    return;
                }

                let mut changes = Vec::new();
                for event in result.events {
                    let Some(kv) = event.kv else { continue };
                    let is_delete = event.event_type.as_deref() == Some("DELETE");
                    let change = if is_delete {
                        let Some(path) = b64_decode(&kv.key)
                            .ok()
                            .and_then(|k| store.path_of(&k).map(str::to_string))
                        else {
                            continue;
                        };
                        Change {
                            kind: ChangeKind::Removed,
                            doc: Document::new(path, Value::Null),
                            old_index: 0,
                            new_index: -1,
                        }
                    } else {
                        let doc = match store.decode_kv(&kv) {
                            Ok(doc) => doc,
                            Err(e) => {
                                warn!("etcd store: undecodable document skipped, error={}", e);
                                continue;
                            }
                        };
                        if kv.is_creation() {
                            Change {
                                kind: ChangeKind::Added,
                                doc,
                                old_index: -1,
                                new_index: 0,
                            }
                        } else {
                            Change {
                                kind: ChangeKind::Modified,
                                doc,
                                old_index: 0,
                                new_index: 0,
                            }
                        }
                    };
                    if matches(&change.doc.path) {
                        changes.push(change);
                    }
                }

                if !changes.is_empty() && tx.send(Ok(Snapshot { changes })).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Err(anyhow!("etcd watch stream ended"))).await;
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(key: &str, value: &str, create: i64, modified: i64) -> KeyValue {
        KeyValue {
            key: b64_encode(key),
            value: b64_encode(value),
            create_revision: Some(create),
            mod_revision: Some(modified),
        }
    }

    fn store_with_prefix(prefix: &str) -> EtcdStore {
        let cfg = crate::config::EtcdConfig::default();
        EtcdStore {
            client: EtcdClient::unconnected(&cfg),
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    #[test]
    fn test_key_and_path_mapping() {
        let store = store_with_prefix("/relay/");
        assert_eq!(store.key("endpoints/home/requests/a"), "/relay/endpoints/home/requests/a");
        assert_eq!(
            store.path_of("/relay/endpoints/home/requests/a"),
            Some("endpoints/home/requests/a")
        );
        assert_eq!(store.path_of("/other/x"), None);
        assert_eq!(store.path_of("/relayx/y"), None);
    }

    #[test]
    fn test_decode_kv() {
        let store = store_with_prefix("/relay");
        let doc = store
            .decode_kv(&kv("/relay/endpoints/home/requests/a", r#"{"created":5}"#, 3, 3))
            .unwrap();
        assert_eq!(doc.path, "endpoints/home/requests/a");
        assert_eq!(doc.data["created"], 5);

        assert!(store.decode_kv(&kv("/relay/x", "not json", 3, 3)).is_err());
        assert!(store.decode_kv(&kv("/elsewhere/x", "{}", 3, 3)).is_err());
    }
}
