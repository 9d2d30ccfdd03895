//! Watchable document store.
//!
//! Documents are JSON objects addressed by slash-separated paths
//! (`endpoints/<name>/requests/<id>`). A collection is the path prefix of its
//! direct children; sub-collections hang below a document
//! (`.../requests/<id>/responseBodies/<chunk-id>`).
//!
//! Two backends share one enum so callers stay free of trait objects:
//! an in-process store (single process deployments and tests) and etcd.

pub mod decode;
mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use anyhow::Result;
use rand::Rng;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SERVER_TIMESTAMP_KEY: &str = "$serverTimestamp";
const DOCUMENT_ID_LEN: usize = 20;
const STREAM_BUFFER: usize = 64;

/// Sentinel replaced with the store's clock when the document is written.
pub fn server_timestamp() -> Value {
    serde_json::json!({ SERVER_TIMESTAMP_KEY: true })
}

/// Replace every server-timestamp sentinel inside `value` with `now_ms`.
pub(crate) fn resolve_server_timestamps(value: &mut Value, now_ms: i64) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 && map.contains_key(SERVER_TIMESTAMP_KEY) {
                *value = Value::from(now_ms);
                return;
            }
            for v in map.values_mut() {
                resolve_server_timestamps(v, now_ms);
            }
        }
        Value::Array(items) => {
            for v in items {
                resolve_server_timestamps(v, now_ms);
            }
        }
        _ => {}
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn new_document_id() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(DOCUMENT_ID_LEN)
        .map(char::from)
        .collect()
}

/// `true` when `path` is a direct child document of `collection`.
pub(crate) fn is_direct_child(collection: &str, path: &str) -> bool {
    path.strip_prefix(collection)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|id| !id.is_empty() && !id.contains('/'))
        .unwrap_or(false)
}

/// Path of a sub-collection under a document.
pub fn child_collection(doc_path: &str, name: &str) -> String {
    format!("{}/{}", doc_path, name)
}

/// A document as seen at one point in time. `data` is `Null` for a document
/// that does not exist (e.g. in a `Removed` change).
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: String,
    pub data: Value,
}

impl Document {
    pub fn new(path: impl Into<String>, data: Value) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }

    pub fn id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn exists(&self) -> bool {
        !self.data.is_null()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        }
    }
}

/// One change inside a watch snapshot. Indices are positions in the
/// collection ordering before/after the change, `-1` when not applicable.
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub doc: Document,
    pub old_index: i64,
    pub new_index: i64,
}

/// A batch of changes delivered together.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub changes: Vec<Change>,
}

/// Receiving side of a watch. Ends with `None` when the underlying watch
/// ends; yields `Err` when it breaks. Dropping it stops the watch.
pub struct ChangeStream {
    rx: mpsc::Receiver<Result<Snapshot>>,
    task: JoinHandle<()>,
}

impl ChangeStream {
    /// Run `producer` on its own task, feeding the returned stream.
    pub(crate) fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<Snapshot>>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let task = tokio::spawn(producer(tx));
        Self { rx, task }
    }

    pub async fn next(&mut self) -> Option<Result<Snapshot>> {
        self.rx.recv().await
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The store used by both roles. Cheaply cloneable.
#[derive(Clone)]
pub enum DocumentStore {
    Memory(MemoryStore),
    Etcd(EtcdStore),
}

impl DocumentStore {
    /// Create a document with a store-assigned id.
    pub async fn add(&self, collection: &str, data: Value) -> Result<Document> {
        match self {
            DocumentStore::Memory(s) => s.add(collection, data),
            DocumentStore::Etcd(s) => s.add(collection, data).await,
        }
    }

    pub async fn get(&self, path: &str) -> Result<Option<Document>> {
        match self {
            DocumentStore::Memory(s) => Ok(s.get(path)),
            DocumentStore::Etcd(s) => s.get(path).await,
        }
    }

    /// Atomically replace one top-level field of an existing document.
    pub async fn update(&self, path: &str, field: &str, value: Value) -> Result<()> {
        match self {
            DocumentStore::Memory(s) => s.update(path, field, value),
            DocumentStore::Etcd(s) => s.update(path, field, value).await,
        }
    }

    /// Like [`update`](Self::update), but only when the field is absent or
    /// null. Returns whether the write happened.
    pub async fn update_if_absent(&self, path: &str, field: &str, value: Value) -> Result<bool> {
        match self {
            DocumentStore::Memory(s) => s.update_if_absent(path, field, value),
            DocumentStore::Etcd(s) => s.update_if_absent(path, field, value).await,
        }
    }

    /// Delete exactly one document. Sub-collections are left alone.
    pub async fn delete(&self, path: &str) -> Result<()> {
        match self {
            DocumentStore::Memory(s) => {
                s.delete(path);
                Ok(())
            }
            DocumentStore::Etcd(s) => s.delete(path).await,
        }
    }

    /// Direct children of `collection`, in path order.
    pub async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        match self {
            DocumentStore::Memory(s) => Ok(s.list(collection)),
            DocumentStore::Etcd(s) => s.list(collection).await,
        }
    }

    pub async fn watch_collection(&self, collection: &str) -> Result<ChangeStream> {
        match self {
            DocumentStore::Memory(s) => Ok(s.watch_collection(collection)),
            DocumentStore::Etcd(s) => s.watch_collection(collection).await,
        }
    }

    pub async fn watch_document(&self, path: &str) -> Result<ChangeStream> {
        match self {
            DocumentStore::Memory(s) => Ok(s.watch_document(path)),
            DocumentStore::Etcd(s) => s.watch_document(path).await,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            DocumentStore::Memory(_) => "memory",
            DocumentStore::Etcd(_) => "etcd",
        }
    }
}
