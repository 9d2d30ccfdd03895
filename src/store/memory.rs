use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::{
    is_direct_child, new_document_id, now_millis, resolve_server_timestamps, Change, ChangeKind,
    ChangeStream, Document, Snapshot,
};

const EVENT_CAPACITY: usize = 4096;

#[derive(Clone, Debug)]
struct StoreEvent {
    change: Change,
}

struct Inner {
    docs: Mutex<BTreeMap<String, Value>>,
    events: broadcast::Sender<StoreEvent>,
}

/// In-process document store. Events are published while the document map
/// is locked, and watchers subscribe under the same lock, so a watcher sees
/// every change after its initial snapshot exactly once.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                docs: Mutex::new(BTreeMap::new()),
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        // A poisoned map is still structurally valid.
        self.inner
            .docs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, change: Change) {
        // No receivers is fine.
        let _ = self.inner.events.send(StoreEvent { change });
    }

    pub fn add(&self, collection: &str, mut data: Value) -> Result<Document> {
        if !data.is_object() {
            bail!("document data must be an object");
        }
        resolve_server_timestamps(&mut data, now_millis());

        let mut docs = self.lock();
        let mut path = format!("{}/{}", collection, new_document_id());
        while docs.contains_key(&path) {
            path = format!("{}/{}", collection, new_document_id());
        }
        docs.insert(path.clone(), data.clone());
        let doc = Document::new(path, data);
        let new_index = sibling_rank(&docs, &doc.path);
        self.publish(Change {
            kind: ChangeKind::Added,
            doc: doc.clone(),
            old_index: -1,
            new_index,
        });
        Ok(doc)
    }

    pub fn get(&self, path: &str) -> Option<Document> {
        self.lock()
            .get(path)
            .map(|data| Document::new(path, data.clone()))
    }

    pub fn update(&self, path: &str, field: &str, value: Value) -> Result<()> {
        self.write_field(path, field, value, false).map(|_| ())
    }

    pub fn update_if_absent(&self, path: &str, field: &str, value: Value) -> Result<bool> {
        self.write_field(path, field, value, true)
    }

    fn write_field(
        &self,
        path: &str,
        field: &str,
        mut value: Value,
        only_if_absent: bool,
    ) -> Result<bool> {
        resolve_server_timestamps(&mut value, now_millis());

        let mut docs = self.lock();
        let data = docs
            .get_mut(path)
            .ok_or_else(|| anyhow!("document not found: {}", path))?;
        let obj = data
            .as_object_mut()
            .ok_or_else(|| anyhow!("document is not an object: {}", path))?;
        if only_if_absent && obj.get(field).is_some_and(|v| !v.is_null()) {
            return Ok(false);
        }
        obj.insert(field.to_string(), value);
        let doc = Document::new(path, data.clone());
        let index = sibling_rank(&docs, path);
        self.publish(Change {
            kind: ChangeKind::Modified,
            doc,
            old_index: index,
            new_index: index,
        });
        Ok(true)
    }

    pub fn delete(&self, path: &str) {
        let mut docs = self.lock();
        if !docs.contains_key(path) {
            return;
        }
        let old_index = sibling_rank(&docs, path);
        docs.remove(path);
        self.publish(Change {
            kind: ChangeKind::Removed,
            doc: Document::new(path, Value::Null),
            old_index,
            new_index: -1,
        });
    }

    pub fn list(&self, collection: &str) -> Vec<Document> {
        children(&self.lock(), collection)
    }

    pub fn watch_collection(&self, collection: &str) -> ChangeStream {
        let (initial, rx) = {
            let docs = self.lock();
            let rx = self.inner.events.subscribe();
            let initial: Vec<Change> = children(&docs, collection)
                .into_iter()
                .enumerate()
                .map(|(i, doc)| Change {
                    kind: ChangeKind::Added,
                    doc,
                    old_index: -1,
                    new_index: i as i64,
                })
                .collect();
            (initial, rx)
        };
        let collection = collection.to_string();
        spawn_feed(initial, rx, move |path| is_direct_child(&collection, path))
    }

    pub fn watch_document(&self, path: &str) -> ChangeStream {
        let (initial, rx) = {
            let docs = self.lock();
            let rx = self.inner.events.subscribe();
            let initial: Vec<Change> = docs
                .get(path)
                .map(|data| Change {
                    kind: ChangeKind::Added,
                    doc: Document::new(path, data.clone()),
                    old_index: -1,
                    new_index: 0,
                })
                .into_iter()
                .collect();
            (initial, rx)
        };
        let path = path.to_string();
        spawn_feed(initial, rx, move |p| p == path)
    }
}

fn children(docs: &BTreeMap<String, Value>, collection: &str) -> Vec<Document> {
    let prefix = format!("{}/", collection);
    docs.range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .filter(|(k, _)| is_direct_child(collection, k))
        .map(|(k, v)| Document::new(k.clone(), v.clone()))
        .collect()
}

/// Position of `path` among its siblings in path order.
fn sibling_rank(docs: &BTreeMap<String, Value>, path: &str) -> i64 {
    let Some((collection, _)) = path.rsplit_once('/') else {
        return 0;
    };
    let prefix = format!("{}/", collection);
    docs.range(prefix.clone()..path.to_string())
        .filter(|(k, _)| is_direct_child(collection, k))
        .count() as i64
}

fn spawn_feed<F>(
    initial: Vec<Change>,
    mut rx: broadcast::Receiver<StoreEvent>,
    matches: F,
) -> ChangeStream
where
    F: Fn(&str) -> bool + Send + 'static,
{
    ChangeStream::spawn(move |tx| async move {
        if tx.send(Ok(Snapshot { changes: initial })).await.is_err() {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !matches(&event.change.doc.path) {
                        continue;
                    }
                    let snapshot = Snapshot {
                        changes: vec![event.change],
                    };
                    if tx.send(Ok(snapshot)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    let _ = tx
                        .send(Err(anyhow!("memory store: watcher lagged by {} events", n)))
                        .await;
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
