use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dedup::DedupCache;
use crate::record;
use crate::store::{Change, ChangeKind, DocumentStore};

/// Watches one endpoint's request collection and feeds fresh, claimed
/// records to the worker queue.
pub struct WatchLoop {
    store: DocumentStore,
    dedup: DedupCache,
    collection: String,
    expire: Duration,
    cleaning: bool,
    dump: bool,
}

/// What the loop did with one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ignored,
    AlreadyResponded,
    Expired,
    Duplicate,
    Dispatched,
}

impl WatchLoop {
    pub fn new(
        store: DocumentStore,
        dedup: DedupCache,
        collection: String,
        expire: Duration,
        cleaning: bool,
        dump: bool,
    ) -> Self {
        Self {
            store,
            dedup,
            collection,
            expire,
            cleaning,
            dump,
        }
    }

    /// Run until `cancel` fires (`Ok`) or the watch breaks (`Err`). The queue
    /// sender is dropped on return.
    pub async fn run(
        self,
        queue: mpsc::Sender<crate::store::Document>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            s = self.store.watch_collection(&self.collection) => s?,
        };
        info!("relay: watching, collection={}", self.collection);

        loop {
            let snapshot = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("relay: watch cancelled");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(snapshot)) => snapshot,
                    Some(Err(e)) => return Err(e.context("watch stream failed")),
                    None => anyhow::bail!("watch stream ended"),
                },
            };

            // A batch is finished even if cancellation arrives meanwhile.
            for change in snapshot.changes {
                self.handle_change(change, &queue).await;
            }
        }
    }

    pub(crate) async fn handle_change(
        &self,
        change: Change,
        queue: &mpsc::Sender<crate::store::Document>,
    ) -> Disposition {
        metrics::counter!("relay_watch_changes_total", "kind" => change.kind.as_str()).increment(1);
        debug!(
            "relay: change, kind={}, id={}, old_index={}, new_index={}",
            change.kind.as_str(),
            change.doc.id(),
            change.old_index,
            change.new_index
        );
        if change.kind != ChangeKind::Added || !change.doc.exists() {
            return Disposition::Ignored;
        }
        let doc = change.doc;
        if self.dump {
            debug!("relay: record dump, id={}, data={}", doc.id(), doc.data);
        }
        if record::has_response(&doc.data) {
            debug!("relay: record already responded, id={}", doc.id());
            return Disposition::AlreadyResponded;
        }

        let age = SystemTime::now()
            .duration_since(record::created_at(&doc.data))
            .unwrap_or_default();
        if age > self.expire {
            metrics::counter!("relay_records_expired_total").increment(1);
            info!("relay: record expired, id={}, age={:?}", doc.id(), age);
            if self.cleaning {
                if let Err(e) = self.store.delete(&doc.path).await {
                    warn!("relay: expired record delete failed, id={}, error={}", doc.id(), e);
                }
            }
            return Disposition::Expired;
        }

        if !self.dedup.try_claim(doc.id()).await {
            metrics::counter!("relay_records_duplicate_total").increment(1);
            debug!("relay: record already claimed, id={}", doc.id());
            return Disposition::Duplicate;
        }

        let id = doc.id().to_string();
        if queue.send(doc).await.is_err() {
            warn!("relay: worker queue closed, dropping record, id={}", id);
            return Disposition::Ignored;
        }
        Disposition::Dispatched
    }
}
