use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::forward::Forwarder;
use crate::error::RelayError;
use crate::store::Document;

/// Fixed set of workers sharing one bounded queue of claimed records.
///
/// The watch loop is the only producer. Dropping every [`mpsc::Sender`]
/// returned by [`WorkerPool::sender`] and calling [`WorkerPool::join`] drains
/// the queue and waits for all workers.
pub struct WorkerPool {
    tx: mpsc::Sender<Document>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, forwarder: Arc<Forwarder>, forward_timeout: Duration) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel(workers);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let forwarder = Arc::clone(&forwarder);
                tokio::spawn(
                    run_worker(rx, forwarder, forward_timeout)
                        .instrument(info_span!("worker", worker)),
                )
            })
            .collect();

        info!("relay: worker pool started, workers={}", workers);
        Self { tx, handles }
    }

    pub fn sender(&self) -> mpsc::Sender<Document> {
        self.tx.clone()
    }

    /// Close the queue and wait for the workers to finish what is queued.
    pub async fn join(self) {
        let Self { tx, handles } = self;
        drop(tx);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("relay: worker task failed, error={}", e);
            }
        }
        info!("relay: worker pool stopped");
    }
}

async fn run_worker(
    rx: Arc<Mutex<mpsc::Receiver<Document>>>,
    forwarder: Arc<Forwarder>,
    forward_timeout: Duration,
) {
    loop {
        // Lock only while waiting for the next record.
        let next = rx.lock().await.recv().await;
        let Some(doc) = next else {
            debug!("relay: queue closed, worker exiting");
            return;
        };
        process(&forwarder, &doc, forward_timeout).await;
    }
}

/// Forward one record within `forward_timeout`. Failures other than a failed
/// response write or a deleted record become an error response on the record.
pub(crate) async fn process(forwarder: &Forwarder, doc: &Document, forward_timeout: Duration) {
    let start = Instant::now();
    let result = tokio::time::timeout(forward_timeout, forwarder.forward(doc))
        .await
        .unwrap_or(Err(RelayError::ForwardTimeout));
    metrics::histogram!("relay_forward_duration_seconds").record(start.elapsed().as_secs_f64());

    let err = match result {
        Ok(_) => {
            metrics::counter!("relay_forward_total", "result" => "ok").increment(1);
            return;
        }
        Err(e) => e,
    };
    metrics::counter!("relay_forward_total", "result" => err.kind()).increment(1);

    if let RelayError::RecordDeleted(_) = err {
        warn!("relay: record deleted before response, id={}", doc.id());
        return;
    }
    if err.is_log_only() {
        error!("relay: response write failed, id={}, error={}", doc.id(), err);
        return;
    }
    warn!("relay: forward failed, id={}, error={}", doc.id(), err);
    match forwarder.write_error(doc, &err).await {
        Ok(true) => {}
        Ok(false) => debug!("relay: response already present, id={}", doc.id()),
        Err(e) => error!("relay: error write failed, id={}, error={}", doc.id(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use crate::record;
    use crate::relay::client::build_forward_client;
    use crate::relay::forward::ForwardSettings;
    use crate::routing::Router;
    use crate::store::{DocumentStore, MemoryStore};
    use http::HeaderMap;

    fn forwarder(store: &DocumentStore, target: &str) -> Arc<Forwarder> {
        let router = Router::new(&[TargetConfig::new("/api/**", target)]).unwrap();
        Arc::new(Forwarder::new(
            build_forward_client(true),
            Arc::new(router),
            store.clone(),
            ForwardSettings {
                inline_body_bytes: 1024,
                chunk_bytes: 1024,
                dump_forward: false,
                max_dump_bytes: 0,
            },
        ))
    }

    async fn add(store: &DocumentStore, uri: &str) -> Document {
        store
            .add(
                "endpoints/t/requests",
                record::new_request("GET", uri, &HeaderMap::new(), b""),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_match_writes_error_response() {
        let store = DocumentStore::Memory(MemoryStore::new());
        let doc = add(&store, "/unknown").await;
        process(&forwarder(&store, "http://127.0.0.1:9"), &doc, Duration::from_secs(5)).await;

        let stored = store.get(&doc.path).await.unwrap().unwrap();
        assert_eq!(stored.data["response"]["error"], "no target match for /unknown");
    }

    #[tokio::test]
    async fn test_timeout_writes_error_response() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut conns = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                conns.push(sock);
            }
        });

        let store = DocumentStore::Memory(MemoryStore::new());
        let doc = add(&store, "/api/slow").await;
        let fwd = forwarder(&store, &format!("http://{}", addr));
        process(&fwd, &doc, Duration::from_millis(200)).await;

        let stored = store.get(&doc.path).await.unwrap().unwrap();
        assert_eq!(stored.data["response"]["error"], "forward timeout");
    }

    #[tokio::test]
    async fn test_join_drains_queue() {
        let store = DocumentStore::Memory(MemoryStore::new());
        let pool = WorkerPool::spawn(2, forwarder(&store, "http://127.0.0.1:9"), Duration::from_secs(5));
        let tx = pool.sender();
        let mut docs = Vec::new();
        for _ in 0..4 {
            let doc = add(&store, "/nomatch").await;
            tx.send(doc.clone()).await.unwrap();
            docs.push(doc);
        }
        drop(tx);
        pool.join().await;

        for doc in docs {
            let stored = store.get(&doc.path).await.unwrap().unwrap();
            assert!(stored.data["response"]["error"].is_string());
        }
    }
}
