use crate::config::{RelayConfig, StoreConfig};
use crate::dedup::{DedupCache, EtcdDedup, MemoryDedup};
use crate::etcd::EtcdClient;
use crate::metrics::Metrics;
use crate::relay::{build_forward_client, ForwardSettings, Forwarder, WatchLoop, WorkerPool};
use crate::routing::Router;
use crate::server::{self, AdminState, GatewayState};
use crate::store::{DocumentStore, EtcdStore, MemoryStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// JSON logs on stdout through a non-blocking writer. `RUST_LOG` filters,
/// default `info`.
pub fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer thread must outlive every log call.
    std::mem::forget(guard);
}

/// Gateway lifecycle: store → listeners → serve → drain.
///
/// Runs until `shutdown` is cancelled, then drains in-flight requests.
pub async fn run_gateway(config: RelayConfig, shutdown: CancellationToken) -> Result<()> {
    let span = tracing::info_span!(
        "gateway",
        endpoint = %config.endpoint_name,
        instance = %instance_id(),
    );
    async move {
        let metrics = Metrics::install()?;
        let (store, _) = build_store(&config.store).await?;

        // Bind both listeners before reporting ready.
        let admin_listen = &config.gateway.admin_listen;
        let admin = start_admin(admin_listen, "gateway", &config, &store, metrics, &shutdown).await?;
        let serving = start_gateway(&config, store, &shutdown).await?;
        admin.set_ready(true);

        finish_gateway(serving, &shutdown).await?;
        tracing::info!("server: shutdown complete");
        Ok(())
    }
    .instrument(span)
    .await
}

/// Consumer lifecycle: store + dedup → workers → watch → drain.
///
/// Returns an error when the watch loop stops for any reason other than
/// `shutdown`; the queued records are still drained first.
pub async fn run_consumer(config: RelayConfig, shutdown: CancellationToken) -> Result<()> {
    let span = tracing::info_span!(
        "consumer",
        endpoint = %config.endpoint_name,
        instance = %instance_id(),
    );
    async move {
        let metrics = Metrics::install()?;
        let (store, etcd) = build_store(&config.store).await?;

        let admin_listen = &config.consumer.admin_listen;
        let admin = start_admin(admin_listen, "consumer", &config, &store, metrics, &shutdown).await?;
        let consumer = start_consumer(&config, store, etcd, &shutdown)?;
        admin.set_ready(true);

        consumer.finish(&shutdown).await?;
        tracing::info!("server: shutdown complete");
        Ok(())
    }
    .instrument(span)
    .await
}

/// Gateway and consumer in one process over one store, served with the
/// gateway's admin listener. This is the only role the memory store relays in.
pub async fn run_standalone(config: RelayConfig, shutdown: CancellationToken) -> Result<()> {
    let span = tracing::info_span!(
        "standalone",
        endpoint = %config.endpoint_name,
        instance = %instance_id(),
    );
    async move {
        let metrics = Metrics::install()?;
        let (store, etcd) = build_store(&config.store).await?;

        let admin_listen = &config.gateway.admin_listen;
        let admin = start_admin(admin_listen, "standalone", &config, &store, metrics, &shutdown).await?;
        let consumer = start_consumer(&config, store.clone(), etcd, &shutdown)?;
        let serving = match start_gateway(&config, store, &shutdown).await {
            Ok(serving) => serving,
            Err(e) => {
                shutdown.cancel();
                consumer.finish(&shutdown).await.ok();
                return Err(e);
            }
        };
        admin.set_ready(true);

        // Either side stopping cancels `shutdown` and brings the other down.
        let (served, consumed) = tokio::join!(
            finish_gateway(serving, &shutdown),
            consumer.finish(&shutdown)
        );
        served?;
        consumed?;
        tracing::info!("server: shutdown complete");
        Ok(())
    }
    .instrument(span)
    .await
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
pub fn shutdown_on_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
}

async fn start_admin(
    listen: &str,
    role: &'static str,
    config: &RelayConfig,
    store: &DocumentStore,
    metrics: Metrics,
    shutdown: &CancellationToken,
) -> Result<AdminState> {
    let listener = server::bind(listen).await?;
    let admin = AdminState::new(role, &config.endpoint_name, store.backend_name(), metrics);
    let (state, token) = (admin.clone(), shutdown.clone());
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(listener, state, token).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });

    // Readiness drops as soon as draining starts.
    let (state, token) = (admin.clone(), shutdown.clone());
    tokio::spawn(async move {
        token.cancelled().await;
        state.set_ready(false);
    });
    Ok(admin)
}

async fn start_gateway(
    config: &RelayConfig,
    store: DocumentStore,
    shutdown: &CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    let listener = server::bind(&config.gateway.listen).await?;
    let state = GatewayState::new(config, store, CancellationToken::new());
    tracing::info!(
        "server: starting gateway, collection={}, timeout={:?}",
        state.collection,
        state.timeout
    );
    Ok(tokio::spawn(
        server::run_gateway_server(
            listener,
            state,
            shutdown.clone(),
            config.gateway.shutdown_timeout(),
        )
        .in_current_span(),
    ))
}

async fn finish_gateway(serving: JoinHandle<Result<()>>, shutdown: &CancellationToken) -> Result<()> {
    let served = serving.await;
    shutdown.cancel();
    match served {
        Ok(result) => result,
        Err(e) => anyhow::bail!("gateway server task failed: {}", e),
    }
}

/// A started consumer: the watch loop task and the pool it feeds.
struct RunningConsumer {
    watching: JoinHandle<Result<()>>,
    pool: WorkerPool,
}

fn start_consumer(
    config: &RelayConfig,
    store: DocumentStore,
    etcd: Option<EtcdClient>,
    shutdown: &CancellationToken,
) -> Result<RunningConsumer> {
    let dedup = build_dedup(config, etcd, shutdown)?;

    let targets = config.effective_targets();
    let router = Router::new(&targets)?;
    for t in &targets {
        tracing::info!("relay: target, pattern={}, target={}", t.pattern, t.target);
    }

    let consumer = &config.consumer;
    let forwarder = Arc::new(Forwarder::new(
        build_forward_client(consumer.tls_verify),
        Arc::new(router),
        store.clone(),
        ForwardSettings {
            inline_body_bytes: consumer.inline_body_bytes,
            chunk_bytes: consumer.chunk_bytes,
            dump_forward: consumer.dump_forward,
            max_dump_bytes: consumer.max_dump_bytes,
        },
    ));
    let pool = WorkerPool::spawn(consumer.workers, forwarder, consumer.forward_timeout());

    tracing::info!(
        "relay: starting consumer, collection={}, workers={}, expire={:?}, cleaning={}, dedup={}",
        config.requests_collection(),
        consumer.workers,
        consumer.expire(),
        consumer.cleaning,
        dedup.backend_name()
    );
    let watch = WatchLoop::new(
        store,
        dedup,
        config.requests_collection(),
        consumer.expire(),
        consumer.cleaning,
        consumer.dump,
    );
    let watching = tokio::spawn(
        watch
            .run(pool.sender(), shutdown.clone())
            .in_current_span(),
    );
    Ok(RunningConsumer { watching, pool })
}

impl RunningConsumer {
    async fn finish(self, shutdown: &CancellationToken) -> Result<()> {
        let watched = self.watching.await;
        shutdown.cancel();

        // The watch loop has dropped its sender; finish what is queued.
        self.pool.join().await;

        match watched {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!("relay: watch loop failed, error={:#}", e);
                Err(e.context("watch loop failed"))
            }
            Err(e) => anyhow::bail!("watch loop task failed: {}", e),
        }
    }
}

/// The configured store, plus the etcd client when there is one so the
/// dedup backend can share it.
async fn build_store(cfg: &StoreConfig) -> Result<(DocumentStore, Option<EtcdClient>)> {
    match cfg.backend.as_str() {
        "etcd" => {
            let client = EtcdClient::connect(&cfg.etcd).await?;
            tracing::info!(
                "store: etcd connected, endpoint={}, prefix={}",
                client.base_url(),
                cfg.etcd.key_prefix
            );
            let store = EtcdStore::new(client.clone(), &cfg.etcd.key_prefix);
            Ok((DocumentStore::Etcd(store), Some(client)))
        }
        _ => {
            tracing::info!("store: using in-process memory store");
            Ok((DocumentStore::Memory(MemoryStore::new()), None))
        }
    }
}

fn build_dedup(
    config: &RelayConfig,
    etcd: Option<EtcdClient>,
    shutdown: &CancellationToken,
) -> Result<DedupCache> {
    let ttl = Duration::from_secs(config.dedup.ttl_secs);
    match (config.dedup.backend.as_str(), etcd) {
        ("etcd", Some(client)) => Ok(DedupCache::Etcd(EtcdDedup::new(
            client,
            &config.store.etcd.key_prefix,
            &config.dedup.namespace,
            ttl,
        ))),
        ("etcd", None) => anyhow::bail!("dedup backend 'etcd' requires store backend 'etcd'"),
        _ => {
            let dedup = MemoryDedup::new(&config.dedup.namespace, ttl);
            dedup.start_gc(shutdown.clone());
            Ok(DedupCache::Memory(dedup))
        }
    }
}

/// Hostname plus a random suffix, to tell replicas apart in logs.
fn instance_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let suffix: u32 = rand::random();
    format!("{}-{:08x}", hostname, suffix)
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("server: SIGTERM handler unavailable, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
