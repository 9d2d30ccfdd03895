mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::{AdminState, GatewayState};

use crate::gateway;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Time waiting handlers get to flush their 503 after the hard deadline.
const HARD_SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);

pub async fn bind(listen: &str) -> Result<TcpListener> {
    let addr: SocketAddr = listen.parse()?;
    Ok(TcpListener::bind(addr).await?)
}

/// Serve the public gateway on `listener` until `shutdown` fires.
///
/// On shutdown the listener stops accepting, open connections are asked to
/// close after their current request, and in-flight requests get `drain` to
/// finish. After that `state.hard_shutdown` fires and every handler still
/// waiting for a response answers 503.
pub async fn run_gateway_server(
    listener: TcpListener,
    state: GatewayState,
    shutdown: CancellationToken,
    drain: Duration,
) -> Result<()> {
    info!("server: gateway listening, addr={}", listener.local_addr()?);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                info!("server: gateway: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: gateway: accept failed, error={}", e);
                continue;
            }
        };

        active_conns.fetch_add(1, Ordering::Relaxed);
        let state = state.clone();
        let shutdown = shutdown.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                gateway::handle_request(req, state.clone())
            });

            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(io, svc);
            tokio::pin!(conn);

            let mut closing = false;
            loop {
                tokio::select! {
                    res = conn.as_mut() => {
                        if let Err(e) = res {
                            if !e.to_string().contains("connection closed") {
                                error!(
                                    "server: gateway: connection error, peer={}, error={}",
                                    peer_addr, e
                                );
                            }
                        }
                        break;
                    }
                    _ = shutdown.cancelled(), if !closing => {
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }

            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    if wait_for_drain(&active_conns, drain).await {
        info!("server: gateway: all connections drained");
        return Ok(());
    }

    warn!(
        "server: gateway: drain timeout ({:?}), {} connections still active, answering 503",
        drain,
        active_conns.load(Ordering::Relaxed)
    );
    state.hard_shutdown.cancel();
    if !wait_for_drain(&active_conns, HARD_SHUTDOWN_FLUSH).await {
        warn!(
            "server: gateway: dropping {} connections",
            active_conns.load(Ordering::Relaxed)
        );
    }
    Ok(())
}

/// `true` once no connection is active, `false` if `limit` elapsed first.
async fn wait_for_drain(active_conns: &AtomicI64, limit: Duration) -> bool {
    let drained = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(limit, drained).await.is_ok()
}

/// Serve `/healthz`, `/readyz` and `/metrics` until `shutdown` fires.
pub async fn run_admin_server(
    listener: TcpListener,
    state: AdminState,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("server: admin listening, addr={}", listener.local_addr()?);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
