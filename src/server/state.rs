use crate::config::RelayConfig;
use crate::metrics::Metrics;
use crate::store::DocumentStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a gateway request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct GatewayState {
    pub store: DocumentStore,
    /// Request collection of the served endpoint.
    pub collection: Arc<str>,
    /// How long a handler waits for the response to appear.
    pub timeout: Duration,
    pub expose_errors: bool,
    pub inject_trace_context: bool,
    pub dump: bool,
    /// Fires after the shutdown grace period; waiting handlers answer 503.
    pub hard_shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(config: &RelayConfig, store: DocumentStore, hard_shutdown: CancellationToken) -> Self {
        Self {
            store,
            collection: Arc::from(config.requests_collection()),
            timeout: config.gateway.timeout(),
            expose_errors: config.gateway.expose_errors,
            inject_trace_context: config.gateway.inject_trace_context,
            dump: config.gateway.dump,
            hard_shutdown,
        }
    }
}

/// Shared by the admin endpoints of either role.
#[derive(Clone)]
pub struct AdminState {
    pub role: &'static str,
    pub endpoint_name: Arc<str>,
    pub store_backend: &'static str,
    pub metrics: Metrics,
    ready: Arc<AtomicBool>,
}

impl AdminState {
    pub fn new(
        role: &'static str,
        endpoint_name: &str,
        store_backend: &'static str,
        metrics: Metrics,
    ) -> Self {
        Self {
            role,
            endpoint_name: Arc::from(endpoint_name),
            store_backend,
            metrics,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
