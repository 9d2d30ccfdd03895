use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds). The gateway
/// waits up to its timeout, so the upper buckets reach a minute.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    /// Call once per process, before serving.
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .install_recorder()?;

        // gateway
        describe_counter!(
            "relay_gateway_requests_total",
            Unit::Count,
            "Requests answered by the gateway, by status code"
        );
        describe_histogram!(
            "relay_gateway_request_duration_seconds",
            Unit::Seconds,
            "Time from request arrival to response, including the relay round trip"
        );
        describe_gauge!(
            "relay_gateway_requests_in_flight",
            Unit::Count,
            "Requests currently waiting for a relayed response"
        );

        // watch loop
        describe_counter!(
            "relay_watch_changes_total",
            Unit::Count,
            "Change notifications observed on the request collection, by kind"
        );
        describe_counter!(
            "relay_records_expired_total",
            Unit::Count,
            "Records skipped because they were older than the expiry"
        );
        describe_counter!(
            "relay_records_duplicate_total",
            Unit::Count,
            "Records skipped because another worker already claimed them"
        );
        describe_counter!(
            "relay_dedup_errors_total",
            Unit::Count,
            "Claim attempts that failed and were processed anyway"
        );

        // workers
        describe_counter!(
            "relay_forward_total",
            Unit::Count,
            "Forwarded records, by result"
        );
        describe_histogram!(
            "relay_forward_duration_seconds",
            Unit::Seconds,
            "Duration of the backend call plus response persistence"
        );
        describe_counter!(
            "relay_response_chunks_total",
            Unit::Count,
            "Response body chunks written to the store"
        );

        Ok(Self { handle })
    }

    /// A handle backed by a recorder that is not installed globally.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            handle: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
