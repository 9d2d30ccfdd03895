use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// A JSON `{"error": msg}` response.
pub fn json_error(status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
    let body = serde_json::json!({ "error": msg }).to_string();
    let mut resp = hyper::Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// Per-request bookkeeping for gateway metrics. Creating one counts the
/// request as in flight; [`RequestContext::finish`] must be called exactly
/// once with the status that was sent.
pub struct RequestContext {
    pub method: String,
    pub request_uri: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(method: String, request_uri: String) -> Self {
        metrics::gauge!("relay_gateway_requests_in_flight").increment(1.0);
        Self {
            method,
            request_uri,
            start: Instant::now(),
        }
    }

    pub fn finish(&self, status: StatusCode) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status.as_u16());

        metrics::counter!(
            "relay_gateway_requests_total",
            "status_code" => status_str.to_owned(),
        )
        .increment(1);
        metrics::histogram!("relay_gateway_request_duration_seconds")
            .record(self.start.elapsed().as_secs_f64());
        metrics::gauge!("relay_gateway_requests_in_flight").decrement(1.0);
    }
}
