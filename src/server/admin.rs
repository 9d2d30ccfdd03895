use super::AdminState;
use crate::gateway::context::{full_body, BoxBody};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use hyper::{Request, Response};
use std::convert::Infallible;

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

pub fn handle_admin<B>(req: Request<B>, state: AdminState) -> Result<Response<BoxBody>, Infallible> {
    let resp = match req.uri().path() {
        "/health" | "/healthz" => respond(
            StatusCode::OK,
            "application/json",
            r#"{"status":"ok"}"#.to_string(),
        ),

        "/ready" | "/readyz" => {
            let ready = state.is_ready();
            let body = serde_json::json!({
                "status": if ready { "ready" } else { "starting" },
                "role": state.role,
                "endpoint": &*state.endpoint_name,
                "store": state.store_backend,
            });
            let status = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            respond(status, "application/json", body.to_string())
        }

        "/metrics" => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            state.metrics.render(),
        ),

        _ => respond(
            StatusCode::NOT_FOUND,
            "application/json",
            r#"{"error":"not found"}"#.to_string(),
        ),
    };
    Ok(resp)
}
