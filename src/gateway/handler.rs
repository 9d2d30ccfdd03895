use bytes::Bytes;
use futures_util::FutureExt;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::BodyExt;
use std::convert::Infallible;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::context::{full_body, json_error, BoxBody, RequestContext};
use crate::codec;
use crate::dump;
use crate::record::{self, RecordResponse};
use crate::server::GatewayState;
use crate::store::{ChangeKind, DocumentStore};
use crate::trace_context::{TraceContext, TRACEPARENT};

const GENERIC_ERROR: &str = "internal server error";

/// Relay one inbound request through the store and answer with whatever the
/// consumer wrote back.
///
/// Lifecycle:
///
/// 1. BUFFER: read the full body, attach trace context
/// 2. WRITE: add the request record
/// 3. WAIT: watch that record until `response` appears, the timeout
///    elapses, or hard shutdown fires
/// 4. ANSWER: rebuild the response, reassembling chunks when needed
/// 5. CLEANUP: delete chunks and the record in the background
///
/// A panic anywhere below becomes a 500; the connection is never dropped.
pub async fn handle_request<B>(
    req: Request<B>,
    state: GatewayState,
) -> Result<Response<BoxBody>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Display,
{
    let request_uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let ctx = RequestContext::new(req.method().as_str().to_string(), request_uri);

    let span = info_span!(
        "request",
        method = %ctx.method,
        uri = %ctx.request_uri,
        trace_id = tracing::field::Empty,
    );
    let resp = match AssertUnwindSafe(relay(req, &state, &ctx).instrument(span))
        .catch_unwind()
        .await
    {
        Ok(resp) => resp,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                "gateway: handler panicked, method={}, uri={}, panic={}",
                ctx.method, ctx.request_uri, msg
            );
            json_error(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR)
        }
    };

    ctx.finish(resp.status());
    Ok(resp)
}

async fn relay<B>(req: Request<B>, state: &GatewayState, ctx: &RequestContext) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Display,
{
    let (mut parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(c) => c.to_bytes(),
        Err(e) => {
            warn!("gateway: read request body failed, error={}", e);
            return json_error(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    if let Some(trace) = outbound_trace(&parts.headers, state.inject_trace_context) {
        tracing::Span::current().record("trace_id", trace.trace_id_hex().as_str());
        if let Ok(v) = HeaderValue::from_str(&trace.to_string()) {
            parts.headers.insert(TRACEPARENT, v);
        }
    }

    if state.dump {
        dump::dump_request("gateway", &parts.method, &parts.uri, &parts.headers, &body, 0);
    }

    let data = record::new_request(
        parts.method.as_str(),
        &ctx.request_uri,
        &parts.headers,
        &body,
    );
    let doc = match state.store.add(&state.collection, data).await {
        Ok(doc) => doc,
        Err(e) => {
            error!("gateway: record write failed, error={:#}", e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR);
        }
    };
    debug!("gateway: record written, id={}, size={}", doc.id(), body.len());

    let outcome = tokio::select! {
        r = tokio::time::timeout(state.timeout, wait_for_response(&state.store, &doc.path)) => r,
        _ = state.hard_shutdown.cancelled() => {
            warn!("gateway: shutting down before response, id={}", doc.id());
            spawn_cleanup(state.store.clone(), doc.path.clone());
            return json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
        }
    };

    let resp = match outcome {
        Err(_) => {
            warn!(
                "gateway: response timeout, id={}, timeout={:?}",
                doc.id(),
                state.timeout
            );
            json_error(StatusCode::GATEWAY_TIMEOUT, "gateway timeout")
        }
        Ok(Err(e)) => {
            error!("gateway: record watch failed, id={}, error={:#}", doc.id(), e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR)
        }
        Ok(Ok(RecordResponse::Failed(message))) => {
            error!("gateway: relay failed, id={}, error={}", doc.id(), message);
            let body = if state.expose_errors {
                message.as_str()
            } else {
                GENERIC_ERROR
            };
            json_error(StatusCode::INTERNAL_SERVER_ERROR, body)
        }
        Ok(Ok(complete)) => match build_response(&state.store, &doc.path, complete).await {
            Ok(resp) => {
                info!(
                    "gateway: relayed, id={}, status={}, dur={:?}",
                    doc.id(),
                    resp.status().as_u16(),
                    ctx.start.elapsed()
                );
                resp
            }
            Err(e) => {
                error!("gateway: response rebuild failed, id={}, error={:#}", doc.id(), e);
                json_error(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR)
            }
        },
    };

    spawn_cleanup(state.store.clone(), doc.path.clone());
    resp
}

/// The trace context stored with the record: a child of a valid inbound
/// `traceparent`, else a new root when injection is on.
fn outbound_trace(headers: &http::HeaderMap, inject: bool) -> Option<TraceContext> {
    let parent = headers
        .get(TRACEPARENT)
        .and_then(|v| v.to_str().ok())
        .and_then(TraceContext::parse);
    match parent {
        Some(parent) => Some(parent.child()),
        None if inject => Some(TraceContext::new_root()),
        None => None,
    }
}

/// Watch one record until its `response` field is set.
async fn wait_for_response(store: &DocumentStore, path: &str) -> anyhow::Result<RecordResponse> {
    let mut stream = store.watch_document(path).await?;
    while let Some(next) = stream.next().await {
        for change in next?.changes {
            if change.kind == ChangeKind::Removed {
                anyhow::bail!("record removed before a response was written");
            }
            if let Some(resp) = RecordResponse::decode(&change.doc.data) {
                return Ok(resp);
            }
        }
    }
    anyhow::bail!("record watch ended")
}

async fn build_response(
    store: &DocumentStore,
    path: &str,
    resp: RecordResponse,
) -> anyhow::Result<Response<BoxBody>> {
    let RecordResponse::Complete {
        status,
        mut header,
        body,
        chunks,
    } = resp
    else {
        anyhow::bail!("not a complete response");
    };

    let status = StatusCode::from_u16(status)
        .map_err(|_| anyhow::anyhow!("invalid stored status code {}", status))?;
    let body = if chunks > 0 {
        read_chunks(store, path, chunks).await?
    } else {
        body
    };

    // The body is re-framed by hyper.
    header.remove(CONTENT_LENGTH);
    header.remove(TRANSFER_ENCODING);

    let mut out = Response::new(full_body(body));
    *out.status_mut() = status;
    *out.headers_mut() = header;
    Ok(out)
}

async fn read_chunks(store: &DocumentStore, path: &str, expected: usize) -> anyhow::Result<Bytes> {
    let docs = store.list(&record::response_bodies(path)).await?;
    let chunks = docs
        .iter()
        .map(|doc| {
            record::decode_chunk(doc)
                .map_err(|e| anyhow::anyhow!("chunk {}: {}", doc.id(), e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    codec::join(chunks, expected).map_err(|e| anyhow::anyhow!("chunk reassembly: {}", e))
}

/// Best effort: chunks first, then the record itself.
fn spawn_cleanup(store: DocumentStore, path: String) {
    tokio::spawn(async move {
        if let Err(e) = delete_record(&store, &path).await {
            warn!("gateway: record delete failed, path={}, error={:#}", path, e);
        }
    });
}

pub(crate) async fn delete_record(store: &DocumentStore, path: &str) -> anyhow::Result<()> {
    for chunk in store.list(&record::response_bodies(path)).await? {
        store.delete(&chunk.path).await?;
    }
    store.delete(path).await
}
