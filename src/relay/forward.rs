use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};

use super::client::ForwardClient;
use crate::codec::{self, BodyLayout};
use crate::dump;
use crate::error::RelayError;
use crate::record::{self, RequestFields, RESPONSE_FIELD};
use crate::routing::Router;
use crate::store::{Document, DocumentStore};
use crate::trace_context::{TraceContext, TRACEPARENT};

/// Outcome of one successfully relayed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forwarded {
    pub status: u16,
    pub body_len: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub inline_body_bytes: usize,
    pub chunk_bytes: usize,
    pub dump_forward: bool,
    pub max_dump_bytes: u64,
}

/// Replays a request record against its target and writes the response back.
pub struct Forwarder {
    client: ForwardClient,
    router: Arc<Router>,
    store: DocumentStore,
    settings: ForwardSettings,
}

impl Forwarder {
    pub fn new(
        client: ForwardClient,
        router: Arc<Router>,
        store: DocumentStore,
        settings: ForwardSettings,
    ) -> Self {
        Self {
            client,
            router,
            store,
            settings,
        }
    }

    pub async fn forward(&self, doc: &Document) -> Result<Forwarded, RelayError> {
        let fields = RequestFields::decode(&doc.data);
        let uri: Uri = fields
            .request_uri
            .parse()
            .map_err(|e: http::uri::InvalidUri| RelayError::InvalidRequestUri(e.to_string()))?;
        let target = self
            .router
            .route(uri.path())
            .ok_or_else(|| RelayError::NoTargetMatch(uri.path().to_string()))?;
        let out_uri = target.rewrite(&uri)?;

        let parent = fields
            .header
            .get(TRACEPARENT)
            .and_then(|v| v.to_str().ok())
            .and_then(TraceContext::parse);
        match parent {
            Some(parent) => {
                let ctx = parent.child();
                let span = info_span!(
                    "forward",
                    trace_id = %ctx.trace_id_hex(),
                    parent_span_id = %parent.span_id_hex(),
                    span_id = %ctx.span_id_hex(),
                );
                self.send_and_persist(doc, fields, out_uri, Some(ctx))
                    .instrument(span)
                    .await
            }
            None => self.send_and_persist(doc, fields, out_uri, None).await,
        }
    }

    async fn send_and_persist(
        &self,
        doc: &Document,
        fields: RequestFields,
        uri: Uri,
        trace: Option<TraceContext>,
    ) -> Result<Forwarded, RelayError> {
        let method = if fields.method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(fields.method.as_bytes())
                .map_err(|_| RelayError::Forward(format!("invalid method {}", fields.method)))?
        };

        let mut headers = fields.header;
        remove_hop_headers(&mut headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        if let Some(ctx) = trace {
            if let Ok(v) = HeaderValue::from_str(&ctx.to_string()) {
                headers.insert(TRACEPARENT, v);
            }
        }

        if self.settings.dump_forward {
            dump::dump_request(
                "relay",
                &method,
                &uri,
                &headers,
                &fields.body,
                self.settings.max_dump_bytes,
            );
        }

        let mut req = Request::builder()
            .method(method)
            .uri(uri.clone())
            .body(Full::new(fields.body))
            .map_err(|e| RelayError::Forward(e.to_string()))?;
        *req.headers_mut() = headers;

        let begin = Instant::now();
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| RelayError::Forward(e.to_string()))?;
        let (parts, body) = resp.into_parts();
        let body: Bytes = body
            .collect()
            .await
            .map_err(|e| RelayError::ReadBody(e.to_string()))?
            .to_bytes();
        info!(
            "relay: forwarded, id={}, url={}, status={}, dur={:?}",
            doc.id(),
            uri,
            parts.status.as_u16(),
            begin.elapsed()
        );

        if self.settings.dump_forward {
            dump::dump_response(
                "relay",
                parts.status,
                &parts.headers,
                &body,
                self.settings.max_dump_bytes,
            );
        }

        let mut resp_headers = parts.headers;
        remove_hop_headers(&mut resp_headers);
        self.persist(doc, parts.status.as_u16(), &resp_headers, body)
            .await
    }

    /// Chunks first, then the response pointing at them, so a gateway that
    /// sees the response can always read every chunk.
    ///
    /// Chunks are only written while the record exists, and are removed
    /// again when the response does not land, so a gateway that already gave
    /// up leaves no orphans behind.
    async fn persist(
        &self,
        doc: &Document,
        status: u16,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Forwarded, RelayError> {
        let body_len = body.len();
        let layout = codec::split(
            body,
            self.settings.inline_body_bytes,
            self.settings.chunk_bytes,
        );
        let mut written_chunks = Vec::new();
        let (value, chunks) = match layout {
            BodyLayout::Inline(body) => (record::inline_response(status, headers, &body), 0),
            BodyLayout::Chunked(chunks) => {
                if let Ok(None) = self.store.get(&doc.path).await {
                    return Err(RelayError::RecordDeleted(doc.path.clone()));
                }
                let collection = record::response_bodies(&doc.path);
                let total = chunks.len();
                for (index, chunk) in chunks.iter().enumerate() {
                    let added = self
                        .store
                        .add(&collection, record::chunk(index, chunk))
                        .await
                        .map_err(|e| RelayError::ChunkPersist {
                            index,
                            message: e.to_string(),
                        })?;
                    metrics::counter!("relay_response_chunks_total").increment(1);
                    info!(
                        "relay: chunk written, id={}, chunk={}/{}, path={}, size={}",
                        doc.id(),
                        index + 1,
                        total,
                        added.path,
                        chunk.len()
                    );
                    written_chunks.push(added.path);
                }
                (record::chunked_response(status, headers, total), total)
            }
        };

        match self
            .store
            .update_if_absent(&doc.path, RESPONSE_FIELD, value)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("relay: response already present, id={}", doc.id());
                self.discard_chunks(doc, &written_chunks).await;
            }
            Err(e) => {
                self.discard_chunks(doc, &written_chunks).await;
                if let Ok(None) = self.store.get(&doc.path).await {
                    return Err(RelayError::RecordDeleted(doc.path.clone()));
                }
                return Err(RelayError::ResponsePersist(e.to_string()));
            }
        }
        info!(
            "relay: response written, id={}, size={}, chunks={}",
            doc.id(),
            body_len,
            chunks
        );
        Ok(Forwarded {
            status,
            body_len,
            chunks,
        })
    }

    /// Best-effort removal of chunks no stored response points at.
    async fn discard_chunks(&self, doc: &Document, paths: &[String]) {
        for path in paths {
            if let Err(e) = self.store.delete(path).await {
                warn!(
                    "relay: chunk cleanup failed, id={}, path={}, error={}",
                    doc.id(),
                    path,
                    e
                );
            }
        }
    }

    /// Record `err` as the response so the gateway can answer 500.
    pub async fn write_error(&self, doc: &Document, err: &RelayError) -> anyhow::Result<bool> {
        self.store
            .update_if_absent(
                &doc.path,
                RESPONSE_FIELD,
                record::error_response(&err.to_string()),
            )
            .await
    }
}

pub(crate) fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailer"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}
