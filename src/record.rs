//! Request record layout.
//!
//! ```text
//! { created, request: { httpInfo: { method, requestURI }, header, body },
//!   response: { time, statusCode, header, body, chunks } | { time, error } }
//! responseBodies/<id>: { index, chunk, size }
//! ```

use bytes::Bytes;
use http::HeaderMap;
use serde_json::{json, Value};
use std::time::SystemTime;

use crate::codec::StoredChunk;
use crate::store::decode::{self, DecodeError};
use crate::store::{server_timestamp, Document};

pub const RESPONSE_FIELD: &str = "response";
pub const RESPONSE_BODIES: &str = "responseBodies";

/// Collection holding the request records of one endpoint.
pub fn requests_collection(endpoint: &str) -> String {
    format!("endpoints/{}/requests", endpoint)
}

pub fn response_bodies(record_path: &str) -> String {
    crate::store::child_collection(record_path, RESPONSE_BODIES)
}

pub fn new_request(method: &str, request_uri: &str, headers: &HeaderMap, body: &[u8]) -> Value {
    json!({
        "created": server_timestamp(),
        "request": {
            "httpInfo": { "method": method, "requestURI": request_uri },
            "header": decode::header_to_value(headers),
            "body": decode::bytes_to_value(body),
        },
    })
}

/// Request fields as read by a worker. Each field falls back to its empty
/// value on its own.
#[derive(Debug, Default)]
pub struct RequestFields {
    pub method: String,
    pub request_uri: String,
    pub header: HeaderMap,
    pub body: Bytes,
}

impl RequestFields {
    pub fn decode(data: &Value) -> Self {
        Self {
            method: decode::as_str(data, "request.httpInfo.method").unwrap_or_default(),
            request_uri: decode::as_str(data, "request.httpInfo.requestURI").unwrap_or_default(),
            header: decode::as_header(data, "request.header").unwrap_or_default(),
            body: decode::as_bytes(data, "request.body").unwrap_or_default(),
        }
    }
}

/// Creation time, or the epoch when missing so the record counts as stale.
pub fn created_at(data: &Value) -> SystemTime {
    decode::as_time(data, "created").unwrap_or(SystemTime::UNIX_EPOCH)
}

pub fn has_response(data: &Value) -> bool {
    decode::lookup(data, RESPONSE_FIELD).is_some()
}

pub fn inline_response(status: u16, headers: &HeaderMap, body: &[u8]) -> Value {
    json!({
        "time": server_timestamp(),
        "statusCode": status,
        "header": decode::header_to_value(headers),
        "body": decode::bytes_to_value(body),
        "chunks": 0,
    })
}

pub fn chunked_response(status: u16, headers: &HeaderMap, chunks: usize) -> Value {
    json!({
        "time": server_timestamp(),
        "statusCode": status,
        "header": decode::header_to_value(headers),
        "chunks": chunks,
    })
}

pub fn error_response(message: &str) -> Value {
    json!({
        "time": server_timestamp(),
        "error": message,
    })
}

pub fn chunk(index: usize, data: &[u8]) -> Value {
    json!({
        "index": index,
        "chunk": decode::bytes_to_value(data),
        "size": data.len(),
    })
}

/// A response as read back by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordResponse {
    Failed(String),
    Complete {
        status: u16,
        header: HeaderMap,
        body: Bytes,
        chunks: usize,
    },
}

impl RecordResponse {
    /// `None` while no response has been written.
    pub fn decode(data: &Value) -> Option<Self> {
        let response = decode::lookup(data, RESPONSE_FIELD)?;
        if let Some(error) = decode::lookup(response, "error") {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Some(RecordResponse::Failed(message));
        }
        let status = decode::as_i64(response, "statusCode")
            .ok()
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(0);
        Some(RecordResponse::Complete {
            status,
            header: decode::as_header(response, "header").unwrap_or_default(),
            body: decode::as_bytes(response, "body").unwrap_or_default(),
            chunks: decode::as_i64(response, "chunks")
                .ok()
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(0),
        })
    }
}

pub fn decode_chunk(doc: &Document) -> Result<StoredChunk, DecodeError> {
    Ok(StoredChunk {
        index: decode::as_i64(&doc.data, "index")?,
        size: decode::as_i64(&doc.data, "size")?,
        data: decode::as_bytes(&doc.data, "chunk")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::resolve_server_timestamps;
    use http::HeaderValue;

    fn resolved(mut v: Value) -> Value {
        resolve_server_timestamps(&mut v, 1_000);
        v
    }

    #[test]
    fn test_new_request_layout() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("*/*"));
        let v = resolved(new_request("GET", "/api/widgets?x=1", &headers, b""));
        assert_eq!(v["created"], 1_000);
        assert_eq!(v["request"]["httpInfo"]["method"], "GET");
        assert_eq!(v["request"]["httpInfo"]["requestURI"], "/api/widgets?x=1");
        assert_eq!(v["request"]["header"]["accept"][0], "*/*");

        let fields = RequestFields::decode(&v);
        assert_eq!(fields.method, "GET");
        assert_eq!(fields.request_uri, "/api/widgets?x=1");
        assert_eq!(fields.header, headers);
        assert!(fields.body.is_empty());
    }

    #[test]
    fn test_request_fields_degrade_individually() {
        let v = json!({
            "request": {
                "httpInfo": { "method": 5, "requestURI": "/x" },
                "body": "!!",
            }
        });
        let fields = RequestFields::decode(&v);
        assert_eq!(fields.method, "");
        assert_eq!(fields.request_uri, "/x");
        assert!(fields.header.is_empty());
        assert!(fields.body.is_empty());
    }

    #[test]
    fn test_created_at_missing_is_epoch() {
        assert_eq!(created_at(&json!({})), SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_decode_inline_response() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let record = json!({ "response": resolved(inline_response(200, &headers, b"{\"ok\":true}")) });
        assert!(has_response(&record));
        assert_eq!(
            RecordResponse::decode(&record),
            Some(RecordResponse::Complete {
                status: 200,
                header: headers,
                body: Bytes::from_static(b"{\"ok\":true}"),
                chunks: 0,
            })
        );
    }

    #[test]
    fn test_decode_chunked_and_error_responses() {
        let record = json!({ "response": chunked_response(200, &HeaderMap::new(), 3) });
        let Some(RecordResponse::Complete { chunks, body, .. }) = RecordResponse::decode(&record)
        else {
            panic!("expected complete response");
        };
        assert_eq!(chunks, 3);
        assert!(body.is_empty());

        let record = json!({ "response": error_response("no target match for /unknown") });
        assert_eq!(
            RecordResponse::decode(&record),
            Some(RecordResponse::Failed("no target match for /unknown".into()))
        );
        assert_eq!(RecordResponse::decode(&json!({ "request": {} })), None);
    }

    #[test]
    fn test_chunk_round_trip() {
        let doc = Document::new("x/responseBodies/c", chunk(2, b"abc"));
        let c = decode_chunk(&doc).unwrap();
        assert_eq!(c.index, 2);
        assert_eq!(c.size, 3);
        assert_eq!(c.data, Bytes::from_static(b"abc"));
    }
}
