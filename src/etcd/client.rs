use base64::Engine;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::error;

use crate::config::EtcdConfig;

/// Deserialize an i64 that may come as a JSON number or a JSON string (etcd v3.6+ gRPC-Gateway v2).
fn deserialize_i64_or_string<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum I64OrString {
        Num(i64),
        Str(String),
    }

    Option::<I64OrString>::deserialize(deserializer).and_then(|opt| match opt {
        None => Ok(None),
        Some(I64OrString::Num(n)) => Ok(Some(n)),
        Some(I64OrString::Str(s)) => s.parse::<i64>().map(Some).map_err(de::Error::custom),
    })
}

/// Shared etcd v3 HTTP/JSON client (avoids protoc/gRPC dependency).
///
/// Uses the gRPC-Gateway endpoints (`/v3/kv/range`, `/v3/kv/put`,
/// `/v3/kv/txn`, `/v3/kv/deleterange`, `/v3/watch`, `/v3/lease/grant`,
/// `/v3/auth/authenticate`).
///
/// Cheaply cloneable: the underlying `reqwest::Client` uses an `Arc`
/// internally so cloning just bumps a reference count.
#[derive(Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    request_timeout: Duration,
}

#[derive(Serialize)]
struct AuthRequest {
    name: String,
    password: String,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: Option<String>,
}

#[derive(Serialize)]
pub struct RangeRequest {
    pub key: String,
    pub range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys_only: Option<bool>,
}

#[derive(Deserialize)]
pub struct RangeResponse {
    #[serde(default)]
    pub kvs: Vec<KeyValue>,
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

#[derive(Deserialize)]
pub struct ResponseHeader {
    #[serde(default, deserialize_with = "deserialize_i64_or_string")]
    pub revision: Option<i64>,
}

#[derive(Deserialize, Clone)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, deserialize_with = "deserialize_i64_or_string")]
    pub create_revision: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_i64_or_string")]
    pub mod_revision: Option<i64>,
}

impl KeyValue {
    /// A PUT whose create and mod revisions coincide created the key.
    pub fn is_creation(&self) -> bool {
        matches!(
            (self.create_revision, self.mod_revision),
            (Some(c), Some(m)) if c == m
        )
    }
}

#[derive(Serialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<i64>,
}

#[derive(Serialize)]
pub struct DeleteRangeRequest {
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub range_end: String,
}

#[derive(Deserialize)]
pub struct DeleteRangeResponse {
    #[serde(default, deserialize_with = "deserialize_i64_or_string")]
    pub deleted: Option<i64>,
}

/// Transaction with a single compare and a single success operation. This is
/// the only shape the relay needs (compare-and-put, create-if-absent).
#[derive(Serialize)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failure: Vec<RequestOp>,
}

#[derive(Serialize)]
pub struct Compare {
    pub key: String,
    /// "CREATE" or "MOD".
    pub target: &'static str,
    /// "EQUAL".
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_revision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_revision: Option<i64>,
}

impl Compare {
    pub fn key_absent(key: String) -> Self {
        Self {
            key,
            target: "CREATE",
            result: "EQUAL",
            create_revision: Some(0),
            mod_revision: None,
        }
    }

    pub fn mod_revision_is(key: String, revision: i64) -> Self {
        Self {
            key,
            target: "MOD",
            result: "EQUAL",
            create_revision: None,
            mod_revision: Some(revision),
        }
    }
}

#[derive(Serialize)]
pub struct RequestOp {
    pub request_put: PutRequest,
}

#[derive(Deserialize)]
pub struct TxnResponse {
    #[serde(default)]
    pub succeeded: bool,
}

#[derive(Serialize)]
pub struct WatchCreateRequest {
    pub create_request: WatchCreate,
}

#[derive(Serialize)]
pub struct WatchCreate {
    pub key: String,
    pub range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_revision: Option<i64>,
}

#[derive(Deserialize)]
pub struct WatchResponse {
    #[serde(default)]
    pub result: Option<WatchResult>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct WatchResult {
    #[serde(default)]
    pub events: Vec<WatchEvent>,
    #[serde(default)]
    pub header: Option<ResponseHeader>,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub cancel_reason: Option<String>,
}

#[derive(Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    pub kv: Option<KeyValue>,
}

#[derive(Serialize)]
pub struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    pub ttl: u64,
}

#[derive(Deserialize)]
pub struct LeaseGrantResponse {
    #[serde(rename = "ID")]
    pub id: Option<String>,
}

pub fn b64_encode(s: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
}

pub fn b64_decode(s: &str) -> anyhow::Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s)?;
    Ok(String::from_utf8(bytes)?)
}

pub fn prefix_range_end(prefix: &str) -> String {
    let mut end = prefix.as_bytes().to_vec();
    for i in (0..end.len()).rev() {
        if end[i] < 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return b64_encode(&String::from_utf8_lossy(&end));
        }
    }
    String::new()
}

/// Reach `base_url` once; yields the auth token when credentials are set.
async fn probe(
    http: &reqwest::Client,
    base_url: &str,
    cfg: &EtcdConfig,
    timeout: Duration,
) -> anyhow::Result<Option<String>> {
    let resp = match (&cfg.username, &cfg.password) {
        (Some(name), Some(password)) => {
            http.post(format!("{}/v3/auth/authenticate", base_url))
                .timeout(timeout)
                .json(&AuthRequest {
                    name: name.clone(),
                    password: password.clone(),
                })
                .send()
                .await?
        }
        _ => {
            http.post(format!("{}/v3/kv/range", base_url))
                .timeout(timeout)
                .json(&RangeRequest {
                    key: b64_encode("/"),
                    range_end: String::new(),
                    keys_only: Some(true),
                })
                .send()
                .await?
        }
    };
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("status {}", status);
    }
    if cfg.username.is_some() && cfg.password.is_some() {
        let auth: AuthResponse = resp.json().await?;
        return Ok(auth.token);
    }
    Ok(None)
}

impl EtcdClient {
    /// First endpoint that answers wins. With credentials the probe is the
    /// authentication call itself, otherwise a keys-only range.
    pub async fn connect(cfg: &EtcdConfig) -> anyhow::Result<Self> {
        if cfg.endpoints.is_empty() {
            anyhow::bail!("etcd: no endpoints configured");
        }

        let http = reqwest::Client::new();
        let request_timeout = Duration::from_secs(cfg.request_timeout_secs.max(1));
        let mut failures = Vec::with_capacity(cfg.endpoints.len());

        for endpoint in &cfg.endpoints {
            let base_url = endpoint.trim_end_matches('/').to_string();
            match probe(&http, &base_url, cfg, request_timeout).await {
                Ok(auth_token) => {
                    return Ok(Self {
                        http,
                        base_url,
                        auth_token,
                        request_timeout,
                    })
                }
                Err(e) => {
                    tracing::warn!("etcd: endpoint unusable, endpoint={}, error={:#}", base_url, e);
                    failures.push(format!("{}: {:#}", base_url, e));
                }
            }
        }

        anyhow::bail!("etcd: no usable endpoint ({})", failures.join("; "))
    }

    /// Client for the first endpoint without any round trip.
    #[cfg(test)]
    pub(crate) fn unconnected(cfg: &EtcdConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg
                .endpoints
                .first()
                .map(|e| e.trim_end_matches('/').to_string())
                .unwrap_or_default(),
            auth_token: None,
            request_timeout: Duration::from_secs(cfg.request_timeout_secs.max(1)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Internal helper: POST JSON to an etcd endpoint with optional auth token.
    /// `timeout` is `None` for long-lived streams.
    async fn post_json(
        &self,
        path: &str,
        body: &impl serde::Serialize,
        timeout: Option<Duration>,
    ) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.post(&url).json(body);
        if let Some(ref token) = self.auth_token {
            req = req.header("Authorization", token);
        }
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("etcd {} failed: {} - {}", path, status, body);
        }
        Ok(resp)
    }

    async fn unary<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> anyhow::Result<T> {
        Ok(self
            .post_json(path, body, Some(self.request_timeout))
            .await?
            .json()
            .await?)
    }

    /// KV range query.
    pub async fn range(&self, req: &RangeRequest) -> anyhow::Result<RangeResponse> {
        self.unary("/v3/kv/range", req).await
    }

    /// KV put.
    pub async fn put(&self, req: &PutRequest) -> anyhow::Result<()> {
        self.post_json("/v3/kv/put", req, Some(self.request_timeout))
            .await?;
        Ok(())
    }

    /// KV delete. Returns the number of deleted keys.
    pub async fn delete_range(&self, req: &DeleteRangeRequest) -> anyhow::Result<i64> {
        let resp: DeleteRangeResponse = self.unary("/v3/kv/deleterange", req).await?;
        Ok(resp.deleted.unwrap_or(0))
    }

    /// Transaction. Returns whether the compare held and `success` ran.
    pub async fn txn(&self, req: &TxnRequest) -> anyhow::Result<bool> {
        let resp: TxnResponse = self.unary("/v3/kv/txn", req).await?;
        Ok(resp.succeeded)
    }

    /// Open a watch stream. Returns a receiver of parsed `WatchResponse` lines.
    /// The caller should loop on the receiver until it closes (stream ended / error).
    pub async fn watch_stream(&self, req: &WatchCreateRequest) -> anyhow::Result<WatchStream> {
        let resp = self.post_json("/v3/watch", req, None).await?;
        Ok(WatchStream {
            stream: Box::pin(resp.bytes_stream()),
            buf: BytesMut::with_capacity(4096),
        })
    }

    /// Grant a lease.
    pub async fn lease_grant(&self, ttl: u64) -> anyhow::Result<i64> {
        let grant: LeaseGrantResponse = self
            .unary("/v3/lease/grant", &LeaseGrantRequest { ttl })
            .await?;
        let id: i64 = grant.id.unwrap_or_default().parse().unwrap_or(0);
        if id == 0 {
            anyhow::bail!("lease grant returned invalid ID");
        }
        Ok(id)
    }
}

/// Newline-delimited `WatchResponse` frames from one `/v3/watch` call.
pub struct WatchStream {
    stream: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
    >,
    buf: BytesMut,
}

impl WatchStream {
    /// Next decodable frame, or `None` once the connection is gone.
    /// Undecodable frames are logged and skipped.
    pub async fn next_response(&mut self) -> Option<WatchResponse> {
        loop {
            while let Some(line) = self.take_line() {
                if let Some(resp) = parse_frame(&line) {
                    return Some(resp);
                }
            }

            match self.stream.next().await {
                Some(Ok(bytes)) => self.buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    error!("etcd: watch stream broken, error={}", e);
                    return None;
                }
                None => {
                    let rest = self.buf.split();
                    return parse_frame(&rest);
                }
            }
        }
    }

    fn take_line(&mut self) -> Option<BytesMut> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        Some(self.buf.split_to(end + 1))
    }
}

fn parse_frame(raw: &[u8]) -> Option<WatchResponse> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<WatchResponse>(line) {
        Ok(resp) => Some(resp),
        Err(e) => {
            error!("etcd: watch frame undecodable, error={}, frame={}", e, line);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_skips_blank_and_garbage() {
        assert!(parse_frame(b"  \r\n").is_none());
        assert!(parse_frame(b"{not json").is_none());
        let resp = parse_frame(br#"{"result":{"events":[]}}"#).unwrap();
        assert!(resp.result.is_some());
    }

    #[test]
    fn test_b64_roundtrip() {
        let encoded = b64_encode("/relay/endpoints/home");
        assert_eq!(b64_decode(&encoded).unwrap(), "/relay/endpoints/home");
    }

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(b64_decode(&prefix_range_end("/a/")).unwrap(), "/a0");
        assert_eq!(b64_decode(&prefix_range_end("abc")).unwrap(), "abd");
    }

    #[test]
    fn test_key_value_revision_as_string() {
        let kv: KeyValue = serde_json::from_str(
            r#"{"key":"a2V5","value":"","create_revision":"7","mod_revision":"7"}"#,
        )
        .unwrap();
        assert!(kv.is_creation());

        let kv: KeyValue = serde_json::from_str(
            r#"{"key":"a2V5","create_revision":7,"mod_revision":9}"#,
        )
        .unwrap();
        assert!(!kv.is_creation());
    }

    #[test]
    fn test_txn_compare_serialization() {
        let req = TxnRequest {
            compare: vec![Compare::key_absent("a2V5".into())],
            success: vec![RequestOp {
                request_put: PutRequest {
                    key: "a2V5".into(),
                    value: "MQ==".into(),
                    lease: Some(42),
                },
            }],
            failure: vec![],
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["compare"][0]["target"], "CREATE");
        assert_eq!(v["compare"][0]["create_revision"], 0);
        assert!(v["compare"][0].get("mod_revision").is_none());
        assert_eq!(v["success"][0]["request_put"]["lease"], 42);
        assert!(v.get("failure").is_none());
    }

    #[test]
    fn test_txn_response_defaults_to_failed() {
        let resp: TxnResponse = serde_json::from_str(r#"{"header":{}}"#).unwrap();
        assert!(!resp.succeeded);
    }

    #[test]
    fn test_watch_response_delete_event_without_type() {
        let resp: WatchResponse = serde_json::from_str(
            r#"{"result":{"header":{"revision":"12"},"events":[{"kv":{"key":"a2V5","create_revision":"12","mod_revision":"12"}}]}}"#,
        )
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result.header.unwrap().revision, Some(12));
        assert!(result.events[0].event_type.is_none());
        assert!(!result.canceled);
    }
}
