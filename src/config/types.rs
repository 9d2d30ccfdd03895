use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level relay configuration, shared by the gateway and the consumer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Logical channel name. A consumer watches exactly one endpoint.
    #[serde(default)]
    pub endpoint_name: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "etcd".
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    #[serde(default)]
    pub etcd: EtcdConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            etcd: EtcdConfig::default(),
        }
    }
}

fn default_memory_backend() -> String {
    "memory".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,

    /// All documents live under this key prefix.
    #[serde(default = "default_etcd_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Applies to unary calls only; watch streams are long-lived.
    #[serde(default = "default_etcd_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            key_prefix: default_etcd_key_prefix(),
            username: None,
            password: None,
            request_timeout_secs: default_etcd_request_timeout(),
        }
    }
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_etcd_key_prefix() -> String {
    "/relay".to_string()
}

fn default_etcd_request_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// "memory" (per-process) or "etcd" (shared across consumer replicas).
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    #[serde(default = "default_dedup_namespace")]
    pub namespace: String,

    #[serde(default = "default_dedup_ttl")]
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            namespace: default_dedup_namespace(),
            ttl_secs: default_dedup_ttl(),
        }
    }
}

fn default_dedup_namespace() -> String {
    "relay-consumer".to_string()
}

fn default_dedup_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_listen")]
    pub listen: String,

    #[serde(default = "default_gateway_admin_listen")]
    pub admin_listen: String,

    /// How long a request waits for its response to appear.
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: f64,

    /// Grace period for in-flight requests on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Put the relay error message into the 500 body instead of a generic one.
    #[serde(default)]
    pub expose_errors: bool,

    #[serde(default = "default_true")]
    pub inject_trace_context: bool,

    #[serde(default)]
    pub dump: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_gateway_listen(),
            admin_listen: default_gateway_admin_listen(),
            timeout_secs: default_gateway_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            expose_errors: false,
            inject_trace_context: true,
            dump: false,
        }
    }
}

fn default_gateway_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_gateway_admin_listen() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_gateway_timeout() -> f64 {
    60.0
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: f64,

    /// Records older than this at first observation are never forwarded.
    #[serde(default = "default_expire")]
    pub expire_secs: f64,

    /// Delete expired records instead of only skipping them.
    #[serde(default = "default_true")]
    pub cleaning: bool,

    /// Ordered: the first matching pattern wins.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub targets: Vec<TargetConfig>,

    /// Response bodies up to this size are stored inline on the record.
    #[serde(default = "default_chunk_bytes")]
    pub inline_body_bytes: usize,

    /// Size of each `responseBodies` chunk for larger bodies.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,

    #[serde(default = "default_true")]
    pub tls_verify: bool,

    #[serde(default)]
    pub dump: bool,

    #[serde(default)]
    pub dump_forward: bool,

    #[serde(default = "default_max_dump_bytes")]
    pub max_dump_bytes: u64,

    #[serde(default = "default_consumer_admin_listen")]
    pub admin_listen: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            forward_timeout_secs: default_forward_timeout(),
            expire_secs: default_expire(),
            cleaning: true,
            targets: Vec::new(),
            inline_body_bytes: default_chunk_bytes(),
            chunk_bytes: default_chunk_bytes(),
            tls_verify: true,
            dump: false,
            dump_forward: false,
            max_dump_bytes: default_max_dump_bytes(),
            admin_listen: default_consumer_admin_listen(),
        }
    }
}

fn default_workers() -> usize {
    8
}

fn default_forward_timeout() -> f64 {
    30.0
}

fn default_expire() -> f64 {
    120.0
}

fn default_chunk_bytes() -> usize {
    900 * 1024
}

fn default_max_dump_bytes() -> u64 {
    4096
}

fn default_consumer_admin_listen() -> String {
    "0.0.0.0:3002".to_string()
}

/// One pattern → target pair.
///
/// `pattern` is a path glob: `**` matches anything including `/`, `*` matches
/// within one segment. Matching is anchored at the start of the path only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub pattern: String,
    pub target: String,
}

impl TargetConfig {
    pub fn new(pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            target: target.into(),
        }
    }

    /// Used when no targets are configured at all.
    pub fn fallback() -> Self {
        Self::new("**", "http://localhost:3010")
    }
}
