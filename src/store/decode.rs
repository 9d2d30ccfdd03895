//! Typed reads from untyped document data.
//!
//! Field paths are dotted (`request.httpInfo.method`). Bodies are stored as
//! base64 strings, timestamps as epoch milliseconds, header maps as
//! `{ name: [value, ...] }`.

use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde_json::{Map, Value};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Missing(String),
    Invalid { path: String, expected: &'static str },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Missing(path) => write!(f, "field {} is missing", path),
            DecodeError::Invalid { path, expected } => {
                write!(f, "field {} is not {}", path, expected)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

pub fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(data, |v, seg| v.as_object()?.get(seg))
        .filter(|v| !v.is_null())
}

fn require<'a>(data: &'a Value, path: &str) -> Result<&'a Value, DecodeError> {
    lookup(data, path).ok_or_else(|| DecodeError::Missing(path.to_string()))
}

fn invalid(path: &str, expected: &'static str) -> DecodeError {
    DecodeError::Invalid {
        path: path.to_string(),
        expected,
    }
}

pub fn as_str(data: &Value, path: &str) -> Result<String, DecodeError> {
    require(data, path)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(path, "a string"))
}

pub fn as_i64(data: &Value, path: &str) -> Result<i64, DecodeError> {
    require(data, path)?
        .as_i64()
        .ok_or_else(|| invalid(path, "an integer"))
}

pub fn as_bytes(data: &Value, path: &str) -> Result<Bytes, DecodeError> {
    let s = require(data, path)?
        .as_str()
        .ok_or_else(|| invalid(path, "a base64 string"))?;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map(Bytes::from)
        .map_err(|_| invalid(path, "a base64 string"))
}

pub fn as_time(data: &Value, path: &str) -> Result<SystemTime, DecodeError> {
    let ms = require(data, path)?
        .as_i64()
        .filter(|ms| *ms >= 0)
        .ok_or_else(|| invalid(path, "a timestamp"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(ms as u64))
}

/// Non-string values are stringified, entries that are not arrays are
/// skipped, and names or values that are not valid HTTP are dropped.
pub fn as_header(data: &Value, path: &str) -> Result<HeaderMap, DecodeError> {
    let obj = require(data, path)?
        .as_object()
        .ok_or_else(|| invalid(path, "a header map"))?;
    let mut headers = HeaderMap::new();
    for (name, values) in obj {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Value::Array(items) = values else {
            continue;
        };
        for item in items {
            let value = match item {
                Value::String(s) => HeaderValue::from_str(s),
                other => HeaderValue::from_str(&other.to_string()),
            };
            if let Ok(v) = value {
                headers.append(name.clone(), v);
            }
        }
    }
    Ok(headers)
}

/// Inverse of [`as_header`]. Values that are not valid UTF-8 are dropped.
pub fn header_to_value(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for name in headers.keys() {
        let values: Vec<Value> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| Value::String(v.to_string()))
            .collect();
        map.insert(name.as_str().to_string(), Value::Array(values));
    }
    Value::Object(map)
}

pub fn bytes_to_value(body: &[u8]) -> Value {
    Value::String(base64::engine::general_purpose::STANDARD.encode(body))
}
