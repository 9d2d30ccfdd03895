//! Debug-level dumps of relayed requests and responses.

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Uri};
use std::fmt::Write;
use tracing::debug;

/// Bodies are dumped only when they are textual and declare a small enough
/// `Content-Length`.
pub fn should_dump_body(headers: &HeaderMap, max_dump_bytes: u64) -> bool {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let textual = content_type.starts_with("text/") || content_type.contains("json");
    let small = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .is_some_and(|len| len <= max_dump_bytes);
    textual && small
}

fn render(first_line: &str, headers: &HeaderMap, body: Option<&[u8]>) -> String {
    let mut out = String::with_capacity(256);
    out.push_str(first_line);
    out.push('\n');
    for (name, value) in headers {
        let _ = writeln!(out, "{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    if let Some(body) = body {
        out.push('\n');
        out.push_str(&String::from_utf8_lossy(body));
    }
    out
}

pub fn dump_request(
    label: &str,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
    max_dump_bytes: u64,
) {
    let body = should_dump_body(headers, max_dump_bytes).then_some(body);
    debug!(
        "{}: request dump\n{}",
        label,
        render(&format!("{} {}", method, uri), headers, body)
    );
}

pub fn dump_response(
    label: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    max_dump_bytes: u64,
) {
    let body = should_dump_body(headers, max_dump_bytes).then_some(body);
    debug!(
        "{}: response dump\n{}",
        label,
        render(&status.to_string(), headers, body)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(ct: &str, cl: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
        if let Some(cl) = cl {
            h.insert(CONTENT_LENGTH, HeaderValue::from_str(cl).unwrap());
        }
        h
    }

    #[test]
    fn test_should_dump_body() {
        assert!(should_dump_body(&headers("application/json", Some("10")), 4096));
        assert!(should_dump_body(&headers("text/plain; charset=utf-8", Some("4096")), 4096));
        assert!(!should_dump_body(&headers("text/plain", Some("4097")), 4096));
        assert!(!should_dump_body(&headers("text/plain", None), 4096));
        assert!(!should_dump_body(&headers("image/png", Some("10")), 4096));
        assert!(!should_dump_body(&headers("text/plain", Some("abc")), 4096));
    }

    #[test]
    fn test_render_includes_body_only_when_given() {
        let h = headers("text/plain", Some("2"));
        let with = render("GET /x", &h, Some(b"hi"));
        assert!(with.starts_with("GET /x\n"));
        assert!(with.contains("content-type: text/plain"));
        assert!(with.ends_with("\nhi"));
        assert!(!render("GET /x", &h, None).contains("hi"));
    }
}
