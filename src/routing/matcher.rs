use crate::config::TargetConfig;
use crate::error::RelayError;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::Uri;
use regex::Regex;

/// A parsed forward target: scheme, authority, and an optional path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
}

impl Target {
    /// Rewrite an inbound request URI onto this target, keeping the path
    /// below the target's prefix and the query string.
    pub fn rewrite(&self, request: &Uri) -> Result<Uri, RelayError> {
        let mut path = join_paths(&self.base_path, request.path());
        if let Some(q) = request.query() {
            path.push('?');
            path.push_str(q);
        }
        let pq = PathAndQuery::try_from(path.as_str())
            .map_err(|e| RelayError::InvalidRequestUri(e.to_string()))?;
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(pq)
            .build()
            .map_err(|e| RelayError::InvalidRequestUri(e.to_string()))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}

/// Parse a target base URL. Only http and https with a host are accepted.
pub fn parse_target(target: &str) -> Result<Target, RelayError> {
    let uri: Uri = target
        .parse()
        .map_err(|e| RelayError::Config(format!("invalid target url '{}': {}", target, e)))?;
    let scheme = match uri.scheme_str() {
        Some("http") | Some("https") => uri.scheme().cloned(),
        _ => None,
    }
    .ok_or_else(|| RelayError::Config(format!("target '{}' must use http or https", target)))?;
    let authority = uri
        .authority()
        .filter(|a| !a.host().is_empty())
        .cloned()
        .ok_or_else(|| RelayError::Config(format!("target '{}' has no host", target)))?;
    if uri.query().is_some() {
        return Err(RelayError::Config(format!(
            "target '{}' must not carry a query",
            target
        )));
    }
    let base_path = uri.path().trim_end_matches('/').to_string();
    Ok(Target {
        scheme,
        authority,
        base_path,
    })
}

/// Convert a path glob into an anchored regular expression.
/// `**` matches any sequence, `*` anything but `/`, everything else is literal.
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut literal = String::new();
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '*' {
            literal.push(c);
            continue;
        }
        out.push_str(&regex::escape(&literal));
        literal.clear();
        if chars.peek() == Some(&'*') {
            chars.next();
            out.push_str(".*");
        } else {
            out.push_str("[^/]*");
        }
    }
    out.push_str(&regex::escape(&literal));
    out
}

fn join_paths(base: &str, path: &str) -> String {
    let rest = path.trim_start_matches('/');
    let mut joined = String::with_capacity(base.len() + rest.len() + 1);
    joined.push_str(base);
    joined.push('/');
    joined.push_str(rest);
    joined
}

struct TargetPattern {
    pattern: String,
    regex: Regex,
    target: Target,
}

/// Ordered pattern → target table. The first matching pattern wins.
pub struct Router {
    patterns: Vec<TargetPattern>,
}

impl Router {
    pub fn new(targets: &[TargetConfig]) -> Result<Self, RelayError> {
        let mut patterns = Vec::with_capacity(targets.len());
        for t in targets {
            let regex = Regex::new(&glob_to_regex(&t.pattern)).map_err(|e| {
                RelayError::Config(format!("invalid pattern '{}': {}", t.pattern, e))
            })?;
            patterns.push(TargetPattern {
                pattern: t.pattern.clone(),
                regex,
                target: parse_target(&t.target)?,
            });
        }
        for p in &patterns {
            tracing::info!("routing: target pattern, pattern={}, target={}", p.pattern, p.target);
        }
        Ok(Self { patterns })
    }

    pub fn route(&self, path: &str) -> Option<&Target> {
        self.patterns
            .iter()
            .find(|p| p.regex.is_match(path))
            .map(|p| &p.target)
    }
}
