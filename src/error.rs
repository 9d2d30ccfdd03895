use std::fmt;

/// Per-record failure taxonomy of the relay side.
///
/// Everything except `ResponsePersist` and `RecordDeleted` ends with an
/// error response being written back onto the record; those two are only
/// logged.
#[derive(Debug)]
pub enum RelayError {
    NoTargetMatch(String),
    InvalidRequestUri(String),
    Forward(String),
    ForwardTimeout,
    ReadBody(String),
    ChunkPersist { index: usize, message: String },
    ResponsePersist(String),
    RecordDeleted(String),
    Config(String),
}

impl RelayError {
    /// The response itself could not be written, or the record is gone.
    /// An error response on top would be a second write to the same field
    /// or a write to nothing, so the caller only logs.
    pub fn is_log_only(&self) -> bool {
        matches!(
            self,
            RelayError::ResponsePersist(_) | RelayError::RecordDeleted(_)
        )
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::NoTargetMatch(_) => "no_target",
            RelayError::InvalidRequestUri(_) => "invalid_uri",
            RelayError::Forward(_) => "forward",
            RelayError::ForwardTimeout => "timeout",
            RelayError::ReadBody(_) => "read_body",
            RelayError::ChunkPersist { .. } => "chunk_persist",
            RelayError::ResponsePersist(_) => "response_persist",
            RelayError::RecordDeleted(_) => "record_deleted",
            RelayError::Config(_) => "config",
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::NoTargetMatch(path) => write!(f, "no target match for {}", path),
            RelayError::InvalidRequestUri(msg) => write!(f, "invalid request uri: {}", msg),
            RelayError::Forward(msg) => write!(f, "forward error: {}", msg),
            RelayError::ForwardTimeout => write!(f, "forward timeout"),
            RelayError::ReadBody(msg) => write!(f, "read response body: {}", msg),
            RelayError::ChunkPersist { index, message } => {
                write!(f, "persist chunk {}: {}", index, message)
            }
            RelayError::ResponsePersist(msg) => write!(f, "persist response: {}", msg),
            RelayError::RecordDeleted(path) => write!(f, "record deleted: {}", path),
            RelayError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_target_match() {
        assert_eq!(
            RelayError::NoTargetMatch("/unknown".to_string()).to_string(),
            "no target match for /unknown"
        );
    }

    #[test]
    fn display_forward_timeout() {
        assert_eq!(RelayError::ForwardTimeout.to_string(), "forward timeout");
    }

    #[test]
    fn display_forward() {
        assert_eq!(
            RelayError::Forward("connection refused".to_string()).to_string(),
            "forward error: connection refused"
        );
    }

    #[test]
    fn display_chunk_persist() {
        let err = RelayError::ChunkPersist {
            index: 2,
            message: "etcd unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "persist chunk 2: etcd unavailable");
    }

    #[test]
    fn display_config() {
        assert_eq!(
            RelayError::Config("bad toml".to_string()).to_string(),
            "config error: bad toml"
        );
    }

    #[test]
    fn persist_failures_are_log_only() {
        assert!(RelayError::ResponsePersist("x".into()).is_log_only());
        assert!(RelayError::RecordDeleted("x".into()).is_log_only());
        assert!(!RelayError::ForwardTimeout.is_log_only());
        assert!(!RelayError::ChunkPersist {
            index: 0,
            message: "x".into()
        }
        .is_log_only());
    }

    #[test]
    fn kind_labels() {
        assert_eq!(RelayError::NoTargetMatch(String::new()).kind(), "no_target");
        assert_eq!(RelayError::ForwardTimeout.kind(), "timeout");
        assert_eq!(RelayError::Config(String::new()).kind(), "config");
    }
}
