use hyper::StatusCode;
use std::path::PathBuf;

/// Errors raised while talking to the container runtime API
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to connect to `{target}`: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read TLS material `{path}`: {source}")]
    TlsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TLS configuration: {0}")]
    TlsConfig(String),
    #[error("TLS handshake with `{target}` failed: {source}")]
    TlsHandshake {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP handshake failed: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("transport error: {0}")]
    Transport(#[source] hyper::Error),
    #[error("failed to build request: {0}")]
    Request(#[source] hyper::http::Error),
    #[error("runtime API returned {status} for `{path}`: {message}")]
    Api {
        status: StatusCode,
        path: String,
        message: String,
    },
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid stats frame: {0}")]
    InvalidFrame(String),
    #[error("event stream closed by the runtime")]
    StreamClosed,
}

impl RuntimeError {
    /// True when the error means the underlying connection can no longer be used
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::Connect { .. }
                | RuntimeError::TlsHandshake { .. }
                | RuntimeError::Handshake(_)
                | RuntimeError::Transport(_)
                | RuntimeError::StreamClosed
        )
    }

    /// True when the runtime reported that the container does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

impl From<hyper::Error> for RuntimeError {
    fn from(err: hyper::Error) -> Self {
        RuntimeError::Transport(err)
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
