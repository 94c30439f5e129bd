use std::io;

use thiserror::Error;

/// Error types for the tunnel core
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("stream closed")]
    StreamClosed,

    #[error("session closed")]
    SessionClosed,

    #[error("no available worker")]
    NoAvailableWorker,

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("stream reset by peer: {0}")]
    StreamReset(h2::Reason),

    #[error("HTTP/2 error: {0}")]
    Http(h2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TunnelError {
    /// Whether the caller should pick a worker again and retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SessionClosed | Self::StreamReset(_))
    }

    /// Whether the whole session is gone rather than a single stream
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::SessionClosed | Self::Io(_) => true,
            Self::Http(e) => e.is_io() || e.is_go_away(),
            _ => false,
        }
    }
}

impl From<h2::Error> for TunnelError {
    fn from(err: h2::Error) -> Self {
        match err.reason() {
            // a reason outside of GOAWAY belongs to one stream
            Some(reason) if !err.is_go_away() => Self::StreamReset(reason),
            _ => Self::Http(err),
        }
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Io(e) => e,
            TunnelError::StreamClosed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            TunnelError::SessionClosed => io::Error::new(io::ErrorKind::ConnectionAborted, err),
            other => io::Error::other(other),
        }
    }
}

/// Type alias for Results using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;
