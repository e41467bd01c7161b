use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Why the local reachability probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    Refused,
    Other,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "timed out"),
            ProbeFailure::Refused => write!(f, "connection refused"),
            ProbeFailure::Other => write!(f, "network error"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    #[error("invalid tunnel options: {0}")]
    InvalidOptions(String),

    #[error("local server at {addr} is unreachable ({kind}){}", detail_suffix(.detail))]
    LocalServerUnreachable {
        addr: String,
        kind: ProbeFailure,
        detail: Option<String>,
    },

    #[error("tunnel service is temporarily unavailable (HTTP {status}), try again shortly")]
    ServiceUnavailable { status: u16 },

    #[error("tunnel service authentication failed (HTTP {status}), check your token")]
    AuthFailed { status: u16 },

    #[error("tunnel service rate limited this client (HTTP 429), slow down and retry later")]
    RateLimited,

    #[error("tunnel allocation failed (HTTP {status}): {excerpt}")]
    AllocationHttp { status: u16, excerpt: String },

    #[error("invalid allocation response: {0}")]
    AllocationParse(String),

    #[error("connection to tunnel service {addr} was refused")]
    ConnectionRefused { addr: String },

    #[error("could not resolve tunnel service host {host}, check DNS or network")]
    HostUnresolvable { host: String },

    #[error("tunnel service {addr} is not responding")]
    NotResponding { addr: String },

    #[error(transparent)]
    Request(Arc<reqwest::Error>),

    #[error("failed to open transport channel to {addr}: {source}")]
    HandshakeFailed {
        addr: String,
        #[source]
        source: Arc<tokio_tungstenite::tungstenite::Error>,
    },

    #[error("transport channel {index} failed: {message}")]
    Channel { index: usize, message: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("tunnel has already been opened")]
    AlreadyOpen,

    #[error("tunnel is closed")]
    Closed,
}

impl From<reqwest::Error> for TunnelError {
    fn from(e: reqwest::Error) -> Self {
        TunnelError::Request(Arc::new(e))
    }
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(": {}", d))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, TunnelError>;
