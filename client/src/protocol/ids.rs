//! Type-safe ID wrappers for protocol identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier the tunnel service assigns to an allocated tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(pub String);

impl TunnelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TunnelId {
    fn from(s: String) -> Self {
        TunnelId(s)
    }
}

impl From<&str> for TunnelId {
    fn from(s: &str) -> Self {
        TunnelId(s.to_string())
    }
}
