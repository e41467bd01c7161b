use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TunnelId;

/// Body of a successful `POST /api/v1/ci-tunnels/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub id: u64,
    pub tunnel_id: TunnelId,
    pub url: String,
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub connected_at: Option<Value>,
    #[serde(default)]
    pub completed_at: Option<Value>,
    #[serde(default)]
    pub playwright_result: Option<Value>,
}

/// Out-of-band control messages (Server -> Client), sent as text frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    TunnelDone {
        tunnel_id: TunnelId,
        #[serde(default)]
        data: Option<Value>,
    },
}

impl ControlFrame {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl AllocationResponse {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
