use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only protocol version accepted on the stream.
pub const JSONRPC_VERSION: &str = "2.0";

/// Inbound command envelope.
///
/// `id` is accepted for framing compatibility but nothing is ever sent back;
/// the stream has no response direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcEnvelope {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl RpcEnvelope {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// `true` unless a version is present and differs from [`JSONRPC_VERSION`].
    pub fn has_supported_version(&self) -> bool {
        self.jsonrpc
            .as_deref()
            .map_or(true, |version| version == JSONRPC_VERSION)
    }
}
