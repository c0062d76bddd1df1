//! RPC request types.

use serde::{Deserialize, Serialize};

/// RPC request envelope.
///
/// The service reads one JSON request per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version spoken by the caller.
    pub protocol_version: i32,
    /// Operation name.
    pub op: String,
    /// Caller-chosen request ID for correlation.
    pub request_id: String,
    /// Identity the transport authenticated the caller as.
    pub caller_uid: u32,
    /// Operation-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}
