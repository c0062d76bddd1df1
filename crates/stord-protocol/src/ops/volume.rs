//! Volume-level queries.

use serde::{Deserialize, Serialize};

/// isQuotaSupported request payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsQuotaSupportedRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
}

/// isQuotaSupported response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsQuotaSupportedResponse {
    pub supported: bool,
}

/// dump response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpResponse {
    pub text: String,
}
