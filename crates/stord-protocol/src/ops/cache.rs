//! Cache quota and eviction operations.

use serde::{Deserialize, Serialize};

/// setAppQuota request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAppQuotaRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub user_id: u32,
    pub app_id: u32,
    pub cache_quota_bytes: i64,
}

/// freeCache request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeCacheRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub target_free_bytes: i64,
    #[serde(default)]
    pub cache_reserved_bytes: i64,
    pub flags: i32,
}

/// freeCache response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeCacheResponse {
    /// Free bytes measured after the run.
    pub free_bytes: i64,
    /// Bytes accounted as cleared by the run.
    pub cleared_bytes: i64,
    /// Number of cache items purged.
    pub purged_items: usize,
}
