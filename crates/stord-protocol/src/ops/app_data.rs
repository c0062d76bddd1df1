//! Per-package data directory operations.

use serde::{Deserialize, Serialize};

/// createAppData request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppDataRequest {
    /// Volume UUID; `None` or empty selects the primary internal volume.
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub package_name: String,
    pub user_id: u32,
    /// Storage-class selectors (`FLAG_STORAGE_CE` / `FLAG_STORAGE_DE`).
    pub flags: i32,
    pub app_id: u32,
    pub se_info: String,
    pub target_sdk_version: i32,
}

/// createAppData response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppDataResponse {
    /// Inode of the CE package directory, when CE storage was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ce_data_inode: Option<u64>,
}

/// destroyAppData request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyAppDataRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub package_name: String,
    pub user_id: u32,
    pub flags: i32,
    /// CE directory inode hint; 0 when unknown.
    #[serde(default)]
    pub ce_data_inode: u64,
}

/// clearAppData request payload.
///
/// `FLAG_CLEAR_CACHE_ONLY` / `FLAG_CLEAR_CODE_CACHE_ONLY` narrow the clear.
pub type ClearAppDataRequest = DestroyAppDataRequest;

/// migrateAppData request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateAppDataRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub package_name: String,
    pub user_id: u32,
    pub flags: i32,
}

/// fixupAppData request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixupAppDataRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
    #[serde(default)]
    pub flags: i32,
}

/// fixupAppData response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixupAppDataResponse {
    /// Entries examined, user roots included.
    pub visited: u64,
    /// Entries whose group (and mode) were corrected.
    pub fixed: u64,
    /// Entries left alone because their group belonged to someone else.
    pub ignored: u64,
}

/// restoreconAppData request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreconAppDataRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub package_name: String,
    pub user_id: u32,
    pub flags: i32,
    pub app_id: u32,
    pub se_info: String,
}

/// moveCompleteApp request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveCompleteAppRequest {
    #[serde(default)]
    pub from_uuid: Option<String>,
    #[serde(default)]
    pub to_uuid: Option<String>,
    pub package_name: String,
    /// Directory name of the package code under `<volume>/app`.
    pub data_app_name: String,
    pub app_id: u32,
    pub se_info: String,
    pub target_sdk_version: i32,
}

/// clearAppProfiles / destroyAppProfiles request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageProfilesRequest {
    pub package_name: String,
}
