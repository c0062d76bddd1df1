//! Storage measurement operations.

use serde::{Deserialize, Serialize};

/// getAppSize request payload.
///
/// `package_names`, `ce_data_inodes` and `code_paths` are positionally
/// aligned: entry `i` of each describes the same package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAppSizeRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub package_names: Vec<String>,
    pub user_id: u32,
    #[serde(default)]
    pub flags: i32,
    pub app_id: u32,
    #[serde(default)]
    pub ce_data_inodes: Vec<u64>,
    #[serde(default)]
    pub code_paths: Vec<String>,
}

/// getUserSize request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUserSizeRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub user_id: u32,
    #[serde(default)]
    pub flags: i32,
    #[serde(default)]
    pub app_ids: Vec<u32>,
}

/// getExternalSize request payload.
pub type GetExternalSizeRequest = GetUserSizeRequest;

/// Six-way breakdown reported by getAppSize and getUserSize, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSize {
    pub code: i64,
    pub data: i64,
    pub cache: i64,
    pub external_code: i64,
    pub external_data: i64,
    pub external_cache: i64,
}

impl AppSize {
    /// Flatten into the positional wire order.
    pub fn to_array(&self) -> [i64; 6] {
        [
            self.code,
            self.data,
            self.cache,
            self.external_code,
            self.external_data,
            self.external_cache,
        ]
    }
}

/// Breakdown reported by getExternalSize, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSize {
    pub total: i64,
    pub audio: i64,
    pub video: i64,
    pub image: i64,
    pub app: i64,
    pub obb: i64,
}

impl ExternalSize {
    /// Flatten into the positional wire order.
    pub fn to_array(&self) -> [i64; 6] {
        [self.total, self.audio, self.video, self.image, self.app, self.obb]
    }
}

/// Response payload shared by the three size queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeResponse {
    pub values: [i64; 6],
}

impl From<AppSize> for SizeResponse {
    fn from(size: AppSize) -> Self {
        Self {
            values: size.to_array(),
        }
    }
}

impl From<ExternalSize> for SizeResponse {
    fn from(size: ExternalSize) -> Self {
        Self {
            values: size.to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_size_wire_order() {
        let size = AppSize {
            code: 1,
            data: 2,
            cache: 3,
            external_code: 4,
            external_data: 5,
            external_cache: 6,
        };
        assert_eq!(size.to_array(), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_get_app_size_defaults() {
        let req: GetAppSizeRequest = serde_json::from_value(serde_json::json!({
            "package_names": ["com.foo"],
            "user_id": 0,
            "app_id": 10050
        }))
        .unwrap();
        assert!(req.volume_uuid.is_none());
        assert!(req.ce_data_inodes.is_empty());
        assert_eq!(req.flags, 0);
    }
}
