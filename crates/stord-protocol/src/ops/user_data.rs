//! Per-user storage operations.

use serde::{Deserialize, Serialize};

/// createUserData request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserDataRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub user_id: u32,
    #[serde(default)]
    pub user_serial: i32,
    pub flags: i32,
}

/// destroyUserData request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyUserDataRequest {
    #[serde(default)]
    pub volume_uuid: Option<String>,
    pub user_id: u32,
    pub flags: i32,
}
