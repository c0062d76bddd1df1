//! Service configuration.
//!
//! Describes where the storage layout lives on the host and which platform
//! properties are in effect. Every field has a production default so an
//! empty TOML table is a valid configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Cache quota assumed for owners that never received one (64 MiB).
pub const DEFAULT_CACHE_QUOTA: i64 = 64 * 1024 * 1024;

/// First target SDK whose home directories are not world-traversable.
pub const MIN_RESTRICTED_HOME_SDK_VERSION: i32 = 24;

/// Storage service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root of the primary internal volume.
    pub data_root: PathBuf,
    /// Directory under which adopted volumes are mounted by UUID.
    pub expand_root: PathBuf,
    /// Scratch root backing the reserved test volume.
    pub test_volume_root: PathBuf,
    /// Root of the AOT profile tree (`cur/` and `ref/`).
    pub profiles_root: PathBuf,
    /// Dalvik cache directory measured for shared-gid code size.
    pub dalvik_cache_dir: PathBuf,
    /// Root of per-user system directories on the primary volume.
    pub misc_user_root: PathBuf,
    /// Mount-point prefix identifying emulated storage runtime mounts.
    pub storage_runtime_prefix: String,
    /// Block device prefix identifying quota-capable mounts.
    pub quota_device_prefix: String,
    /// Live mount table.
    pub proc_mounts: PathBuf,
    /// Command used to copy package trees between volumes.
    pub copy_command: Vec<String>,
    /// Permit the reserved test volume.
    pub debuggable: bool,
    /// Create AOT profile directories alongside DE storage.
    pub use_jit_profiles: bool,
    /// Establish per-uid hard quotas on DE creation.
    pub apply_hard_quotas: bool,
    /// Target SDK at which package directories become 0700.
    pub restricted_home_sdk: i32,
    /// Cache quota for owners without an explicit one, in bytes.
    pub default_cache_quota: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/data"),
            expand_root: PathBuf::from("/mnt/expand"),
            test_volume_root: PathBuf::from("/data/local/tmp"),
            profiles_root: PathBuf::from("/data/misc/profiles"),
            dalvik_cache_dir: PathBuf::from("/data/dalvik-cache"),
            misc_user_root: PathBuf::from("/data/misc/user"),
            storage_runtime_prefix: "/mnt/runtime/default/".to_string(),
            quota_device_prefix: "/dev/block/".to_string(),
            proc_mounts: PathBuf::from("/proc/mounts"),
            copy_command: ["/system/bin/cp", "-F", "-p", "-R", "-P", "-d"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            debuggable: false,
            use_jit_profiles: true,
            apply_hard_quotas: true,
            restricted_home_sdk: MIN_RESTRICTED_HOME_SDK_VERSION,
            default_cache_quota: DEFAULT_CACHE_QUOTA,
        }
    }
}

impl ServiceConfig {
    /// A configuration with every root placed under `root`, for fixtures.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let data = root.join("data");
        Self {
            expand_root: root.join("mnt/expand"),
            test_volume_root: data.join("local/tmp"),
            profiles_root: data.join("misc/profiles"),
            dalvik_cache_dir: data.join("dalvik-cache"),
            misc_user_root: data.join("misc/user"),
            proc_mounts: root.join("proc/mounts"),
            copy_command: ["cp", "-p", "-R", "-P", "-d"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            data_root: data,
            ..Self::default()
        }
    }
}
