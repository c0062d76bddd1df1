//! Path naming layer.
//!
//! Pure mapping from `(volume, user, package, class)` to canonical paths,
//! plus the argument validation every path-bearing call runs before it
//! touches the filesystem.

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::DirEntryExt;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::error::{StorageError, StorageResult};

/// Longest caller-supplied path accepted.
pub const PKG_PATH_MAX: usize = 4096;

/// Volume UUID reserved for the ephemeral test volume.
pub const TEST_VOLUME_UUID: &str = "TEST";

const PROFILE_EXT: &str = ".prof";
const CURRENT_PROFILE_EXT: &str = ".cur";
const PRIMARY_PROFILE_NAME: &str = "primary.prof";

/// A storage volume as named by callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Volume {
    /// The primary internal volume.
    Primary,
    /// The reserved test volume; only available on debuggable builds.
    Test,
    /// An adopted volume mounted under the expand root.
    Expand(String),
}

impl Volume {
    /// The UUID callers use for this volume.
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Volume::Primary => None,
            Volume::Test => Some(TEST_VOLUME_UUID),
            Volume::Expand(uuid) => Some(uuid),
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Volume::Primary)
    }
}

/// Whether `name` is a single path component with no traversal.
pub fn is_valid_filename(name: &str) -> bool {
    !(name.is_empty() || name == "." || name == ".." || name.contains('/'))
}

/// Whether `name` is a well-formed package name.
///
/// Dot-separated segments, each starting with a letter and continuing with
/// letters, digits or `_`; at least one separator. An optional `-` starts a
/// non-empty suffix of `[A-Za-z0-9_=-]`.
pub fn is_valid_package_name(name: &str) -> bool {
    let (base, suffix) = match name.split_once('-') {
        Some((base, suffix)) => (base, Some(suffix)),
        None => (name, None),
    };

    let mut has_sep = false;
    let mut front = true;
    for c in base.chars() {
        if c.is_ascii_alphabetic() || (!front && (c.is_ascii_digit() || c == '_')) {
            front = false;
        } else if c == '.' && !front {
            has_sep = true;
            front = true;
        } else {
            debug!(package = name, bad = %c, "bad package character");
            return false;
        }
    }
    if front || !has_sep {
        debug!(package = name, "missing separator");
        return false;
    }

    match suffix {
        None => true,
        Some(suffix) => {
            !suffix.is_empty()
                && suffix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '='))
        }
    }
}

/// Reject malformed package names.
pub fn check_package_name(name: &str) -> StorageResult<()> {
    if is_valid_filename(name) && is_valid_package_name(name) {
        Ok(())
    } else {
        Err(StorageError::illegal_argument(format!(
            "package name {:?} is malformed",
            name
        )))
    }
}

/// Reject malformed volume UUIDs. `None` and empty mean the primary volume.
pub fn check_uuid(uuid: Option<&str>) -> StorageResult<()> {
    match uuid {
        None | Some("") => Ok(()),
        Some(uuid) if is_valid_filename(uuid) => Ok(()),
        Some(uuid) => Err(StorageError::illegal_argument(format!(
            "volume uuid {:?} is malformed",
            uuid
        ))),
    }
}

/// Reject caller-supplied absolute paths that could escape their root.
pub fn check_path(path: &str) -> StorageResult<()> {
    let bad = |why: &str| {
        Err(StorageError::illegal_argument(format!(
            "path {:?} is {}",
            path, why
        )))
    };
    if path.is_empty() || !path.starts_with('/') {
        return bad("not absolute");
    }
    if path.len() > PKG_PATH_MAX {
        return bad("too long");
    }
    if Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        || path.contains("/.")
    {
        return bad("not canonical");
    }
    Ok(())
}

/// Canonical path builder for one service configuration.
#[derive(Debug, Clone)]
pub struct PathLayout {
    config: ServiceConfig,
}

impl PathLayout {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Validate a caller-supplied UUID and name the volume it refers to.
    pub fn volume(&self, uuid: Option<&str>) -> StorageResult<Volume> {
        check_uuid(uuid)?;
        match uuid {
            None | Some("") => Ok(Volume::Primary),
            Some(TEST_VOLUME_UUID) => {
                if self.config.debuggable {
                    Ok(Volume::Test)
                } else {
                    Err(StorageError::illegal_argument(
                        "test volume requires a debuggable build",
                    ))
                }
            }
            Some(uuid) => Ok(Volume::Expand(uuid.to_string())),
        }
    }

    /// Root of the volume.
    pub fn data_path(&self, volume: &Volume) -> PathBuf {
        match volume {
            Volume::Primary => self.config.data_root.clone(),
            Volume::Test => self.config.test_volume_root.clone(),
            Volume::Expand(uuid) => self.config.expand_root.join(uuid),
        }
    }

    /// Directory holding installed package code.
    pub fn app_path(&self, volume: &Volume) -> PathBuf {
        self.data_path(volume).join("app")
    }

    /// CE root for `user`, honouring the legacy `<data>/data` layout.
    pub fn user_ce_path(&self, volume: &Volume, user: u32) -> PathBuf {
        let data = self.data_path(volume);
        if volume.is_primary() && user == 0 {
            let legacy = data.join("data");
            if fs::symlink_metadata(&legacy).map(|m| m.is_dir()).unwrap_or(false) {
                return legacy;
            }
        }
        data.join("user").join(user.to_string())
    }

    pub fn user_de_path(&self, volume: &Volume, user: u32) -> PathBuf {
        self.data_path(volume).join("user_de").join(user.to_string())
    }

    pub fn ce_package_path(&self, volume: &Volume, user: u32, package: &str) -> StorageResult<PathBuf> {
        check_package_name(package)?;
        Ok(self.user_ce_path(volume, user).join(package))
    }

    /// CE package path, located by inode when a hint is given.
    ///
    /// Falls back to the nominal name when the hint is zero or nothing in
    /// the user root carries that inode.
    pub fn ce_package_path_by_inode(
        &self,
        volume: &Volume,
        user: u32,
        package: &str,
        ce_data_inode: u64,
    ) -> StorageResult<PathBuf> {
        let fallback = self.ce_package_path(volume, user, package)?;
        if ce_data_inode == 0 {
            return Ok(fallback);
        }
        let user_path = self.user_ce_path(volume, user);
        Ok(find_child_with_inode(&user_path, ce_data_inode).unwrap_or_else(|| {
            warn!(inode = ce_data_inode, fallback = %fallback.display(), "failed to resolve inode");
            fallback
        }))
    }

    pub fn de_package_path(&self, volume: &Volume, user: u32, package: &str) -> StorageResult<PathBuf> {
        check_package_name(package)?;
        Ok(self.user_de_path(volume, user).join(package))
    }

    /// Unresolved media root (`<data>/media`); see the service for mounts.
    pub fn media_root(&self, volume: &Volume) -> PathBuf {
        self.data_path(volume).join("media")
    }

    pub fn media_path(&self, volume: &Volume, user: u32) -> PathBuf {
        self.media_root(volume).join(user.to_string())
    }

    pub fn media_obb_path(&self, volume: &Volume, package: &str) -> PathBuf {
        self.media_root(volume).join("obb").join(package)
    }

    /// `<media>/Android/<data_type>/<package>` under an already resolved media path.
    pub fn media_package_path(media_user_path: &Path, data_type: &str, package: &str) -> PathBuf {
        media_user_path.join("Android").join(data_type).join(package)
    }

    pub fn misc_user_path(&self, user: u32) -> PathBuf {
        self.config.misc_user_root.join(user.to_string())
    }

    pub fn cur_profile_dir(&self, user: u32) -> PathBuf {
        self.config.profiles_root.join("cur").join(user.to_string())
    }

    pub fn cur_profile_package_dir(&self, user: u32, package: &str) -> StorageResult<PathBuf> {
        check_package_name(package)?;
        Ok(self.cur_profile_dir(user).join(package))
    }

    pub fn ref_profile_dir(&self) -> PathBuf {
        self.config.profiles_root.join("ref")
    }

    pub fn ref_profile_package_dir(&self, package: &str) -> StorageResult<PathBuf> {
        check_package_name(package)?;
        Ok(self.ref_profile_dir().join(package))
    }

    /// Current profile for a package, or for a secondary dex file when
    /// `is_secondary_dex` is set (then `location` is the dex path).
    pub fn current_profile_path(
        &self,
        user: u32,
        location: &str,
        is_secondary_dex: bool,
    ) -> StorageResult<PathBuf> {
        if is_secondary_dex {
            let (dir, name) = secondary_dex_location(location)?;
            Ok(dir
                .join("oat")
                .join(format!("{}{}{}", name, CURRENT_PROFILE_EXT, PROFILE_EXT)))
        } else {
            Ok(self
                .cur_profile_package_dir(user, location)?
                .join(PRIMARY_PROFILE_NAME))
        }
    }

    /// Reference profile for a package or secondary dex file.
    pub fn reference_profile_path(&self, location: &str, is_secondary_dex: bool) -> StorageResult<PathBuf> {
        if is_secondary_dex {
            let (dir, name) = secondary_dex_location(location)?;
            Ok(dir.join("oat").join(format!("{}{}", name, PROFILE_EXT)))
        } else {
            Ok(self
                .ref_profile_package_dir(location)?
                .join(PRIMARY_PROFILE_NAME))
        }
    }

    /// User 0 plus every numeric directory under `<data>/user`.
    pub fn known_users(&self, volume: &Volume) -> Vec<u32> {
        let mut users = vec![0];
        let path = self.data_path(volume).join("user");
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unable to discover users");
                return users;
            }
        };
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            if let Some(user) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                if user != 0 {
                    users.push(user);
                }
            }
        }
        users.sort_unstable();
        users
    }
}

fn secondary_dex_location(location: &str) -> StorageResult<(PathBuf, &str)> {
    match location.rfind('/') {
        Some(idx) if idx + 1 < location.len() => {
            Ok((PathBuf::from(&location[..idx]), &location[idx + 1..]))
        }
        _ => Err(StorageError::illegal_argument(format!(
            "unexpected dir structure for secondary dex {}",
            location
        ))),
    }
}

/// Scan `dir` for an entry whose inode is `inode`.
pub(crate) fn find_child_with_inode(dir: &Path, inode: u64) -> Option<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to open dir");
            return None;
        }
    };
    entries
        .flatten()
        .find(|entry| entry.ino() == inode)
        .map(|entry| dir.join(entry.file_name()))
}

/// Final component of `path` as UTF-8, if any.
pub(crate) fn file_name_str(path: &Path) -> Option<&str> {
    path.file_name().and_then(OsStr::to_str)
}
