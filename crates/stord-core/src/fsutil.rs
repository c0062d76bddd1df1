//! Filesystem primitives shared by lifecycle, measurement and eviction.

use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{chown, lchown, DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use tracing::{debug, error, warn};
use walkdir::WalkDir;

use crate::error::{StorageError, StorageResult};
use crate::identity::{
    get_app_id, AID_APP_END, AID_APP_START, AID_CACHE_GID_END, AID_CACHE_GID_START,
    AID_SHARED_GID_END, AID_SHARED_GID_START,
};

/// Mode of `cache` and `code_cache`: setgid so new entries inherit the cache gid.
pub const CACHE_DIR_MODE: u32 = 0o2771;

const MODE_MASK: u32 = 0o2777;

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, Permissions::from_mode(mode))
}

/// Ensure `path` is a directory with exactly `mode`, owned by `uid:gid`.
///
/// Creates the directory when missing and corrects mode or ownership when
/// they differ. A non-directory in the way is an error.
pub fn prepare_dir(path: &Path, mode: u32, uid: u32, gid: u32) -> StorageResult<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            match DirBuilder::new().mode(mode).create(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(StorageError::io_at("mkdir", path, e)),
            }
            fs::symlink_metadata(path).map_err(|e| StorageError::io_at("stat", path, e))?
        }
        Err(e) => return Err(StorageError::io_at("stat", path, e)),
    };

    if !meta.file_type().is_dir() {
        return Err(StorageError::io_at(
            "prepare",
            path,
            io::Error::from_raw_os_error(libc::ENOTDIR),
        ));
    }
    if meta.uid() != uid || meta.gid() != gid {
        chown(path, Some(uid), Some(gid)).map_err(|e| StorageError::io_at("chown", path, e))?;
    }
    if meta.mode() & MODE_MASK != mode {
        set_mode(path, mode).map_err(|e| StorageError::io_at("chmod", path, e))?;
    }
    Ok(())
}

/// Ensure `path` is a regular file with `mode`, owned by `uid:gid`.
pub fn prepare_file(path: &Path, mode: u32, uid: u32, gid: u32) -> StorageResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .mode(mode)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(|e| StorageError::io_at("open", path, e))?;
    let meta = file
        .metadata()
        .map_err(|e| StorageError::io_at("stat", path, e))?;
    if meta.uid() != uid || meta.gid() != gid {
        chown(path, Some(uid), Some(gid)).map_err(|e| StorageError::io_at("chown", path, e))?;
    }
    if meta.mode() & MODE_MASK != mode {
        set_mode(path, mode).map_err(|e| StorageError::io_at("chmod", path, e))?;
    }
    Ok(())
}

/// Ensure `parent/name` is a cache directory for `uid`, converging group and
/// mode of the whole subtree when a platform upgrade left them stale.
///
/// A directory owned by a different uid is refused.
pub fn prepare_app_cache_dir(
    parent: &Path,
    name: &str,
    target_mode: u32,
    uid: u32,
    gid: u32,
) -> StorageResult<()> {
    let path = parent.join(name);
    let meta = match fs::metadata(&path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return prepare_dir(&path, target_mode, uid, gid);
        }
        Err(e) => return Err(StorageError::io_at("stat", &path, e)),
    };

    if meta.uid() != uid {
        return Err(StorageError::io(
            format!(
                "mismatched uid at {}: found {} but expected {}",
                path.display(),
                meta.uid(),
                uid
            ),
            io::Error::from_raw_os_error(libc::EPERM),
        ));
    }
    if meta.gid() == gid && meta.mode() & MODE_MASK == target_mode {
        return Ok(());
    }
    debug!(
        path = %path.display(),
        found = meta.gid(),
        expected = gid,
        "mismatched cache gid/mode"
    );

    for entry in WalkDir::new(&path)
        .follow_links(false)
        .same_file_system(true)
        .contents_first(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to walk");
                continue;
            }
        };
        let file_type = entry.file_type();
        let result = if file_type.is_dir() {
            chown(entry.path(), None, Some(gid)).and_then(|_| set_mode(entry.path(), target_mode))
        } else if file_type.is_file() {
            chown(entry.path(), None, Some(gid))
        } else if file_type.is_symlink() {
            lchown(entry.path(), None, Some(gid))
        } else {
            Ok(())
        };
        if let Err(e) = result {
            warn!(path = %entry.path().display(), error = %e, "failed to fix cache entry");
        }
    }
    Ok(())
}

fn delete_contents(path: &Path) -> io::Result<()> {
    let mut first_err = None;
    for entry in fs::read_dir(path)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                first_err.get_or_insert(e);
                continue;
            }
        };
        let child = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let result = if is_dir {
            delete_contents(&child).and_then(|_| fs::remove_dir(&child))
        } else {
            fs::remove_file(&child)
        };
        if let Err(e) = result {
            error!(path = %child.display(), error = %e, "couldn't delete");
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Delete everything inside `path`, keeping `path` itself.
///
/// Keeps going past individual failures and reports the first one.
pub fn delete_dir_contents(path: &Path, ignore_if_missing: bool) -> StorageResult<()> {
    match delete_contents(path) {
        Err(e) if ignore_if_missing && e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io_at("delete contents of", path, e)),
        Ok(()) => Ok(()),
    }
}

/// Delete `path` and everything inside it.
pub fn delete_dir_contents_and_dir(path: &Path, ignore_if_missing: bool) -> StorageResult<()> {
    match delete_contents(path) {
        Err(e) if ignore_if_missing && e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            // Still try the directory so a partial failure leaves less behind.
            let _ = fs::remove_dir(path);
            return Err(StorageError::io_at("delete contents of", path, e));
        }
        Ok(()) => {}
    }
    fs::remove_dir(path).map_err(|e| StorageError::io_at("rmdir", path, e))
}

/// Filters applied by [`calculate_tree_size`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeFilter {
    /// Only count entries with this gid.
    pub include_gid: Option<u32>,
    /// Skip entries with this gid.
    pub exclude_gid: Option<u32>,
    /// Neither count nor descend into anything owned by an app, its cache
    /// gid or its shared gid.
    pub exclude_apps: bool,
}

impl TreeFilter {
    pub fn include(gid: Option<u32>) -> Self {
        Self {
            include_gid: gid,
            ..Self::default()
        }
    }

    pub fn exclude_apps() -> Self {
        Self {
            exclude_apps: true,
            ..Self::default()
        }
    }
}

fn is_app_owned(uid: u32, gid: u32) -> bool {
    let app_uid = get_app_id(uid);
    let app_gid = get_app_id(gid);
    (AID_APP_START..=AID_APP_END).contains(&app_uid)
        || (AID_CACHE_GID_START..=AID_CACHE_GID_END).contains(&app_gid)
        || (AID_SHARED_GID_START..=AID_SHARED_GID_END).contains(&app_gid)
}

/// Allocated bytes (`blocks * 512`) under `path`, including `path` itself.
///
/// A missing tree counts as zero; unreadable entries are logged and skipped.
pub fn calculate_tree_size(path: &Path, filter: TreeFilter) -> i64 {
    let mut size = 0i64;
    let mut it = WalkDir::new(path)
        .follow_links(false)
        .same_file_system(true)
        .into_iter();
    while let Some(entry) = it.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let missing = e
                    .io_error()
                    .map(|io| io.kind() == io::ErrorKind::NotFound)
                    .unwrap_or(false);
                if !missing {
                    warn!(path = %path.display(), error = %e, "failed to measure");
                }
                continue;
            }
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "failed to stat");
                continue;
            }
        };
        if filter.exclude_apps && is_app_owned(meta.uid(), meta.gid()) {
            if entry.file_type().is_dir() {
                it.skip_current_dir();
            }
            continue;
        }
        if filter.include_gid.is_some_and(|gid| gid != meta.gid()) {
            continue;
        }
        if filter.exclude_gid.is_some_and(|gid| gid == meta.gid()) {
            continue;
        }
        size += meta.blocks() as i64 * 512;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getegid, geteuid};
    use tempfile::TempDir;

    fn me() -> (u32, u32) {
        (geteuid().as_raw(), getegid().as_raw())
    }

    #[test]
    fn test_prepare_dir_creates_and_converges() {
        let tmp = TempDir::new().unwrap();
        let (uid, gid) = me();
        let dir = tmp.path().join("pkg");

        prepare_dir(&dir, 0o751, uid, gid).unwrap();
        assert_eq!(fs::metadata(&dir).unwrap().mode() & 0o7777, 0o751);

        set_mode(&dir, 0o777).unwrap();
        prepare_dir(&dir, 0o700, uid, gid).unwrap();
        assert_eq!(fs::metadata(&dir).unwrap().mode() & 0o7777, 0o700);

        // Idempotent.
        prepare_dir(&dir, 0o700, uid, gid).unwrap();
    }

    #[test]
    fn test_prepare_dir_refuses_file() {
        let tmp = TempDir::new().unwrap();
        let (uid, gid) = me();
        let path = tmp.path().join("file");
        fs::write(&path, b"x").unwrap();
        let err = prepare_dir(&path, 0o700, uid, gid).unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOTDIR));
    }

    #[test]
    fn test_prepare_file() {
        let tmp = TempDir::new().unwrap();
        let (uid, gid) = me();
        let path = tmp.path().join("primary.prof");
        prepare_file(&path, 0o600, uid, gid).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.mode() & 0o777, 0o600);
    }

    #[test]
    fn test_prepare_app_cache_dir_fixes_mode() {
        let tmp = TempDir::new().unwrap();
        let (uid, gid) = me();
        let cache = tmp.path().join("cache");
        fs::create_dir_all(cache.join("sub")).unwrap();
        set_mode(&cache, 0o771).unwrap();
        set_mode(&cache.join("sub"), 0o700).unwrap();

        prepare_app_cache_dir(tmp.path(), "cache", 0o2771, uid, gid).unwrap();
        assert_eq!(fs::metadata(&cache).unwrap().mode() & 0o7777, 0o2771);
        assert_eq!(fs::metadata(cache.join("sub")).unwrap().mode() & 0o7777, 0o2771);
    }

    #[test]
    fn test_prepare_app_cache_dir_rejects_foreign_uid() {
        let tmp = TempDir::new().unwrap();
        let (uid, gid) = me();
        fs::create_dir(tmp.path().join("cache")).unwrap();
        assert!(prepare_app_cache_dir(tmp.path(), "cache", 0o2771, uid + 1, gid).is_err());
    }

    #[test]
    fn test_delete_dir_contents() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("pkg");
        fs::create_dir_all(dir.join("a/b")).unwrap();
        fs::write(dir.join("a/b/f"), b"x").unwrap();
        fs::write(dir.join("top"), b"x").unwrap();
        std::os::unix::fs::symlink(tmp.path(), dir.join("link")).unwrap();

        delete_dir_contents(&dir, false).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        // The symlink target survives.
        assert!(tmp.path().is_dir());

        delete_dir_contents_and_dir(&dir, false).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_delete_missing() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("missing");
        delete_dir_contents(&missing, true).unwrap();
        delete_dir_contents_and_dir(&missing, true).unwrap();
        assert!(delete_dir_contents(&missing, false).is_err());
    }

    #[test]
    fn test_calculate_tree_size() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tree");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("sub/f"), vec![1u8; 8192]).unwrap();

        let all = calculate_tree_size(&dir, TreeFilter::default());
        assert!(all >= 8192);
        assert_eq!(calculate_tree_size(&tmp.path().join("missing"), TreeFilter::default()), 0);

        let (_, gid) = me();
        assert_eq!(calculate_tree_size(&dir, TreeFilter::include(Some(gid))), all);
        assert_eq!(calculate_tree_size(&dir, TreeFilter::include(Some(gid + 1))), 0);
        let excluded = TreeFilter {
            exclude_gid: Some(gid),
            ..TreeFilter::default()
        };
        assert_eq!(calculate_tree_size(&dir, excluded), 0);
    }
}
