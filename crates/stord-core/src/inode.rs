//! Inode-indirection resolver.
//!
//! A parent directory records the inode of a named child in an xattr so the
//! child stays locatable after its visible name is rotated.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::paths::find_child_with_inode;
use crate::xattr;

/// Inode of `path`, following symlinks.
pub fn get_path_inode(path: &Path) -> io::Result<u64> {
    fs::metadata(path).map(|m| m.ino())
}

/// Record the inode of `parent/name` in the `key` xattr on `parent`.
///
/// A missing child is not an error, nor is a filesystem without xattr
/// support. Skips the write when the recorded value is already current.
pub fn write_child_inode(parent: &Path, name: &str, key: &str) -> StorageResult<()> {
    let path = parent.join(name);
    let inode = match get_path_inode(&path) {
        Ok(inode) => inode,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no child to record");
            return Ok(());
        }
    };

    match xattr::get_u64(parent, key) {
        Ok(Some(recorded)) if recorded == inode => return Ok(()),
        Ok(Some(recorded)) => {
            warn!(
                path = %parent.display(),
                key,
                found = inode,
                recorded,
                "mismatched inode value; overwriting"
            );
        }
        Ok(None) => {}
        Err(e) if xattr::is_unsupported(&e) => return Ok(()),
        Err(e) => debug!(path = %parent.display(), key, error = %e, "failed to read xattr"),
    }

    match xattr::set_u64(parent, key, inode) {
        Ok(()) => Ok(()),
        Err(e) if xattr::is_unsupported(&e) => Ok(()),
        Err(e) => Err(StorageError::io(
            format!("failed to write xattr {} at {}", key, parent.display()),
            e,
        )),
    }
}

/// Currently valid path of the child recorded under `key` on `parent`.
///
/// Falls back to `parent/name` when nothing is recorded or when no entry in
/// `parent` carries the recorded inode.
pub fn resolve_child_by_inode(parent: &Path, name: &str, key: &str) -> PathBuf {
    let fallback = parent.join(name);
    let inode = match xattr::get_u64(parent, key) {
        Ok(Some(inode)) if inode != 0 => inode,
        _ => return fallback,
    };
    match find_child_with_inode(parent, inode) {
        Some(resolved) => {
            if resolved != fallback {
                debug!(resolved = %resolved.display(), inode, "resolved rotated child");
            }
            resolved
        }
        None => {
            warn!(inode, fallback = %fallback.display(), "failed to resolve inode");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xattr::XATTR_INODE_CACHE;
    use tempfile::TempDir;

    fn xattrs_supported(dir: &Path) -> bool {
        match xattr::set(dir, "user.support_check", b"1") {
            Ok(()) => true,
            Err(e) if xattr::is_unsupported(&e) => false,
            Err(e) => panic!("xattr support check failed: {}", e),
        }
    }

    #[test]
    fn test_missing_child_is_noop() {
        let tmp = TempDir::new().unwrap();
        write_child_inode(tmp.path(), "cache", XATTR_INODE_CACHE).unwrap();
        assert_eq!(xattr::get_u64(tmp.path(), XATTR_INODE_CACHE).ok().flatten(), None);
        assert_eq!(
            resolve_child_by_inode(tmp.path(), "cache", XATTR_INODE_CACHE),
            tmp.path().join("cache")
        );
    }

    #[test]
    fn test_resolves_after_rotation() {
        let tmp = TempDir::new().unwrap();
        let parent = tmp.path().join("com.foo");
        fs::create_dir_all(parent.join("cache")).unwrap();
        if !xattrs_supported(&parent) {
            return;
        }
        let inode = get_path_inode(&parent.join("cache")).unwrap();

        write_child_inode(&parent, "cache", XATTR_INODE_CACHE).unwrap();
        // Rotate both the parent and the child names.
        let rotated = tmp.path().join("Xk2p9Q");
        fs::rename(&parent, &rotated).unwrap();
        fs::rename(rotated.join("cache"), rotated.join("aGVsbG8")).unwrap();

        let resolved = resolve_child_by_inode(&rotated, "cache", XATTR_INODE_CACHE);
        assert_eq!(resolved, rotated.join("aGVsbG8"));
        assert_eq!(get_path_inode(&resolved).unwrap(), inode);
    }

    #[test]
    fn test_stale_pointer_falls_back_and_rewrites() {
        let tmp = TempDir::new().unwrap();
        let parent = tmp.path();
        fs::create_dir(parent.join("cache")).unwrap();
        if !xattrs_supported(parent) {
            return;
        }
        xattr::set_u64(parent, XATTR_INODE_CACHE, u64::MAX - 1).unwrap();
        assert_eq!(
            resolve_child_by_inode(parent, "cache", XATTR_INODE_CACHE),
            parent.join("cache")
        );

        write_child_inode(parent, "cache", XATTR_INODE_CACHE).unwrap();
        assert_eq!(
            xattr::get_u64(parent, XATTR_INODE_CACHE).unwrap(),
            Some(get_path_inode(&parent.join("cache")).unwrap())
        );
    }
}
