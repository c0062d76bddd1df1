//! Extended attribute access on paths.
//!
//! Thin wrappers over the `xattr` crate. Attributes are read from the entry
//! itself, never a symlink target; callers only ever address directories and
//! regular files.

use std::io;
use std::path::Path;

/// Inode of a package's `cache` directory, recorded on the package root.
pub const XATTR_INODE_CACHE: &str = "user.inode_cache";
/// Inode of a package's `code_cache` directory, recorded on the package root.
pub const XATTR_INODE_CODE_CACHE: &str = "user.inode_code_cache";
/// Marks the storage class that became the default after a migration.
pub const XATTR_DEFAULT: &str = "user.default";
/// Marks a cache directory whose contents are purged as one item.
pub const XATTR_CACHE_GROUP: &str = "user.cache_group";
/// Marks cache files that are truncated rather than unlinked.
pub const XATTR_CACHE_TOMBSTONE: &str = "user.cache_tombstone";
/// SELinux security context.
pub const XATTR_SELINUX: &str = "security.selinux";

/// Whether the error means the attribute simply isn't there.
pub fn is_missing(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENODATA)
}

/// Whether the error means the filesystem has no xattr support.
pub fn is_unsupported(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EOPNOTSUPP))
}

/// Read the raw value of `name`, or `None` when it is absent.
pub fn get(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    match ::xattr::get(path, name) {
        Ok(value) => Ok(value),
        Err(e) if is_missing(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Set `name` to `value`, creating or replacing it.
pub fn set(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    ::xattr::set(path, name, value)
}

/// Whether `name` is present on `path`. Unreadable attributes count as absent.
pub fn has(path: &Path, name: &str) -> bool {
    matches!(get(path, name), Ok(Some(_)))
}

/// Read a native-endian 64-bit value; wrong-sized values count as absent.
pub fn get_u64(path: &Path, name: &str) -> io::Result<Option<u64>> {
    Ok(get(path, name)?.and_then(|raw| {
        <[u8; 8]>::try_from(raw.as_slice())
            .ok()
            .map(u64::from_ne_bytes)
    }))
}

/// Write a native-endian 64-bit value.
pub fn set_u64(path: &Path, name: &str, value: u64) -> io::Result<()> {
    set(path, name, &value.to_ne_bytes())
}
