//! Free-space probing.

use std::io;
use std::path::Path;

use nix::sys::statvfs::statvfs;

/// Reports available bytes on the filesystem holding a path.
pub trait FreeSpace: Send + Sync {
    fn free_bytes(&self, path: &Path) -> io::Result<i64>;
}

/// `statvfs(2)`: blocks available to unprivileged users times fragment size.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsFreeSpace;

impl FreeSpace for StatvfsFreeSpace {
    fn free_bytes(&self, path: &Path) -> io::Result<i64> {
        let stat = statvfs(path)?;
        Ok(stat.blocks_available() as i64 * stat.fragment_size() as i64)
    }
}

impl<F> FreeSpace for F
where
    F: Fn(&Path) -> io::Result<i64> + Send + Sync,
{
    fn free_bytes(&self, path: &Path) -> io::Result<i64> {
        self(path)
    }
}

/// Total bytes and inodes of the filesystem holding `path`.
pub fn filesystem_totals(path: &Path) -> io::Result<(u64, u64)> {
    let stat = statvfs(path)?;
    Ok((
        stat.blocks() as u64 * stat.fragment_size() as u64,
        stat.files() as u64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_statvfs_reports_space() {
        let tmp = TempDir::new().unwrap();
        let free = StatvfsFreeSpace.free_bytes(tmp.path()).unwrap();
        assert!(free >= 0);
        let (bytes, _) = filesystem_totals(tmp.path()).unwrap();
        assert!(bytes as i64 >= free);
    }

    #[test]
    fn test_closure_free_space() {
        let free = |_: &Path| -> io::Result<i64> { Ok(42) };
        assert_eq!(free.free_bytes(Path::new("/")).unwrap(), 42);
    }
}
