//! Security labelling collaborator.
//!
//! Labelling is a black box to the service: it asks for a tree to be
//! relabelled and only observes success or failure, plus the top-level
//! context so it can skip recursive passes when nothing changed.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::xattr;

/// Assigns security contexts to directory trees.
pub trait Labeler: Send + Sync {
    /// Current context of `path` itself.
    fn file_context(&self, path: &Path) -> io::Result<String>;

    /// Relabel a package directory for the app identified by `se_info`/`uid`.
    fn restorecon_pkgdir(&self, path: &Path, se_info: &str, uid: u32, recursive: bool) -> io::Result<()>;

    /// Relabel an arbitrary path from the file-contexts policy.
    fn restorecon(&self, path: &Path, recursive: bool) -> io::Result<()>;
}

/// Labeler for hosts without SELinux.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLabeler;

impl Labeler for NoopLabeler {
    fn file_context(&self, _path: &Path) -> io::Result<String> {
        Ok(String::new())
    }

    fn restorecon_pkgdir(&self, _path: &Path, _se_info: &str, _uid: u32, _recursive: bool) -> io::Result<()> {
        Ok(())
    }

    fn restorecon(&self, _path: &Path, _recursive: bool) -> io::Result<()> {
        Ok(())
    }
}

/// Labeler backed by a `restorecon` binary and the `security.selinux` xattr.
#[derive(Debug, Clone)]
pub struct CommandLabeler {
    program: PathBuf,
}

impl CommandLabeler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, path: &Path, recursive: bool) -> io::Result<()> {
        let mut cmd = Command::new(&self.program);
        if recursive {
            cmd.arg("-R");
        }
        let status = cmd.arg(path).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {}", self.program.display(), status),
            ))
        }
    }
}

impl Default for CommandLabeler {
    fn default() -> Self {
        Self::new("/system/bin/restorecon")
    }
}

impl Labeler for CommandLabeler {
    fn file_context(&self, path: &Path) -> io::Result<String> {
        let raw = xattr::get(path, xattr::XATTR_SELINUX)?.unwrap_or_default();
        let context = String::from_utf8_lossy(&raw);
        Ok(context.trim_end_matches('\0').to_string())
    }

    fn restorecon_pkgdir(&self, path: &Path, _se_info: &str, _uid: u32, recursive: bool) -> io::Result<()> {
        self.run(path, recursive)
    }

    fn restorecon(&self, path: &Path, recursive: bool) -> io::Result<()> {
        self.run(path, recursive)
    }
}

/// Relabel `path`, recursing only when the top-level label changed.
///
/// Labels only change across policy upgrades, so the common case costs a
/// single non-recursive relabel.
pub fn restorecon_lazy(
    labeler: &dyn Labeler,
    path: &Path,
    se_info: &str,
    uid: u32,
    existing: bool,
) -> StorageResult<()> {
    let before = labeler
        .file_context(path)
        .map_err(|e| StorageError::io_at("read context before relabel of", path, e))?;
    labeler
        .restorecon_pkgdir(path, se_info, uid, false)
        .map_err(|e| StorageError::io_at("restorecon", path, e))?;
    let after = labeler
        .file_context(path)
        .map_err(|e| StorageError::io_at("read context after relabel of", path, e))?;

    if before != after {
        if existing {
            debug!(path = %path.display(), %before, %after, "label changed; running recursive restorecon");
        }
        labeler
            .restorecon_pkgdir(path, se_info, uid, true)
            .map_err(|e| StorageError::io_at("recursively restorecon", path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingLabeler;

    #[test]
    fn test_lazy_skips_recursion_when_unchanged() {
        let labeler = RecordingLabeler::new();
        restorecon_lazy(&labeler, Path::new("/data/user/0/com.foo"), "default", 10050, true).unwrap();
        assert_eq!(labeler.recursive_calls(), 0);
        assert_eq!(labeler.calls().len(), 1);
    }

    #[test]
    fn test_lazy_recurses_on_label_change() {
        let labeler = RecordingLabeler::new();
        labeler.relabel_next_to("u:object_r:app_data_file:s0");
        restorecon_lazy(&labeler, Path::new("/data/user/0/com.foo"), "default", 10050, true).unwrap();
        assert_eq!(labeler.recursive_calls(), 1);
    }
}
