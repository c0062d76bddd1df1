//! Ownership convergence for package data trees.
//!
//! Cache directories used to share the app's gid; they now belong to a
//! dedicated cache gid with setgid set. A fixup pass walks every package
//! directory and moves each entry to the gid its class expects. Entries that
//! already match are pruned along with their subtrees unless forced, so a
//! converged tree costs one visit per package child.

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::{chown, lchown, MetadataExt, PermissionsExt};
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::fsutil::CACHE_DIR_MODE;
use crate::identity::cache_gid_or_uid;
use crate::paths::file_name_str;
use crate::walk::{self, Entry, Visit, Visitor};
use crate::xattr::{self, XATTR_INODE_CACHE, XATTR_INODE_CODE_CACHE};

/// Counters of one fixup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FixupReport {
    /// Entries looked at.
    pub visited: u64,
    /// Entries whose gid was corrected.
    pub fixed: u64,
    /// Mismatched entries left alone because their gid belongs to someone
    /// other than the app.
    pub ignored: u64,
}

impl FixupReport {
    fn absorb(&mut self, other: FixupReport) {
        self.visited += other.visited;
        self.fixed += other.fixed;
        self.ignored += other.ignored;
    }
}

/// What a node tells its children.
#[derive(Debug, Clone, Copy)]
enum Class {
    /// A user root; children are package directories.
    Root,
    /// A package directory; children are classified by name and inode.
    Package {
        uid: u32,
        inode_cache: u64,
        inode_code_cache: u64,
    },
    /// Anything deeper. `uid` is this node's owner, `repair` is set when the
    /// node itself still needs its gid moved on the way back up.
    Tree {
        expected: u32,
        uid: u32,
        repair: Option<Repair>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Repair {
    expected: u32,
    to_cache: bool,
}

struct Fixer {
    force: bool,
    report: FixupReport,
}

fn recorded_inode(path: &Path, key: &str) -> u64 {
    xattr::get_u64(path, key).ok().flatten().unwrap_or(0)
}

fn set_gid(path: &Path, gid: u32, symlink: bool) -> io::Result<()> {
    if symlink {
        lchown(path, None, Some(gid))
    } else {
        chown(path, None, Some(gid))
    }
}

impl Fixer {
    fn repair_dir(&mut self, path: &Path, repair: Repair) {
        info!(path = %path.display(), gid = repair.expected, "fixing directory gid");
        if let Err(e) = set_gid(path, repair.expected, false) {
            warn!(path = %path.display(), error = %e, "failed to chown");
        }
        if repair.to_cache {
            if let Err(e) = fs::set_permissions(path, Permissions::from_mode(CACHE_DIR_MODE)) {
                warn!(path = %path.display(), error = %e, "failed to chmod");
            }
        }
        self.report.fixed += 1;
    }
}

impl Visitor for Fixer {
    type Context = Class;

    fn enter(&mut self, entry: &Entry<'_>, parent: &Class) -> Visit<Class> {
        self.report.visited += 1;
        let meta = entry.metadata;

        let (expected, uid) = match *parent {
            Class::Root if entry.depth == 0 => return Visit::Descend(Class::Root),
            Class::Root => {
                if !entry.is_dir() {
                    return Visit::Skip;
                }
                return Visit::Descend(Class::Package {
                    uid: meta.uid(),
                    inode_cache: recorded_inode(entry.path, XATTR_INODE_CACHE),
                    inode_code_cache: recorded_inode(entry.path, XATTR_INODE_CODE_CACHE),
                });
            }
            Class::Package {
                uid,
                inode_cache,
                inode_code_cache,
            } => {
                let name = file_name_str(entry.path);
                let is_cache = meta.ino() == inode_cache
                    || meta.ino() == inode_code_cache
                    || name == Some("cache")
                    || name == Some("code_cache");
                let expected = if is_cache { cache_gid_or_uid(uid) } else { uid };
                (expected, uid)
            }
            Class::Tree { expected, uid, .. } => (expected, uid),
        };

        let cache_gid = cache_gid_or_uid(uid);
        let actual = meta.gid();
        let mut child = Class::Tree {
            expected,
            uid: meta.uid(),
            repair: None,
        };

        if actual == expected {
            if !self.force {
                return Visit::Skip;
            }
        } else if actual == uid || actual == cache_gid {
            if entry.is_dir() {
                // Fixed after the children, on the way back up.
                child = Class::Tree {
                    expected,
                    uid: meta.uid(),
                    repair: Some(Repair {
                        expected,
                        to_cache: expected == cache_gid,
                    }),
                };
            } else {
                info!(path = %entry.path.display(), actual, expected, "fixing gid");
                match set_gid(entry.path, expected, entry.is_symlink()) {
                    Ok(()) => self.report.fixed += 1,
                    Err(e) => warn!(path = %entry.path.display(), error = %e, "failed to chown"),
                }
                return Visit::Skip;
            }
        } else {
            warn!(path = %entry.path.display(), actual, expected, "ignoring unexpected gid");
            self.report.ignored += 1;
        }

        if entry.is_dir() {
            Visit::Descend(child)
        } else {
            Visit::Skip
        }
    }

    fn leave(&mut self, entry: &Entry<'_>, context: Class) {
        if let Class::Tree {
            repair: Some(repair),
            ..
        } = context
        {
            self.repair_dir(entry.path, repair);
        }
    }
}

/// Converge every package directory under one user root.
///
/// `force` disables pruning of already-correct subtrees. A missing root is
/// not an error.
pub fn fixup_user_root(root: &Path, force: bool) -> FixupReport {
    let mut fixer = Fixer {
        force,
        report: FixupReport::default(),
    };
    if let Err(e) = walk::walk(root, Class::Root, &mut fixer) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %root.display(), error = %e, "failed to walk");
        }
    }
    fixer.report
}

/// [`fixup_user_root`] across several roots.
pub fn fixup_roots<'a>(roots: impl IntoIterator<Item = &'a Path>, force: bool) -> FixupReport {
    let mut report = FixupReport::default();
    for root in roots {
        report.absorb(fixup_user_root(root, force));
    }
    report
}
