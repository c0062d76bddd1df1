//! Physical tree traversal with per-node pruning.
//!
//! Every tree walk in the service has the same shape: visit a node, classify
//! it, optionally prune its subtree and hand a classification down to its
//! children. [`walk`] drives that shape; the classification travels as a
//! value passed from parent to child on the call stack.
//!
//! Symlinks are never followed and the walk does not cross into other
//! filesystems.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::warn;

/// What to do after entering a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visit<C> {
    /// Walk the children (directories only), handing them this context.
    Descend(C),
    /// Do not walk below this node.
    Skip,
}

/// A node reported to a [`Visitor`].
#[derive(Debug)]
pub struct Entry<'a> {
    pub path: &'a Path,
    /// 0 for the walk root.
    pub depth: usize,
    /// `lstat` of the node.
    pub metadata: &'a Metadata,
}

impl Entry<'_> {
    pub fn is_dir(&self) -> bool {
        self.metadata.file_type().is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.metadata.file_type().is_symlink()
    }
}

/// Callbacks driven by [`walk`].
pub trait Visitor {
    type Context;

    /// Called before a node's children; `parent` is the context its parent
    /// descended with (the root context for the walk root).
    fn enter(&mut self, entry: &Entry<'_>, parent: &Self::Context) -> Visit<Self::Context>;

    /// Called after all children of a directory that was descended into.
    fn leave(&mut self, _entry: &Entry<'_>, _context: Self::Context) {}

    /// Called for nodes below the root that could not be read.
    fn error(&mut self, path: &Path, err: &io::Error) {
        warn!(path = %path.display(), error = %err, "failed to walk");
    }
}

/// Walk the tree at `root`. Fails only when `root` itself can't be read.
pub fn walk<V: Visitor>(root: &Path, context: V::Context, visitor: &mut V) -> io::Result<()> {
    let metadata = fs::symlink_metadata(root)?;
    let device = metadata.dev();
    visit(root, 0, &metadata, device, &context, visitor);
    Ok(())
}

fn visit<V: Visitor>(
    path: &Path,
    depth: usize,
    metadata: &Metadata,
    device: u64,
    parent: &V::Context,
    visitor: &mut V,
) {
    let entry = Entry {
        path,
        depth,
        metadata,
    };
    let context = match visitor.enter(&entry, parent) {
        Visit::Descend(context) => context,
        Visit::Skip => return,
    };
    if !entry.is_dir() || metadata.dev() != device {
        return;
    }

    match fs::read_dir(path) {
        Ok(children) => {
            for child in children {
                let child = match child {
                    Ok(child) => child,
                    Err(e) => {
                        visitor.error(path, &e);
                        continue;
                    }
                };
                let child_path = child.path();
                match fs::symlink_metadata(&child_path) {
                    Ok(child_meta) => {
                        visit(&child_path, depth + 1, &child_meta, device, &context, visitor)
                    }
                    Err(e) => visitor.error(&child_path, &e),
                }
            }
        }
        Err(e) => visitor.error(path, &e),
    }
    visitor.leave(&entry, context);
}
