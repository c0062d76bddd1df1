//! Cache items: the unit of deletion.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::walk::{self, Entry, Visit, Visitor};
use crate::xattr::{self, XATTR_CACHE_GROUP, XATTR_CACHE_TOMBSTONE};

/// A file or directory that may be deleted to reclaim space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub path: PathBuf,
    /// Allocated bytes reclaimed by purging; a group covers its whole tree.
    pub size: i64,
    /// Newest mtime (seconds) of the item and anything below it.
    pub modified: i64,
    /// Depth below the cache directory, starting at 1.
    pub level: usize,
    pub directory: bool,
    /// Purged as a single unit with everything below it.
    pub group: bool,
    /// Files are truncated instead of unlinked.
    pub tombstone: bool,
}

impl CacheItem {
    /// Delete the item from disk.
    ///
    /// Directories are removed with their contents; files inside tombstone
    /// directories are truncated to zero instead. Individual failures are
    /// logged and skipped.
    pub fn purge(&self) -> io::Result<()> {
        if !self.directory {
            return if self.tombstone {
                truncate(&self.path)
            } else {
                fs::remove_file(&self.path)
            };
        }
        let mut purger = Purger;
        walk::walk(&self.path, self.tombstone, &mut purger)
    }
}

fn truncate(path: &Path) -> io::Result<()> {
    fs::OpenOptions::new().write(true).open(path)?.set_len(0)
}

/// Post-order deletion; the context says whether files are tombstoned.
struct Purger;

impl Visitor for Purger {
    type Context = bool;

    fn enter(&mut self, entry: &Entry<'_>, tombstone: &bool) -> Visit<bool> {
        if entry.is_dir() {
            let tombstone = if entry.depth == 0 {
                *tombstone
            } else {
                *tombstone || xattr::has(entry.path, XATTR_CACHE_TOMBSTONE)
            };
            return Visit::Descend(tombstone);
        }
        let result = if entry.metadata.file_type().is_file() && *tombstone {
            truncate(entry.path)
        } else {
            fs::remove_file(entry.path)
        };
        if let Err(e) = result {
            warn!(path = %entry.path.display(), error = %e, "failed to purge");
        }
        Visit::Skip
    }

    fn leave(&mut self, entry: &Entry<'_>, _tombstone: bool) {
        if let Err(e) = fs::remove_dir(entry.path) {
            // Tombstoned files keep their directories alive.
            debug!(path = %entry.path.display(), error = %e, "failed to rmdir");
        }
    }
}

/// One directory frame on the loader's stack.
struct Frame {
    /// Index into `items`, or `None` for the cache root.
    index: Option<usize>,
}

/// Collects items below a cache directory in discovery order.
#[derive(Default)]
struct Loader {
    items: Vec<CacheItem>,
    stack: Vec<Frame>,
}

impl Loader {
    fn bubble_modified(&mut self, modified: i64) {
        if let Some(Frame { index: Some(parent) }) = self.stack.last() {
            let parent = &mut self.items[*parent];
            parent.modified = parent.modified.max(modified);
        }
    }
}

/// Inherited per-branch state: whether we're below a group or tombstone.
#[derive(Clone, Copy, Default)]
struct Inherited {
    group: bool,
    tombstone: bool,
}

impl Visitor for Loader {
    type Context = Inherited;

    fn enter(&mut self, entry: &Entry<'_>, parent: &Inherited) -> Visit<Inherited> {
        if entry.depth == 0 {
            self.stack.push(Frame { index: None });
            return Visit::Descend(Inherited::default());
        }

        let mut item = CacheItem {
            path: entry.path.to_path_buf(),
            size: entry.metadata.blocks() as i64 * 512,
            modified: entry.metadata.mtime(),
            level: entry.depth,
            directory: entry.is_dir(),
            group: parent.group,
            tombstone: parent.tombstone,
        };

        if !item.directory {
            self.bubble_modified(item.modified);
            self.items.push(item);
            return Visit::Skip;
        }

        item.group |= xattr::has(entry.path, XATTR_CACHE_GROUP);
        item.tombstone |= xattr::has(entry.path, XATTR_CACHE_TOMBSTONE);
        if item.group {
            // The whole tree becomes one item.
            for child in walkdir::WalkDir::new(entry.path)
                .min_depth(1)
                .follow_links(false)
                .same_file_system(true)
                .into_iter()
                .flatten()
            {
                if let Ok(meta) = child.metadata() {
                    item.size += meta.blocks() as i64 * 512;
                    item.modified = item.modified.max(meta.mtime());
                }
            }
            self.bubble_modified(item.modified);
            self.items.push(item);
            return Visit::Skip;
        }

        let inherited = Inherited {
            group: item.group,
            tombstone: item.tombstone,
        };
        self.items.push(item);
        self.stack.push(Frame {
            index: Some(self.items.len() - 1),
        });
        Visit::Descend(inherited)
    }

    fn leave(&mut self, _entry: &Entry<'_>, _context: Inherited) {
        if let Some(Frame { index: Some(index) }) = self.stack.pop() {
            let modified = self.items[index].modified;
            self.bubble_modified(modified);
        }
    }
}

/// Every entry below `cache_dir` as a deletion candidate.
///
/// Directories carry the newest mtime found beneath them. A missing
/// directory yields nothing.
pub fn load_items(cache_dir: &Path) -> Vec<CacheItem> {
    let mut loader = Loader::default();
    if let Err(e) = walk::walk(cache_dir, Inherited::default(), &mut loader) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %cache_dir.display(), error = %e, "failed to load cache items");
        }
    }
    loader.items
}

/// Order items newest first so the oldest can be popped from the back.
///
/// Ties put shallower entries and directories earlier, so deeper entries
/// and files go first.
pub(crate) fn sort_items(items: &mut [CacheItem]) {
    items.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then(a.level.cmp(&b.level))
            .then(b.directory.cmp(&a.directory))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    fn write(path: &Path, len: usize, mtime: i64) {
        fs::write(path, vec![7u8; len]).unwrap();
        set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    #[test]
    fn test_load_and_sort_items() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        fs::create_dir_all(cache.join("dir")).unwrap();
        write(&cache.join("old"), 4096, 1_000);
        write(&cache.join("new"), 4096, 3_000);
        write(&cache.join("dir/inner"), 4096, 2_000);
        set_file_mtime(cache.join("dir"), FileTime::from_unix_time(500, 0)).unwrap();

        let mut items = load_items(&cache);
        assert_eq!(items.len(), 4);
        let dir = items.iter().find(|i| i.path.ends_with("dir")).unwrap();
        assert!(dir.directory);
        // Directory mtime bubbles up from its newest child.
        assert_eq!(dir.modified, 2_000);

        sort_items(&mut items);
        let order: Vec<_> = items
            .iter()
            .map(|i| i.path.strip_prefix(&cache).unwrap().to_path_buf())
            .collect();
        // Popped from the back: old, then inner (deeper) before dir, then new.
        assert_eq!(
            order,
            vec![
                PathBuf::from("new"),
                PathBuf::from("dir"),
                PathBuf::from("dir/inner"),
                PathBuf::from("old"),
            ]
        );
    }

    #[test]
    fn test_missing_cache_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(load_items(&tmp.path().join("nope")).is_empty());
    }

    #[test]
    fn test_group_is_single_item() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        let group = cache.join("bundle");
        fs::create_dir_all(group.join("nested")).unwrap();
        if xattr::set(&group, XATTR_CACHE_GROUP, b"").is_err() {
            return;
        }
        write(&group.join("a"), 4096, 100);
        write(&group.join("nested/b"), 4096, 900);

        let items = load_items(&cache);
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert!(item.group);
        assert!(item.size >= 8192);
        assert!(item.modified >= 900);

        item.purge().unwrap();
        assert!(!group.exists());
    }

    #[test]
    fn test_tombstone_truncates() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        let dir = cache.join("keep");
        fs::create_dir_all(&dir).unwrap();
        if xattr::set(&dir, XATTR_CACHE_TOMBSTONE, b"").is_err() {
            return;
        }
        write(&dir.join("f"), 4096, 100);

        let items = load_items(&cache);
        let file = items.iter().find(|i| i.path.ends_with("f")).unwrap();
        assert!(file.tombstone);
        file.purge().unwrap();
        assert_eq!(fs::metadata(dir.join("f")).unwrap().len(), 0);

        let dir_item = items.iter().find(|i| i.path.ends_with("keep")).unwrap();
        dir_item.purge().unwrap();
        assert!(dir.join("f").exists());
    }

    #[test]
    fn test_purge_plain_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cache/d");
        fs::create_dir_all(dir.join("e")).unwrap();
        write(&dir.join("e/f"), 10, 1);
        let item = CacheItem {
            path: dir.clone(),
            size: 0,
            modified: 0,
            level: 1,
            directory: true,
            group: false,
            tombstone: false,
        };
        item.purge().unwrap();
        assert!(!dir.exists());
    }
}
