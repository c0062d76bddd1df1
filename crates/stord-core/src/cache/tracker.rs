//! Per-owner cache accounting.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::item::{load_items, sort_items, CacheItem};
use crate::fsutil::{calculate_tree_size, TreeFilter};
use crate::identity::{
    app_uid_for_ext_gid, get_app_id, get_ext_cache_gid, get_cache_gid, get_uid, get_user_id,
    AID_MEDIA_RW,
};
use crate::inode::resolve_child_by_inode;
use crate::quota::{QuotaKind, QuotaSource};
use crate::xattr::{XATTR_INODE_CACHE, XATTR_INODE_CODE_CACHE};

/// Fixed-point scale of [`CacheTracker::cache_ratio`]; 100% of quota.
pub const RATIO_SCALE: i64 = 10_000;

/// Cache usage of one `(user, appId)` owner across all of its data
/// directories.
#[derive(Debug, Clone)]
pub struct CacheTracker {
    user: u32,
    app_id: u32,
    data_paths: Vec<PathBuf>,
    pub cache_quota: i64,
    pub cache_used: i64,
    items: Vec<CacheItem>,
    items_loaded: bool,
}

impl CacheTracker {
    pub fn new(user: u32, app_id: u32, cache_quota: i64) -> Self {
        Self {
            user,
            app_id,
            data_paths: Vec::new(),
            cache_quota,
            cache_used: 0,
            items: Vec::new(),
            items_loaded: false,
        }
    }

    pub fn user(&self) -> u32 {
        self.user
    }

    pub fn app_id(&self) -> u32 {
        self.app_id
    }

    pub fn uid(&self) -> u32 {
        get_uid(self.user, self.app_id)
    }

    /// Register a package data directory owned by this app.
    pub fn add_data_path(&mut self, path: impl Into<PathBuf>) {
        self.data_paths.push(path.into());
    }

    pub fn data_paths(&self) -> &[PathBuf] {
        &self.data_paths
    }

    /// Current `cache` and `code_cache` directories of every data path,
    /// resolved through the recorded inodes.
    pub fn cache_dirs(&self) -> Vec<PathBuf> {
        self.data_paths
            .iter()
            .flat_map(|path| {
                [
                    resolve_child_by_inode(path, "cache", XATTR_INODE_CACHE),
                    resolve_child_by_inode(path, "code_cache", XATTR_INODE_CODE_CACHE),
                ]
            })
            .collect()
    }

    /// Measure `cache_used`, preferring quota accounting.
    pub fn load_stats(&mut self, quota: Option<QuotaSource<'_>>) {
        if let Some(quota) = quota {
            if let Some(used) = self.load_quota_stats(quota) {
                self.cache_used = used;
                return;
            }
        }
        self.cache_used = self
            .cache_dirs()
            .iter()
            .map(|dir| calculate_tree_size(dir, TreeFilter::default()))
            .sum();
    }

    fn load_quota_stats(&self, quota: QuotaSource<'_>) -> Option<i64> {
        let cache_gid = get_cache_gid(self.user, self.app_id)?;
        let ext_cache_gid = get_ext_cache_gid(self.user, self.app_id)?;
        let cache = quota.used(QuotaKind::Group, cache_gid)?;
        let ext_cache = quota.used(QuotaKind::Group, ext_cache_gid)?;
        Some(cache + ext_cache)
    }

    /// Cache usage relative to quota, where [`RATIO_SCALE`] is 100%.
    ///
    /// A zero quota reports 0 so such owners are never preferred.
    pub fn cache_ratio(&self) -> i64 {
        if self.cache_quota == 0 {
            0
        } else {
            self.cache_used.saturating_mul(RATIO_SCALE) / self.cache_quota
        }
    }

    /// Load and sort deletion candidates on first use.
    pub fn ensure_items(&mut self) {
        if self.items_loaded {
            return;
        }
        self.items = self
            .cache_dirs()
            .iter()
            .flat_map(|dir| load_items(dir))
            .collect();
        sort_items(&mut self.items);
        self.items_loaded = true;
        debug!(uid = self.uid(), items = self.items.len(), "loaded cache items");
    }

    pub fn items_remaining(&self) -> usize {
        self.items.len()
    }

    /// Take the oldest remaining item.
    pub fn pop_item(&mut self) -> Option<CacheItem> {
        self.items.pop()
    }
}

/// Owner uid of a level-1 data directory.
///
/// External storage is owned by media_rw; its real owner is encoded in the
/// gid. Returns `None` for directories that can't be attributed to an app.
fn owner_uid(uid: u32, gid: u32) -> Option<u32> {
    if get_app_id(uid) == AID_MEDIA_RW {
        app_uid_for_ext_gid(gid)
    } else {
        Some(uid)
    }
}

/// Build one tracker per owner found in the level-1 directories of `roots`.
///
/// Owners without a nonzero entry in `quotas` get `default_quota`. Stats
/// are loaded; items are not.
pub fn scan_trackers(
    roots: &[PathBuf],
    quotas: &HashMap<u32, i64>,
    default_quota: i64,
    quota: Option<QuotaSource<'_>>,
) -> Vec<CacheTracker> {
    let mut trackers: BTreeMap<u32, CacheTracker> = BTreeMap::new();
    for root in roots {
        scan_root(root, &mut |uid, path| {
            trackers
                .entry(uid)
                .or_insert_with(|| {
                    let quota = quotas
                        .get(&uid)
                        .copied()
                        .filter(|&q| q != 0)
                        .unwrap_or(default_quota);
                    CacheTracker::new(get_user_id(uid), get_app_id(uid), quota)
                })
                .add_data_path(path);
        });
    }

    let mut trackers: Vec<CacheTracker> = trackers.into_values().collect();
    for tracker in &mut trackers {
        tracker.load_stats(quota);
        debug!(
            uid = tracker.uid(),
            used = tracker.cache_used,
            quota = tracker.cache_quota,
            ratio = tracker.cache_ratio(),
            "tracker"
        );
    }
    trackers
}

fn scan_root(root: &Path, found: &mut dyn FnMut(u32, PathBuf)) {
    let children = match fs::read_dir(root) {
        Ok(children) => children,
        Err(e) => {
            debug!(path = %root.display(), error = %e, "skipping cache root");
            return;
        }
    };
    for child in children.flatten() {
        let path = child.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to stat");
                continue;
            }
        };
        if !meta.file_type().is_dir() {
            continue;
        }
        match owner_uid(meta.uid(), meta.gid()) {
            Some(uid) => found(uid, path),
            None => debug!(path = %path.display(), "unattributed data directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::get_ext_gid;
    use crate::mock::MockQuota;
    use nix::unistd::geteuid;
    use tempfile::TempDir;

    fn fill(dir: &Path, files: usize, len: usize) {
        fs::create_dir_all(dir).unwrap();
        for i in 0..files {
            fs::write(dir.join(format!("f{}", i)), vec![1u8; len]).unwrap();
        }
    }

    #[test]
    fn test_ratio() {
        let mut tracker = CacheTracker::new(0, 10_050, 1000);
        tracker.cache_used = 1500;
        assert_eq!(tracker.cache_ratio(), 15_000);
        tracker.cache_quota = 0;
        assert_eq!(tracker.cache_ratio(), 0);
    }

    #[test]
    fn test_tree_stats_and_items() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("com.foo");
        fill(&pkg.join("cache"), 3, 4096);
        fill(&pkg.join("code_cache"), 1, 4096);
        fill(&pkg.join("files"), 4, 4096);

        let mut tracker = CacheTracker::new(0, 10_050, 1 << 20);
        tracker.add_data_path(&pkg);
        tracker.load_stats(None);

        let expected = calculate_tree_size(&pkg.join("cache"), TreeFilter::default())
            + calculate_tree_size(&pkg.join("code_cache"), TreeFilter::default());
        assert_eq!(tracker.cache_used, expected);
        assert!(tracker.cache_used >= 4 * 4096);

        tracker.ensure_items();
        assert_eq!(tracker.items_remaining(), 4);
        let item = tracker.pop_item().unwrap();
        assert!(!item.path.starts_with(pkg.join("files")));
    }

    #[test]
    fn test_quota_stats_preferred() {
        let mock = MockQuota::new();
        let cache_gid = get_cache_gid(0, 10_050).unwrap();
        let ext_cache_gid = get_ext_cache_gid(0, 10_050).unwrap();
        mock.set_usage(QuotaKind::Group, cache_gid, 7000);
        mock.set_usage(QuotaKind::Group, ext_cache_gid, 3000);

        let mut tracker = CacheTracker::new(0, 10_050, 1 << 20);
        tracker.load_stats(Some(QuotaSource::new(&mock, "/dev/block/test")));
        assert_eq!(tracker.cache_used, 10_000);

        // Missing ext cache usage falls back to the tree walk.
        let mut other = CacheTracker::new(0, 10_051, 1 << 20);
        mock.set_usage(QuotaKind::Group, get_cache_gid(0, 10_051).unwrap(), 5);
        mock.set_missing(QuotaKind::Group, get_ext_cache_gid(0, 10_051).unwrap());
        other.load_stats(Some(QuotaSource::new(&mock, "/dev/block/test")));
        assert_eq!(other.cache_used, 0);
    }

    #[test]
    fn test_owner_uid_remaps_media_rw() {
        let ext_gid = get_ext_gid(10, 10_050).unwrap();
        assert_eq!(owner_uid(AID_MEDIA_RW, ext_gid), Some(get_uid(10, 10_050)));
        assert_eq!(owner_uid(AID_MEDIA_RW, AID_MEDIA_RW), None);
        assert_eq!(owner_uid(10_050, 0), Some(10_050));
    }

    #[test]
    fn test_scan_groups_by_owner() {
        let tmp = TempDir::new().unwrap();
        let ce = tmp.path().join("ce");
        let de = tmp.path().join("de");
        fs::create_dir_all(ce.join("com.foo")).unwrap();
        fs::create_dir_all(de.join("com.foo")).unwrap();
        fs::write(ce.join("stray"), b"x").unwrap();

        let uid = geteuid().as_raw();
        let mut quotas = HashMap::new();
        quotas.insert(uid, 12_345);
        let trackers = scan_trackers(
            &[ce.clone(), de.clone(), tmp.path().join("missing")],
            &quotas,
            99,
            None,
        );
        assert_eq!(trackers.len(), 1);
        let tracker = &trackers[0];
        assert_eq!(tracker.uid(), uid);
        assert_eq!(tracker.cache_quota, 12_345);
        assert_eq!(tracker.data_paths().len(), 2);
    }

    #[test]
    fn test_scan_zero_quota_uses_default() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("com.foo")).unwrap();

        let uid = geteuid().as_raw();
        let mut quotas = HashMap::new();
        quotas.insert(uid, 0);
        let trackers = scan_trackers(&[tmp.path().to_path_buf()], &quotas, 64 << 20, None);
        assert_eq!(trackers.len(), 1);
        assert_eq!(trackers[0].cache_quota, 67_108_864);
    }
}
