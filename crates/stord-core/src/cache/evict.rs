//! The eviction loop.
//!
//! Always deletes from the tracker furthest over its cache quota, and keeps
//! deleting from it until another tracker overtakes it. Stops when enough
//! space is free, when the active tracker drops under its quota, when the
//! reserved share of cache would be touched, or when nothing is left.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::tracker::{CacheTracker, RATIO_SCALE};
use crate::disk::FreeSpace;
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionState {
    Idle,
    Scanning,
    Prioritizing,
    Evicting,
    Satisfied,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Enough space was free before anything was scanned.
    AlreadySatisfied,
    TargetMet,
    /// The active tracker fell under its cache quota.
    QuotaFloor,
    /// Clearing more would eat into the reserved cache bytes.
    ReservedFloor,
    /// No tracker has anything left to delete.
    Exhausted,
}

/// Outcome of one [`Evictor::run`].
#[derive(Debug, Clone, Serialize)]
pub struct EvictionReport {
    pub state: EvictionState,
    pub stop: StopReason,
    pub free_before: i64,
    pub free_after: i64,
    pub cleared: i64,
    /// Items in deletion order.
    pub purged: Vec<PathBuf>,
}

impl EvictionReport {
    pub fn is_satisfied(&self) -> bool {
        self.state == EvictionState::Satisfied
    }
}

/// Heap entry; ratios of inactive trackers don't change while queued.
#[derive(Debug, PartialEq, Eq)]
struct Ranked {
    ratio: i64,
    uid: u32,
    index: usize,
}

impl Ranked {
    fn of(index: usize, tracker: &CacheTracker) -> Self {
        Self {
            ratio: tracker.cache_ratio(),
            uid: tracker.uid(),
            index,
        }
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower uid wins ties.
        self.ratio
            .cmp(&other.ratio)
            .then_with(|| other.uid.cmp(&self.uid))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Frees cache on one volume until a free-space target is met.
pub struct Evictor<'a> {
    data_path: &'a Path,
    free_space: &'a dyn FreeSpace,
    target_free: i64,
    cache_reserved: i64,
    defy_quota: bool,
    noop: bool,
    state: EvictionState,
}

impl<'a> Evictor<'a> {
    pub fn new(data_path: &'a Path, free_space: &'a dyn FreeSpace, target_free: i64) -> Self {
        Self {
            data_path,
            free_space,
            target_free,
            cache_reserved: 0,
            defy_quota: false,
            noop: false,
            state: EvictionState::Idle,
        }
    }

    /// Leave at least this many cache bytes in place.
    pub fn cache_reserved(mut self, bytes: i64) -> Self {
        self.cache_reserved = bytes;
        self
    }

    /// Keep deleting from trackers that are already under quota.
    pub fn defy_quota(mut self, defy: bool) -> Self {
        self.defy_quota = defy;
        self
    }

    /// Walk the loop and account for items without deleting anything.
    pub fn noop(mut self, noop: bool) -> Self {
        self.noop = noop;
        self
    }

    pub fn state(&self) -> EvictionState {
        self.state
    }

    fn transition(&mut self, next: EvictionState) {
        debug!(from = ?self.state, to = ?next, "eviction state");
        self.state = next;
    }

    fn measure(&self) -> StorageResult<i64> {
        self.free_space.free_bytes(self.data_path).map_err(|e| {
            StorageError::io(
                format!("failed to determine free space for {}", self.data_path.display()),
                e,
            )
        })
    }

    /// Run to completion. `scan` builds the trackers and is only called
    /// when there is work to do.
    pub fn run(
        mut self,
        scan: impl FnOnce() -> Vec<CacheTracker>,
    ) -> StorageResult<EvictionReport> {
        let free_before = self.measure()?;
        info!(
            path = %self.data_path.display(),
            free = free_before,
            target = self.target_free,
            reserved = self.cache_reserved,
            "freeing cache"
        );
        if free_before >= self.target_free {
            self.transition(EvictionState::Satisfied);
            return Ok(EvictionReport {
                state: self.state,
                stop: StopReason::AlreadySatisfied,
                free_before,
                free_after: free_before,
                cleared: 0,
                purged: Vec::new(),
            });
        }

        self.transition(EvictionState::Scanning);
        let mut trackers = scan();

        self.transition(EvictionState::Prioritizing);
        let cache_total: i64 = trackers.iter().map(|t| t.cache_used).sum();
        let mut queue: BinaryHeap<Ranked> = trackers
            .iter()
            .enumerate()
            .map(|(index, tracker)| Ranked::of(index, tracker))
            .collect();

        self.transition(EvictionState::Evicting);
        let mut needed = self.target_free - free_before;
        let mut cleared = 0i64;
        let mut purged = Vec::new();
        let mut active: Option<usize> = None;

        let stop = loop {
            if let Some(index) = active {
                if trackers[index].cache_ratio() < RATIO_SCALE && !self.defy_quota {
                    debug!(uid = trackers[index].uid(), "active tracker under quota");
                    break StopReason::QuotaFloor;
                }
            }
            if self.cache_reserved > 0 && cleared >= cache_total - self.cache_reserved {
                debug!(cleared, cache_total, "reached reserved cache");
                break StopReason::ReservedFloor;
            }

            let top_ratio = queue.peek().map(|ranked| ranked.ratio);
            let index = match active {
                Some(index) if top_ratio.map_or(true, |top| trackers[index].cache_ratio() >= top) => {
                    index
                }
                _ => {
                    let Some(next) = queue.pop() else {
                        break StopReason::Exhausted;
                    };
                    if let Some(previous) = active.take() {
                        queue.push(Ranked::of(previous, &trackers[previous]));
                    }
                    let tracker = &mut trackers[next.index];
                    tracker.ensure_items();
                    debug!(
                        uid = tracker.uid(),
                        ratio = tracker.cache_ratio(),
                        items = tracker.items_remaining(),
                        "switching to tracker"
                    );
                    active = Some(next.index);
                    continue;
                }
            };

            let tracker = &mut trackers[index];
            let Some(item) = tracker.pop_item() else {
                debug!(uid = tracker.uid(), "tracker has nothing left");
                active = None;
                continue;
            };
            if !self.noop {
                if let Err(e) = item.purge() {
                    warn!(path = %item.path.display(), error = %e, "failed to purge");
                }
            }
            tracker.cache_used -= item.size;
            needed -= item.size;
            cleared += item.size;
            debug!(path = %item.path.display(), size = item.size, "purged");
            purged.push(item.path);

            if needed <= 0 {
                match self.measure() {
                    Ok(free) => {
                        needed = self.target_free - free;
                        if needed <= 0 {
                            break StopReason::TargetMet;
                        }
                        warn!(needed, "expected to be done but still need more");
                    }
                    Err(e) => warn!(error = %e, "failed to re-measure free space"),
                }
            }
        };

        let free_after = self.measure()?;
        let next = if free_after >= self.target_free {
            EvictionState::Satisfied
        } else {
            EvictionState::Exhausted
        };
        self.transition(next);
        info!(
            state = ?self.state,
            stop = ?stop,
            cleared,
            purged = purged.len(),
            free = free_after,
            "cache eviction finished"
        );
        Ok(EvictionReport {
            state: self.state,
            stop,
            free_before,
            free_after,
            cleared,
            purged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::{calculate_tree_size, TreeFilter};
    use crate::mock::FnFreeSpace;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    const NEVER: i64 = i64::MAX / 4;

    /// Package dir with `count` cache files of `len` bytes, mtimes from
    /// `first_mtime` stepping by `step`.
    fn package(root: &Path, name: &str, count: usize, len: usize, first_mtime: i64, step: i64) -> PathBuf {
        let pkg = root.join(name);
        let cache = pkg.join("cache");
        fs::create_dir_all(&cache).unwrap();
        for i in 0..count {
            let file = cache.join(format!("f{:02}", i));
            fs::write(&file, vec![3u8; len]).unwrap();
            set_file_mtime(&file, FileTime::from_unix_time(first_mtime + step * i as i64, 0)).unwrap();
        }
        pkg
    }

    fn tracker(app_id: u32, pkg: &Path, quota: i64) -> CacheTracker {
        let mut tracker = CacheTracker::new(0, app_id, quota);
        tracker.add_data_path(pkg);
        tracker.load_stats(None);
        tracker
    }

    fn cache_size(pkg: &Path) -> i64 {
        calculate_tree_size(&pkg.join("cache"), TreeFilter::default())
    }

    #[test]
    fn test_already_satisfied_skips_scan() {
        let tmp = TempDir::new().unwrap();
        let free = FnFreeSpace::fixed(100);
        let report = Evictor::new(tmp.path(), &free, 50)
            .run(|| panic!("should not scan"))
            .unwrap();
        assert!(report.is_satisfied());
        assert_eq!(report.stop, StopReason::AlreadySatisfied);
        assert!(report.purged.is_empty());
    }

    #[test]
    fn test_free_space_failure() {
        let tmp = TempDir::new().unwrap();
        let free = FnFreeSpace::new(|_| Err(io::Error::from_raw_os_error(libc::EIO)));
        let err = Evictor::new(tmp.path(), &free, 50).run(Vec::new).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EIO));
    }

    #[test]
    fn test_stops_at_reserved_floor() {
        let tmp = TempDir::new().unwrap();
        let pkg = package(tmp.path(), "a", 10, 8192, 1_000, 10);
        let t = tracker(10_001, &pkg, 1);
        let total = t.cache_used;
        let reserved = 16 * 1024;
        let expected = ((total - reserved) + 8191) / 8192;

        let free = FnFreeSpace::fixed(0);
        let report = Evictor::new(tmp.path(), &free, NEVER)
            .cache_reserved(reserved)
            .run(|| vec![t])
            .unwrap();
        assert_eq!(report.stop, StopReason::ReservedFloor);
        assert_eq!(report.state, EvictionState::Exhausted);
        assert_eq!(report.purged.len() as i64, expected);
        assert!(report.cleared >= total - reserved);
        // Oldest first.
        assert!(report.purged[0].ends_with("f00"));
    }

    #[test]
    fn test_stops_when_active_tracker_under_quota() {
        let tmp = TempDir::new().unwrap();
        let a = package(tmp.path(), "a", 5, 20 * 1024, 1_000, 10);
        let b = package(tmp.path(), "b", 2, 16 * 1024, 500, 10);
        let quota = 64 * 1024;
        let trackers = vec![tracker(10_001, &a, quota), tracker(10_002, &b, quota)];
        let b_before = cache_size(&b);

        let free = FnFreeSpace::fixed(0);
        let report = Evictor::new(tmp.path(), &free, NEVER)
            .run(|| trackers)
            .unwrap();
        assert_eq!(report.stop, StopReason::QuotaFloor);
        assert!(report.purged.iter().all(|p| p.starts_with(&a)));

        let remaining = cache_size(&a);
        assert!(remaining < quota);
        assert!(remaining + 20 * 1024 >= quota);
        assert_eq!(cache_size(&b), b_before);
    }

    #[test]
    fn test_switches_to_most_over_quota() {
        let tmp = TempDir::new().unwrap();
        let a = package(tmp.path(), "a", 6, 16 * 1024, 1_000, 10);
        let b = package(tmp.path(), "b", 5, 16 * 1024, 1_001, 10);
        let quota = 32 * 1024;
        let trackers = vec![tracker(10_001, &a, quota), tracker(10_002, &b, quota)];

        let free = FnFreeSpace::fixed(0);
        let report = Evictor::new(tmp.path(), &free, NEVER)
            .noop(true)
            .run(|| trackers)
            .unwrap();
        let owners: Vec<bool> = report.purged.iter().map(|p| p.starts_with(&a)).collect();
        assert!(owners.len() >= 3);
        assert_eq!(&owners[..3], &[true, true, false]);
        // Nothing deleted in noop mode.
        assert_eq!(fs::read_dir(a.join("cache")).unwrap().count(), 6);
    }

    #[test]
    fn test_target_met_after_reclaiming() {
        let tmp = TempDir::new().unwrap();
        let pkg = package(tmp.path(), "a", 4, 8192, 1_000, 10);
        let t = tracker(10_001, &pkg, 1);

        // Free space grows as the cache shrinks.
        let base = 1_000_000;
        let start = base - cache_size(&pkg);
        let watched = pkg.clone();
        let free = FnFreeSpace::new(move |_| Ok(base - cache_size(&watched)));

        let report = Evictor::new(tmp.path(), &free, start + 1)
            .run(|| vec![t])
            .unwrap();
        assert!(report.is_satisfied());
        assert_eq!(report.stop, StopReason::TargetMet);
        assert_eq!(report.purged.len(), 1);
        assert_eq!(fs::read_dir(pkg.join("cache")).unwrap().count(), 3);
    }

    #[test]
    fn test_defy_quota_drains_everything() {
        let tmp = TempDir::new().unwrap();
        let pkg = package(tmp.path(), "a", 3, 4096, 1_000, 10);
        let t = tracker(10_001, &pkg, 1 << 30);

        let free = FnFreeSpace::fixed(0);
        let report = Evictor::new(tmp.path(), &free, NEVER)
            .defy_quota(true)
            .run(|| vec![t])
            .unwrap();
        assert_eq!(report.stop, StopReason::Exhausted);
        assert_eq!(report.purged.len(), 3);
        assert_eq!(fs::read_dir(pkg.join("cache")).unwrap().count(), 0);
    }
}
