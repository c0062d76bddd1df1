//! In-memory collaborator doubles for tests.
//!
//! Lets fixtures exercise quota-backed measurement, lazy relabelling and
//! eviction stop conditions without a quota-enabled block device, SELinux or
//! a real disk filling up.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::disk::FreeSpace;
use crate::quota::{Quota, QuotaControl, QuotaKind};
use crate::selinux::Labeler;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Quota table keyed by `(kind, id)`, shared across every device.
///
/// Like the kernel on a quota-enabled device, ids without a record read as
/// zeroed; ids marked with [`MockQuota::set_missing`] fail with ESRCH.
#[derive(Debug, Clone, Default)]
pub struct MockQuota {
    inner: Arc<Mutex<MockQuotaInner>>,
}

#[derive(Debug, Default)]
struct MockQuotaInner {
    entries: HashMap<(QuotaKind, u32), Quota>,
    missing: HashSet<(QuotaKind, u32)>,
    quota_on: Vec<(String, QuotaKind)>,
    set_calls: Vec<(String, QuotaKind, u32)>,
}

impl MockQuota {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge `bytes` of current usage to `id`.
    pub fn set_usage(&self, kind: QuotaKind, id: u32, bytes: u64) {
        let mut inner = lock(&self.inner);
        inner.missing.remove(&(kind, id));
        inner.entries.entry((kind, id)).or_default().cur_space = bytes;
    }

    /// Make queries for `id` fail as if the kernel had no quota for it.
    pub fn set_missing(&self, kind: QuotaKind, id: u32) {
        let mut inner = lock(&self.inner);
        inner.entries.remove(&(kind, id));
        inner.missing.insert((kind, id));
    }

    /// Devices and kinds passed to `quota_on`, in call order.
    pub fn quota_on_calls(&self) -> Vec<(String, QuotaKind)> {
        lock(&self.inner).quota_on.clone()
    }

    /// `(device, kind, id)` of every `set_quota` call.
    pub fn set_calls(&self) -> Vec<(String, QuotaKind, u32)> {
        lock(&self.inner).set_calls.clone()
    }
}

impl QuotaControl for MockQuota {
    fn get_quota(&self, _device: &str, kind: QuotaKind, id: u32) -> io::Result<Quota> {
        let inner = lock(&self.inner);
        if inner.missing.contains(&(kind, id)) {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        Ok(inner.entries.get(&(kind, id)).copied().unwrap_or_default())
    }

    fn set_quota(&self, device: &str, kind: QuotaKind, id: u32, limits: &Quota) -> io::Result<()> {
        let mut inner = lock(&self.inner);
        inner.set_calls.push((device.to_string(), kind, id));
        let entry = inner.entries.entry((kind, id)).or_default();
        entry.block_hard_limit = limits.block_hard_limit;
        entry.block_soft_limit = limits.block_soft_limit;
        entry.inode_hard_limit = limits.inode_hard_limit;
        entry.inode_soft_limit = limits.inode_soft_limit;
        Ok(())
    }

    fn quota_on(&self, device: &str, kind: QuotaKind) -> io::Result<()> {
        lock(&self.inner).quota_on.push((device.to_string(), kind));
        Ok(())
    }
}

/// Labeler that records calls and can simulate a policy change.
#[derive(Debug, Clone, Default)]
pub struct RecordingLabeler {
    inner: Arc<Mutex<RecordingInner>>,
}

#[derive(Debug, Default)]
struct RecordingInner {
    calls: Vec<(PathBuf, bool)>,
    contexts: HashMap<PathBuf, String>,
    pending: Option<String>,
}

impl RecordingLabeler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next non-recursive relabel assign `context`.
    pub fn relabel_next_to(&self, context: &str) {
        lock(&self.inner).pending = Some(context.to_string());
    }

    /// `(path, recursive)` of every relabel, in call order.
    pub fn calls(&self) -> Vec<(PathBuf, bool)> {
        lock(&self.inner).calls.clone()
    }

    pub fn recursive_calls(&self) -> usize {
        lock(&self.inner).calls.iter().filter(|(_, r)| *r).count()
    }

    fn record(&self, path: &Path, recursive: bool) {
        let mut inner = lock(&self.inner);
        inner.calls.push((path.to_path_buf(), recursive));
        if !recursive {
            if let Some(context) = inner.pending.take() {
                inner.contexts.insert(path.to_path_buf(), context);
            }
        }
    }
}

impl Labeler for RecordingLabeler {
    fn file_context(&self, path: &Path) -> io::Result<String> {
        Ok(lock(&self.inner)
            .contexts
            .get(path)
            .cloned()
            .unwrap_or_default())
    }

    fn restorecon_pkgdir(&self, path: &Path, _se_info: &str, _uid: u32, recursive: bool) -> io::Result<()> {
        self.record(path, recursive);
        Ok(())
    }

    fn restorecon(&self, path: &Path, recursive: bool) -> io::Result<()> {
        self.record(path, recursive);
        Ok(())
    }
}

/// Free-space probe backed by a closure.
pub struct FnFreeSpace {
    probe: Box<dyn Fn(&Path) -> io::Result<i64> + Send + Sync>,
}

impl FnFreeSpace {
    pub fn new(probe: impl Fn(&Path) -> io::Result<i64> + Send + Sync + 'static) -> Self {
        Self {
            probe: Box::new(probe),
        }
    }

    /// A probe that always reports `bytes`.
    pub fn fixed(bytes: i64) -> Self {
        Self::new(move |_| Ok(bytes))
    }
}

impl FreeSpace for FnFreeSpace {
    fn free_bytes(&self, path: &Path) -> io::Result<i64> {
        (self.probe)(path)
    }
}
