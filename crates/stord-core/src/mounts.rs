//! Mount table caches.
//!
//! Two derived views of the live mount table: emulated-storage runtime
//! mounts (source to visible mount point) and quota-capable block devices
//! (mount point to device). Both are rebuilt wholesale on invalidation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::quota::{QuotaControl, QuotaKind};

/// Snapshot of the mount-derived maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTables {
    storage_mounts: BTreeMap<PathBuf, PathBuf>,
    quota_reverse_mounts: BTreeMap<PathBuf, String>,
}

/// Decode the octal escapes (`\040` etc.) used in mount table fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

impl MountTables {
    /// Build the maps from mount table text.
    ///
    /// A block device whose mount answers a user-quota query for id 0 is
    /// recorded as quota-capable, and limit enforcement is switched on for
    /// users and groups (already-on is fine).
    pub fn scan(
        mounts: &str,
        storage_prefix: &str,
        quota_prefix: &str,
        quota: &dyn QuotaControl,
    ) -> Self {
        let mut tables = MountTables::default();
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (source, target) = match (fields.next(), fields.next()) {
                (Some(source), Some(target)) => (unescape(source), unescape(target)),
                _ => continue,
            };

            if target.starts_with(storage_prefix) {
                debug!(%source, %target, "found storage mount");
                tables
                    .storage_mounts
                    .insert(PathBuf::from(&source), PathBuf::from(&target));
            }

            if source.starts_with(quota_prefix) && quota.get_quota(&source, QuotaKind::User, 0).is_ok() {
                debug!(%source, %target, "found quota mount");
                for kind in [QuotaKind::User, QuotaKind::Group] {
                    if let Err(e) = quota.quota_on(&source, kind) {
                        if e.raw_os_error() != Some(libc::EBUSY) {
                            error!(%source, ?kind, error = %e, "failed to enable quota");
                        }
                    }
                }
                tables.quota_reverse_mounts.insert(PathBuf::from(&target), source);
            }
        }
        tables
    }

    /// Visible mount point for a storage source path.
    pub fn storage_mount_for(&self, source: &Path) -> Option<&Path> {
        self.storage_mounts.get(source).map(PathBuf::as_path)
    }

    /// Quota-capable block device mounted at `target`.
    pub fn quota_device_for(&self, target: &Path) -> Option<&str> {
        self.quota_reverse_mounts.get(target).map(String::as_str)
    }

    /// Human-readable listing for diagnostics.
    pub fn describe(&self) -> String {
        let mut out = String::from("Storage mounts:\n");
        for (source, target) in &self.storage_mounts {
            out.push_str(&format!("    {} = {}\n", source.display(), target.display()));
        }
        out.push_str("\nQuota reverse mounts:\n");
        for (target, device) in &self.quota_reverse_mounts {
            out.push_str(&format!("    {} = {}\n", target.display(), device));
        }
        out
    }
}
