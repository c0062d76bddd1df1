//! Kernel quota control.
//!
//! The service only issues standard `quotactl(2)` commands and trusts the
//! filesystem's accounting. [`QuotaControl`] is the seam; [`KernelQuota`]
//! talks to the kernel.

use std::ffi::CString;
use std::io;

use nix::sys::quota::{quotactl_get, quotactl_set, Dqblk, QuotaType, QuotaValidFlags};
use tracing::{debug, error, warn};

/// Size of one quota block as used by `dqb_bhardlimit`.
pub const QIF_DQBLKSIZE: u64 = 1024;

const QFMT_VFS_V1: libc::c_int = 4;

/// Quota namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    User,
    Group,
}

impl QuotaKind {
    fn raw(self) -> libc::c_int {
        match self {
            QuotaKind::User => libc::USRQUOTA,
            QuotaKind::Group => libc::GRPQUOTA,
        }
    }

    fn quota_type(self) -> QuotaType {
        match self {
            QuotaKind::User => QuotaType::USRQUOTA,
            QuotaKind::Group => QuotaType::GRPQUOTA,
        }
    }
}

/// Limits and usage of one quota id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    /// Hard block limit, in [`QIF_DQBLKSIZE`] units.
    pub block_hard_limit: u64,
    pub block_soft_limit: u64,
    /// Current usage in bytes.
    pub cur_space: u64,
    pub inode_hard_limit: u64,
    pub inode_soft_limit: u64,
    pub cur_inodes: u64,
}

/// Quota operations against a block device.
pub trait QuotaControl: Send + Sync {
    /// Read limits and usage for `id`.
    fn get_quota(&self, device: &str, kind: QuotaKind, id: u32) -> io::Result<Quota>;

    /// Set the hard and soft limits of `id`; usage fields are ignored.
    fn set_quota(&self, device: &str, kind: QuotaKind, id: u32, limits: &Quota) -> io::Result<()>;

    /// Turn on limit enforcement for `kind`.
    fn quota_on(&self, device: &str, kind: QuotaKind) -> io::Result<()>;
}

/// Bytes charged to `id`, or `None` when the kernel has nothing to report.
///
/// ESRCH (no quota for that id) is silent; other failures are logged.
pub fn space_used(quota: &dyn QuotaControl, device: &str, kind: QuotaKind, id: u32) -> Option<i64> {
    match quota.get_quota(device, kind, id) {
        Ok(q) => {
            debug!(device, ?kind, id, cur_space = q.cur_space, "quotactl");
            Some(q.cur_space as i64)
        }
        Err(e) => {
            if e.raw_os_error() != Some(libc::ESRCH) {
                error!(device, ?kind, id, error = %e, "failed to quotactl");
            }
            None
        }
    }
}

/// A quota-capable device paired with the control used to query it.
#[derive(Clone, Copy)]
pub struct QuotaSource<'a> {
    pub control: &'a dyn QuotaControl,
    pub device: &'a str,
}

impl<'a> QuotaSource<'a> {
    pub fn new(control: &'a dyn QuotaControl, device: &'a str) -> Self {
        Self { control, device }
    }

    /// See [`space_used`].
    pub fn used(&self, kind: QuotaKind, id: u32) -> Option<i64> {
        space_used(self.control, self.device, kind, id)
    }
}

/// `quotactl(2)` on the running kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelQuota;

fn device_cstring(device: &str) -> io::Result<CString> {
    CString::new(device).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

impl QuotaControl for KernelQuota {
    fn get_quota(&self, device: &str, kind: QuotaKind, id: u32) -> io::Result<Quota> {
        let dq = quotactl_get(kind.quota_type(), device, id as libc::c_int)?;
        Ok(Quota {
            block_hard_limit: dq.blocks_hard_limit().unwrap_or(0),
            block_soft_limit: dq.blocks_soft_limit().unwrap_or(0),
            cur_space: dq.occupied_space().unwrap_or(0),
            inode_hard_limit: dq.inodes_hard_limit().unwrap_or(0),
            inode_soft_limit: dq.inodes_soft_limit().unwrap_or(0),
            cur_inodes: dq.allocated_inodes().unwrap_or(0),
        })
    }

    fn set_quota(&self, device: &str, kind: QuotaKind, id: u32, limits: &Quota) -> io::Result<()> {
        let mut dq = Dqblk::default();
        dq.set_blocks_hard_limit(limits.block_hard_limit);
        dq.set_blocks_soft_limit(limits.block_soft_limit);
        dq.set_inodes_hard_limit(limits.inode_hard_limit);
        dq.set_inodes_soft_limit(limits.inode_soft_limit);
        let fields = QuotaValidFlags::QIF_BLIMITS | QuotaValidFlags::QIF_ILIMITS;
        quotactl_set(kind.quota_type(), device, id as libc::c_int, &dq, fields)?;
        Ok(())
    }

    // nix's quotactl_on requires a quota file path; journalled quota needs NULL.
    fn quota_on(&self, device: &str, kind: QuotaKind) -> io::Result<()> {
        let special = device_cstring(device)?;
        let res = unsafe {
            libc::quotactl(
                libc::QCMD(libc::Q_QUOTAON, kind.raw()),
                special.as_ptr(),
                QFMT_VFS_V1,
                std::ptr::null_mut(),
            )
        };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Hard limits protecting a partition from a single uid: 90% of blocks and
/// 50% of inodes.
pub fn hard_limits_for(total_bytes: u64, total_inodes: u64) -> Quota {
    Quota {
        block_hard_limit: ((total_bytes / 10) * 9) / QIF_DQBLKSIZE,
        inode_hard_limit: total_inodes / 2,
        ..Quota::default()
    }
}

/// Ensure `uid` has hard limits on `device`, deriving them from the
/// filesystem totals when either limit is unset.
pub fn ensure_hard_limits(
    quota: &dyn QuotaControl,
    device: &str,
    uid: u32,
    totals: impl FnOnce() -> io::Result<(u64, u64)>,
) -> io::Result<()> {
    let current = quota.get_quota(device, QuotaKind::User, uid).map_err(|e| {
        warn!(device, uid, error = %e, "failed to find quota");
        e
    })?;
    if current.block_hard_limit != 0 && current.inode_hard_limit != 0 {
        return Ok(());
    }
    let (bytes, inodes) = totals()?;
    let limits = Quota {
        block_soft_limit: current.block_soft_limit,
        inode_soft_limit: current.inode_soft_limit,
        ..hard_limits_for(bytes, inodes)
    };
    quota.set_quota(device, QuotaKind::User, uid, &limits).map_err(|e| {
        warn!(device, uid, error = %e, "failed to set hard quota");
        e
    })?;
    debug!(device, uid, "applied hard quotas");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockQuota;

    #[test]
    fn test_hard_limits_math() {
        let limits = hard_limits_for(10 * 1024 * 1024 * 1024, 1_000_001);
        assert_eq!(limits.block_hard_limit, 9_437_184);
        assert_eq!(limits.inode_hard_limit, 500_000);
    }

    #[test]
    fn test_ensure_hard_limits_only_when_unset() {
        let mock = MockQuota::new();
        ensure_hard_limits(&mock, "/dev/block/dm-0", 10050, || Ok((1024 * 1000, 100))).unwrap();
        let set = mock.get_quota("/dev/block/dm-0", QuotaKind::User, 10050).unwrap();
        assert_eq!(set.block_hard_limit, 900);
        assert_eq!(set.inode_hard_limit, 50);

        // Already set: totals are never consulted.
        ensure_hard_limits(&mock, "/dev/block/dm-0", 10050, || {
            panic!("totals should not be read")
        })
        .unwrap();
    }

    #[test]
    fn test_ensure_hard_limits_keeps_soft_limits() {
        let mock = MockQuota::new();
        mock.set_quota(
            "/dev/block/dm-0",
            QuotaKind::User,
            10051,
            &Quota {
                block_soft_limit: 7,
                inode_soft_limit: 3,
                ..Quota::default()
            },
        )
        .unwrap();
        ensure_hard_limits(&mock, "/dev/block/dm-0", 10051, || Ok((1024 * 1000, 100))).unwrap();
        let set = mock.get_quota("/dev/block/dm-0", QuotaKind::User, 10051).unwrap();
        assert_eq!((set.block_hard_limit, set.block_soft_limit), (900, 7));
        assert_eq!((set.inode_hard_limit, set.inode_soft_limit), (50, 3));
    }

    #[test]
    fn test_ensure_hard_limits_propagates_lookup_failure() {
        let mock = MockQuota::new();
        mock.set_missing(QuotaKind::User, 10052);
        let err = ensure_hard_limits(&mock, "/dev/block/dm-0", 10052, || {
            panic!("totals should not be read")
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
        assert!(mock.set_calls().is_empty());
    }

    #[test]
    fn test_space_used_missing_id() {
        let mock = MockQuota::new();
        assert_eq!(space_used(&mock, "/dev/block/dm-0", QuotaKind::Group, 20050), Some(0));
        mock.set_missing(QuotaKind::Group, 20050);
        assert_eq!(space_used(&mock, "/dev/block/dm-0", QuotaKind::Group, 20050), None);
        mock.set_usage(QuotaKind::Group, 20050, 4096);
        assert_eq!(space_used(&mock, "/dev/block/dm-0", QuotaKind::Group, 20050), Some(4096));
    }
}
