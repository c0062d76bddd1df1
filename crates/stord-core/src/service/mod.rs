//! The storage service object.
//!
//! One long-lived instance owns the path layout, the injected collaborators
//! and the three pieces of shared state, each behind its own lock:
//!
//! - a coarse lock serialising every lifecycle, measurement, eviction and
//!   fixup call;
//! - the mount tables, replaced wholesale by `invalidate_mounts`;
//! - the per-uid cache quotas, keyed inserts only.

mod lifecycle;
mod storage;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use stord_protocol::ops::SetAppQuotaRequest;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::disk::{FreeSpace, StatvfsFreeSpace};
use crate::error::{StorageError, StorageResult};
use crate::identity::{get_uid, Caller};
use crate::mounts::MountTables;
use crate::paths::{PathLayout, Volume};
use crate::quota::{KernelQuota, QuotaControl, QuotaSource};
use crate::selinux::{Labeler, NoopLabeler};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reject callers without the elevated system identity.
fn enforce_system(caller: Caller) -> StorageResult<()> {
    if caller.is_elevated() {
        Ok(())
    } else {
        Err(StorageError::security(format!(
            "uid {} is not allowed to modify storage",
            caller.uid
        )))
    }
}

/// Builder for [`StorageService`].
///
/// Collaborators default to the kernel quota interface, no labelling and
/// `statvfs` free-space probing.
pub struct StorageServiceBuilder {
    config: ServiceConfig,
    quota: Option<Box<dyn QuotaControl>>,
    labeler: Option<Box<dyn Labeler>>,
    free_space: Option<Box<dyn FreeSpace>>,
}

impl StorageServiceBuilder {
    pub fn quota(mut self, quota: impl QuotaControl + 'static) -> Self {
        self.quota = Some(Box::new(quota));
        self
    }

    pub fn labeler(mut self, labeler: impl Labeler + 'static) -> Self {
        self.labeler = Some(Box::new(labeler));
        self
    }

    pub fn free_space(mut self, free_space: impl FreeSpace + 'static) -> Self {
        self.free_space = Some(Box::new(free_space));
        self
    }

    /// Mount tables start empty; call [`StorageService::invalidate_mounts`]
    /// to populate them.
    pub fn build(self) -> StorageService {
        StorageService {
            layout: PathLayout::new(self.config),
            quota: self.quota.unwrap_or_else(|| Box::new(KernelQuota)),
            labeler: self.labeler.unwrap_or_else(|| Box::new(NoopLabeler)),
            free_space: self
                .free_space
                .unwrap_or_else(|| Box::new(StatvfsFreeSpace)),
            lock: Mutex::new(()),
            mounts: RwLock::new(MountTables::default()),
            cache_quotas: Mutex::new(HashMap::new()),
        }
    }
}

/// Per-app storage management for one host.
pub struct StorageService {
    layout: PathLayout,
    quota: Box<dyn QuotaControl>,
    labeler: Box<dyn Labeler>,
    free_space: Box<dyn FreeSpace>,
    lock: Mutex<()>,
    mounts: RwLock<MountTables>,
    cache_quotas: Mutex<HashMap<u32, i64>>,
}

impl StorageService {
    pub fn builder(config: ServiceConfig) -> StorageServiceBuilder {
        StorageServiceBuilder {
            config,
            quota: None,
            labeler: None,
            free_space: None,
        }
    }

    pub fn layout(&self) -> &PathLayout {
        &self.layout
    }

    pub fn config(&self) -> &ServiceConfig {
        self.layout.config()
    }

    fn serialize(&self) -> MutexGuard<'_, ()> {
        lock(&self.lock)
    }

    fn mounts(&self) -> RwLockReadGuard<'_, MountTables> {
        self.mounts.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebuild the mount tables from the live mount table.
    pub fn invalidate_mounts(&self, caller: Caller) -> StorageResult<()> {
        enforce_system(caller)?;
        let config = self.config();
        let text = fs::read_to_string(&config.proc_mounts)
            .map_err(|e| StorageError::io_at("read mounts from", &config.proc_mounts, e))?;
        let tables = MountTables::scan(
            &text,
            &config.storage_runtime_prefix,
            &config.quota_device_prefix,
            &*self.quota,
        );
        *self.mounts.write().unwrap_or_else(PoisonError::into_inner) = tables;
        info!(mounts = %config.proc_mounts.display(), "mount tables rebuilt");
        Ok(())
    }

    /// Quota-capable block device backing `volume`, if any.
    pub fn find_quota_device(&self, volume: &Volume) -> Option<String> {
        let data_path = self.layout.data_path(volume);
        self.mounts()
            .quota_device_for(&data_path)
            .map(str::to_string)
    }

    /// Media directory of `user`, seen through its storage runtime mount
    /// when one exists.
    pub fn find_data_media_path(&self, volume: &Volume, user: u32) -> PathBuf {
        let media = self.layout.media_root(volume);
        let resolved = match self.mounts().storage_mount_for(&media) {
            Some(target) => target.to_path_buf(),
            None => {
                debug!(path = %media.display(), "no storage mount; using media root");
                media
            }
        };
        resolved.join(user.to_string())
    }

    fn quota_source<'a>(&'a self, device: Option<&'a str>) -> Option<QuotaSource<'a>> {
        device.map(|device| QuotaSource::new(&*self.quota, device))
    }

    pub fn is_quota_supported(&self, volume_uuid: Option<&str>) -> StorageResult<bool> {
        let volume = self.layout.volume(volume_uuid)?;
        Ok(self.find_quota_device(&volume).is_some())
    }

    /// Record the cache quota of one app for one user.
    pub fn set_app_quota(&self, caller: Caller, request: &SetAppQuotaRequest) -> StorageResult<()> {
        enforce_system(caller)?;
        self.layout.volume(request.volume_uuid.as_deref())?;
        let uid = get_uid(request.user_id, request.app_id);
        if request.cache_quota_bytes < 0 {
            warn!(uid, bytes = request.cache_quota_bytes, "negative cache quota");
        }
        lock(&self.cache_quotas).insert(uid, request.cache_quota_bytes);
        debug!(uid, bytes = request.cache_quota_bytes, "set cache quota");
        Ok(())
    }

    /// Cache quota recorded for `uid`.
    pub fn cache_quota(&self, uid: u32) -> Option<i64> {
        lock(&self.cache_quotas).get(&uid).copied()
    }

    /// Diagnostic listing of the mount tables and cache quotas.
    pub fn dump(&self) -> String {
        let _guard = self.serialize();
        let mut out = String::from("stord is happy!\n\n");
        out.push_str(&self.mounts().describe());

        out.push_str("\nPer-UID cache quotas:\n");
        let quotas: BTreeMap<u32, i64> = lock(&self.cache_quotas)
            .iter()
            .map(|(uid, bytes)| (*uid, *bytes))
            .collect();
        for (uid, bytes) in quotas {
            out.push_str(&format!("    {} = {}\n", uid, bytes));
        }
        out
    }

    fn data_path(&self, volume: &Volume) -> PathBuf {
        self.layout.data_path(volume)
    }

    fn labeler(&self) -> &dyn Labeler {
        &*self.labeler
    }
}

/// First failure of a multi-step call that keeps going past failures.
#[derive(Default)]
struct Outcome(Option<StorageError>);

impl Outcome {
    fn record(&mut self, result: StorageResult<()>) {
        if let Err(e) = result {
            warn!(error = %e, "step failed");
            if self.0.is_none() {
                self.0 = Some(e);
            }
        }
    }

    fn finish(self) -> StorageResult<()> {
        match self.0 {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockQuota;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, ServiceConfig) {
        let tmp = TempDir::new().unwrap();
        let config = ServiceConfig::rooted_at(tmp.path());
        fs::create_dir_all(&config.data_root).unwrap();
        fs::create_dir_all(config.proc_mounts.parent().unwrap()).unwrap();
        (tmp, config)
    }

    #[test]
    fn test_mutations_require_system() {
        let (_tmp, config) = fixture();
        let service = StorageService::builder(config).build();
        let request = SetAppQuotaRequest {
            volume_uuid: None,
            user_id: 0,
            app_id: 10050,
            cache_quota_bytes: 1024,
        };

        let err = service.set_app_quota(Caller::new(10050), &request).unwrap_err();
        assert!(matches!(err, StorageError::Security(_)));
        assert!(service.cache_quota(10050).is_none());

        service.set_app_quota(Caller::system(), &request).unwrap();
        assert_eq!(service.cache_quota(10050), Some(1024));
        assert!(service.dump().contains("10050 = 1024"));
    }

    #[test]
    fn test_quota_support_follows_mounts() {
        let (_tmp, config) = fixture();
        fs::write(
            &config.proc_mounts,
            format!(
                "/dev/block/test {} ext4 rw 0 0\n{} /mnt/runtime/default/emulated sdcardfs rw 0 0\n",
                config.data_root.display(),
                config.data_root.join("media").display()
            ),
        )
        .unwrap();
        let quota = MockQuota::new();
        let service = StorageService::builder(config).quota(quota).build();

        assert!(!service.is_quota_supported(None).unwrap());
        service.invalidate_mounts(Caller::system()).unwrap();
        assert!(service.is_quota_supported(None).unwrap());
        assert!(!service.is_quota_supported(Some("57f8")).unwrap());
        assert_eq!(
            service.find_quota_device(&Volume::Primary).as_deref(),
            Some("/dev/block/test")
        );
        assert_eq!(
            service.find_data_media_path(&Volume::Primary, 10),
            PathBuf::from("/mnt/runtime/default/emulated/10")
        );
        assert!(service.dump().contains("Quota reverse mounts:"));
    }

    #[test]
    fn test_media_path_falls_back_to_media_root() {
        let (_tmp, config) = fixture();
        let media = config.data_root.join("media/0");
        let service = StorageService::builder(config).build();
        assert_eq!(service.find_data_media_path(&Volume::Primary, 0), media);
    }

    #[test]
    fn test_invalidate_mounts_missing_table() {
        let (_tmp, config) = fixture();
        let service = StorageService::builder(config).build();
        let err = service.invalidate_mounts(Caller::system()).unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn test_bad_uuid_rejected() {
        let (_tmp, config) = fixture();
        let service = StorageService::builder(config).build();
        assert!(matches!(
            service.is_quota_supported(Some("../etc")),
            Err(StorageError::IllegalArgument(_))
        ));
        assert!(matches!(
            service.is_quota_supported(Some("TEST")),
            Err(StorageError::IllegalArgument(_))
        ));
    }
}
