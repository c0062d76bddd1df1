//! Measurement, eviction and fixup entry points.

use std::path::PathBuf;

use stord_protocol::flags::{
    has, FLAG_FORCE, FLAG_FREE_CACHE_NOOP, FLAG_FREE_CACHE_V2, FLAG_FREE_CACHE_V2_DEFY_QUOTA,
    FLAG_USE_QUOTA,
};
use stord_protocol::ops::{
    AppSize, ExternalSize, FixupAppDataRequest, FreeCacheRequest, GetAppSizeRequest,
    GetExternalSizeRequest, GetUserSizeRequest,
};
use tracing::info;

use super::{enforce_system, lock, StorageService};
use crate::cache::{scan_trackers, EvictionReport, Evictor};
use crate::error::{StorageError, StorageResult};
use crate::fixup::{fixup_roots, FixupReport};
use crate::identity::Caller;
use crate::measure;
use crate::paths::{check_package_name, check_path, Volume};

impl StorageService {
    /// Quota device to measure with, when the caller asked for quota
    /// accounting and the volume has one.
    fn measuring_device(&self, flags: i32, volume: &Volume) -> Option<String> {
        if has(flags, FLAG_USE_QUOTA) {
            self.find_quota_device(volume)
        } else {
            None
        }
    }

    pub fn get_app_size(&self, request: &GetAppSizeRequest) -> StorageResult<AppSize> {
        let volume = self.layout.volume(request.volume_uuid.as_deref())?;
        for package in &request.package_names {
            check_package_name(package)?;
        }
        for code_path in &request.code_paths {
            check_path(code_path)?;
        }

        let _guard = self.serialize();
        let device = self.measuring_device(request.flags, &volume);
        measure::app_size(
            &self.layout,
            &volume,
            request,
            self.quota_source(device.as_deref()),
        )
    }

    pub fn get_user_size(&self, request: &GetUserSizeRequest) -> StorageResult<AppSize> {
        let volume = self.layout.volume(request.volume_uuid.as_deref())?;
        let _guard = self.serialize();
        let device = self.measuring_device(request.flags, &volume);
        Ok(measure::user_size(
            &self.layout,
            &volume,
            request.user_id,
            &request.app_ids,
            self.quota_source(device.as_deref()),
        ))
    }

    pub fn get_external_size(&self, request: &GetExternalSizeRequest) -> StorageResult<ExternalSize> {
        let volume = self.layout.volume(request.volume_uuid.as_deref())?;
        let _guard = self.serialize();
        let device = self.measuring_device(request.flags, &volume);
        Ok(measure::external_size(
            &self.layout,
            &volume,
            request.user_id,
            &request.app_ids,
            self.quota_source(device.as_deref()),
        ))
    }

    /// Top-level cache owner directories of every known user on `volume`.
    fn cache_roots(&self, volume: &Volume) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        for user in self.layout.known_users(volume) {
            roots.push(self.layout.user_ce_path(volume, user));
            roots.push(self.layout.user_de_path(volume, user));
            roots.push(self.find_data_media_path(volume, user).join("Android/data"));
        }
        roots
    }

    /// Evict cache until `target_free_bytes` are free on the volume.
    ///
    /// A run that ends below target is reported as
    /// [`StorageError::InsufficientSpace`].
    pub fn free_cache(&self, caller: Caller, request: &FreeCacheRequest) -> StorageResult<EvictionReport> {
        enforce_system(caller)?;
        let volume = self.layout.volume(request.volume_uuid.as_deref())?;
        if !has(request.flags, FLAG_FREE_CACHE_V2) {
            return Err(StorageError::illegal_argument(
                "legacy cache eviction is no longer supported",
            ));
        }

        let _guard = self.serialize();
        let data_path = self.data_path(&volume);
        let device = self.find_quota_device(&volume);
        let quota = self.quota_source(device.as_deref());
        let default_quota = self.config().default_cache_quota;

        let report = Evictor::new(&data_path, &*self.free_space, request.target_free_bytes)
            .cache_reserved(request.cache_reserved_bytes)
            .defy_quota(has(request.flags, FLAG_FREE_CACHE_V2_DEFY_QUOTA))
            .noop(has(request.flags, FLAG_FREE_CACHE_NOOP))
            .run(|| {
                let roots = self.cache_roots(&volume);
                let quotas = lock(&self.cache_quotas).clone();
                scan_trackers(&roots, &quotas, default_quota, quota)
            })?;

        if report.is_satisfied() {
            Ok(report)
        } else {
            Err(StorageError::InsufficientSpace {
                path: data_path,
                target: request.target_free_bytes,
                free: report.free_after,
            })
        }
    }

    /// Converge cache ownership under every known user's CE and DE roots.
    pub fn fixup_app_data(&self, caller: Caller, request: &FixupAppDataRequest) -> StorageResult<FixupReport> {
        enforce_system(caller)?;
        let volume = self.layout.volume(request.volume_uuid.as_deref())?;
        let _guard = self.serialize();

        let mut roots = Vec::new();
        for user in self.layout.known_users(&volume) {
            roots.push(self.layout.user_ce_path(&volume, user));
            roots.push(self.layout.user_de_path(&volume, user));
        }
        let report = fixup_roots(
            roots.iter().map(PathBuf::as_path),
            has(request.flags, FLAG_FORCE),
        );
        info!(
            visited = report.visited,
            fixed = report.fixed,
            ignored = report.ignored,
            "fixup complete"
        );
        Ok(report)
    }
}
