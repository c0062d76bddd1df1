//! Package and user directory lifecycle.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::Command;

use stord_protocol::flags::{
    has, FLAG_CLEAR_CACHE_ONLY, FLAG_CLEAR_CODE_CACHE_ONLY, FLAG_STORAGE_CE, FLAG_STORAGE_DE,
};
use stord_protocol::ops::{
    ClearAppDataRequest, CreateAppDataRequest, CreateUserDataRequest, DestroyAppDataRequest,
    DestroyUserDataRequest, MigrateAppDataRequest, MoveCompleteAppRequest,
    PackageProfilesRequest, RestoreconAppDataRequest,
};
use tracing::{debug, info, warn};

use super::{enforce_system, exists, Outcome, StorageService};
use crate::disk::filesystem_totals;
use crate::error::{StorageError, StorageResult};
use crate::fsutil::{
    delete_dir_contents, delete_dir_contents_and_dir, prepare_app_cache_dir, prepare_dir,
    prepare_file, CACHE_DIR_MODE,
};
use crate::identity::{
    cache_gid_or_uid, get_shared_app_gid, get_uid, Caller, AID_EVERYBODY, AID_MEDIA_RW,
    AID_SYSTEM,
};
use crate::inode::{get_path_inode, resolve_child_by_inode, write_child_inode};
use crate::paths::{check_package_name, Volume};
use crate::quota::{ensure_hard_limits, QuotaKind};
use crate::selinux::restorecon_lazy;
use crate::xattr::{self, XATTR_DEFAULT, XATTR_INODE_CACHE, XATTR_INODE_CODE_CACHE};

const CACHE_DIR: &str = "cache";
const CODE_CACHE_DIR: &str = "code_cache";

/// Truncate a profile in place; a missing profile is already clear.
fn clear_profile(path: &Path) -> StorageResult<()> {
    match OpenOptions::new()
        .write(true)
        .truncate(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io_at("truncate profile", path, e)),
    }
}

impl StorageService {
    /// Resolve and validate the volume and package of a request.
    fn app_target(&self, volume_uuid: Option<&str>, package: &str) -> StorageResult<Volume> {
        let volume = self.layout.volume(volume_uuid)?;
        check_package_name(package)?;
        Ok(volume)
    }

    /// Create the requested storage classes of one package for one user.
    ///
    /// Returns the inode of the CE directory when CE was requested.
    pub fn create_app_data(
        &self,
        caller: Caller,
        request: &CreateAppDataRequest,
    ) -> StorageResult<Option<u64>> {
        enforce_system(caller)?;
        let volume = self.app_target(request.volume_uuid.as_deref(), &request.package_name)?;
        let _guard = self.serialize();
        self.create_app_data_locked(&volume, request)
    }

    fn create_app_data_locked(
        &self,
        volume: &Volume,
        request: &CreateAppDataRequest,
    ) -> StorageResult<Option<u64>> {
        let package = request.package_name.as_str();
        let user = request.user_id;
        let uid = get_uid(user, request.app_id);
        let cache_gid = cache_gid_or_uid(uid);
        let mode = if request.target_sdk_version >= self.config().restricted_home_sdk {
            0o700
        } else {
            0o751
        };

        let mut ce_inode = None;
        if has(request.flags, FLAG_STORAGE_CE) {
            let path = self.layout.ce_package_path(volume, user, package)?;
            self.prepare_package_dir(&path, mode, uid, cache_gid, &request.se_info)?;
            write_child_inode(&path, CACHE_DIR, XATTR_INODE_CACHE)?;
            write_child_inode(&path, CODE_CACHE_DIR, XATTR_INODE_CODE_CACHE)?;
            let inode = get_path_inode(&path).map_err(|e| StorageError::io_at("stat", &path, e))?;
            ce_inode = Some(inode);
        }

        if has(request.flags, FLAG_STORAGE_DE) {
            let path = self.layout.de_package_path(volume, user, package)?;
            self.prepare_package_dir(&path, mode, uid, cache_gid, &request.se_info)?;
            self.prepare_app_quota(volume, uid)?;
            if self.config().use_jit_profiles {
                self.prepare_profiles(user, package, request.app_id)?;
            }
        }

        info!(package, user, uid, ?ce_inode, "created app data");
        Ok(ce_inode)
    }

    /// Package directory with its two cache directories, labelled.
    fn prepare_package_dir(
        &self,
        path: &Path,
        mode: u32,
        uid: u32,
        cache_gid: u32,
        se_info: &str,
    ) -> StorageResult<()> {
        let existing = exists(path);
        prepare_dir(path, mode, uid, uid)?;
        prepare_app_cache_dir(path, CACHE_DIR, CACHE_DIR_MODE, uid, cache_gid)?;
        prepare_app_cache_dir(path, CODE_CACHE_DIR, CACHE_DIR_MODE, uid, cache_gid)?;

        let labeler = self.labeler();
        restorecon_lazy(labeler, path, se_info, uid, existing)?;
        restorecon_lazy(labeler, &path.join(CACHE_DIR), se_info, uid, existing)?;
        restorecon_lazy(labeler, &path.join(CODE_CACHE_DIR), se_info, uid, existing)
    }

    /// Give `uid` hard limits on the volume's quota device, if it has one.
    fn prepare_app_quota(&self, volume: &Volume, uid: u32) -> StorageResult<()> {
        let Some(device) = self.find_quota_device(volume) else {
            return Ok(());
        };
        let failed = |e: io::Error| StorageError::io(format!("failed to prepare quota for uid {}", uid), e);
        if !self.config().apply_hard_quotas {
            self.quota
                .get_quota(&device, QuotaKind::User, uid)
                .map_err(failed)?;
            return Ok(());
        }
        let data_path = self.data_path(volume);
        ensure_hard_limits(&*self.quota, &device, uid, || filesystem_totals(&data_path))
            .map_err(failed)
    }

    /// Current and reference profile locations for a package.
    fn prepare_profiles(&self, user: u32, package: &str, app_id: u32) -> StorageResult<()> {
        let uid = get_uid(user, app_id);
        let cur = self.layout.cur_profile_package_dir(user, package)?;
        prepare_dir(&cur, 0o700, uid, uid)?;
        let profile = self.layout.current_profile_path(user, package, false)?;
        prepare_file(&profile, 0o600, uid, uid)?;

        if let Some(shared_gid) = get_shared_app_gid(app_id) {
            let reference = self.layout.ref_profile_package_dir(package)?;
            prepare_dir(&reference, 0o700, shared_gid, shared_gid)?;
        }
        Ok(())
    }

    /// Move the default storage of a legacy app between CE and DE.
    ///
    /// Whichever class holds the `user.default` marker is the live one;
    /// when neither does, CE is marked. If the requested class is not the
    /// live one, it is replaced by the other class's directory.
    pub fn migrate_app_data(&self, caller: Caller, request: &MigrateAppDataRequest) -> StorageResult<()> {
        enforce_system(caller)?;
        let volume = self.app_target(request.volume_uuid.as_deref(), &request.package_name)?;
        let _guard = self.serialize();

        let package = request.package_name.as_str();
        let ce = self.layout.ce_package_path(&volume, request.user_id, package)?;
        let de = self.layout.de_package_path(&volume, request.user_id, package)?;

        if !xattr::has(&ce, XATTR_DEFAULT) && !xattr::has(&de, XATTR_DEFAULT) {
            xattr::set(&ce, XATTR_DEFAULT, b"")
                .map_err(|e| StorageError::io_at("mark default storage", &ce, e))?;
        }

        let (target, source) = if has(request.flags, FLAG_STORAGE_DE) {
            (de, ce)
        } else {
            (ce, de)
        };
        if !xattr::has(&target, XATTR_DEFAULT) {
            warn!(
                target = %target.display(),
                source = %source.display(),
                "requested default storage is not active; migrating"
            );
            delete_dir_contents_and_dir(&target, true)?;
            std::fs::rename(&source, &target).map_err(|e| {
                StorageError::io(
                    format!("failed to rename {} to {}", source.display(), target.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    /// Empty a package's storage, or just one of its cache directories.
    ///
    /// Keeps going after a failed step and reports the first failure.
    pub fn clear_app_data(&self, caller: Caller, request: &ClearAppDataRequest) -> StorageResult<()> {
        enforce_system(caller)?;
        let volume = self.app_target(request.volume_uuid.as_deref(), &request.package_name)?;
        let _guard = self.serialize();

        let package = request.package_name.as_str();
        let user = request.user_id;
        let cache_only = has(request.flags, FLAG_CLEAR_CACHE_ONLY);
        let code_cache_only = has(request.flags, FLAG_CLEAR_CODE_CACHE_ONLY);
        let mut outcome = Outcome::default();

        if has(request.flags, FLAG_STORAGE_CE) {
            let mut path =
                self.layout
                    .ce_package_path_by_inode(&volume, user, package, request.ce_data_inode)?;
            if cache_only {
                path = resolve_child_by_inode(&path, CACHE_DIR, XATTR_INODE_CACHE);
            } else if code_cache_only {
                path = resolve_child_by_inode(&path, CODE_CACHE_DIR, XATTR_INODE_CODE_CACHE);
            }
            if exists(&path) {
                outcome.record(delete_dir_contents(&path, true));
            }
        }

        if has(request.flags, FLAG_STORAGE_DE) {
            let mut path = self.layout.de_package_path(&volume, user, package)?;
            if cache_only {
                path.push(CACHE_DIR);
            } else if code_cache_only {
                path.push(CODE_CACHE_DIR);
            }
            if exists(&path) {
                if let Err(e) = delete_dir_contents(&path, true) {
                    warn!(path = %path.display(), error = %e, "failed to clear DE storage");
                }
            }
            if !cache_only && !code_cache_only {
                let profile = self.layout.current_profile_path(user, package, false)?;
                outcome.record(clear_profile(&profile));
            }
        }

        debug!(package, user, flags = request.flags, "cleared app data");
        outcome.finish()
    }

    /// Delete a package's storage and, with DE, its profiles.
    pub fn destroy_app_data(&self, caller: Caller, request: &DestroyAppDataRequest) -> StorageResult<()> {
        enforce_system(caller)?;
        let volume = self.app_target(request.volume_uuid.as_deref(), &request.package_name)?;
        let _guard = self.serialize();

        let package = request.package_name.as_str();
        let user = request.user_id;
        let mut outcome = Outcome::default();

        if has(request.flags, FLAG_STORAGE_CE) {
            let path =
                self.layout
                    .ce_package_path_by_inode(&volume, user, package, request.ce_data_inode)?;
            outcome.record(delete_dir_contents_and_dir(&path, true));
        }
        if has(request.flags, FLAG_STORAGE_DE) {
            let path = self.layout.de_package_path(&volume, user, package)?;
            outcome.record(delete_dir_contents_and_dir(&path, true));
            let cur = self.layout.cur_profile_package_dir(user, package)?;
            outcome.record(delete_dir_contents_and_dir(&cur, true));
            let reference = self.layout.ref_profile_package_dir(package)?;
            outcome.record(delete_dir_contents_and_dir(&reference, true));
        }

        info!(package, user, flags = request.flags, "destroyed app data");
        outcome.finish()
    }

    /// Recursively relabel a package's storage.
    pub fn restorecon_app_data(&self, caller: Caller, request: &RestoreconAppDataRequest) -> StorageResult<()> {
        enforce_system(caller)?;
        let volume = self.app_target(request.volume_uuid.as_deref(), &request.package_name)?;
        let _guard = self.serialize();
        self.restorecon_app_data_locked(&volume, request)
    }

    fn restorecon_app_data_locked(
        &self,
        volume: &Volume,
        request: &RestoreconAppDataRequest,
    ) -> StorageResult<()> {
        let package = request.package_name.as_str();
        let user = request.user_id;
        let uid = get_uid(user, request.app_id);
        let mut outcome = Outcome::default();

        let mut paths = Vec::new();
        if has(request.flags, FLAG_STORAGE_CE) {
            paths.push(self.layout.ce_package_path(volume, user, package)?);
        }
        if has(request.flags, FLAG_STORAGE_DE) {
            paths.push(self.layout.de_package_path(volume, user, package)?);
        }
        for path in paths {
            outcome.record(
                self.labeler()
                    .restorecon_pkgdir(&path, &request.se_info, uid, true)
                    .map_err(|e| StorageError::io_at("restorecon", &path, e)),
            );
        }
        outcome.finish()
    }

    /// Run the configured copy command with `from` and `to` appended.
    fn copy_tree(&self, from: &Path, to: &Path) -> StorageResult<()> {
        let Some((program, args)) = self.config().copy_command.split_first() else {
            return Err(StorageError::illegal_argument("copy command is empty"));
        };
        debug!(from = %from.display(), to = %to.display(), "copying");
        let status = Command::new(program)
            .args(args)
            .arg(from)
            .arg(to)
            .status()
            .map_err(|e| StorageError::io(format!("failed to run {}", program), e))?;
        if status.success() {
            Ok(())
        } else {
            Err(StorageError::service_specific(
                status.code().unwrap_or(-1),
                format!("failed copying {} to {}", from.display(), to.display()),
            ))
        }
    }

    /// Copy a package's code and every user's data to another volume.
    ///
    /// Anything already copied to the destination is removed again when a
    /// step fails. The source is left untouched either way.
    pub fn move_complete_app(&self, caller: Caller, request: &MoveCompleteAppRequest) -> StorageResult<()> {
        enforce_system(caller)?;
        let from = self.app_target(request.from_uuid.as_deref(), &request.package_name)?;
        let to = self.layout.volume(request.to_uuid.as_deref())?;
        if !crate::paths::is_valid_filename(&request.data_app_name) {
            return Err(StorageError::illegal_argument(format!(
                "data app name {:?} is malformed",
                request.data_app_name
            )));
        }
        let _guard = self.serialize();

        let users = self.layout.known_users(&from);
        let result = self.move_complete_app_locked(&from, &to, &users, request);
        if let Err(e) = &result {
            warn!(package = %request.package_name, error = %e, "move failed; rolling back");
            self.rollback_move(&to, &users, request);
        }
        result
    }

    fn move_complete_app_locked(
        &self,
        from: &Volume,
        to: &Volume,
        users: &[u32],
        request: &MoveCompleteAppRequest,
    ) -> StorageResult<()> {
        let package = request.package_name.as_str();
        let code_from = self.layout.app_path(from).join(&request.data_app_name);
        let code_parent = self.layout.app_path(to);
        self.copy_tree(&code_from, &code_parent)?;
        let code_to = code_parent.join(&request.data_app_name);
        self.labeler()
            .restorecon(&code_to, true)
            .map_err(|e| StorageError::io_at("restorecon", &code_to, e))?;

        for &user in users {
            let ce_from = self.layout.ce_package_path(from, user, package)?;
            if !exists(&ce_from) {
                info!(path = %ce_from.display(), "missing source");
                continue;
            }

            let create = CreateAppDataRequest {
                volume_uuid: request.to_uuid.clone(),
                package_name: request.package_name.clone(),
                user_id: user,
                flags: FLAG_STORAGE_CE | FLAG_STORAGE_DE,
                app_id: request.app_id,
                se_info: request.se_info.clone(),
                target_sdk_version: request.target_sdk_version,
            };
            self.create_app_data_locked(to, &create)?;

            let de_from = self.layout.de_package_path(from, user, package)?;
            self.copy_tree(&de_from, &self.layout.user_de_path(to, user))?;
            self.copy_tree(&ce_from, &self.layout.user_ce_path(to, user))?;

            let restorecon = RestoreconAppDataRequest {
                volume_uuid: request.to_uuid.clone(),
                package_name: request.package_name.clone(),
                user_id: user,
                flags: FLAG_STORAGE_CE | FLAG_STORAGE_DE,
                app_id: request.app_id,
                se_info: request.se_info.clone(),
            };
            self.restorecon_app_data_locked(to, &restorecon)?;
        }

        info!(package, from = ?from.uuid(), to = ?to.uuid(), "moved app");
        Ok(())
    }

    fn rollback_move(&self, to: &Volume, users: &[u32], request: &MoveCompleteAppRequest) {
        let package = request.package_name.as_str();
        let mut targets = vec![self.layout.app_path(to).join(&request.data_app_name)];
        for &user in users {
            targets.push(self.layout.user_de_path(to, user).join(package));
            targets.push(self.layout.user_ce_path(to, user).join(package));
        }
        for target in targets {
            if let Err(e) = delete_dir_contents_and_dir(&target, true) {
                warn!(path = %target.display(), error = %e, "failed to roll back");
            }
        }
    }

    /// Truncate the reference profile and every user's current profile.
    pub fn clear_app_profiles(&self, caller: Caller, request: &PackageProfilesRequest) -> StorageResult<()> {
        enforce_system(caller)?;
        check_package_name(&request.package_name)?;
        let _guard = self.serialize();

        let package = request.package_name.as_str();
        let mut outcome = Outcome::default();
        let reference = self.layout.reference_profile_path(package, false)?;
        outcome.record(clear_profile(&reference));
        for user in self.layout.known_users(&Volume::Primary) {
            let current = self.layout.current_profile_path(user, package, false)?;
            outcome.record(clear_profile(&current));
        }
        outcome.finish()
    }

    /// Delete the reference profile directory and every user's current one.
    pub fn destroy_app_profiles(&self, caller: Caller, request: &PackageProfilesRequest) -> StorageResult<()> {
        enforce_system(caller)?;
        check_package_name(&request.package_name)?;
        let _guard = self.serialize();

        let package = request.package_name.as_str();
        let mut outcome = Outcome::default();
        for user in self.layout.known_users(&Volume::Primary) {
            let cur = self.layout.cur_profile_package_dir(user, package)?;
            outcome.record(delete_dir_contents_and_dir(&cur, true));
        }
        let reference = self.layout.ref_profile_package_dir(package)?;
        outcome.record(delete_dir_contents_and_dir(&reference, true));
        outcome.finish()
    }

    /// Per-user system directories and the media quota of a new user.
    pub fn create_user_data(&self, caller: Caller, request: &CreateUserDataRequest) -> StorageResult<()> {
        enforce_system(caller)?;
        let volume = self.layout.volume(request.volume_uuid.as_deref())?;
        let _guard = self.serialize();

        let user = request.user_id;
        if has(request.flags, FLAG_STORAGE_DE) && volume.is_primary() {
            prepare_dir(
                &self.layout.misc_user_path(user),
                0o750,
                get_uid(user, AID_SYSTEM),
                get_uid(user, AID_EVERYBODY),
            )?;
        }
        // Media has no owning app but still gets hard limits of its own.
        self.prepare_app_quota(&volume, get_uid(user, AID_MEDIA_RW))?;
        info!(user, serial = request.user_serial, "created user data");
        Ok(())
    }

    /// Delete a user's storage roots.
    pub fn destroy_user_data(&self, caller: Caller, request: &DestroyUserDataRequest) -> StorageResult<()> {
        enforce_system(caller)?;
        let volume = self.layout.volume(request.volume_uuid.as_deref())?;
        let _guard = self.serialize();

        let user = request.user_id;
        let mut outcome = Outcome::default();
        let mut targets = Vec::new();
        if has(request.flags, FLAG_STORAGE_DE) {
            targets.push(self.layout.user_de_path(&volume, user));
            if volume.is_primary() {
                targets.push(self.layout.misc_user_path(user));
                targets.push(self.layout.cur_profile_dir(user));
            }
        }
        if has(request.flags, FLAG_STORAGE_CE) {
            targets.push(self.layout.user_ce_path(&volume, user));
            targets.push(self.find_data_media_path(&volume, user));
        }
        for target in targets {
            outcome.record(delete_dir_contents_and_dir(&target, true));
        }
        info!(user, flags = request.flags, "destroyed user data");
        outcome.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::path::PathBuf;

    use super::*;
    use crate::config::ServiceConfig;
    use crate::mock::{MockQuota, RecordingLabeler};
    use crate::quota::{hard_limits_for, QuotaControl};
    use tempfile::TempDir;

    /// `(user, app_id)` whose uid the test process can chown to.
    fn test_identity() -> Option<(u32, u32)> {
        let euid = nix::unistd::geteuid().as_raw();
        if euid == 0 {
            Some((0, 10050))
        } else if euid == nix::unistd::getegid().as_raw() && crate::identity::get_app_id(euid) < 10000 {
            Some((crate::identity::get_user_id(euid), crate::identity::get_app_id(euid)))
        } else {
            None
        }
    }

    struct Fixture {
        _tmp: TempDir,
        config: ServiceConfig,
        labeler: RecordingLabeler,
        service: StorageService,
    }

    fn fixture(user: u32) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = ServiceConfig::rooted_at(tmp.path());
        config.use_jit_profiles = false;
        for dir in ["user", "user_de", "app"] {
            fs::create_dir_all(config.data_root.join(dir).join(user.to_string())).unwrap();
        }
        let labeler = RecordingLabeler::new();
        let service = StorageService::builder(config.clone())
            .labeler(labeler.clone())
            .build();
        Fixture {
            _tmp: tmp,
            config,
            labeler,
            service,
        }
    }

    fn create_request(user: u32, app_id: u32, flags: i32) -> CreateAppDataRequest {
        CreateAppDataRequest {
            volume_uuid: None,
            package_name: "com.foo".to_string(),
            user_id: user,
            flags,
            app_id,
            se_info: "default".to_string(),
            target_sdk_version: 30,
        }
    }

    fn destroy_request(user: u32, flags: i32) -> DestroyAppDataRequest {
        DestroyAppDataRequest {
            volume_uuid: None,
            package_name: "com.foo".to_string(),
            user_id: user,
            flags,
            ce_data_inode: 0,
        }
    }

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn test_create_app_data_layout() {
        let Some((user, app_id)) = test_identity() else {
            return;
        };
        let fx = fixture(user);
        let inode = fx
            .service
            .create_app_data(
                Caller::system(),
                &create_request(user, app_id, FLAG_STORAGE_CE | FLAG_STORAGE_DE),
            )
            .unwrap()
            .unwrap();

        let ce = fx.config.data_root.join(format!("user/{}/com.foo", user));
        let de = fx.config.data_root.join(format!("user_de/{}/com.foo", user));
        assert_eq!(fs::metadata(&ce).unwrap().ino(), inode);
        for root in [&ce, &de] {
            assert_eq!(mode(root), 0o700);
            assert_eq!(mode(&root.join("cache")), 0o2771);
            assert_eq!(mode(&root.join("code_cache")), 0o2771);
        }
        // One non-recursive relabel per directory.
        assert_eq!(fx.labeler.calls().len(), 6);
        assert_eq!(fx.labeler.recursive_calls(), 0);
    }

    #[test]
    fn test_create_legacy_sdk_is_traversable() {
        let Some((user, app_id)) = test_identity() else {
            return;
        };
        let fx = fixture(user);
        let mut request = create_request(user, app_id, FLAG_STORAGE_DE);
        request.target_sdk_version = 23;
        let inode = fx.service.create_app_data(Caller::system(), &request).unwrap();
        assert!(inode.is_none());
        let de = fx.config.data_root.join(format!("user_de/{}/com.foo", user));
        assert_eq!(mode(&de), 0o751);
    }

    #[test]
    fn test_create_de_applies_hard_quota() {
        let Some((user, app_id)) = test_identity() else {
            return;
        };
        let tmp = TempDir::new().unwrap();
        let mut config = ServiceConfig::rooted_at(tmp.path());
        config.use_jit_profiles = false;
        fs::create_dir_all(config.data_root.join("user_de").join(user.to_string())).unwrap();
        fs::create_dir_all(config.proc_mounts.parent().unwrap()).unwrap();
        fs::write(
            &config.proc_mounts,
            format!("/dev/block/dm-0 {} ext4 rw 0 0\n", config.data_root.display()),
        )
        .unwrap();
        let quota = MockQuota::new();
        let service = StorageService::builder(config.clone())
            .quota(quota.clone())
            .build();
        service.invalidate_mounts(Caller::system()).unwrap();

        let request = create_request(user, app_id, FLAG_STORAGE_DE);
        service.create_app_data(Caller::system(), &request).unwrap();

        let uid = get_uid(user, app_id);
        assert_eq!(
            quota.set_calls(),
            vec![("/dev/block/dm-0".to_string(), QuotaKind::User, uid)]
        );
        let (bytes, inodes) = filesystem_totals(&config.data_root).unwrap();
        let expected = hard_limits_for(bytes, inodes);
        let applied = quota.get_quota("/dev/block/dm-0", QuotaKind::User, uid).unwrap();
        assert_eq!(applied.block_hard_limit, expected.block_hard_limit);
        assert_eq!(applied.inode_hard_limit, expected.inode_hard_limit);

        // Limits in place are not rewritten.
        if applied.block_hard_limit != 0 && applied.inode_hard_limit != 0 {
            service.create_app_data(Caller::system(), &request).unwrap();
            assert_eq!(quota.set_calls().len(), 1);
        }
    }

    #[test]
    fn test_create_requires_system_and_valid_name() {
        let fx = fixture(0);
        let request = create_request(0, 10050, FLAG_STORAGE_CE);
        assert!(matches!(
            fx.service.create_app_data(Caller::new(10050), &request),
            Err(StorageError::Security(_))
        ));

        let mut bad = request.clone();
        bad.package_name = "../evil".to_string();
        assert!(matches!(
            fx.service.create_app_data(Caller::system(), &bad),
            Err(StorageError::IllegalArgument(_))
        ));
        assert!(!fx.config.data_root.join("user/0/com.foo").exists());
    }

    #[test]
    fn test_create_fails_without_user_root() {
        let fx = fixture(0);
        let request = create_request(7, 10050, FLAG_STORAGE_DE);
        let err = fx
            .service
            .create_app_data(Caller::system(), &request)
            .unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn test_destroy_and_clear_missing_are_ok() {
        let fx = fixture(0);
        let both = FLAG_STORAGE_CE | FLAG_STORAGE_DE;
        fx.service
            .destroy_app_data(Caller::system(), &destroy_request(0, both))
            .unwrap();
        fx.service
            .clear_app_data(Caller::system(), &destroy_request(0, both))
            .unwrap();
        fx.service
            .clear_app_data(
                Caller::system(),
                &destroy_request(0, both | FLAG_CLEAR_CACHE_ONLY),
            )
            .unwrap();
    }

    #[test]
    fn test_clear_cache_only_keeps_data() {
        let fx = fixture(0);
        let ce = fx.config.data_root.join("user/0/com.foo");
        fs::create_dir_all(ce.join("cache/sub")).unwrap();
        fs::write(ce.join("cache/sub/blob"), b"x").unwrap();
        fs::write(ce.join("prefs.xml"), b"x").unwrap();

        fx.service
            .clear_app_data(
                Caller::system(),
                &destroy_request(0, FLAG_STORAGE_CE | FLAG_CLEAR_CACHE_ONLY),
            )
            .unwrap();
        assert!(ce.join("cache").is_dir());
        assert!(!ce.join("cache/sub").exists());
        assert!(ce.join("prefs.xml").exists());

        fx.service
            .clear_app_data(Caller::system(), &destroy_request(0, FLAG_STORAGE_CE))
            .unwrap();
        assert!(ce.is_dir());
        assert_eq!(fs::read_dir(&ce).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_de_truncates_current_profile() {
        let fx = fixture(0);
        let de = fx.config.data_root.join("user_de/0/com.foo");
        fs::create_dir_all(&de).unwrap();
        let profile = fx.config.profiles_root.join("cur/0/com.foo/primary.prof");
        fs::create_dir_all(profile.parent().unwrap()).unwrap();
        fs::write(&profile, b"profile").unwrap();

        fx.service
            .clear_app_data(Caller::system(), &destroy_request(0, FLAG_STORAGE_DE))
            .unwrap();
        assert_eq!(fs::metadata(&profile).unwrap().len(), 0);
    }

    #[test]
    fn test_destroy_removes_dirs_and_profiles() {
        let fx = fixture(0);
        let ce = fx.config.data_root.join("user/0/com.foo");
        let de = fx.config.data_root.join("user_de/0/com.foo");
        let cur = fx.config.profiles_root.join("cur/0/com.foo");
        let reference = fx.config.profiles_root.join("ref/com.foo");
        for dir in [&ce, &de, &cur, &reference] {
            fs::create_dir_all(dir.join("nested")).unwrap();
            fs::write(dir.join("nested/file"), b"x").unwrap();
        }

        fx.service
            .destroy_app_data(Caller::system(), &destroy_request(0, FLAG_STORAGE_DE))
            .unwrap();
        assert!(ce.exists());
        assert!(!de.exists());
        assert!(!cur.exists());
        assert!(!reference.exists());

        fx.service
            .destroy_app_data(Caller::system(), &destroy_request(0, FLAG_STORAGE_CE))
            .unwrap();
        assert!(!ce.exists());
    }

    #[test]
    fn test_destroy_follows_inode_hint() {
        let fx = fixture(0);
        let rotated = fx.config.data_root.join("user/0/rotated_name");
        fs::create_dir_all(&rotated).unwrap();
        let inode = fs::metadata(&rotated).unwrap().ino();

        let mut request = destroy_request(0, FLAG_STORAGE_CE);
        request.ce_data_inode = inode;
        fx.service.destroy_app_data(Caller::system(), &request).unwrap();
        assert!(!rotated.exists());
    }

    #[test]
    fn test_migrate_moves_ce_to_de() {
        let fx = fixture(0);
        let ce = fx.config.data_root.join("user/0/com.foo");
        let de = fx.config.data_root.join("user_de/0/com.foo");
        fs::create_dir_all(&ce).unwrap();
        fs::create_dir_all(&de).unwrap();
        fs::write(ce.join("db"), b"data").unwrap();
        if let Err(e) = xattr::set(&ce, "user.support_check", b"") {
            assert!(xattr::is_unsupported(&e));
            return;
        }

        let request = MigrateAppDataRequest {
            volume_uuid: None,
            package_name: "com.foo".to_string(),
            user_id: 0,
            flags: FLAG_STORAGE_DE,
        };
        fx.service.migrate_app_data(Caller::system(), &request).unwrap();
        assert!(!ce.exists());
        assert_eq!(fs::read(de.join("db")).unwrap(), b"data");
        assert!(xattr::has(&de, XATTR_DEFAULT));

        // Already the default: nothing moves.
        fx.service.migrate_app_data(Caller::system(), &request).unwrap();
        assert!(de.join("db").exists());
    }

    #[test]
    fn test_restorecon_is_recursive_per_class() {
        let fx = fixture(0);
        let request = RestoreconAppDataRequest {
            volume_uuid: None,
            package_name: "com.foo".to_string(),
            user_id: 0,
            flags: FLAG_STORAGE_CE | FLAG_STORAGE_DE,
            app_id: 10050,
            se_info: "default".to_string(),
        };
        fx.service.restorecon_app_data(Caller::system(), &request).unwrap();
        assert_eq!(fx.labeler.recursive_calls(), 2);
        let paths: Vec<PathBuf> = fx.labeler.calls().into_iter().map(|(p, _)| p).collect();
        assert!(paths.contains(&fx.config.data_root.join("user_de/0/com.foo")));
    }

    #[test]
    fn test_profiles_clear_and_destroy() {
        let fx = fixture(0);
        let cur = fx.config.profiles_root.join("cur/0/com.foo");
        let reference = fx.config.profiles_root.join("ref/com.foo");
        for dir in [&cur, &reference] {
            fs::create_dir_all(dir).unwrap();
            fs::write(dir.join("primary.prof"), b"profile").unwrap();
        }
        let request = PackageProfilesRequest {
            package_name: "com.foo".to_string(),
        };

        fx.service.clear_app_profiles(Caller::system(), &request).unwrap();
        assert_eq!(fs::metadata(cur.join("primary.prof")).unwrap().len(), 0);
        assert_eq!(fs::metadata(reference.join("primary.prof")).unwrap().len(), 0);

        fx.service.destroy_app_profiles(Caller::system(), &request).unwrap();
        assert!(!cur.exists());
        assert!(!reference.exists());
        // Gone is gone.
        fx.service.destroy_app_profiles(Caller::system(), &request).unwrap();
    }

    #[test]
    fn test_destroy_user_data() {
        let fx = fixture(10);
        let misc = fx.config.misc_user_root.join("10");
        let media = fx.config.data_root.join("media/10");
        for dir in [&misc, &media] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(fx.config.data_root.join("user/10/file"), b"x").unwrap();

        let request = DestroyUserDataRequest {
            volume_uuid: None,
            user_id: 10,
            flags: FLAG_STORAGE_DE,
        };
        fx.service.destroy_user_data(Caller::system(), &request).unwrap();
        assert!(!fx.config.data_root.join("user_de/10").exists());
        assert!(!misc.exists());
        assert!(fx.config.data_root.join("user/10").exists());

        let request = DestroyUserDataRequest {
            flags: FLAG_STORAGE_CE,
            ..request
        };
        fx.service.destroy_user_data(Caller::system(), &request).unwrap();
        assert!(!fx.config.data_root.join("user/10").exists());
        assert!(!media.exists());
    }

    #[test]
    fn test_create_user_data_misc_dir() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let fx = fixture(10);
        fs::create_dir_all(&fx.config.misc_user_root).unwrap();
        let request = CreateUserDataRequest {
            volume_uuid: None,
            user_id: 10,
            user_serial: 3,
            flags: FLAG_STORAGE_DE,
        };
        fx.service.create_user_data(Caller::system(), &request).unwrap();
        let meta = fs::metadata(fx.config.misc_user_root.join("10")).unwrap();
        assert_eq!(meta.uid(), 1_001_000);
        assert_eq!(meta.gid(), 1_009_997);
        assert_eq!(meta.permissions().mode() & 0o777, 0o750);
    }

    #[test]
    fn test_move_complete_app() {
        let Some((user, app_id)) = test_identity() else {
            return;
        };
        let fx = fixture(user);
        let data = &fx.config.data_root;
        fs::create_dir_all(data.join("app/com.foo-1")).unwrap();
        fs::write(data.join("app/com.foo-1/base.apk"), b"apk").unwrap();
        fx.service
            .create_app_data(
                Caller::system(),
                &create_request(user, app_id, FLAG_STORAGE_CE | FLAG_STORAGE_DE),
            )
            .unwrap();
        fs::write(data.join(format!("user/{}/com.foo/ce_file", user)), b"ce").unwrap();
        fs::write(data.join(format!("user_de/{}/com.foo/de_file", user)), b"de").unwrap();

        let target = fx.config.expand_root.join("57f8");
        for dir in ["app".to_string(), format!("user/{}", user), format!("user_de/{}", user)] {
            fs::create_dir_all(target.join(dir)).unwrap();
        }

        let request = MoveCompleteAppRequest {
            from_uuid: None,
            to_uuid: Some("57f8".to_string()),
            package_name: "com.foo".to_string(),
            data_app_name: "com.foo-1".to_string(),
            app_id,
            se_info: "default".to_string(),
            target_sdk_version: 30,
        };
        fx.service.move_complete_app(Caller::system(), &request).unwrap();

        assert_eq!(fs::read(target.join("app/com.foo-1/base.apk")).unwrap(), b"apk");
        assert_eq!(
            fs::read(target.join(format!("user/{}/com.foo/ce_file", user))).unwrap(),
            b"ce"
        );
        assert_eq!(
            fs::read(target.join(format!("user_de/{}/com.foo/de_file", user))).unwrap(),
            b"de"
        );
        // Source is untouched.
        assert!(data.join(format!("user/{}/com.foo/ce_file", user)).exists());
    }

    #[test]
    fn test_move_rolls_back_on_copy_failure() {
        let fx = fixture(0);
        let target = fx.config.expand_root.join("57f8");
        fs::create_dir_all(target.join("app")).unwrap();

        let request = MoveCompleteAppRequest {
            from_uuid: None,
            to_uuid: Some("57f8".to_string()),
            package_name: "com.foo".to_string(),
            data_app_name: "com.foo-1".to_string(),
            app_id: 10050,
            se_info: "default".to_string(),
            target_sdk_version: 30,
        };
        let err = fx
            .service
            .move_complete_app(Caller::system(), &request)
            .unwrap_err();
        assert!(matches!(err, StorageError::ServiceSpecific { .. }));
        assert!(!target.join("app/com.foo-1").exists());
    }
}
