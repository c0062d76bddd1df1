//! Size accounting.
//!
//! Every report has two strategies. With a quota-capable device the kernel's
//! per-uid and per-gid counters answer most questions directly. Without one
//! the relevant trees are walked and every entry is charged `blocks * 512`.
//! Missing paths contribute zero and unreadable entries are logged and
//! skipped, so one bad subtree never fails a whole report.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use stord_protocol::ops::{AppSize, ExternalSize, GetAppSizeRequest};
use tracing::{debug, warn};

use crate::error::StorageResult;
use crate::fsutil::{calculate_tree_size, TreeFilter};
use crate::identity::{
    get_app_id, get_cache_gid, get_ext_cache_gid, get_ext_gid, get_shared_app_gid, get_uid,
    get_user_id, AID_APP_END, AID_APP_START, AID_MEDIA_AUDIO, AID_MEDIA_IMAGE, AID_MEDIA_OBB,
    AID_MEDIA_RW, AID_MEDIA_VIDEO,
};
use crate::media::{match_extension, MediaKind};
use crate::paths::{file_name_str, PathLayout, Volume};
use crate::quota::{QuotaKind, QuotaSource};
use crate::walk::{self, Entry, Visit, Visitor};

/// One side (internal or external) of a size report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub code: i64,
    pub data: i64,
    pub cache: i64,
}

fn combine(stats: Stats, ext: Stats) -> AppSize {
    AppSize {
        code: stats.code,
        data: stats.data,
        cache: stats.cache,
        external_code: ext.code,
        external_data: ext.data,
        external_cache: ext.cache,
    }
}

fn is_app_id(app_id: u32) -> bool {
    (AID_APP_START..=AID_APP_END).contains(&app_id)
}

/// Add the kernel's counters for one app.
///
/// `stats` receives the uid (data), cache gid (cache) and shared gid (code);
/// `ext` receives the external gid (data) and external cache gid (data and
/// cache).
pub fn collect_quota_stats(
    quota: QuotaSource<'_>,
    user: u32,
    app_id: u32,
    stats: Option<&mut Stats>,
    ext: Option<&mut Stats>,
) {
    if let Some(stats) = stats {
        if let Some(used) = quota.used(QuotaKind::User, get_uid(user, app_id)) {
            stats.data += used;
        }
        if let Some(gid) = get_cache_gid(user, app_id) {
            stats.cache += quota.used(QuotaKind::Group, gid).unwrap_or(0);
        }
        if let Some(gid) = get_shared_app_gid(app_id) {
            stats.code += quota.used(QuotaKind::Group, gid).unwrap_or(0);
        }
    }
    if let Some(ext) = ext {
        if let Some(gid) = get_ext_gid(user, app_id) {
            ext.data += quota.used(QuotaKind::Group, gid).unwrap_or(0);
        }
        if let Some(gid) = get_ext_cache_gid(user, app_id) {
            if let Some(used) = quota.used(QuotaKind::Group, gid) {
                ext.data += used;
                ext.cache += used;
            }
        }
    }
}

/// Charge the immediate children of a package directory.
///
/// Every child counts as data; child directories count their whole tree. A
/// child directory is also cache when it is named `cache` or `code_cache`,
/// or when it is owned by `cache_gid`. The directory's own node counts as
/// data and the legacy `lib` symlink is not charged at all.
pub fn collect_manual_stats(path: &Path, cache_gid: Option<u32>, stats: &mut Stats) {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to open");
            }
            return;
        }
    };
    if let Ok(meta) = fs::symlink_metadata(path) {
        stats.data += meta.blocks() as i64 * 512;
    }

    for entry in entries.flatten() {
        let child = entry.path();
        let meta = match fs::symlink_metadata(&child) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %child.display(), error = %e, "failed to stat");
                continue;
            }
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let file_type = meta.file_type();

        let size = if file_type.is_dir() {
            let size = calculate_tree_size(&child, TreeFilter::default());
            let named_cache = name == "cache" || name == "code_cache";
            let owned_by_cache = cache_gid.is_some_and(|gid| gid == meta.gid());
            if named_cache || owned_by_cache {
                stats.cache += size;
            }
            size
        } else {
            if file_type.is_symlink() && name == "lib" {
                continue;
            }
            meta.blocks() as i64 * 512
        };
        stats.data += size;
    }
}

/// [`collect_manual_stats`] for every package directory under a user root.
///
/// With `exclude_apps`, directories owned by an app uid are skipped since
/// quota already accounts for them.
pub fn collect_manual_stats_for_user(path: &Path, stats: &mut Stats, exclude_apps: bool) {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to open");
            }
            return;
        }
    };
    for entry in entries.flatten() {
        let child = entry.path();
        let Ok(meta) = fs::symlink_metadata(&child) else {
            continue;
        };
        if !meta.file_type().is_dir() {
            continue;
        }
        let app_id = get_app_id(meta.uid());
        if exclude_apps && is_app_id(app_id) {
            continue;
        }
        let cache_gid = get_cache_gid(get_user_id(meta.uid()), app_id);
        collect_manual_stats(&child, cache_gid, stats);
    }
}

/// Walks `<media>/<user>` charging everything to data; anything under
/// `Android/data/<pkg>/cache` is also cache. The context marks that subtree.
struct ExternalUserStats<'a> {
    stats: &'a mut Stats,
}

fn is_app_cache_dir(entry: &Entry<'_>) -> bool {
    if entry.depth != 4 || file_name_str(entry.path) != Some("cache") {
        return false;
    }
    let mut ancestors = entry.path.ancestors().skip(2);
    let data = ancestors.next().and_then(file_name_str);
    let android = ancestors.next().and_then(file_name_str);
    data == Some("data") && android == Some("Android")
}

impl Visitor for ExternalUserStats<'_> {
    type Context = bool;

    fn enter(&mut self, entry: &Entry<'_>, in_cache: &bool) -> Visit<bool> {
        let in_cache = *in_cache || (entry.is_dir() && is_app_cache_dir(entry));
        let size = entry.metadata.blocks() as i64 * 512;
        if in_cache {
            self.stats.cache += size;
        }
        self.stats.data += size;
        Visit::Descend(in_cache)
    }
}

/// Charge a user's whole external storage tree.
pub fn collect_manual_external_stats_for_user(path: &Path, stats: &mut Stats) {
    if let Err(e) = walk::walk(path, false, &mut ExternalUserStats { stats }) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to walk");
        }
    }
}

/// Buckets a user's external storage by media type. The context says
/// whether the parent lies inside the app-private `Android` tree.
#[derive(Default)]
struct ExternalBuckets {
    size: ExternalSize,
}

impl Visitor for ExternalBuckets {
    type Context = bool;

    fn enter(&mut self, entry: &Entry<'_>, parent_is_app: &bool) -> Visit<bool> {
        let size = entry.metadata.blocks() as i64 * 512;
        if entry.metadata.file_type().is_file() && !*parent_is_app {
            match file_name_str(entry.path).and_then(match_extension) {
                Some(MediaKind::Audio) => self.size.audio += size,
                Some(MediaKind::Video) => self.size.video += size,
                Some(MediaKind::Image) => self.size.image += size,
                None => {}
            }
        }
        if *parent_is_app {
            self.size.app += size;
        }
        self.size.total += size;

        let is_app = if entry.depth == 1 && file_name_str(entry.path) == Some("Android") {
            true
        } else {
            *parent_is_app
        };
        Visit::Descend(is_app)
    }
}

/// Sizes of one or more packages of one app for one user.
///
/// `ce_data_inodes` and `code_paths` line up with `package_names`; a
/// missing inode hint falls back to the nominal CE path.
pub fn app_size(
    layout: &PathLayout,
    volume: &Volume,
    request: &GetAppSizeRequest,
    quota: Option<QuotaSource<'_>>,
) -> StorageResult<AppSize> {
    let user = request.user_id;
    let app_id = request.app_id;
    let mut stats = Stats::default();
    let mut ext = Stats::default();

    for package in &request.package_names {
        ext.code += calculate_tree_size(&layout.media_obb_path(volume, package), TreeFilter::default());
    }

    match quota {
        Some(quota) if app_id >= AID_APP_START => {
            let filter = TreeFilter {
                exclude_gid: get_shared_app_gid(app_id),
                ..TreeFilter::default()
            };
            for code_path in &request.code_paths {
                stats.code += calculate_tree_size(Path::new(code_path), filter);
            }
            collect_quota_stats(quota, user, app_id, Some(&mut stats), Some(&mut ext));
        }
        _ => {
            for code_path in &request.code_paths {
                stats.code += calculate_tree_size(Path::new(code_path), TreeFilter::default());
            }

            let cache_gid = get_cache_gid(user, app_id);
            let media = layout.media_path(volume, user);
            for (i, package) in request.package_names.iter().enumerate() {
                let inode = request.ce_data_inodes.get(i).copied().unwrap_or(0);
                let ce = layout.ce_package_path_by_inode(volume, user, package, inode)?;
                collect_manual_stats(&ce, cache_gid, &mut stats);
                let de = layout.de_package_path(volume, user, package)?;
                collect_manual_stats(&de, cache_gid, &mut stats);

                if volume.is_primary() {
                    let cur = layout.cur_profile_package_dir(user, package)?;
                    stats.data += calculate_tree_size(&cur, TreeFilter::default());
                    let reference = layout.ref_profile_package_dir(package)?;
                    stats.code += calculate_tree_size(&reference, TreeFilter::default());
                }

                let ext_data = PathLayout::media_package_path(&media, "data", package);
                collect_manual_stats(&ext_data, get_ext_cache_gid(user, app_id), &mut ext);
                let ext_media = PathLayout::media_package_path(&media, "media", package);
                ext.data += calculate_tree_size(&ext_media, TreeFilter::default());
            }

            if volume.is_primary() {
                if let Some(shared_gid) = get_shared_app_gid(app_id) {
                    stats.code += calculate_tree_size(
                        &layout.config().dalvik_cache_dir,
                        TreeFilter::include(Some(shared_gid)),
                    );
                }
            }
        }
    }

    let size = combine(stats, ext);
    debug!(user, app_id, ?size, "measured app");
    Ok(size)
}

/// Totals for one user across every app plus the user's shared areas.
pub fn user_size(
    layout: &PathLayout,
    volume: &Volume,
    user: u32,
    app_ids: &[u32],
    quota: Option<QuotaSource<'_>>,
) -> AppSize {
    let mut stats = Stats::default();
    let mut ext = Stats::default();
    let primary = volume.is_primary();

    if let Some(quota) = quota {
        let apps = TreeFilter::exclude_apps();
        ext.code += quota.used(QuotaKind::Group, AID_MEDIA_OBB).unwrap_or(0);
        stats.code += calculate_tree_size(&layout.app_path(volume), apps);

        collect_manual_stats_for_user(&layout.user_ce_path(volume, user), &mut stats, true);
        collect_manual_stats_for_user(&layout.user_de_path(volume, user), &mut stats, true);

        if primary {
            stats.data += calculate_tree_size(&layout.cur_profile_dir(user), apps);
            stats.code += calculate_tree_size(&layout.ref_profile_dir(), apps);
            stats.code += calculate_tree_size(&layout.config().dalvik_cache_dir, apps);
        }

        ext.data += quota
            .used(QuotaKind::User, get_uid(user, AID_MEDIA_RW))
            .unwrap_or(0);

        // External data is already covered by the media_rw total above.
        let ext_data = ext.data;
        for &app_id in app_ids.iter().filter(|&&id| id >= AID_APP_START) {
            collect_quota_stats(quota, user, app_id, Some(&mut stats), Some(&mut ext));
        }
        ext.data = ext_data;
    } else {
        let all = TreeFilter::default();
        ext.code += calculate_tree_size(&layout.media_root(volume).join("obb"), all);
        stats.code += calculate_tree_size(&layout.app_path(volume), all);

        collect_manual_stats_for_user(&layout.user_ce_path(volume, user), &mut stats, false);
        collect_manual_stats_for_user(&layout.user_de_path(volume, user), &mut stats, false);

        if primary {
            stats.data += calculate_tree_size(&layout.cur_profile_dir(user), all);
            stats.code += calculate_tree_size(&layout.ref_profile_dir(), all);
        }

        collect_manual_external_stats_for_user(&layout.media_path(volume, user), &mut ext);

        if primary {
            stats.code += calculate_tree_size(&layout.config().dalvik_cache_dir, all);
        }
    }

    let size = combine(stats, ext);
    debug!(user, ?size, "measured user");
    size
}

/// External storage of one user broken down by media type.
pub fn external_size(
    layout: &PathLayout,
    volume: &Volume,
    user: u32,
    app_ids: &[u32],
    quota: Option<QuotaSource<'_>>,
) -> ExternalSize {
    let size = match quota {
        Some(quota) => {
            let group = |id: u32| quota.used(QuotaKind::Group, id).unwrap_or(0);
            let mut ext = Stats::default();
            for &app_id in app_ids.iter().filter(|&&id| id >= AID_APP_START) {
                collect_quota_stats(quota, user, app_id, None, Some(&mut ext));
            }
            ExternalSize {
                total: quota
                    .used(QuotaKind::User, get_uid(user, AID_MEDIA_RW))
                    .unwrap_or(0),
                audio: group(get_uid(user, AID_MEDIA_AUDIO)),
                video: group(get_uid(user, AID_MEDIA_VIDEO)),
                image: group(get_uid(user, AID_MEDIA_IMAGE)),
                app: ext.data,
                obb: group(AID_MEDIA_OBB),
            }
        }
        None => {
            let media = layout.media_path(volume, user);
            let mut buckets = ExternalBuckets::default();
            if let Err(e) = walk::walk(&media, false, &mut buckets) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %media.display(), error = %e, "failed to walk");
                }
            }
            let obb = layout.media_root(volume).join("obb");
            ExternalSize {
                obb: calculate_tree_size(&obb, TreeFilter::default()),
                ..buckets.size
            }
        }
    };
    debug!(user, ?size, "measured external");
    size
}
