//! Multi-user uid/gid arithmetic and caller identity.
//!
//! A kernel uid encodes `(user, appId)` as `user * AID_USER_OFFSET + appId`.
//! Each app id in the application range also owns a dedicated cache gid,
//! external-storage gids and a shared gid, all found by shifting the app id
//! into a parallel range.

use serde::{Deserialize, Serialize};

pub const AID_ROOT: u32 = 0;
pub const AID_SYSTEM: u32 = 1000;
pub const AID_MEDIA_RW: u32 = 1023;
pub const AID_MEDIA_AUDIO: u32 = 1055;
pub const AID_MEDIA_VIDEO: u32 = 1056;
pub const AID_MEDIA_IMAGE: u32 = 1057;
pub const AID_MEDIA_OBB: u32 = 1059;
pub const AID_EVERYBODY: u32 = 9997;

pub const AID_APP_START: u32 = 10000;
pub const AID_APP_END: u32 = 19999;
pub const AID_CACHE_GID_START: u32 = 20000;
pub const AID_CACHE_GID_END: u32 = 29999;
pub const AID_EXT_GID_START: u32 = 30000;
pub const AID_EXT_GID_END: u32 = 39999;
pub const AID_EXT_CACHE_GID_START: u32 = 40000;
pub const AID_EXT_CACHE_GID_END: u32 = 49999;
pub const AID_SHARED_GID_START: u32 = 50000;
pub const AID_SHARED_GID_END: u32 = 59999;

pub const AID_USER_OFFSET: u32 = 100000;

/// Compose a kernel uid from a user id and an app id.
pub fn get_uid(user: u32, app_id: u32) -> u32 {
    user * AID_USER_OFFSET + (app_id % AID_USER_OFFSET)
}

pub fn get_user_id(uid: u32) -> u32 {
    uid / AID_USER_OFFSET
}

pub fn get_app_id(uid: u32) -> u32 {
    uid % AID_USER_OFFSET
}

fn shifted_gid(user: u32, app_id: u32, range_start: u32) -> Option<u32> {
    if (AID_APP_START..=AID_APP_END).contains(&app_id) {
        Some(get_uid(user, app_id - AID_APP_START + range_start))
    } else {
        None
    }
}

/// Dedicated gid owning the app's `cache` and `code_cache` directories.
pub fn get_cache_gid(user: u32, app_id: u32) -> Option<u32> {
    shifted_gid(user, app_id, AID_CACHE_GID_START)
}

/// Cache gid for the owner of `uid`, or `uid` itself outside the app range.
pub fn cache_gid_or_uid(uid: u32) -> u32 {
    get_cache_gid(get_user_id(uid), get_app_id(uid)).unwrap_or(uid)
}

/// Gid owning the app's files on external storage.
pub fn get_ext_gid(user: u32, app_id: u32) -> Option<u32> {
    shifted_gid(user, app_id, AID_EXT_GID_START)
}

/// Gid owning the app's cache files on external storage.
pub fn get_ext_cache_gid(user: u32, app_id: u32) -> Option<u32> {
    shifted_gid(user, app_id, AID_EXT_CACHE_GID_START)
}

/// Gid shared by every user's instance of the app; owns code and profiles.
///
/// Always expressed in user 0.
pub fn get_shared_app_gid(app_id: u32) -> Option<u32> {
    let app_id = get_app_id(app_id);
    if (AID_APP_START..=AID_APP_END).contains(&app_id) {
        Some(app_id - AID_APP_START + AID_SHARED_GID_START)
    } else if (AID_SHARED_GID_START..=AID_SHARED_GID_END).contains(&app_id) {
        Some(app_id)
    } else {
        None
    }
}

/// Map an external-storage gid back to the uid of the app it belongs to.
///
/// External storage is physically owned by media_rw, so the gid is the only
/// remaining hint of the real owner. Returns `None` when the gid is outside
/// the external range.
pub fn app_uid_for_ext_gid(gid: u32) -> Option<u32> {
    let app_id = get_app_id(gid);
    if (AID_EXT_GID_START..=AID_EXT_GID_END).contains(&app_id) {
        Some(get_uid(get_user_id(gid), app_id - AID_EXT_GID_START + AID_APP_START))
    } else {
        None
    }
}

/// Identity of the process issuing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub uid: u32,
}

impl Caller {
    pub fn new(uid: u32) -> Self {
        Self { uid }
    }

    /// The system server identity.
    pub fn system() -> Self {
        Self { uid: AID_SYSTEM }
    }

    /// Root and system may mutate storage.
    pub fn is_elevated(&self) -> bool {
        matches!(self.uid, AID_ROOT | AID_SYSTEM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_composition() {
        assert_eq!(get_uid(0, 10050), 10050);
        assert_eq!(get_uid(10, 10050), 1_010_050);
        assert_eq!(get_user_id(1_010_050), 10);
        assert_eq!(get_app_id(1_010_050), 10050);
    }

    #[test]
    fn test_dedicated_gids() {
        assert_eq!(get_cache_gid(0, 10050), Some(20050));
        assert_eq!(get_cache_gid(10, 10050), Some(1_020_050));
        assert_eq!(get_ext_gid(0, 10050), Some(30050));
        assert_eq!(get_ext_cache_gid(0, 10050), Some(40050));
        assert_eq!(get_shared_app_gid(10050), Some(50050));
        assert_eq!(get_shared_app_gid(50050), Some(50050));
        assert_eq!(get_cache_gid(0, AID_SYSTEM), None);
        assert_eq!(get_shared_app_gid(AID_SYSTEM), None);
        assert_eq!(cache_gid_or_uid(1_010_050), 1_020_050);
        assert_eq!(cache_gid_or_uid(AID_SYSTEM), AID_SYSTEM);
    }

    #[test]
    fn test_ext_gid_remap() {
        assert_eq!(app_uid_for_ext_gid(30050), Some(10050));
        assert_eq!(app_uid_for_ext_gid(1_030_050), Some(1_010_050));
        assert_eq!(app_uid_for_ext_gid(AID_MEDIA_RW), None);
    }

    #[test]
    fn test_elevated_callers() {
        assert!(Caller::new(AID_ROOT).is_elevated());
        assert!(Caller::system().is_elevated());
        assert!(!Caller::new(10050).is_elevated());
    }
}
