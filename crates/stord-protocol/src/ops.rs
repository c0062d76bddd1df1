//! Operation-specific types.

pub mod app_data;
pub mod cache;
pub mod size;
pub mod user_data;
pub mod volume;

pub use app_data::{
    ClearAppDataRequest, CreateAppDataRequest, CreateAppDataResponse, DestroyAppDataRequest,
    FixupAppDataRequest, FixupAppDataResponse, MigrateAppDataRequest, MoveCompleteAppRequest,
    PackageProfilesRequest, RestoreconAppDataRequest,
};
pub use cache::{FreeCacheRequest, FreeCacheResponse, SetAppQuotaRequest};
pub use size::{
    AppSize, ExternalSize, GetAppSizeRequest, GetExternalSizeRequest, GetUserSizeRequest,
    SizeResponse,
};
pub use user_data::{CreateUserDataRequest, DestroyUserDataRequest};
pub use volume::{DumpResponse, IsQuotaSupportedRequest, IsQuotaSupportedResponse};

/// Known operation names.
pub mod names {
    pub const CREATE_APP_DATA: &str = "create_app_data";
    pub const DESTROY_APP_DATA: &str = "destroy_app_data";
    pub const MIGRATE_APP_DATA: &str = "migrate_app_data";
    pub const CLEAR_APP_DATA: &str = "clear_app_data";
    pub const FIXUP_APP_DATA: &str = "fixup_app_data";
    pub const RESTORECON_APP_DATA: &str = "restorecon_app_data";
    pub const MOVE_COMPLETE_APP: &str = "move_complete_app";
    pub const CLEAR_APP_PROFILES: &str = "clear_app_profiles";
    pub const DESTROY_APP_PROFILES: &str = "destroy_app_profiles";
    pub const CREATE_USER_DATA: &str = "create_user_data";
    pub const DESTROY_USER_DATA: &str = "destroy_user_data";
    pub const GET_APP_SIZE: &str = "get_app_size";
    pub const GET_USER_SIZE: &str = "get_user_size";
    pub const GET_EXTERNAL_SIZE: &str = "get_external_size";
    pub const SET_APP_QUOTA: &str = "set_app_quota";
    pub const FREE_CACHE: &str = "free_cache";
    pub const INVALIDATE_MOUNTS: &str = "invalidate_mounts";
    pub const IS_QUOTA_SUPPORTED: &str = "is_quota_supported";
    pub const DUMP: &str = "dump";
}
