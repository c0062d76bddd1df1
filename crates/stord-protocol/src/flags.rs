//! Storage flag bits shared by every operation.
//!
//! Values are part of the wire contract and must stay stable.

/// Select device-encrypted storage.
pub const FLAG_STORAGE_DE: i32 = 1 << 0;
/// Select credential-encrypted storage.
pub const FLAG_STORAGE_CE: i32 = 1 << 1;

/// `clearAppData`: only clear the `cache` directory.
pub const FLAG_CLEAR_CACHE_ONLY: i32 = 1 << 8;
/// `clearAppData`: only clear the `code_cache` directory.
pub const FLAG_CLEAR_CODE_CACHE_ONLY: i32 = 1 << 9;

/// Size queries: prefer kernel quota accounting when the volume supports it.
pub const FLAG_USE_QUOTA: i32 = 1 << 12;
/// `freeCache`: use the fair, quota-ratio eviction strategy.
pub const FLAG_FREE_CACHE_V2: i32 = 1 << 13;
/// `freeCache`: keep evicting from owners already under their quota.
pub const FLAG_FREE_CACHE_V2_DEFY_QUOTA: i32 = 1 << 14;
/// `freeCache`: account for purges without touching the disk.
pub const FLAG_FREE_CACHE_NOOP: i32 = 1 << 15;
/// `fixupAppData`: visit every entry instead of pruning matching subtrees.
pub const FLAG_FORCE: i32 = 1 << 16;

/// Check whether `flags` has every bit of `flag` set.
pub fn has(flags: i32, flag: i32) -> bool {
    flags & flag == flag
}
