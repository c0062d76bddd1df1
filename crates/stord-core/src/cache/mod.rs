//! Cache eviction engine.
//!
//! Frees cache space fairly across apps: every run builds one
//! [`CacheTracker`] per `(user, appId)` owner, ranks them by how far over
//! their cache quota they are and deletes items from whichever owner is
//! currently the most over quota.

mod evict;
mod item;
mod tracker;

pub use evict::{EvictionReport, EvictionState, Evictor, StopReason};
pub use item::{load_items, CacheItem};
pub use tracker::{scan_trackers, CacheTracker, RATIO_SCALE};
