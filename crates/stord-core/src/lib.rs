//! stord core
//!
//! Per-app storage management for a multi-user device: the canonical
//! directory layout, creation and teardown of package and user storage,
//! quota-aware size accounting, fair cache eviction, and inode indirection
//! for CE directories whose names may be rotated.
//!
//! Everything is driven through [`StorageService`]; [`rpc::RpcHandler`]
//! exposes it as a JSON-lines protocol.

pub mod cache;
pub mod config;
pub mod disk;
pub mod error;
pub mod fixup;
pub mod fsutil;
pub mod identity;
pub mod inode;
pub mod measure;
pub mod media;
pub mod mock;
pub mod mounts;
pub mod paths;
pub mod quota;
pub mod rpc;
pub mod selinux;
pub mod service;
pub mod walk;
pub mod xattr;

pub use config::ServiceConfig;
pub use error::{StorageError, StorageResult};
pub use identity::Caller;
pub use paths::{PathLayout, Volume};
pub use service::{StorageService, StorageServiceBuilder};
