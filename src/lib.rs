//! stord - per-app storage management daemon
//!
//! The storage service itself lives in `stord-core` and its wire types in
//! `stord-protocol`. This crate holds what the `stord` binary layers on top:
//! configuration loading with provenance and logging setup.

pub mod config;
pub mod logging;

pub use config::{ConfigError, EffectiveConfig};
pub use stord_core::{Caller, ServiceConfig, StorageService};
