//! Layered service configuration
//!
//! Three layers, later ones winning:
//! 1. Built-in defaults
//! 2. Host config file (/etc/stord/stord.toml or --config)
//! 3. CLI flags
//!
//! The merged result deserializes into a [`stord_core::ServiceConfig`].

mod defaults;
mod effective;
mod merge;

pub use defaults::{builtin_defaults, DEFAULT_CONFIG_PATH};
pub use effective::{ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig};
pub use merge::{deep_merge, merge_layers};
