//! Built-in defaults (layer 1)

use serde_json::Value;
use stord_core::ServiceConfig;

use super::effective::ConfigError;

/// Host config file consulted when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/stord/stord.toml";

/// The production defaults as a mergeable value.
pub fn builtin_defaults() -> Result<Value, ConfigError> {
    serde_json::to_value(ServiceConfig::default())
        .map_err(|e| ConfigError::ParseError(format!("failed to encode defaults: {}", e)))
}
