//! Effective configuration with provenance
//!
//! Records the merged configuration together with every layer that
//! contributed to it, so `stord config` can show where a value came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use stord_core::ServiceConfig;

use super::defaults::builtin_defaults;
use super::merge::merge_layers;

/// Schema identifier
pub const SCHEMA_ID: &str = "stord/effective_config@1";

/// Origin of a configuration layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

/// A contributing layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (files only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the raw file bytes (files only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Merged configuration plus provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub schema_id: String,

    /// When the layers were merged
    pub created_at: DateTime<Utc>,

    /// The merged configuration object
    pub config: Value,

    /// Contributing layers in precedence order
    pub sources: Vec<ConfigSource>,
}

impl EffectiveConfig {
    /// Merge the built-in defaults, an optional TOML file and CLI overrides.
    ///
    /// A file that is given must exist.
    pub fn build(file: Option<&Path>, cli_overrides: Option<Value>) -> Result<Self, ConfigError> {
        let mut layers = vec![builtin_defaults()?];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        if let Some(path) = file {
            let (value, digest) = Self::load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let effective = Self {
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config: merge_layers(layers),
            sources,
        };
        effective.service_config()?;
        Ok(effective)
    }

    /// Parse a TOML file, returning the value and digest of its bytes
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;
        let table: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;

        let value = serde_json::to_value(table)
            .map_err(|e| ConfigError::ParseError(format!("unrepresentable value: {}", e)))?;
        Ok((value, digest))
    }

    /// The typed service configuration.
    pub fn service_config(&self) -> Result<ServiceConfig, ConfigError> {
        let config: ServiceConfig = serde_json::from_value(self.config.clone())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        validate(&config)?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn validate(config: &ServiceConfig) -> Result<(), ConfigError> {
    if !config.data_root.is_absolute() {
        return Err(ConfigError::ValidationError(
            "data_root must be an absolute path".to_string(),
        ));
    }
    if config.copy_command.is_empty() {
        return Err(ConfigError::ValidationError(
            "copy_command must name a program".to_string(),
        ));
    }
    if config.restricted_home_sdk <= 0 {
        return Err(ConfigError::ValidationError(
            "restricted_home_sdk must be positive".to_string(),
        ));
    }
    if config.default_cache_quota <= 0 {
        return Err(ConfigError::ValidationError(
            "default_cache_quota must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
