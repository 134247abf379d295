//! Configuration loading for the data server.
//!
//! A configuration type is any serde-enabled struct that implements
//! [`Config`]; [`ConfigManager`] loads it from a TOML file, validates it and
//! supports hot-reloading the fields the type marks as hot-updatable.

mod manager;

pub use manager::ConfigManager;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors raised while loading, rendering or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("config value out of range: {field} = {value} ({reason})")]
    OutOfRange {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A configuration section that can be parsed from TOML.
///
/// The default methods cover plain serde structs; implementors override
/// [`Config::validate`] for range checks and [`Config::hot_update`] to copy
/// the fields that may change without a restart.
pub trait Config: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Build the configuration from a parsed TOML tree.
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError> {
        Ok(value.clone().try_into()?)
    }

    /// Copy hot-updatable fields from `other` into `self`.
    fn hot_update(&mut self, other: &Self) {
        let _ = other;
    }

    /// Render the configuration as a TOML document.
    fn render(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field and range constraints.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}
