//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
///
/// These are fatal at startup; they never reach the bootstrap procedure or
/// the dispatcher at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
