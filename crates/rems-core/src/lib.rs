//! rems-core — configuration and shared types for the REMS ops tooling.
//!
//! Both the bootstrap procedure and the command dispatcher are configured
//! once at startup from `rems.toml`, overlaid with the environment values the
//! deployment injects. Nothing here is re-resolved per request.

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::{
    BootstrapSettings, DispatchSettings, MAX_DISPATCH_TIMEOUT, OwnershipMode, RemsConfig,
    SecretSource, ServerSettings,
};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use types::*;
