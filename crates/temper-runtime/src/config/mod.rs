//! Configuration for the Temper runtime.
//!
//! Layered loading (defaults, files, environment) with figment, plus the
//! schema for logging, file watching and the plugin map.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, PROFILE_ENV, Profile};
pub use schema::{
    LogFormat, LogLevel, LogOutput, LoggingConfig, SpanEventConfig, TemperConfig, WatchConfig,
};
pub use validation::validate_config;
