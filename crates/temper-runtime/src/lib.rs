//! Temper Runtime - module graph, hot reload and process runtime.
//!
//! This crate provides:
//! - A module cache with dependency tracking (`ModuleCache`, `ModuleLoader`)
//! - Reload classification and the all-or-nothing swap (`classify`, `Reloader`)
//! - Debounced file watching (`FileWatcher`)
//! - The plugin map loader (`PluginLoader`)
//! - figment configuration and `tracing` setup
//! - The process runtime (`TemperRuntime`)
//!
//! ```ignore
//! use temper_runtime::TemperRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = TemperRuntime::builder().loader(MyLoader::new()).build()?;
//!
//!     // Hot-swaps plugins on file changes until Ctrl+C
//!     let exit = runtime.run().await?;
//!     std::process::exit(exit.code());
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `toml-config`: read `temper.toml`
//! - `yaml-config`: read `temper.yaml`
//! - `json-log`: JSON log output

pub mod config;
pub mod error;
pub mod loader;
pub mod logging;
pub mod module;
pub mod reload;
pub mod runtime;

// Re-exports
pub use config::{ConfigError, ConfigLoader, ConfigResult, TemperConfig};
pub use error::{ReloadError, RestartReason, RuntimeError, RuntimeResult};
pub use loader::PluginLoader;
pub use logging::{LoggingBuilder, SpanEvents};
pub use module::{Exports, LoadScope, ModuleCache, ModuleError, ModuleLoader, StaticLoader};
pub use reload::{FileWatcher, ReloadOutcome, ReloadPolicy, Reloader};
pub use runtime::{Exit, RESTART_EXIT_CODE, RuntimeBuilder, TemperRuntime};

// Re-export tracing for use by plugin crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros for plugin code.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
