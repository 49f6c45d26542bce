//! Runtime error types.

use std::path::PathBuf;

use temper_core::EngineError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::module::ModuleError;

/// Errors that can occur while setting up or running the process runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// The file watcher could not be created.
    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),
}

/// A reload cycle that was rolled back.
#[derive(Error, Debug)]
pub enum ReloadError {
    /// A changed module failed to load again.
    #[error("Reload failed while loading modules: {0}")]
    Module(#[from] ModuleError),

    #[error("Reload failed: {0}")]
    Engine(#[from] EngineError),

    /// The new version of a plugin failed to apply.
    #[error("Plugin '{plugin}' failed to re-apply: {source}")]
    Apply {
        plugin: String,
        #[source]
        source: EngineError,
    },
}

/// Why the process has to be relaunched instead of hot-swapped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    #[error("entry file changed: {}", .0.display())]
    EntryChanged(PathBuf),

    #[error("changes cannot be hot-swapped: {0:?}")]
    UnsafeChange(Vec<PathBuf>),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
