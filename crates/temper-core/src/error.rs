//! Engine error types.

use thiserror::Error;

use crate::registry::ForkId;

/// Boxed error returned by plugin code and user-supplied cleanups.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the plugin registry and the context algebra.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The registered value is not a plugin.
    #[error("Invalid plugin: {0}")]
    InvalidPlugin(String),

    /// The context is not owned by a live fork.
    #[error("Context is not owned by a live fork")]
    NoSuchFork,

    /// A plugin's `apply` returned an error. The fork has already been disposed.
    #[error("Plugin '{plugin}' failed to apply: {source}")]
    ApplyFailure {
        plugin: String,
        fork: ForkId,
        #[source]
        source: BoxError,
    },

    /// A single disposable failed. Only ever logged; disposal keeps going.
    #[error("Disposable of plugin '{plugin}' failed: {source}")]
    DisposeFailure {
        plugin: String,
        #[source]
        source: BoxError,
    },

    /// Two contexts from different registries were composed.
    #[error("Cannot compose contexts that belong to different registries")]
    ForeignContext,

    /// The registry has been torn down.
    #[error("Registry has been torn down")]
    Closed,
}

impl EngineError {
    /// Creates an invalid plugin error.
    pub fn invalid_plugin(reason: impl Into<String>) -> Self {
        Self::InvalidPlugin(reason.into())
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
