//! Module loading and the dependency graph.
//!
//! Temper does not compile or evaluate source code itself. The host supplies a
//! [`ModuleLoader`] that turns a path into [`Exports`]; the [`ModuleCache`]
//! memoizes the result and records which modules each load pulled in through
//! [`LoadScope::require`]. That recorded graph is what hot reload classifies.
//!
//! ```text
//! ModuleCache::require("/app/a")
//!   └─ loader.load("/app/a", scope)
//!        ├─ scope.require("b") ──► ModuleCache::require("/app/b") ...
//!        └─ returns Exports::Plugin(..)
//! graph: /app/a ─► { /app/b }
//! ```

pub mod cache;
pub mod graph;
pub mod memory;

use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::Value;
use temper_core::{BoxError, EngineError, Plugin};
use thiserror::Error;

pub use cache::{LoadScope, ModuleCache, ModuleSnapshot};
pub use graph::{ModuleEntry, ModuleGraph};
pub use memory::{ModuleFactory, StaticLoader};

/// What a module evaluated to.
#[derive(Clone)]
pub enum Exports {
    Plugin(Plugin),
    Value(Value),
    Empty,
}

impl Exports {
    pub fn plugin(&self) -> Option<&Plugin> {
        match self {
            Exports::Plugin(plugin) => Some(plugin),
            _ => None,
        }
    }

    /// Fails with [`EngineError::InvalidPlugin`] unless the module exported a plugin.
    pub fn into_plugin(self, path: &Path) -> Result<Plugin, EngineError> {
        match self {
            Exports::Plugin(plugin) => Ok(plugin),
            Exports::Value(_) => Err(EngineError::invalid_plugin(format!(
                "{} exports a value, not a plugin",
                path.display()
            ))),
            Exports::Empty => Err(EngineError::invalid_plugin(format!(
                "{} has no exports",
                path.display()
            ))),
        }
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exports::Plugin(plugin) => f.debug_tuple("Plugin").field(&plugin.name()).finish(),
            Exports::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Exports::Empty => f.write_str("Empty"),
        }
    }
}

/// Host-provided module system.
pub trait ModuleLoader: Send + Sync + 'static {
    /// Evaluates the module at `path`. Dependencies must be pulled through `scope`
    /// so that the graph sees them.
    fn load(&self, path: &Path, scope: &mut LoadScope<'_>) -> Result<Exports, BoxError>;

    /// Maps a specifier such as a plugin name to a module path.
    fn resolve(&self, name: &str, root: &Path) -> Option<PathBuf> {
        Some(root.join(name))
    }

    /// Called after the cache evicted `path`.
    fn invalidate(&self, _path: &Path) {}
}

/// Errors raised while loading modules.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// The loader failed to evaluate a module.
    #[error("Failed to load module {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    /// A module required itself, directly or through its dependencies.
    #[error("Require cycle detected at {}", .0.display())]
    Cycle(PathBuf),

    /// A specifier could not be resolved to a module.
    #[error("Module not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_plugin_rejects_values() {
        let path = Path::new("/app/settings");
        let error = Exports::Value(serde_json::json!({ "a": 1 }))
            .into_plugin(path)
            .unwrap_err();
        assert!(matches!(error, EngineError::InvalidPlugin(ref reason) if reason.contains("settings")));
        assert!(Exports::Empty.into_plugin(path).is_err());

        let plugin = Plugin::function("echo", |_ctx, _config| async { Ok(()) });
        let exported = Exports::Plugin(plugin.clone()).into_plugin(path).unwrap();
        assert!(exported.same(&plugin));
    }
}
