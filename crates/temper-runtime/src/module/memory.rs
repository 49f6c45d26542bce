//! In-process module system.
//!
//! [`StaticLoader`] maps paths to factory closures. Redefining a path and
//! stashing it is how embedded hosts and tests simulate an edited file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use temper_core::BoxError;

use super::{Exports, LoadScope, ModuleError, ModuleLoader};

pub type ModuleFactory =
    Arc<dyn Fn(&mut LoadScope<'_>) -> Result<Exports, BoxError> + Send + Sync>;

#[derive(Default)]
struct Modules {
    factories: HashMap<PathBuf, ModuleFactory>,
    loads: HashMap<PathBuf, usize>,
}

/// Cloneable handle to a table of module factories.
#[derive(Clone, Default)]
pub struct StaticLoader {
    modules: Arc<RwLock<Modules>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines or replaces the module at `path`.
    pub fn define<F>(&self, path: impl Into<PathBuf>, factory: F)
    where
        F: Fn(&mut LoadScope<'_>) -> Result<Exports, BoxError> + Send + Sync + 'static,
    {
        self.modules
            .write()
            .factories
            .insert(path.into(), Arc::new(factory));
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.modules.write().factories.remove(path).is_some()
    }

    /// How many times `path` has been evaluated.
    pub fn loads(&self, path: &Path) -> usize {
        self.modules.read().loads.get(path).copied().unwrap_or(0)
    }
}

impl ModuleLoader for StaticLoader {
    fn load(&self, path: &Path, scope: &mut LoadScope<'_>) -> Result<Exports, BoxError> {
        let factory = {
            let mut modules = self.modules.write();
            let factory = modules
                .factories
                .get(path)
                .cloned()
                .ok_or_else(|| ModuleError::NotFound(path.display().to_string()))?;
            *modules.loads.entry(path.to_path_buf()).or_default() += 1;
            factory
        };
        factory(scope)
    }
}
