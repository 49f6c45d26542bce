//! Memoized module exports plus the graph recorded while loading them.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use temper_core::{Plugin, RuntimeId};
use tracing::{debug, trace};

use super::graph::{ModuleEntry, ModuleGraph};
use super::{Exports, ModuleError, ModuleLoader};

#[derive(Default)]
struct CacheState {
    exports: HashMap<PathBuf, Exports>,
    graph: ModuleGraph,
    /// Modules whose load is in progress, outermost first.
    loading: Vec<PathBuf>,
}

/// The module registry.
///
/// The internal lock is released while the loader runs, so loaders may
/// require further modules through their [`LoadScope`].
pub struct ModuleCache {
    root: PathBuf,
    loader: Arc<dyn ModuleLoader>,
    inner: Mutex<CacheState>,
}

/// Saved exports and graph entries of a set of modules.
#[derive(Debug, Clone, Default)]
pub struct ModuleSnapshot {
    entries: Vec<(PathBuf, Option<Exports>, Option<ModuleEntry>)>,
}

impl ModuleSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ModuleCache {
    pub fn new(root: impl Into<PathBuf>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            root: root.into(),
            loader,
            inner: Mutex::new(CacheState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins relative paths onto the root.
    pub fn normalize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Resolves a specifier through the loader.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, ModuleError> {
        self.loader
            .resolve(name, &self.root)
            .map(|path| self.normalize(&path))
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))
    }

    /// Returns the cached exports of `path`, loading the module on first use.
    pub fn require(&self, path: &Path) -> Result<Exports, ModuleError> {
        let path = self.normalize(path);
        {
            let mut state = self.inner.lock();
            if let Some(exports) = state.exports.get(&path) {
                return Ok(exports.clone());
            }
            if state.loading.contains(&path) {
                return Err(ModuleError::Cycle(path));
            }
            state.loading.push(path.clone());
        }

        trace!(path = %path.display(), "Loading module");
        let mut scope = LoadScope {
            cache: self,
            filename: path.clone(),
            dependencies: BTreeSet::new(),
            reloadable: true,
        };
        let result = self.loader.load(&path, &mut scope);
        let LoadScope {
            dependencies,
            reloadable,
            ..
        } = scope;

        let mut state = self.inner.lock();
        state.loading.retain(|p| p != &path);
        match result {
            Ok(exports) => {
                debug!(
                    path = %path.display(),
                    dependencies = dependencies.len(),
                    reloadable,
                    "Module loaded"
                );
                state.graph.record(path.clone(), dependencies, reloadable);
                state.exports.insert(path, exports.clone());
                Ok(exports)
            }
            Err(source) => Err(ModuleError::Load { path, source }),
        }
    }

    /// Resolves `name` and requires the plugin it exports.
    pub fn require_plugin(&self, name: &str) -> Result<(PathBuf, Plugin), crate::RuntimeError> {
        let path = self.resolve(name)?;
        let plugin = self.require(&path)?.into_plugin(&path)?;
        Ok((path, plugin))
    }

    pub fn get(&self, path: &Path) -> Option<Exports> {
        self.inner.lock().exports.get(&self.normalize(path)).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner.lock().exports.contains_key(&self.normalize(path))
    }

    /// Evicts exports and graph entry, then lets the loader drop its own state.
    pub fn invalidate(&self, path: &Path) -> bool {
        let path = self.normalize(path);
        let removed = {
            let mut state = self.inner.lock();
            state.graph.remove(&path);
            state.exports.remove(&path).is_some()
        };
        self.loader.invalidate(&path);
        if removed {
            trace!(path = %path.display(), "Module evicted");
        }
        removed
    }

    pub fn snapshot<'a, I>(&self, paths: I) -> ModuleSnapshot
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let state = self.inner.lock();
        ModuleSnapshot {
            entries: paths
                .into_iter()
                .map(|path| {
                    (
                        path.clone(),
                        state.exports.get(path).cloned(),
                        state.graph.get(path).cloned(),
                    )
                })
                .collect(),
        }
    }

    /// Puts every module of `snapshot` back exactly as it was.
    pub fn restore(&self, snapshot: ModuleSnapshot) {
        let mut state = self.inner.lock();
        for (path, exports, entry) in snapshot.entries {
            match exports {
                Some(exports) => {
                    state.exports.insert(path.clone(), exports);
                }
                None => {
                    state.exports.remove(&path);
                }
            }
            match entry {
                Some(entry) => state.graph.insert_entry(entry),
                None => {
                    state.graph.remove(&path);
                }
            }
        }
    }

    pub fn graph(&self) -> ModuleGraph {
        self.inner.lock().graph.clone()
    }

    pub fn set_owner(&self, path: &Path, owner: Option<RuntimeId>) {
        self.inner.lock().graph.set_owner(path, owner);
    }

    /// Modules that export a plugin, in discovery order.
    pub fn exported_plugins(&self) -> Vec<(PathBuf, Plugin)> {
        let state = self.inner.lock();
        state
            .graph
            .iter()
            .filter_map(|entry| {
                let plugin = state.exports.get(&entry.filename)?.plugin()?.clone();
                Some((entry.filename.clone(), plugin))
            })
            .collect()
    }
}

impl fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCache")
            .field("root", &self.root)
            .field("modules", &self.inner.lock().exports.len())
            .finish()
    }
}

/// Handed to [`ModuleLoader::load`]; records what the module requires.
pub struct LoadScope<'a> {
    cache: &'a ModuleCache,
    filename: PathBuf,
    dependencies: BTreeSet<PathBuf>,
    reloadable: bool,
}

impl LoadScope<'_> {
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Requires a dependency of the module being loaded.
    pub fn require(&mut self, specifier: &str) -> Result<Exports, ModuleError> {
        let path = self.cache.resolve(specifier)?;
        self.dependencies.insert(path.clone());
        self.cache.require(&path)
    }

    /// Marks the module as not hot-reloadable; changing it requires a restart.
    pub fn decline(&mut self) {
        self.reloadable = false;
    }
}
