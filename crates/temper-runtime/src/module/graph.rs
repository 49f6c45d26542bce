//! Direct-dependency bookkeeping for loaded modules.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use temper_core::RuntimeId;

/// One loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    pub filename: PathBuf,
    /// Direct dependencies, as required during the last load.
    pub dependencies: BTreeSet<PathBuf>,
    /// Runtime of the plugin this module exports, if that plugin is registered.
    pub owner: Option<RuntimeId>,
    /// `false` once the module declined hot reload.
    pub reloadable: bool,
}

impl ModuleEntry {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            dependencies: BTreeSet::new(),
            owner: None,
            reloadable: true,
        }
    }
}

/// Module graph keyed by path. Iteration follows discovery order, which is
/// kept across evictions so a reloaded module keeps its position.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    entries: HashMap<PathBuf, ModuleEntry>,
    order: Vec<PathBuf>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished load, keeping the previously known owner.
    pub fn record(&mut self, filename: PathBuf, dependencies: BTreeSet<PathBuf>, reloadable: bool) {
        let owner = self.entries.get(&filename).and_then(|entry| entry.owner);
        self.insert_entry(ModuleEntry {
            filename,
            dependencies,
            owner,
            reloadable,
        });
    }

    pub fn insert_entry(&mut self, entry: ModuleEntry) {
        if !self.order.contains(&entry.filename) {
            self.order.push(entry.filename.clone());
        }
        self.entries.insert(entry.filename.clone(), entry);
    }

    pub fn remove(&mut self, path: &Path) -> Option<ModuleEntry> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &Path) -> Option<&ModuleEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleEntry> {
        self.order.iter().filter_map(|path| self.entries.get(path))
    }

    /// Modules that directly depend on `path`, in discovery order.
    pub fn dependents(&self, path: &Path) -> Vec<&Path> {
        self.iter()
            .filter(|entry| entry.dependencies.contains(path))
            .map(|entry| entry.filename.as_path())
            .collect()
    }

    /// `path` plus every loaded module reachable from it, without entering `stop`.
    pub fn closure(&self, path: &Path, stop: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
        let mut seen = BTreeSet::from([path.to_path_buf()]);
        let mut stack = vec![path.to_path_buf()];
        while let Some(current) = stack.pop() {
            let Some(entry) = self.entries.get(&current) else {
                continue;
            };
            for dependency in &entry.dependencies {
                if stop.contains(dependency) || !self.entries.contains_key(dependency) {
                    continue;
                }
                if seen.insert(dependency.clone()) {
                    stack.push(dependency.clone());
                }
            }
        }
        seen
    }

    pub fn set_owner(&mut self, path: &Path, owner: Option<RuntimeId>) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.owner = owner;
        }
    }

    pub fn owner(&self, path: &Path) -> Option<RuntimeId> {
        self.entries.get(path).and_then(|entry| entry.owner)
    }
}
