//! Which modules may never be hot-swapped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use wildmatch::WildMatch;

use crate::config::WatchConfig;
use crate::module::ModuleEntry;

/// Decides which modules force a full restart when they change.
#[derive(Debug, Clone)]
pub struct ReloadPolicy {
    root: PathBuf,
    entries: HashSet<PathBuf>,
    no_reload: Vec<WildMatch>,
}

impl ReloadPolicy {
    /// A policy managing everything under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: HashSet::new(),
            no_reload: Vec::new(),
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        let mut policy = Self::new(&config.root);
        for entry in &config.entry {
            policy = policy.with_entry(entry);
        }
        for pattern in &config.no_reload {
            policy = policy.with_no_reload(pattern);
        }
        policy
    }

    /// Registers an entry or config file. Relative paths are taken from the root.
    pub fn with_entry(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        self.entries.insert(path);
        self
    }

    /// Modules whose root-relative path matches `pattern` always require a restart.
    pub fn with_no_reload(mut self, pattern: &str) -> Self {
        self.no_reload.push(WildMatch::new(pattern));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_entry(&self, path: &Path) -> bool {
        self.entries.contains(path)
    }

    pub fn is_managed(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    fn matches_no_reload(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let relative = relative.to_string_lossy();
        self.no_reload.iter().any(|pattern| pattern.matches(&relative))
    }

    pub fn forces_restart(&self, entry: &ModuleEntry) -> bool {
        let path = entry.filename.as_path();
        !entry.reloadable
            || self.is_entry(path)
            || !self.is_managed(path)
            || self.matches_no_reload(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_restarts() {
        let policy = ReloadPolicy::new("/app")
            .with_entry("main")
            .with_no_reload("vendor/*");

        assert!(policy.is_entry(Path::new("/app/main")));
        assert!(policy.forces_restart(&ModuleEntry::new("/app/main")));
        assert!(policy.forces_restart(&ModuleEntry::new("/usr/lib/std")));
        assert!(policy.forces_restart(&ModuleEntry::new("/app/vendor/db/driver")));
        assert!(!policy.forces_restart(&ModuleEntry::new("/app/plugins/echo")));

        let mut declined = ModuleEntry::new("/app/plugins/echo");
        declined.reloadable = false;
        assert!(policy.forces_restart(&declined));
    }
}
