//! The reload cycle.
//!
//! ```text
//! stash ─► try_lock ─► entry changed? ──────────────► Restart(EntryChanged)
//!                        │
//!                        ▼
//!                   refresh owners ─► classify ─ unsafe ─► Restart(UnsafeChange)
//!                                        │
//!                                        ▼
//!             snapshot + evict accepted ─► re-load entries ─ error ─► restore, RolledBack
//!                                        │
//!                                        ▼
//!             swap runtimes in order ─ apply error ─► undo swaps newest first, RolledBack
//!                                        │
//!                                        ▼
//!                                    Reloaded
//! ```
//!
//! The cycle is all-or-nothing: either every affected runtime runs the new
//! code, or every one of them runs the old code again.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use temper_core::{ForkRecord, Plugin, Registry, RuntimeId};
use tracing::{debug, error, info, warn};

use super::classify::classify;
use super::policy::ReloadPolicy;
use crate::error::{ReloadError, RestartReason};
use crate::module::{ModuleCache, ModuleSnapshot};

/// Result of one [`Reloader::reload`] call.
#[derive(Debug)]
pub enum ReloadOutcome {
    /// Nothing that is loaded changed.
    Idle,
    /// Another cycle is running; the changes stay queued.
    Deferred,
    Reloaded {
        plugins: Vec<String>,
        modules: Vec<PathBuf>,
    },
    /// The cycle failed and everything was put back.
    RolledBack { error: ReloadError },
    Restart(RestartReason),
}

struct Swap {
    name: String,
    old: Plugin,
    new: Plugin,
    records: Vec<ForkRecord>,
}

/// Turns stashed file changes into runtime swaps.
pub struct Reloader {
    registry: Registry,
    modules: Arc<ModuleCache>,
    policy: ReloadPolicy,
    stashed: Mutex<BTreeSet<PathBuf>>,
    cycle: tokio::sync::Mutex<()>,
}

impl Reloader {
    pub fn new(registry: Registry, modules: Arc<ModuleCache>, policy: ReloadPolicy) -> Self {
        Self {
            registry,
            modules,
            policy,
            stashed: Mutex::new(BTreeSet::new()),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &ReloadPolicy {
        &self.policy
    }

    /// Queues changed paths for the next cycle.
    pub fn stash<I>(&self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.stashed.lock().extend(paths);
    }

    pub fn pending(&self) -> usize {
        self.stashed.lock().len()
    }

    pub async fn reload(&self) -> ReloadOutcome {
        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("Reload already in progress, deferring");
            return ReloadOutcome::Deferred;
        };
        let mut stashed = std::mem::take(&mut *self.stashed.lock());

        if let Some(entry) = stashed.iter().find(|path| self.policy.is_entry(path)) {
            warn!(path = %entry.display(), "Entry file changed, restart required");
            return ReloadOutcome::Restart(RestartReason::EntryChanged(entry.clone()));
        }

        stashed.retain(|path| self.modules.contains(path));
        if stashed.is_empty() {
            return ReloadOutcome::Idle;
        }

        for (path, plugin) in self.modules.exported_plugins() {
            self.modules.set_owner(&path, self.registry.get(&plugin));
        }

        let classification = classify(&self.modules.graph(), &stashed, &self.policy);
        if !classification.is_safe() {
            let files = classification.unsafe_changes();
            warn!(files = ?files, "Changes cannot be hot-swapped, restart required");
            return ReloadOutcome::Restart(RestartReason::UnsafeChange(files));
        }

        let affected: HashSet<RuntimeId> =
            classification.affected.iter().map(|(id, _)| *id).collect();
        let (nested, targets): (Vec<_>, Vec<_>) =
            classification.affected.iter().cloned().partition(|(id, _)| {
                self.registry
                    .ancestors(*id)
                    .iter()
                    .any(|ancestor| affected.contains(ancestor))
            });

        let snapshot = self.modules.snapshot(&classification.accepted);
        for path in &classification.accepted {
            self.modules.invalidate(path);
        }

        let mut pairs = Vec::new();
        for (id, path) in &targets {
            let Some(old) = self.registry.plugin_of(*id) else {
                continue;
            };
            match self.load_plugin(path) {
                Ok(new) => pairs.push((*id, old, new)),
                Err(e) => return self.abort(snapshot, e),
            }
        }

        // Accepted modules nothing above required, e.g. a changed leaf with no dependents.
        for path in &classification.accepted {
            if !self.modules.contains(path)
                && let Err(e) = self.modules.require(path)
            {
                return self.abort(snapshot, e.into());
            }
        }

        let mut swapped: Vec<Swap> = Vec::new();
        for (id, old, new) in pairs {
            if let Err(e) = self.swap(id, old, new, &mut swapped).await {
                self.rollback(swapped).await;
                return self.abort(snapshot, e);
            }
        }

        // A nested runtime may also have forks outside its swapped ancestors.
        // Those still run the old value and are swapped on their own.
        for (id, path) in &nested {
            let Some(old) = self.registry.plugin_of(*id) else {
                continue;
            };
            let result = match self.load_plugin(path) {
                Ok(new) => self.swap(*id, old, new, &mut swapped).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.rollback(swapped).await;
                return self.abort(snapshot, e);
            }
        }

        ReloadOutcome::Reloaded {
            plugins: swapped.into_iter().map(|swap| swap.name).collect(),
            modules: classification.accepted.into_iter().collect(),
        }
    }

    fn load_plugin(&self, path: &Path) -> Result<Plugin, ReloadError> {
        Ok(self.modules.require(path)?.into_plugin(path)?)
    }

    /// Disposes one runtime and re-applies `new` wherever it lived.
    async fn swap(
        &self,
        id: RuntimeId,
        old: Plugin,
        new: Plugin,
        swapped: &mut Vec<Swap>,
    ) -> Result<(), ReloadError> {
        let name = old.name().to_string();
        let records = self.registry.dispose_runtime(id).await;
        swapped.push(Swap {
            name: name.clone(),
            old,
            new: new.clone(),
            records: records.clone(),
        });

        for record in &records {
            if !record.parent.is_active() {
                debug!(plugin = %name, "Skipping fork whose parent went away");
                continue;
            }
            let result = record
                .parent
                .try_plugin_as(new.clone(), record.config.clone(), record.alias.clone())
                .await;
            if let Err(source) = result {
                error!(plugin = %name, error = %source, "Reload failed, rolling back");
                return Err(ReloadError::Apply {
                    plugin: name,
                    source,
                });
            }
        }
        info!(plugin = %name, forks = records.len(), "Plugin reloaded");
        Ok(())
    }

    /// Puts old plugin values back into their original contexts, newest swap first.
    async fn rollback(&self, swapped: Vec<Swap>) {
        for swap in swapped.into_iter().rev() {
            if let Some(id) = self.registry.get(&swap.new) {
                self.registry.dispose_runtime(id).await;
            }
            for record in swap.records {
                if !record.parent.is_active() {
                    continue;
                }
                if let Err(e) = record
                    .parent
                    .try_plugin_as(swap.old.clone(), record.config, record.alias)
                    .await
                {
                    error!(plugin = %swap.name, error = %e, "Failed to restore previous version");
                }
            }
        }
    }

    fn abort(&self, snapshot: ModuleSnapshot, error: ReloadError) -> ReloadOutcome {
        self.modules.restore(snapshot);
        warn!(error = %error, "Reload rolled back");
        ReloadOutcome::RolledBack { error }
    }
}
