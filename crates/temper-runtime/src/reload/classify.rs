//! Reachability classification of changed modules.
//!
//! Every changed module ends up either *accepted* (it can be re-evaluated
//! together with a plugin that depends on it) or *declined* (some path from
//! it leads only to modules that cannot be swapped). A change is safe when
//! every changed module is accepted.
//!
//! ```text
//! a (plugin) ─► b ─► c*        c changed, b reloadable: {a, b, c} accepted
//! a (plugin) ─► b! ─► c*       b declined: c only reaches a declined module
//! ```

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use temper_core::RuntimeId;

use super::policy::ReloadPolicy;
use crate::module::ModuleGraph;

/// The outcome of classifying one batch of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Changed modules that are part of the graph.
    pub stashed: BTreeSet<PathBuf>,
    pub accepted: BTreeSet<PathBuf>,
    pub declined: BTreeSet<PathBuf>,
    /// Runtimes to swap, with the module exporting their plugin, in discovery order.
    pub affected: Vec<(RuntimeId, PathBuf)>,
}

impl Classification {
    pub fn is_safe(&self) -> bool {
        self.stashed.is_subset(&self.accepted)
    }

    /// Changed modules that cannot be hot-swapped.
    pub fn unsafe_changes(&self) -> Vec<PathBuf> {
        self.stashed.difference(&self.accepted).cloned().collect()
    }
}

pub fn classify(
    graph: &ModuleGraph,
    stashed: &BTreeSet<PathBuf>,
    policy: &ReloadPolicy,
) -> Classification {
    let stashed: BTreeSet<PathBuf> = stashed
        .iter()
        .filter(|path| graph.contains(path))
        .cloned()
        .collect();

    let mut declined: BTreeSet<PathBuf> = graph
        .iter()
        .filter(|entry| policy.forces_restart(entry))
        .map(|entry| entry.filename.clone())
        .collect();

    // seeds
    let mut accepted = BTreeSet::new();
    let mut pending = BTreeSet::new();
    for entry in graph.iter() {
        if entry.owner.is_none() || declined.contains(&entry.filename) {
            continue;
        }
        let closure = graph.closure(&entry.filename, &declined);
        if !closure.is_disjoint(&stashed) {
            accepted.insert(entry.filename.clone());
            pending.extend(closure);
        }
    }
    for path in &stashed {
        if !declined.contains(path) && graph.dependents(path).is_empty() {
            accepted.insert(path.clone());
        }
    }
    pending.extend(stashed.iter().cloned());
    pending.retain(|path| !accepted.contains(path) && !declined.contains(path));

    loop {
        let mut changed = false;
        for path in pending.clone() {
            let dependents = graph.dependents(&path);
            if dependents.iter().any(|d| accepted.contains(*d)) {
                accepted.insert(path.clone());
            } else if !dependents.is_empty() && dependents.iter().all(|d| declined.contains(*d)) {
                declined.insert(path.clone());
            } else {
                continue;
            }
            pending.remove(&path);
            changed = true;
        }
        if !changed {
            break;
        }
    }
    declined.extend(pending);

    // map onto runtimes
    let mut affected = Vec::new();
    let mut seen = HashSet::new();
    loop {
        let mut changed = false;
        for entry in graph.iter() {
            let Some(owner) = entry.owner else {
                continue;
            };
            if declined.contains(&entry.filename) || seen.contains(&entry.filename) {
                continue;
            }
            let closure = graph.closure(&entry.filename, &declined);
            if closure.is_disjoint(&accepted) {
                continue;
            }
            seen.insert(entry.filename.clone());
            affected.push((owner, entry.filename.clone()));
            for path in closure {
                changed |= accepted.insert(path);
            }
        }
        if !changed {
            break;
        }
    }

    Classification {
        stashed,
        accepted,
        declined,
        affected,
    }
}
