//! The plugin registry.
//!
//! [`Registry`] owns every runtime, fork, listener, command and service of
//! one plugin tree. Runtimes and forks live in an arena keyed by opaque ids;
//! contexts and handles refer to them by id, so there are no ownership
//! cycles between forks and the contexts they create.
//!
//! ```text
//! Registry
//!  ├── runtimes: RuntimeId ─► { plugin, config, forks, parent, children }
//!  ├── forks:    ForkId    ─► { runtime, parent ctx, own ctx, config, disposables }
//!  ├── listeners / commands / services
//!  └── detached: registrations made on the root context
//! ```
//!
//! The state lives behind one `parking_lot::Mutex`. It is never held across
//! an `.await` and never while plugin code, listeners or cleanups run.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = Registry::new();
//! let fork = registry.root().plugin(my_plugin, json!({ "greeting": "hi" })).await?;
//! registry.start();
//! // ...
//! registry.teardown().await;
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::Context;
use crate::disposable::Cleanup;
use crate::error::{EngineError, EngineResult};
use crate::events::{self, INTERNAL_SERVICE, Listener, Payload, READY};
use crate::fork::{Fork, ForkState, dispose_fork};
use crate::plugin::{Plugin, PluginKey};
use crate::service::{ProviderKey, ServiceArc, ServiceMapping};

// =============================================================================
// Ids
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForkId(u64);

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Arena state (internal)
// =============================================================================

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    next_id: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            // 0 is ProviderKey::ROOT
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub(crate) struct RuntimeEntry {
    pub(crate) plugin: Plugin,
    pub(crate) config: Value,
    pub(crate) forks: Vec<ForkId>,
    pub(crate) parent: Option<RuntimeId>,
    pub(crate) children: Vec<RuntimeId>,
}

pub(crate) struct ForkEntry {
    pub(crate) runtime: RuntimeId,
    pub(crate) parent: Context,
    pub(crate) context: Context,
    pub(crate) config: Value,
    pub(crate) alias: Option<String>,
    pub(crate) state: ForkState,
    pub(crate) disposables: Vec<(u64, Cleanup)>,
}

pub(crate) struct CommandEntry {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) context: Context,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) runtimes: HashMap<RuntimeId, RuntimeEntry>,
    pub(crate) identities: HashMap<PluginKey, RuntimeId>,
    pub(crate) forks: HashMap<ForkId, ForkEntry>,
    pub(crate) listeners: Vec<Listener>,
    pub(crate) commands: Vec<CommandEntry>,
    pub(crate) services: HashMap<(String, ProviderKey), ServiceArc>,
    pub(crate) detached: Vec<(u64, Cleanup)>,
    pub(crate) ready: bool,
    pub(crate) closed: bool,
}

impl State {
    fn runtime_of_context(&self, ctx: &Context) -> Option<RuntimeId> {
        let fork = ctx.fork_id()?;
        self.forks.get(&fork).map(|entry| entry.runtime)
    }

    /// Recomputes a reusable runtime's config array, or the latest config otherwise.
    fn refresh_config(&mut self, id: RuntimeId) {
        let Some(runtime) = self.runtimes.get(&id) else {
            return;
        };
        let configs: Vec<Value> = runtime
            .forks
            .iter()
            .filter_map(|fork| self.forks.get(fork).map(|entry| entry.config.clone()))
            .collect();
        let config = if runtime.plugin.is_reusable() {
            Value::Array(configs)
        } else {
            match configs.into_iter().last() {
                Some(config) => config,
                None => return,
            }
        };
        if let Some(runtime) = self.runtimes.get_mut(&id) {
            runtime.config = config;
        }
    }

    /// Re-derives a runtime's parent from the context of its first live fork.
    fn relink(&mut self, id: RuntimeId) {
        let Some(runtime) = self.runtimes.get(&id) else {
            return;
        };
        let next = runtime
            .forks
            .first()
            .and_then(|fork| self.forks.get(fork))
            .and_then(|entry| self.runtime_of_context(&entry.parent))
            .filter(|parent| *parent != id);
        let previous = runtime.parent;
        if next == previous {
            return;
        }

        if let Some(old) = previous
            && let Some(entry) = self.runtimes.get_mut(&old)
        {
            entry.children.retain(|child| *child != id);
        }
        if let Some(new) = next
            && let Some(entry) = self.runtimes.get_mut(&new)
            && !entry.children.contains(&id)
        {
            entry.children.push(id);
        }
        if let Some(runtime) = self.runtimes.get_mut(&id) {
            runtime.parent = next;
        }
    }

    pub(crate) fn detach_fork(&mut self, id: RuntimeId, fork: ForkId) {
        let children = match self.runtimes.get_mut(&id) {
            Some(runtime) => {
                runtime.forks.retain(|f| *f != fork);
                runtime.children.clone()
            }
            None => return,
        };
        for child in children {
            self.relink(child);
        }
        self.refresh_config(id);
        self.collect(id);
    }

    /// Destroys the runtime if it has neither forks nor children, then walks up.
    fn collect(&mut self, id: RuntimeId) {
        let empty = self
            .runtimes
            .get(&id)
            .is_some_and(|rt| rt.forks.is_empty() && rt.children.is_empty());
        if !empty {
            self.relink(id);
            return;
        }
        let Some(runtime) = self.runtimes.remove(&id) else {
            return;
        };
        self.identities.remove(&runtime.plugin.key());
        debug!(plugin = %runtime.plugin.name(), runtime = %id, "Runtime destroyed");

        if let Some(parent) = runtime.parent {
            if let Some(entry) = self.runtimes.get_mut(&parent) {
                entry.children.retain(|child| *child != id);
            }
            self.collect(parent);
        }
    }

    fn info(&self, id: RuntimeId) -> Option<RuntimeInfo> {
        let runtime = self.runtimes.get(&id)?;
        Some(RuntimeInfo {
            id,
            name: runtime.plugin.name().to_string(),
            reusable: runtime.plugin.is_reusable(),
            config: runtime.config.clone(),
            forks: runtime.forks.clone(),
            parent: runtime.parent,
            children: runtime.children.clone(),
        })
    }
}

// =============================================================================
// Public views
// =============================================================================

/// Point-in-time view of a runtime.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub id: RuntimeId,
    pub name: String,
    pub reusable: bool,
    pub config: Value,
    pub forks: Vec<ForkId>,
    pub parent: Option<RuntimeId>,
    pub children: Vec<RuntimeId>,
}

/// Where and how a disposed fork had been created.
#[derive(Debug, Clone)]
pub struct ForkRecord {
    pub parent: Context,
    pub config: Value,
    pub alias: Option<String>,
}

/// Bookkeeping counters used to check that disposal left nothing behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub listeners: Vec<(u64, String)>,
    pub commands: Vec<(u64, String)>,
    pub services: Vec<(String, ProviderKey)>,
    pub runtimes: usize,
    pub forks: usize,
    pub detached: usize,
}

// =============================================================================
// Registry
// =============================================================================

/// Handle to one plugin tree. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    root: Context,
}

impl Registry {
    pub fn new() -> Self {
        let shared = Arc::new(Shared::new());
        let root = Context::root(shared);
        debug!(root = root.id(), "Registry created");
        Self { root }
    }

    pub(crate) fn from_root(root: Context) -> Self {
        Self { root }
    }

    fn shared(&self) -> &Arc<Shared> {
        self.root.shared()
    }

    pub fn root(&self) -> Context {
        self.root.clone()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Emits `ready` once. Returns the number of listeners notified.
    pub fn start(&self) -> usize {
        let first = {
            let mut state = self.shared().state.lock();
            !std::mem::replace(&mut state.ready, true)
        };
        if !first {
            return 0;
        }
        info!("Registry ready");
        events::emit_where(self.shared(), READY, &Payload::Empty, |_| true)
    }

    pub fn is_ready(&self) -> bool {
        self.shared().state.lock().ready
    }

    pub fn is_closed(&self) -> bool {
        self.shared().state.lock().closed
    }

    /// Disposes every top-level fork (newest first) and all root registrations.
    ///
    /// Afterwards `plugin()` fails with [`EngineError::Closed`].
    pub async fn teardown(&self) {
        let shared = Arc::clone(self.shared());
        let top_level: Vec<ForkId> = {
            let mut state = shared.state.lock();
            if std::mem::replace(&mut state.closed, true) {
                return;
            }
            let mut ids: Vec<ForkId> = state
                .forks
                .iter()
                .filter(|(_, entry)| entry.parent.fork_id().is_none())
                .map(|(id, _)| *id)
                .collect();
            ids.sort();
            ids
        };
        info!(forks = top_level.len(), "Tearing down registry");

        for id in top_level.into_iter().rev() {
            dispose_fork(Arc::clone(&shared), id).await;
        }

        let detached = std::mem::take(&mut shared.state.lock().detached);
        for (_, cleanup) in detached.into_iter().rev() {
            if let Err(error) = cleanup.run(&shared).await {
                warn!(error = %error, "Root cleanup failed");
            }
        }

        let mut state = shared.state.lock();
        state.listeners.clear();
        state.commands.clear();
        state.services.clear();
        state.forks.clear();
        state.runtimes.clear();
        state.identities.clear();
    }

    // ─── Lookups ─────────────────────────────────────────────────────────────

    /// The runtime currently bound to this plugin identity.
    pub fn get(&self, plugin: &Plugin) -> Option<RuntimeId> {
        self.shared()
            .state
            .lock()
            .identities
            .get(&plugin.key())
            .copied()
    }

    pub fn plugin_of(&self, id: RuntimeId) -> Option<Plugin> {
        self.shared()
            .state
            .lock()
            .runtimes
            .get(&id)
            .map(|runtime| runtime.plugin.clone())
    }

    pub fn runtime(&self, id: RuntimeId) -> Option<RuntimeInfo> {
        self.shared().state.lock().info(id)
    }

    /// All runtimes in creation order.
    pub fn runtimes(&self) -> Vec<RuntimeInfo> {
        let state = self.shared().state.lock();
        let mut ids: Vec<RuntimeId> = state.runtimes.keys().copied().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| state.info(id)).collect()
    }

    pub fn forks_of(&self, id: RuntimeId) -> Vec<Fork> {
        let forks = self
            .shared()
            .state
            .lock()
            .runtimes
            .get(&id)
            .map(|runtime| runtime.forks.clone())
            .unwrap_or_default();
        forks
            .into_iter()
            .map(|fork| Fork::new(Arc::clone(self.shared()), fork))
            .collect()
    }

    /// Live forks whose parent is exactly `ctx`, oldest first.
    pub fn forks_in(&self, ctx: &Context) -> Vec<Fork> {
        let mut ids: Vec<ForkId> = self
            .shared()
            .state
            .lock()
            .forks
            .iter()
            .filter(|(_, entry)| {
                entry.parent.id() == ctx.id() && entry.state != ForkState::Disposed
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids.into_iter()
            .map(|id| Fork::new(Arc::clone(self.shared()), id))
            .collect()
    }

    /// Parent chain of a runtime, nearest first.
    pub fn ancestors(&self, id: RuntimeId) -> Vec<RuntimeId> {
        let state = self.shared().state.lock();
        let mut chain = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut current = state.runtimes.get(&id).and_then(|rt| rt.parent);
        while let Some(parent) = current {
            if !seen.insert(parent) {
                break;
            }
            chain.push(parent);
            current = state.runtimes.get(&parent).and_then(|rt| rt.parent);
        }
        chain
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.shared().state.lock();
        let mut services: Vec<(String, ProviderKey)> = state.services.keys().cloned().collect();
        services.sort();
        RegistrySnapshot {
            listeners: state
                .listeners
                .iter()
                .map(|l| (l.id, l.name.clone()))
                .collect(),
            commands: state
                .commands
                .iter()
                .map(|c| (c.id, c.name.clone()))
                .collect(),
            services,
            runtimes: state.runtimes.len(),
            forks: state.forks.len(),
            detached: state.detached.len(),
        }
    }

    /// Registered command names with their descriptions.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.shared()
            .state
            .lock()
            .commands
            .iter()
            .map(|c| (c.name.clone(), c.description.clone()))
            .collect()
    }

    // ─── Mutation ────────────────────────────────────────────────────────────

    /// Disposes every fork of a runtime and returns where they lived.
    pub async fn dispose_runtime(&self, id: RuntimeId) -> Vec<ForkRecord> {
        let records: Vec<(ForkId, ForkRecord)> = {
            let state = self.shared().state.lock();
            state
                .runtimes
                .get(&id)
                .map(|runtime| {
                    runtime
                        .forks
                        .iter()
                        .filter_map(|fork| {
                            state.forks.get(fork).map(|entry| {
                                let record = ForkRecord {
                                    parent: entry.parent.clone(),
                                    config: entry.config.clone(),
                                    alias: entry.alias.clone(),
                                };
                                (*fork, record)
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        for (fork, _) in &records {
            dispose_fork(Arc::clone(self.shared()), *fork).await;
        }
        records.into_iter().map(|(_, record)| record).collect()
    }

    /// Notifies the contexts under `next` whose provider for a service
    /// changed relative to `previous`. Returns the names that changed.
    pub fn reconcile_isolation(&self, previous: &ServiceMapping, next: &Context) -> Vec<String> {
        let changed: Vec<String> = {
            let state = self.shared().state.lock();
            let identity = |name: &String, key: ProviderKey| {
                state
                    .services
                    .get(&(name.clone(), key))
                    .map(|service| Arc::as_ptr(service) as *const () as usize)
            };
            previous
                .diff(next.mapping())
                .into_iter()
                .filter(|name| {
                    identity(name, previous.resolve(name)) != identity(name, next.resolve(name))
                })
                .collect()
        };

        for name in &changed {
            let key = next.resolve(name);
            events::emit_where(
                self.shared(),
                INTERNAL_SERVICE,
                &Payload::Service(name.clone()),
                |ctx| ctx.is_descendant_of(next) && ctx.resolve(name) == key,
            );
        }
        changed
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("root", &self.root.id())
            .finish()
    }
}

// =============================================================================
// Fork creation
// =============================================================================

pub(crate) fn notify_service(shared: &Shared, name: &str, key: ProviderKey) {
    events::emit_where(
        shared,
        INTERNAL_SERVICE,
        &Payload::Service(name.to_string()),
        |ctx| ctx.resolve(name) == key,
    );
}

fn check_using(context: &Context, plugin: &Plugin, phase: &'static str) {
    let missing: Vec<String> = plugin
        .using()
        .into_iter()
        .filter(|service| !context.has_service(service))
        .collect();
    if !missing.is_empty() {
        warn!(
            plugin = %plugin.name(),
            phase,
            missing = ?missing,
            "Plugin declares services that are not available"
        );
    }
}

/// Finds or creates the runtime for `plugin` and applies a new fork of it.
pub(crate) async fn spawn(
    parent: Context,
    plugin: Plugin,
    config: Value,
    alias: Option<String>,
) -> EngineResult<Fork> {
    let shared = Arc::clone(parent.shared());
    let name = plugin.name().to_string();

    let (fork_id, context) = {
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(EngineError::Closed);
        }
        if let Some(owner) = parent.fork_id()
            && !state
                .forks
                .get(&owner)
                .is_some_and(|entry| entry.state != ForkState::Disposed)
        {
            return Err(EngineError::NoSuchFork);
        }

        let key = plugin.key();
        let runtime_id = match state.identities.get(&key) {
            Some(id) => *id,
            None => {
                let id = RuntimeId(shared.next_id());
                state.runtimes.insert(
                    id,
                    RuntimeEntry {
                        plugin: plugin.clone(),
                        config: Value::Null,
                        forks: Vec::new(),
                        parent: None,
                        children: Vec::new(),
                    },
                );
                state.identities.insert(key, id);
                debug!(plugin = %name, runtime = %id, "Runtime created");
                id
            }
        };

        if !plugin.is_reusable() {
            let existing = state.runtimes.get(&runtime_id).and_then(|runtime| {
                runtime.forks.iter().copied().find(|fork| {
                    state.forks.get(fork).is_some_and(|entry| {
                        entry.parent.id() == parent.id() && entry.state != ForkState::Disposed
                    })
                })
            });
            if let Some(existing) = existing {
                debug!(plugin = %name, fork = %existing, "Plugin already forked in this context");
                return Ok(Fork::new(Arc::clone(&shared), existing));
            }
        }

        let fork_id = ForkId(shared.next_id());
        let context = parent.for_fork(fork_id);
        state.forks.insert(
            fork_id,
            ForkEntry {
                runtime: runtime_id,
                parent: parent.clone(),
                context: context.clone(),
                config: config.clone(),
                alias,
                state: ForkState::Pending,
                disposables: Vec::new(),
            },
        );
        if let Some(runtime) = state.runtimes.get_mut(&runtime_id) {
            runtime.forks.push(fork_id);
        }
        state.refresh_config(runtime_id);
        state.relink(runtime_id);

        if let Some(owner) = parent.fork_id()
            && let Some(entry) = state.forks.get_mut(&owner)
        {
            entry
                .disposables
                .push((shared.next_id(), Cleanup::Fork(fork_id)));
        }
        (fork_id, context)
    };

    check_using(&context, &plugin, "before apply");
    let span = info_span!("plugin", plugin = %name, fork = %fork_id);
    let result = plugin.apply(context.clone(), config).instrument(span).await;

    match result {
        Ok(()) => {
            {
                let mut state = shared.state.lock();
                if let Some(entry) = state.forks.get_mut(&fork_id)
                    && entry.state == ForkState::Pending
                {
                    entry.state = ForkState::Active;
                }
            }
            check_using(&context, &plugin, "after apply");
            info!(plugin = %name, fork = %fork_id, "Plugin applied");
            Ok(Fork::new(shared, fork_id))
        }
        Err(source) => {
            error!(plugin = %name, fork = %fork_id, error = %source, "Plugin failed to apply");
            dispose_fork(Arc::clone(&shared), fork_id).await;
            Err(EngineError::ApplyFailure {
                plugin: name,
                fork: fork_id,
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::BoxError;
    use crate::plugin::PluginObject;

    fn noop(name: &str) -> Plugin {
        Plugin::function(name, |_ctx, _config| async { Ok(()) })
    }

    struct Greeter;

    #[async_trait]
    impl PluginObject for Greeter {
        fn name(&self) -> &str {
            "greeter"
        }

        fn reusable(&self) -> bool {
            true
        }

        async fn apply(&self, ctx: Context, _config: Value) -> Result<(), BoxError> {
            ctx.command("greet", "Say hello");
            Ok(())
        }
    }

    /// Every fork's runtime must be reachable from a parentless runtime, and
    /// parent/child links must agree in both directions.
    fn assert_tree_consistent(registry: &Registry) {
        let runtimes = registry.runtimes();
        let ids: HashSet<RuntimeId> = runtimes.iter().map(|rt| rt.id).collect();
        for runtime in &runtimes {
            assert!(!runtime.forks.is_empty() || !runtime.children.is_empty());
            if let Some(parent) = runtime.parent {
                assert!(ids.contains(&parent));
                let parent = registry.runtime(parent).unwrap();
                assert!(parent.children.contains(&runtime.id));
            }
            for child in &runtime.children {
                assert_eq!(registry.runtime(*child).unwrap().parent, Some(runtime.id));
            }
            let chain = registry.ancestors(runtime.id);
            if let Some(top) = chain.last() {
                assert!(registry.runtime(*top).unwrap().parent.is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_non_reusable_plugin_is_idempotent_per_context() {
        let registry = Registry::new();
        let root = registry.root();
        let plugin = noop("echo");

        let first = root.plugin(plugin.clone(), json!({ "a": 1 })).await.unwrap();
        let second = root.plugin(plugin.clone(), json!({ "a": 2 })).await.unwrap();
        assert_eq!(first.id(), second.id());

        let elsewhere = root.guild(&["g1"]).plugin(plugin.clone(), json!({})).await.unwrap();
        assert_ne!(first.id(), elsewhere.id());

        let runtime = registry.get(&plugin).unwrap();
        assert_eq!(registry.runtime(runtime).unwrap().forks.len(), 2);
    }

    #[tokio::test]
    async fn test_reusable_plugin_collects_configs() {
        let registry = Registry::new();
        let root = registry.root();
        let plugin = Plugin::object(Greeter);

        let first = root.plugin(plugin.clone(), json!({ "n": 1 })).await.unwrap();
        root.plugin(plugin.clone(), json!({ "n": 2 })).await.unwrap();

        let runtime = registry.get(&plugin).unwrap();
        assert_eq!(
            registry.runtime(runtime).unwrap().config,
            json!([{ "n": 1 }, { "n": 2 }])
        );
        assert_eq!(registry.commands().len(), 2);

        first.dispose().await;
        assert_eq!(registry.runtime(runtime).unwrap().config, json!([{ "n": 2 }]));
    }

    #[tokio::test]
    async fn test_apply_failure_is_contained() {
        let registry = Registry::new();
        let root = registry.root();
        let cleaned = Arc::new(AtomicUsize::new(0));

        let broken = {
            let cleaned = Arc::clone(&cleaned);
            Plugin::function("broken", move |ctx, _config| {
                let cleaned = Arc::clone(&cleaned);
                async move {
                    ctx.on("message", |_| {});
                    ctx.effect(move || {
                        cleaned.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    });
                    Err::<(), BoxError>("apply exploded".into())
                }
            })
        };
        let sibling = noop("sibling");

        let failed = root.plugin(broken.clone(), json!({})).await.unwrap();
        let healthy = root.plugin(sibling, json!({})).await.unwrap();

        assert_eq!(failed.state(), ForkState::Disposed);
        assert_eq!(cleaned.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(healthy.is_active());
        assert!(registry.get(&broken).is_none());
        assert!(registry.snapshot().listeners.is_empty());

        let error = root.try_plugin(broken, json!({})).await.unwrap_err();
        assert!(matches!(error, EngineError::ApplyFailure { ref plugin, .. } if plugin == "broken"));
    }

    #[tokio::test]
    async fn test_dispose_restores_registry_snapshot() {
        let registry = Registry::new();
        let root = registry.root();
        root.on("message", |_| {});
        let before = registry.snapshot();

        let plugin = Plugin::function("chatty", |ctx, _config| async move {
            ctx.on("message", |_| {});
            ctx.on("notice", |_| {});
            ctx.command("ping", "Reply with pong");
            ctx.provide("counter", Arc::new(AtomicUsize::new(0)));
            ctx.guild(&["g1"]).command("kick", "Remove a member");
            Ok(())
        });

        let fork = root.plugin(plugin, json!({})).await.unwrap();
        assert_ne!(registry.snapshot(), before);

        fork.dispose().await;
        assert_eq!(registry.snapshot(), before);
    }

    #[tokio::test]
    async fn test_tree_stays_consistent_through_nested_plugins() {
        let registry = Registry::new();
        let root = registry.root();
        let leaf = noop("leaf");
        let middle = {
            let leaf = leaf.clone();
            Plugin::function("middle", move |ctx, _config| {
                let leaf = leaf.clone();
                async move {
                    ctx.plugin(leaf, json!({})).await?;
                    Ok(())
                }
            })
        };
        let top = {
            let middle = middle.clone();
            Plugin::function("top", move |ctx, _config| {
                let middle = middle.clone();
                async move {
                    ctx.plugin(middle.clone(), json!({})).await?;
                    ctx.user(&["u1"]).plugin(middle, json!({})).await?;
                    Ok(())
                }
            })
        };

        let first = root.plugin(top.clone(), json!({})).await.unwrap();
        let second = root.guild(&["g1"]).plugin(top.clone(), json!({})).await.unwrap();
        root.plugin(leaf.clone(), json!({})).await.unwrap();
        assert_tree_consistent(&registry);

        let top_id = registry.get(&top).unwrap();
        let middle_id = registry.get(&middle).unwrap();
        assert_eq!(registry.runtime(middle_id).unwrap().parent, Some(top_id));
        assert_eq!(registry.runtime(middle_id).unwrap().forks.len(), 4);

        first.dispose().await;
        assert_tree_consistent(&registry);
        assert_eq!(registry.runtime(middle_id).unwrap().forks.len(), 2);

        second.dispose().await;
        assert_tree_consistent(&registry);
        assert!(registry.get(&top).is_none());
        assert!(registry.get(&middle).is_none());

        let leaf_id = registry.get(&leaf).unwrap();
        let leaf_info = registry.runtime(leaf_id).unwrap();
        assert_eq!(leaf_info.forks.len(), 1);
        assert!(leaf_info.parent.is_none());
    }

    #[tokio::test]
    async fn test_plugin_on_disposed_context_is_rejected() {
        let registry = Registry::new();
        let captured = Arc::new(Mutex::new(None));
        let plugin = {
            let captured = Arc::clone(&captured);
            Plugin::function("capture", move |ctx, _config| {
                let captured = Arc::clone(&captured);
                async move {
                    *captured.lock() = Some(ctx);
                    Ok(())
                }
            })
        };

        let fork = registry.root().plugin(plugin, json!({})).await.unwrap();
        fork.dispose().await;

        let stale = captured.lock().clone().unwrap();
        assert!(!stale.is_active());
        let result = stale.plugin(noop("late"), json!({})).await;
        assert!(matches!(result, Err(EngineError::NoSuchFork)));
    }

    #[tokio::test]
    async fn test_ready_fires_once_and_late_listeners_immediately() {
        let registry = Registry::new();
        let root = registry.root();
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let hits = Arc::clone(&hits);
            root.on(READY, move |_| {
                hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        assert_eq!(registry.start(), 1);
        assert_eq!(registry.start(), 0);

        {
            let hits = Arc::clone(&hits);
            root.on(READY, move |_| {
                hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_teardown_disposes_everything() {
        let registry = Registry::new();
        let root = registry.root();
        let cleaned = Arc::new(AtomicUsize::new(0));
        {
            let cleaned = Arc::clone(&cleaned);
            root.effect(move || {
                cleaned.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            });
        }
        root.plugin(Plugin::object(Greeter), json!({})).await.unwrap();
        root.plugin(noop("other"), json!({})).await.unwrap();

        registry.teardown().await;

        assert_eq!(cleaned.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(registry.snapshot(), RegistrySnapshot::default());
        assert!(registry.is_closed());
        assert!(matches!(
            root.plugin(noop("late"), json!({})).await,
            Err(EngineError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_reconcile_isolation_notifies_changed_subtree_only() {
        let registry = Registry::new();
        let root = registry.root();
        root.provide("database", Arc::new(String::from("shared")));

        let previous = root.extend();
        let next = root.isolate(["database"]);
        next.provide("database", Arc::new(String::from("private")));

        let inside = Arc::new(AtomicUsize::new(0));
        let outside = Arc::new(AtomicUsize::new(0));
        {
            let inside = Arc::clone(&inside);
            next.user(&[]).on(INTERNAL_SERVICE, move |_| {
                inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        {
            let outside = Arc::clone(&outside);
            previous.on(INTERNAL_SERVICE, move |_| {
                outside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }

        let changed = registry.reconcile_isolation(previous.mapping(), &next);
        assert_eq!(changed, vec!["database".to_string()]);
        assert_eq!(inside.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(outside.load(std::sync::atomic::Ordering::SeqCst), 0);

        let unchanged = registry.reconcile_isolation(next.mapping(), &next.extend());
        assert!(unchanged.is_empty());
    }
}
