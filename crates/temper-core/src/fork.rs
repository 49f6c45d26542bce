//! Forks: one instantiation of a runtime inside a context.
//!
//! ```text
//! plugin()  ──► Pending ──► Active     (apply returned Ok)
//!                  │
//!                  └──────► Disposed   (apply failed, or dispose() called)
//! Active    ──► Disposed               (dispose(), parent disposal, reload)
//! ```
//!
//! Disposal marks the fork first, so a second call, or a re-entrant call
//! from inside one of its own disposables, returns immediately.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::Context;
use crate::disposable::Cleanup;
use crate::error::EngineError;
use crate::events::{self, DISPOSE, Payload};
use crate::registry::{ForkId, RuntimeId, Shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkState {
    /// `apply` is still running.
    Pending,
    Active,
    Disposed,
}

/// Handle to a fork. Cheap to clone; stays valid after disposal.
#[derive(Clone)]
pub struct Fork {
    shared: Arc<Shared>,
    id: ForkId,
}

impl Fork {
    pub(crate) fn new(shared: Arc<Shared>, id: ForkId) -> Self {
        Self { shared, id }
    }

    pub fn id(&self) -> ForkId {
        self.id
    }

    pub fn state(&self) -> ForkState {
        self.shared
            .state
            .lock()
            .forks
            .get(&self.id)
            .map(|entry| entry.state)
            .unwrap_or(ForkState::Disposed)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ForkState::Active
    }

    /// The fork's own context, while the fork exists.
    pub fn context(&self) -> Option<Context> {
        self.with_entry(|entry| entry.context.clone())
    }

    /// The context the plugin was forked into.
    pub fn parent(&self) -> Option<Context> {
        self.with_entry(|entry| entry.parent.clone())
    }

    pub fn runtime(&self) -> Option<RuntimeId> {
        self.with_entry(|entry| entry.runtime)
    }

    pub fn config(&self) -> Option<Value> {
        self.with_entry(|entry| entry.config.clone())
    }

    pub fn alias(&self) -> Option<String> {
        self.with_entry(|entry| entry.alias.clone()).flatten()
    }

    /// Disposes the fork. Returns `false` if it was already disposed.
    pub async fn dispose(&self) -> bool {
        dispose_fork(Arc::clone(&self.shared), self.id).await
    }

    fn with_entry<R>(&self, f: impl FnOnce(&crate::registry::ForkEntry) -> R) -> Option<R> {
        self.shared.state.lock().forks.get(&self.id).map(f)
    }
}

impl fmt::Debug for Fork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fork")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Tears a fork down.
///
/// Nested forks go first, newest first, then every other disposable newest
/// first. A failing disposable is logged and the rest still run. Whatever
/// gets registered while this runs is drained too.
pub(crate) fn dispose_fork(shared: Arc<Shared>, id: ForkId) -> BoxFuture<'static, bool> {
    Box::pin(async move {
        let plugin = {
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.forks.get_mut(&id) else {
                return false;
            };
            if entry.state == ForkState::Disposed {
                return false;
            }
            entry.state = ForkState::Disposed;
            let runtime = entry.runtime;
            state
                .runtimes
                .get(&runtime)
                .map(|rt| rt.plugin.name().to_string())
                .unwrap_or_default()
        };

        events::emit_where(&shared, DISPOSE, &Payload::Empty, |ctx| {
            ctx.fork_id() == Some(id)
        });

        loop {
            let batch = {
                let mut state = shared.state.lock();
                match state.forks.get_mut(&id) {
                    Some(entry) => std::mem::take(&mut entry.disposables),
                    None => Vec::new(),
                }
            };
            if batch.is_empty() {
                break;
            }

            let (nested, rest): (Vec<_>, Vec<_>) =
                batch.into_iter().partition(|(_, cleanup)| cleanup.is_fork());
            for (_, cleanup) in nested.into_iter().rev().chain(rest.into_iter().rev()) {
                if let Err(source) = cleanup.run(&shared).await {
                    let error = EngineError::DisposeFailure {
                        plugin: plugin.clone(),
                        source,
                    };
                    warn!(fork = %id, error = %error, "Disposable failed, continuing");
                }
            }
        }

        {
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            if let Some(entry) = state.forks.remove(&id) {
                if let Some(owner) = entry.parent.fork_id()
                    && let Some(parent) = state.forks.get_mut(&owner)
                {
                    parent
                        .disposables
                        .retain(|(_, cleanup)| !matches!(cleanup, Cleanup::Fork(child) if *child == id));
                }
                state.detach_fork(entry.runtime, id);
            }
        }

        debug!(plugin = %plugin, fork = %id, "Fork disposed");
        true
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::error::BoxError;
    use crate::plugin::Plugin;
    use crate::registry::Registry;

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let registry = Registry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let plugin = {
            let runs = Arc::clone(&runs);
            Plugin::function("counter", move |ctx, _config| {
                let runs = Arc::clone(&runs);
                async move {
                    ctx.effect(move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    Ok(())
                }
            })
        };

        let fork = registry.root().plugin(plugin, json!({})).await.unwrap();
        assert!(fork.is_active());

        assert!(fork.dispose().await);
        assert!(!fork.dispose().await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(fork.state(), ForkState::Disposed);
    }

    #[tokio::test]
    async fn test_disposables_run_in_reverse_order() {
        let registry = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let plugin = {
            let order = Arc::clone(&order);
            Plugin::function("ordered", move |ctx, _config| {
                let order = Arc::clone(&order);
                async move {
                    for step in 1..=3 {
                        let order = Arc::clone(&order);
                        ctx.effect(move || {
                            order.lock().push(step);
                            Ok(())
                        });
                    }
                    Ok(())
                }
            })
        };

        let fork = registry.root().plugin(plugin, json!({})).await.unwrap();
        fork.dispose().await;
        assert_eq!(*order.lock(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_failing_disposable_does_not_stop_the_rest() {
        let registry = Registry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let plugin = {
            let runs = Arc::clone(&runs);
            Plugin::function("flaky", move |ctx, _config| {
                let runs = Arc::clone(&runs);
                async move {
                    {
                        let runs = Arc::clone(&runs);
                        ctx.effect(move || {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                    }
                    ctx.effect(|| Err::<(), BoxError>("cleanup exploded".into()));
                    ctx.effect_async(move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    Ok(())
                }
            })
        };

        let fork = registry.root().plugin(plugin, json!({})).await.unwrap();
        fork.dispose().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_nested_forks_are_disposed_before_the_parent_cleanups() {
        let registry = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let child = {
            let order = Arc::clone(&order);
            Plugin::function("child", move |ctx, _config| {
                let order = Arc::clone(&order);
                async move {
                    ctx.effect(move || {
                        order.lock().push("child");
                        Ok(())
                    });
                    Ok(())
                }
            })
        };
        let parent = {
            let order = Arc::clone(&order);
            Plugin::function("parent", move |ctx, _config| {
                let order = Arc::clone(&order);
                let child = child.clone();
                async move {
                    ctx.effect(move || {
                        order.lock().push("parent");
                        Ok(())
                    });
                    ctx.plugin(child, json!({})).await?;
                    Ok(())
                }
            })
        };

        let fork = registry.root().plugin(parent, json!({})).await.unwrap();
        assert_eq!(registry.runtimes().len(), 2);

        fork.dispose().await;
        assert_eq!(*order.lock(), vec!["child", "parent"]);
        assert!(registry.runtimes().is_empty());
    }

    #[tokio::test]
    async fn test_reentrant_disposal_of_ancestor() {
        let registry = Registry::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let child = {
            let runs = Arc::clone(&runs);
            Plugin::function("child", move |ctx, _config| {
                let runs = Arc::clone(&runs);
                async move {
                    let parent = ctx.parent().cloned();
                    ctx.effect_async(move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        if let Some(parent) = parent {
                            parent.dispose().await?;
                        }
                        Ok(())
                    });
                    Ok(())
                }
            })
        };
        let parent = {
            let runs = Arc::clone(&runs);
            Plugin::function("parent", move |ctx, _config| {
                let runs = Arc::clone(&runs);
                let child = child.clone();
                async move {
                    ctx.effect(move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    ctx.plugin(child, json!({})).await?;
                    Ok(())
                }
            })
        };

        let parent_fork = registry.root().plugin(parent, json!({})).await.unwrap();
        let child_runtime = registry
            .runtimes()
            .into_iter()
            .find(|rt| rt.name == "child")
            .unwrap();
        let child_fork = registry.forks_of(child_runtime.id).pop().unwrap();

        child_fork.dispose().await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(parent_fork.state(), ForkState::Disposed);
        assert!(registry.runtimes().is_empty());
        assert_eq!(registry.snapshot().forks, 0);
    }

    #[tokio::test]
    async fn test_dispose_event_reaches_only_the_disposed_fork() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let plugin = {
            let hits = Arc::clone(&hits);
            Plugin::function("watcher", move |ctx, _config| {
                let hits = Arc::clone(&hits);
                async move {
                    ctx.user(&["u1"]).on(DISPOSE, move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                    Ok(())
                }
            })
        };

        let root = registry.root();
        let first = root.extend().plugin(plugin.clone(), json!({})).await.unwrap();
        let second = root.extend().plugin(plugin, json!({})).await.unwrap();

        first.dispose().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(second.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_are_cancelled_on_dispose() {
        let registry = Registry::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let plugin = {
            let ticks = Arc::clone(&ticks);
            Plugin::function("ticker", move |ctx, _config| {
                let ticks = Arc::clone(&ticks);
                async move {
                    ctx.set_interval(std::time::Duration::from_secs(1), move || {
                        ticks.fetch_add(1, Ordering::SeqCst);
                    });
                    Ok(())
                }
            })
        };

        let fork = registry.root().plugin(plugin, json!({})).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(3500)).await;
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        fork.dispose().await;
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
