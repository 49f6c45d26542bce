//! Contexts: immutable, chainable views onto the registry.
//!
//! A [`Context`] pairs a session [`Filter`] with a [`ServiceMapping`] and
//! records the fork that owns whatever is registered through it. Contexts are
//! never mutated; every selector or boolean combinator returns a new child.
//!
//! ```text
//!            root (any)
//!             │
//!     ┌───────┴────────┐
//!  guild(["g1"])    platform(["discord"])
//!     │
//!  exclude(user(["spam"]))
//! ```
//!
//! All registration surfaces (`on`, `command`, `provide`, `effect`, timers,
//! `plugin`) push exactly one disposable onto the owning fork, which is what
//! makes [`Context::dispose`] leak-free.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use serde_json::Value;
use tracing::{debug, warn};

use crate::disposable::{Cleanup, Disposer};
use crate::error::{BoxError, EngineError, EngineResult};
use crate::events::{self, Listener, ListenerFn, Payload, READY};
use crate::filter::Filter;
use crate::fork::{self, Fork, ForkState};
use crate::plugin::Plugin;
use crate::registry::{self, CommandEntry, ForkId, Registry, RuntimeId, Shared};
use crate::service::{ProviderKey, ServiceArc, ServiceMapping};
use crate::session::Session;

/// A filtered, service-scoped view onto a registry.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    shared: Arc<Shared>,
    parent: Option<Context>,
    filter: Filter,
    mapping: Arc<ServiceMapping>,
    fork: Option<ForkId>,
}

impl Context {
    pub(crate) fn root(shared: Arc<Shared>) -> Self {
        let id = shared.next_id();
        Self {
            inner: Arc::new(ContextInner {
                id,
                shared,
                parent: None,
                filter: Filter::any(),
                mapping: Arc::new(ServiceMapping::default()),
                fork: None,
            }),
        }
    }

    fn derive(&self, filter: Filter, mapping: Arc<ServiceMapping>, fork: Option<ForkId>) -> Context {
        let shared = Arc::clone(&self.inner.shared);
        Context {
            inner: Arc::new(ContextInner {
                id: shared.next_id(),
                shared,
                parent: Some(self.clone()),
                filter,
                mapping,
                fork,
            }),
        }
    }

    fn narrow(&self, filter: Filter) -> Context {
        self.derive(filter, Arc::clone(&self.inner.mapping), self.inner.fork)
    }

    /// The child context handed to a fork's `apply`.
    pub(crate) fn for_fork(&self, fork: ForkId) -> Context {
        self.derive(
            self.inner.filter.clone(),
            Arc::clone(&self.inner.mapping),
            Some(fork),
        )
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    // ─── Identity ────────────────────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The fork that owns registrations made through this context.
    pub fn fork_id(&self) -> Option<ForkId> {
        self.inner.fork
    }

    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// The process-root ancestor.
    pub fn root_context(&self) -> Context {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current.clone()
    }

    /// Whether `ancestor` is this context or one of its ancestors.
    pub fn is_descendant_of(&self, ancestor: &Context) -> bool {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if ctx.id() == ancestor.id() {
                return true;
            }
            current = ctx.parent();
        }
        false
    }

    pub fn registry(&self) -> Registry {
        Registry::from_root(self.root_context())
    }

    /// The runtime of the owning fork.
    pub fn runtime(&self) -> Option<RuntimeId> {
        let fork = self.inner.fork?;
        self.inner
            .shared
            .state
            .lock()
            .forks
            .get(&fork)
            .map(|entry| entry.runtime)
    }

    /// Root contexts are always active; fork contexts until their fork is disposed.
    pub fn is_active(&self) -> bool {
        match self.inner.fork {
            None => !self.inner.shared.state.lock().closed,
            Some(fork) => self
                .inner
                .shared
                .state
                .lock()
                .forks
                .get(&fork)
                .is_some_and(|entry| entry.state != ForkState::Disposed),
        }
    }

    // ─── Composition ─────────────────────────────────────────────────────────

    pub fn filter(&self) -> &Filter {
        &self.inner.filter
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.inner.filter.matches(session)
    }

    fn same_registry(&self, other: &Context) -> EngineResult<()> {
        if Arc::ptr_eq(&self.inner.shared, &other.inner.shared) {
            Ok(())
        } else {
            Err(EngineError::ForeignContext)
        }
    }

    /// Sessions accepted by both contexts.
    pub fn intersect(&self, other: &Context) -> EngineResult<Context> {
        self.same_registry(other)?;
        Ok(self.narrow(self.inner.filter.and(&other.inner.filter)))
    }

    /// Sessions accepted by either context.
    pub fn union(&self, other: &Context) -> EngineResult<Context> {
        self.same_registry(other)?;
        Ok(self.narrow(self.inner.filter.or(&other.inner.filter)))
    }

    /// Sessions accepted by `self` but not by `other`.
    pub fn exclude(&self, other: &Context) -> EngineResult<Context> {
        self.same_registry(other)?;
        Ok(self.narrow(self.inner.filter.and_not(&other.inner.filter)))
    }

    /// Narrows this context by an arbitrary predicate.
    pub fn select<F>(&self, predicate: F) -> Context
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        self.narrow(self.inner.filter.and(&Filter::new(predicate)))
    }

    /// A view that accepts every session.
    pub fn any(&self) -> Context {
        self.narrow(Filter::any())
    }

    /// A view that accepts no session.
    pub fn never(&self) -> Context {
        self.narrow(Filter::never())
    }

    pub fn user(&self, ids: &[&str]) -> Context {
        self.narrow(
            self.inner
                .filter
                .and(&Filter::field(ids, |s| s.user_id.as_deref())),
        )
    }

    pub fn guild(&self, ids: &[&str]) -> Context {
        self.narrow(
            self.inner
                .filter
                .and(&Filter::field(ids, |s| s.guild_id.as_deref())),
        )
    }

    pub fn channel(&self, ids: &[&str]) -> Context {
        self.narrow(
            self.inner
                .filter
                .and(&Filter::field(ids, |s| s.channel_id.as_deref())),
        )
    }

    pub fn platform(&self, names: &[&str]) -> Context {
        self.narrow(
            self.inner
                .filter
                .and(&Filter::field(names, |s| Some(s.platform.as_str()))),
        )
    }

    pub fn self_id(&self, ids: &[&str]) -> Context {
        self.narrow(
            self.inner
                .filter
                .and(&Filter::field(ids, |s| s.self_id.as_deref())),
        )
    }

    /// Direct sessions, optionally restricted to `ids`.
    pub fn private(&self, ids: &[&str]) -> Context {
        let guild = Filter::field(&[], |s| s.guild_id.as_deref());
        self.narrow(self.inner.filter.and_not(&guild)).user(ids)
    }

    /// A fresh child with the same filter and mapping.
    pub fn extend(&self) -> Context {
        self.narrow(self.inner.filter.clone())
    }

    /// Shadows `names` with new provider slots for this subtree.
    pub fn isolate<I>(&self, names: I) -> Context
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let shared = Arc::clone(&self.inner.shared);
        let mapping = self
            .inner
            .mapping
            .shadow(names, || ProviderKey::new(shared.next_id()));
        self.derive(self.inner.filter.clone(), Arc::new(mapping), self.inner.fork)
    }

    // ─── Services ────────────────────────────────────────────────────────────

    pub fn mapping(&self) -> &ServiceMapping {
        &self.inner.mapping
    }

    pub fn resolve(&self, name: &str) -> ProviderKey {
        self.inner.mapping.resolve(name)
    }

    /// Installs `value` as the provider of `name` for every context that
    /// resolves `name` to the same slot as this one.
    pub fn provide<T>(&self, name: &str, value: Arc<T>) -> Disposer
    where
        T: Any + Send + Sync,
    {
        let key = self.resolve(name);
        let value: ServiceArc = value;
        let identity = Arc::as_ptr(&value) as *const () as usize;
        self.inner
            .shared
            .state
            .lock()
            .services
            .insert((name.to_string(), key), value);
        debug!(service = name, provider = %key, "Service provided");

        let disposer = self.track(Cleanup::Service {
            name: name.to_string(),
            key,
            identity,
        });
        registry::notify_service(&self.inner.shared, name, key);
        disposer
    }

    pub fn get<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let service = self
            .inner
            .shared
            .state
            .lock()
            .services
            .get(&(name.to_string(), self.resolve(name)))
            .cloned()?;
        service.downcast::<T>().ok()
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.inner
            .shared
            .state
            .lock()
            .services
            .contains_key(&(name.to_string(), self.resolve(name)))
    }

    // ─── Events ──────────────────────────────────────────────────────────────

    /// Registers a listener. A `ready` listener added after start fires at once.
    pub fn on<F>(&self, name: &str, listener: F) -> Disposer
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        let callback: ListenerFn = Arc::new(listener);
        let id = self.inner.shared.next_id();
        let fire_now = {
            let mut state = self.inner.shared.state.lock();
            state.listeners.push(Listener {
                id,
                name: name.to_string(),
                context: self.clone(),
                callback: Arc::clone(&callback),
            });
            name == READY && state.ready
        };

        let disposer = self.track(Cleanup::Listener(id));
        if fire_now {
            callback(&Payload::Empty);
        }
        disposer
    }

    /// Delivers an event. Session payloads only reach listeners whose context matches.
    pub fn emit(&self, name: &str, payload: Payload) -> usize {
        events::emit_where(&self.inner.shared, name, &payload, |ctx| match &payload {
            Payload::Session(session) => ctx.matches(session),
            _ => true,
        })
    }

    /// Records a command owned by this context. Parsing and dispatch live elsewhere.
    pub fn command(&self, name: &str, description: &str) -> Disposer {
        let id = self.inner.shared.next_id();
        self.inner.shared.state.lock().commands.push(CommandEntry {
            id,
            name: name.to_string(),
            description: description.to_string(),
            context: self.clone(),
        });
        self.track(Cleanup::Command(id))
    }

    // ─── Effects & timers ────────────────────────────────────────────────────

    pub fn effect<F>(&self, cleanup: F) -> Disposer
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.track(Cleanup::Callback(Box::new(
            move || -> BoxFuture<'static, Result<(), BoxError>> {
                Box::pin(future::ready(cleanup()))
            },
        )))
    }

    pub fn effect_async<F, Fut>(&self, cleanup: F) -> Disposer
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.track(Cleanup::Callback(Box::new(
            move || -> BoxFuture<'static, Result<(), BoxError>> { Box::pin(cleanup()) },
        )))
    }

    /// Runs `callback` once after `delay` unless the owning fork is disposed first.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> Disposer
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        self.track(Cleanup::Task(handle.abort_handle()))
    }

    pub fn set_interval<F>(&self, period: Duration, callback: F) -> Disposer
    where
        F: Fn() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                callback();
            }
        });
        self.track(Cleanup::Task(handle.abort_handle()))
    }

    // ─── Plugins ─────────────────────────────────────────────────────────────

    /// Forks `plugin` into this context.
    ///
    /// A failing `apply` is logged and its fork disposed; the returned fork
    /// is then in [`ForkState::Disposed`]. Use [`try_plugin`](Self::try_plugin)
    /// to observe the failure.
    pub async fn plugin(&self, plugin: impl Into<Plugin>, config: Value) -> EngineResult<Fork> {
        self.plugin_as(plugin, config, None).await
    }

    pub async fn plugin_as(
        &self,
        plugin: impl Into<Plugin>,
        config: Value,
        alias: Option<String>,
    ) -> EngineResult<Fork> {
        match registry::spawn(self.clone(), plugin.into(), config, alias).await {
            Err(EngineError::ApplyFailure { fork, .. }) => {
                Ok(Fork::new(Arc::clone(&self.inner.shared), fork))
            }
            other => other,
        }
    }

    /// Like [`plugin`](Self::plugin) but returns [`EngineError::ApplyFailure`].
    pub async fn try_plugin(&self, plugin: impl Into<Plugin>, config: Value) -> EngineResult<Fork> {
        registry::spawn(self.clone(), plugin.into(), config, None).await
    }

    pub async fn try_plugin_as(
        &self,
        plugin: impl Into<Plugin>,
        config: Value,
        alias: Option<String>,
    ) -> EngineResult<Fork> {
        registry::spawn(self.clone(), plugin.into(), config, alias).await
    }

    /// Disposes the fork that owns this context.
    pub async fn dispose(&self) -> EngineResult<()> {
        let fork = self.inner.fork.ok_or(EngineError::NoSuchFork)?;
        fork::dispose_fork(Arc::clone(&self.inner.shared), fork).await;
        Ok(())
    }

    /// Attaches `cleanup` to the owning fork, or to the root's detached list.
    pub(crate) fn track(&self, cleanup: Cleanup) -> Disposer {
        let shared = Arc::clone(&self.inner.shared);
        let id = shared.next_id();
        let orphan = {
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            match self.inner.fork {
                Some(fork) => match state.forks.get_mut(&fork) {
                    Some(entry) => {
                        entry.disposables.push((id, cleanup));
                        None
                    }
                    None => Some(cleanup),
                },
                None => {
                    state.detached.push((id, cleanup));
                    None
                }
            }
        };

        if let Some(cleanup) = orphan {
            warn!(
                context = self.inner.id,
                "Registration on a disposed fork, releasing it immediately"
            );
            cleanup.release(Arc::clone(&shared));
        }
        Disposer::new(shared, self.inner.fork, id)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("fork", &self.inner.fork)
            .field("isolated", &self.inner.mapping.isolated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn sessions() -> Vec<Session> {
        let mut out = Vec::new();
        for platform in ["qq", "discord"] {
            for user in [None, Some("u1"), Some("u2")] {
                for guild in [None, Some("g1"), Some("g2")] {
                    let mut session = Session::new(platform);
                    session.user_id = user.map(str::to_string);
                    session.guild_id = guild.map(str::to_string);
                    out.push(session);
                }
            }
        }
        out
    }

    fn assert_same_filter(lhs: &Context, rhs: &Context) {
        for session in sessions() {
            assert_eq!(lhs.matches(&session), rhs.matches(&session), "{session:?}");
        }
    }

    #[test]
    fn test_composition_matches_boolean_semantics() {
        let registry = Registry::new();
        let root = registry.root();
        let a = root.user(&["u1"]);
        let b = root.guild(&["g1"]);

        let both = a.intersect(&b).unwrap();
        let either = a.union(&b).unwrap();
        let only_a = a.exclude(&b).unwrap();

        for session in sessions() {
            let (ea, eb) = (a.matches(&session), b.matches(&session));
            assert_eq!(both.matches(&session), ea && eb);
            assert_eq!(either.matches(&session), ea || eb);
            assert_eq!(only_a.matches(&session), ea && !eb);
        }
    }

    #[test]
    fn test_composition_laws() {
        let registry = Registry::new();
        let root = registry.root();
        let a = root.user(&["u1"]);
        let b = root.guild(&[]);
        let c = root.platform(&["discord"]);

        let left = a.intersect(&b).unwrap().intersect(&c).unwrap();
        let right = a.intersect(&b.intersect(&c).unwrap()).unwrap();
        assert_same_filter(&left, &right);

        let left = a.union(&b).unwrap().union(&c).unwrap();
        let right = a.union(&b.union(&c).unwrap()).unwrap();
        assert_same_filter(&left, &right);

        assert_same_filter(&a.intersect(&b).unwrap(), &b.intersect(&a).unwrap());
        assert_same_filter(&a.union(&b).unwrap(), &b.union(&a).unwrap());
    }

    #[test]
    fn test_selectors() {
        let registry = Registry::new();
        let root = registry.root();

        let direct = Session::new("qq").with_user("u1");
        let group = Session::new("qq").with_user("u1").with_guild("g1");

        assert!(root.private(&[]).matches(&direct));
        assert!(!root.private(&[]).matches(&group));
        assert!(!root.private(&["u2"]).matches(&direct));
        assert!(root.guild(&[]).matches(&group));
        assert!(root.any().matches(&group));
        assert!(!root.never().matches(&group));
        assert!(root.select(|s| s.content.is_empty()).matches(&direct));
        assert!(root.self_id(&[]).matches(&direct.clone().with_self_id("bot")));
        assert!(!root.self_id(&[]).matches(&direct));
    }

    #[test]
    fn test_foreign_contexts_fail_fast() {
        let first = Registry::new();
        let second = Registry::new();

        let result = first.root().intersect(&second.root());
        assert!(matches!(result, Err(EngineError::ForeignContext)));
        assert!(matches!(
            first.root().union(&second.root().user(&[])),
            Err(EngineError::ForeignContext)
        ));
    }

    #[test]
    fn test_derived_contexts_keep_ancestry() {
        let registry = Registry::new();
        let root = registry.root();
        let child = root.user(&["u1"]).guild(&["g1"]);

        assert!(child.is_descendant_of(&root));
        assert!(!root.is_descendant_of(&child));
        assert_eq!(child.root_context().id(), root.id());
        assert!(root.is_root());
        assert!(!child.is_root());
    }

    #[test]
    fn test_isolate_scopes_services() {
        let registry = Registry::new();
        let root = registry.root();
        let isolated = root.isolate(["database"]);
        let nested = isolated.user(&["u1"]);

        root.provide("database", Arc::new(String::from("shared")));
        isolated.provide("database", Arc::new(String::from("private")));

        assert_eq!(root.get::<String>("database").unwrap().as_str(), "shared");
        assert_eq!(nested.get::<String>("database").unwrap().as_str(), "private");
        assert_eq!(nested.resolve("database"), isolated.resolve("database"));
        assert_eq!(nested.resolve("cache"), ProviderKey::ROOT);
        assert!(root.get::<u32>("database").is_none());
    }

    #[test]
    fn test_service_notification_is_scoped_to_provider_slot() {
        let registry = Registry::new();
        let root = registry.root();
        let isolated = root.isolate(["database"]);

        let shared_hits = Arc::new(AtomicUsize::new(0));
        let isolated_hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&shared_hits);
            root.user(&[]).on(events::INTERNAL_SERVICE, move |payload| {
                if payload == &Payload::Service("database".into()) {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        {
            let hits = Arc::clone(&isolated_hits);
            isolated.on(events::INTERNAL_SERVICE, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        root.provide("database", Arc::new(1u32));
        assert_eq!(shared_hits.load(Ordering::SeqCst), 1);
        assert_eq!(isolated_hits.load(Ordering::SeqCst), 0);

        isolated.provide("database", Arc::new(2u32));
        assert_eq!(shared_hits.load(Ordering::SeqCst), 1);
        assert_eq!(isolated_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_session_events_respect_listener_filters() {
        let registry = Registry::new();
        let root = registry.root();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            root.guild(&["g1"]).on("message", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let inside = Session::new("qq").with_guild("g1");
        let outside = Session::new("qq").with_guild("g2");
        assert_eq!(root.emit("message", Payload::Session(inside)), 1);
        assert_eq!(root.emit("message", Payload::Session(outside)), 0);
        assert_eq!(root.emit("message", Payload::Empty), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_root_dispose_is_rejected() {
        let registry = Registry::new();
        let result = tokio_test::block_on(registry.root().dispose());
        assert!(matches!(result, Err(EngineError::NoSuchFork)));
    }
}
