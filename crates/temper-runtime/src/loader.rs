//! The plugin map.
//!
//! Configuration names plugins by key and passes the value as their config:
//!
//! ```toml
//! [plugins.echo]              # plugin "echo"
//! prefix = "!"
//!
//! [plugins."echo:loud"]       # a second fork of "echo", aliased "loud"
//! prefix = "!!"
//!
//! [plugins."~admin"]          # disabled
//!
//! [plugins."group:chat"]      # a group: the value is a nested plugin map
//! "$isolate" = ["database"]   # `$` keys are loader options, not plugin config
//! [plugins."group:chat".greeter]
//! text = "hi"
//! ```
//!
//! Every entry is forked into its own [`Context::extend`] child, so entries
//! can be disposed and re-forked independently.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use temper_core::{BoxError, Context, Plugin, PluginObject};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::{ConfigError, ConfigResult};
use crate::error::RuntimeResult;
use crate::module::ModuleCache;

/// Plugin name of group entries.
pub const GROUP: &str = "group";

const ISOLATE: &str = "$isolate";

/// A parsed plugin map key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryKey {
    pub name: String,
    pub alias: Option<String>,
    pub disabled: bool,
}

impl EntryKey {
    /// The key without the disabled marker; stable across enabling and disabling.
    pub fn id(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{}:{alias}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Parses `name`, `name:alias` and `~name`.
pub fn parse_key(key: &str) -> ConfigResult<EntryKey> {
    let (disabled, rest) = match key.strip_prefix('~') {
        Some(rest) => (true, rest),
        None => (false, key),
    };
    let (name, alias) = match rest.split_once(':') {
        Some((name, alias)) => (name, Some(alias)),
        None => (rest, None),
    };

    if name.is_empty() {
        return Err(ConfigError::invalid_entry(key, "missing plugin name"));
    }
    if name.starts_with('$') {
        return Err(ConfigError::invalid_entry(
            key,
            "options are only allowed inside an entry",
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(ConfigError::invalid_entry(key, "plugin names cannot contain spaces"));
    }
    if alias.is_some_and(str::is_empty) {
        return Err(ConfigError::invalid_entry(key, "empty alias"));
    }

    Ok(EntryKey {
        name: name.to_string(),
        alias: alias.map(str::to_string),
        disabled,
    })
}

/// Loader options given by `$` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryOptions {
    /// Services shadowed in the entry's context.
    pub isolate: Vec<String>,
}

/// Splits an entry value into plugin config and loader options.
///
/// `null` becomes an empty object.
pub fn split_options(key: &str, value: &Value) -> ConfigResult<(Value, EntryOptions)> {
    let object = match value {
        Value::Null => return Ok((Value::Object(Map::new()), EntryOptions::default())),
        Value::Object(object) => object,
        other => return Ok((other.clone(), EntryOptions::default())),
    };

    let mut config = Map::new();
    let mut options = EntryOptions::default();
    for (name, value) in object {
        if !name.starts_with('$') {
            config.insert(name.clone(), value.clone());
            continue;
        }
        if name != ISOLATE {
            return Err(ConfigError::invalid_entry(
                key,
                format!("unknown option '{name}'"),
            ));
        }

        let names = value
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| {
                ConfigError::invalid_entry(key, "$isolate must be an array of service names")
            })?;
        options.isolate = names;
    }

    options.isolate.sort();
    options.isolate.dedup();
    Ok((Value::Object(config), options))
}

/// Placeholder plugin that gives nested entries a fork to live in.
struct Group;

#[async_trait]
impl PluginObject for Group {
    fn name(&self) -> &str {
        GROUP
    }

    fn reusable(&self) -> bool {
        true
    }

    async fn apply(&self, _ctx: Context, _config: Value) -> Result<(), BoxError> {
        Ok(())
    }
}

struct Nested {
    /// Context of the group fork; nested entries extend it.
    scope: Context,
    entries: BTreeMap<String, EntryState>,
}

struct EntryState {
    key: EntryKey,
    config: Value,
    options: EntryOptions,
    /// The context the plugin was forked into.
    context: Context,
    group: Option<Nested>,
}

/// Applies a plugin map and keeps it in sync with later versions.
pub struct PluginLoader {
    modules: Arc<ModuleCache>,
    group: Plugin,
    entries: Mutex<BTreeMap<String, EntryState>>,
}

impl PluginLoader {
    pub fn new(modules: Arc<ModuleCache>) -> Self {
        Self {
            modules,
            group: Plugin::object(Group),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Loads `map` into `ctx`, replacing whatever was loaded before.
    pub async fn apply(&self, ctx: &Context, map: &Map<String, Value>) -> RuntimeResult<()> {
        let mut entries = self.entries.lock().await;
        for entry in std::mem::take(&mut *entries).into_values() {
            unload_entry(&entry).await;
        }
        info!(entries = map.len(), "Loading plugin map");
        self.reconcile(ctx, &mut entries, map).await
    }

    /// Brings the loaded tree in line with `map`, touching only what changed.
    pub async fn update(&self, ctx: &Context, map: &Map<String, Value>) -> RuntimeResult<()> {
        let mut entries = self.entries.lock().await;
        debug!("Updating plugin map");
        self.reconcile(ctx, &mut entries, map).await
    }

    /// Disposes every entry. Returns how many top-level entries there were.
    pub async fn unload_all(&self) -> usize {
        let entries = std::mem::take(&mut *self.entries.lock().await);
        let count = entries.len();
        for entry in entries.into_values() {
            unload_entry(&entry).await;
        }
        count
    }

    /// Ids of the loaded entries, nested ones as `group:alias/name`.
    pub async fn loaded(&self) -> Vec<String> {
        fn walk(prefix: &str, entries: &BTreeMap<String, EntryState>, out: &mut Vec<String>) {
            for (id, entry) in entries {
                let path = format!("{prefix}{id}");
                if let Some(nested) = &entry.group {
                    walk(&format!("{path}/"), &nested.entries, out);
                }
                out.push(path);
            }
        }

        let entries = self.entries.lock().await;
        let mut out = Vec::new();
        walk("", &entries, &mut out);
        out.sort();
        out
    }

    fn reconcile<'a>(
        &'a self,
        ctx: &'a Context,
        entries: &'a mut BTreeMap<String, EntryState>,
        map: &'a Map<String, Value>,
    ) -> BoxFuture<'a, RuntimeResult<()>> {
        async move {
            let mut wanted = BTreeMap::new();
            for (raw, value) in map {
                let key = parse_key(raw)?;
                if key.disabled {
                    continue;
                }
                let (config, options) = split_options(raw, value)?;
                wanted.insert(key.id(), (key, config, options));
            }

            let stale: Vec<String> = entries
                .keys()
                .filter(|id| !wanted.contains_key(*id))
                .cloned()
                .collect();
            for id in stale {
                if let Some(entry) = entries.remove(&id) {
                    debug!(entry = %id, "Unloading entry");
                    unload_entry(&entry).await;
                }
            }

            for (id, (key, config, options)) in wanted {
                match entries.remove(&id) {
                    Some(mut entry)
                        if entry.options == options
                            && (entry.group.is_some() || entry.config == config) =>
                    {
                        if let (Some(nested), Value::Object(children)) = (&mut entry.group, &config)
                        {
                            self.reconcile(&nested.scope, &mut nested.entries, children)
                                .await?;
                        }
                        entry.config = config;
                        entries.insert(id, entry);
                    }
                    Some(previous) => {
                        debug!(entry = %id, "Entry changed, forking again");
                        unload_entry(&previous).await;
                        let Some(entry) = self.load_entry(ctx, key, config, options).await? else {
                            continue;
                        };
                        if previous.options.isolate != entry.options.isolate {
                            let changed = ctx
                                .registry()
                                .reconcile_isolation(previous.context.mapping(), &entry.context);
                            debug!(entry = %id, services = ?changed, "Isolation changed");
                        }
                        entries.insert(id, entry);
                    }
                    None => {
                        if let Some(entry) = self.load_entry(ctx, key, config, options).await? {
                            entries.insert(id, entry);
                        }
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Forks one entry. A plugin that cannot be resolved is logged and skipped.
    async fn load_entry(
        &self,
        ctx: &Context,
        key: EntryKey,
        config: Value,
        options: EntryOptions,
    ) -> RuntimeResult<Option<EntryState>> {
        let context = if options.isolate.is_empty() {
            ctx.extend()
        } else {
            ctx.extend().isolate(&options.isolate)
        };

        if key.name == GROUP {
            let Value::Object(children) = &config else {
                let reason = "a group must contain a plugin map";
                return Err(ConfigError::invalid_entry(key.id(), reason).into());
            };
            let children = children.clone();
            let fork = context
                .plugin_as(self.group.clone(), config.clone(), key.alias.clone())
                .await?;
            let Some(scope) = fork.context() else {
                return Ok(None);
            };

            let mut nested = BTreeMap::new();
            self.reconcile(&scope, &mut nested, &children).await?;
            return Ok(Some(EntryState {
                key,
                config,
                options,
                context,
                group: Some(Nested {
                    scope,
                    entries: nested,
                }),
            }));
        }

        let plugin = match self.modules.require_plugin(&key.name) {
            Ok((_, plugin)) => plugin,
            Err(e) => {
                error!(plugin = %key.name, error = %e, "Failed to load plugin");
                return Ok(None);
            }
        };
        context
            .plugin_as(plugin, config.clone(), key.alias.clone())
            .await?;

        Ok(Some(EntryState {
            key,
            config,
            options,
            context,
            group: None,
        }))
    }
}

/// Disposes the forks living directly in the entry's context, whatever
/// plugin value they run now.
async fn unload_entry(entry: &EntryState) {
    for fork in entry.context.registry().forks_in(&entry.context) {
        fork.dispose().await;
    }
    debug!(entry = %entry.key.id(), "Entry unloaded");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use temper_core::{INTERNAL_SERVICE, ProviderKey, Registry};

    use super::*;
    use crate::module::{Exports, StaticLoader};

    struct Fixture {
        modules: Arc<ModuleCache>,
        registry: Registry,
        loader: PluginLoader,
    }

    impl Fixture {
        fn new() -> Self {
            let modules_loader = StaticLoader::new();
            modules_loader.define("/app/echo", |_| {
                Ok(Exports::Plugin(Plugin::function("echo", |ctx, _config| async move {
                    ctx.command("echo", "Repeat a message");
                    Ok(())
                })))
            });
            let modules = Arc::new(ModuleCache::new("/app", Arc::new(modules_loader)));
            Self {
                loader: PluginLoader::new(Arc::clone(&modules)),
                modules,
                registry: Registry::new(),
            }
        }

        fn echo_forks(&self) -> Vec<temper_core::Fork> {
            let (_, echo) = self.modules.require_plugin("echo").unwrap();
            self.registry
                .get(&echo)
                .map(|id| self.registry.forks_of(id))
                .unwrap_or_default()
        }

        fn map(value: Value) -> Map<String, Value> {
            match value {
                Value::Object(map) => map,
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_parse_key() {
        let key = parse_key("~echo:loud").unwrap();
        assert_eq!(key.name, "echo");
        assert_eq!(key.alias.as_deref(), Some("loud"));
        assert!(key.disabled);
        assert_eq!(key.id(), "echo:loud");

        assert!(parse_key("").is_err());
        assert!(parse_key(":loud").is_err());
        assert!(parse_key("echo:").is_err());
        assert!(parse_key("$isolate").is_err());
    }

    #[test]
    fn test_split_options() {
        let (config, options) = split_options(
            "echo",
            &json!({ "prefix": "!", "$isolate": ["db", "cache", "db"] }),
        )
        .unwrap();
        assert_eq!(config, json!({ "prefix": "!" }));
        assert_eq!(options.isolate, ["cache", "db"]);

        let (config, _) = split_options("echo", &Value::Null).unwrap();
        assert_eq!(config, json!({}));

        assert!(split_options("echo", &json!({ "$isolate": "db" })).is_err());
        assert!(split_options("echo", &json!({ "$filter": {} })).is_err());
    }

    #[tokio::test]
    async fn test_update_diffs_entries() {
        let fx = Fixture::new();
        let root = fx.registry.root();

        let first = Fixture::map(json!({
            "echo": { "prefix": "!" },
            "echo:loud": { "prefix": "!!" },
            "~admin": {},
            "missing": {},
        }));
        fx.loader.apply(&root, &first).await.unwrap();
        assert_eq!(fx.loader.loaded().await, ["echo", "echo:loud"]);
        let forks = fx.echo_forks();
        assert_eq!(forks.len(), 2);
        let loud = forks
            .iter()
            .find(|fork| fork.alias().as_deref() == Some("loud"))
            .unwrap()
            .id();

        let second = Fixture::map(json!({
            "echo": { "prefix": "?" },
            "echo:loud": { "prefix": "!!" },
        }));
        fx.loader.update(&root, &second).await.unwrap();
        let forks = fx.echo_forks();
        assert_eq!(forks.len(), 2);
        assert!(forks.iter().any(|fork| fork.id() == loud));
        assert!(
            forks
                .iter()
                .any(|fork| fork.config() == Some(json!({ "prefix": "?" })))
        );

        let third = Fixture::map(json!({
            "~echo": { "prefix": "?" },
            "echo:loud": { "prefix": "!!" },
        }));
        fx.loader.update(&root, &third).await.unwrap();
        assert_eq!(fx.loader.loaded().await, ["echo:loud"]);
        assert_eq!(fx.echo_forks().len(), 1);
        assert_eq!(fx.registry.commands().len(), 1);

        assert_eq!(fx.loader.unload_all().await, 1);
        assert!(fx.registry.runtimes().is_empty());
    }

    #[tokio::test]
    async fn test_groups_nest_and_isolate() {
        let fx = Fixture::new();
        let root = fx.registry.root();

        let map = Fixture::map(json!({
            "group:chat": {
                "$isolate": ["database"],
                "echo": { "n": 1 },
            },
        }));
        fx.loader.apply(&root, &map).await.unwrap();
        assert_eq!(fx.loader.loaded().await, ["group:chat", "group:chat/echo"]);

        let echo = fx.echo_forks().remove(0);
        let parent = echo.parent().unwrap();
        assert_ne!(parent.resolve("database"), ProviderKey::ROOT);
        assert_eq!(root.resolve("database"), ProviderKey::ROOT);
        let group_runtime = fx.registry.runtime(parent.runtime().unwrap()).unwrap();
        assert_eq!(group_runtime.name, GROUP);

        let changed = Fixture::map(json!({
            "group:chat": {
                "$isolate": ["database"],
                "echo": { "n": 2 },
            },
        }));
        fx.loader.update(&root, &changed).await.unwrap();
        let forks = fx.echo_forks();
        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].config(), Some(json!({ "n": 2 })));
        assert_eq!(forks[0].parent().unwrap().fork_id(), parent.fork_id());

        fx.loader
            .update(&root, &Fixture::map(json!({})))
            .await
            .unwrap();
        assert!(fx.loader.loaded().await.is_empty());
        assert!(fx.registry.runtimes().is_empty());
    }

    #[tokio::test]
    async fn test_isolate_change_notifies_listeners() {
        let fx = Fixture::new();
        let root = fx.registry.root();
        let notified = Arc::new(AtomicUsize::new(0));

        let loader = StaticLoader::new();
        let counter = Arc::clone(&notified);
        loader.define("/app/watcher", move |_| {
            let counter = Arc::clone(&counter);
            Ok(Exports::Plugin(Plugin::function("watcher", move |ctx, _config| {
                let counter = Arc::clone(&counter);
                async move {
                    ctx.on(INTERNAL_SERVICE, move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                    Ok(())
                }
            })))
        });
        let plugins = PluginLoader::new(Arc::new(ModuleCache::new("/app", Arc::new(loader))));

        let _db = root.provide("database", Arc::new(String::from("shared")));
        plugins
            .apply(&root, &Fixture::map(json!({ "watcher": {} })))
            .await
            .unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 0);

        plugins
            .update(
                &root,
                &Fixture::map(json!({ "watcher": { "$isolate": ["database"] } })),
            )
            .await
            .unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        plugins.unload_all().await;
        assert!(fx.registry.runtimes().is_empty());
    }
}
