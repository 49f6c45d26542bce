//! Process runtime: configuration, plugin map, file watching and reload.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use temper_runtime::TemperRuntime;
//!
//! let runtime = TemperRuntime::builder()
//!     .config_file("temper.toml")
//!     .loader(my_module_loader)
//!     .build()?;
//!
//! let exit = runtime.run().await?;
//! std::process::exit(exit.code());
//! ```
//!
//! A supervisor that relaunches the process on [`RESTART_EXIT_CODE`] turns
//! changes that cannot be hot-swapped into a quick restart.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use temper_core::Registry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigLoader, TemperConfig, validate_config};
use crate::error::{RestartReason, RuntimeResult};
use crate::loader::PluginLoader;
use crate::logging;
use crate::module::{ModuleCache, ModuleLoader, StaticLoader};
use crate::reload::{ChangeStream, FileWatcher, IgnoreSet, ReloadOutcome, ReloadPolicy, Reloader};

/// Exit code asking the supervisor to start the process again.
pub const RESTART_EXIT_CODE: i32 = 51;

/// Why [`TemperRuntime::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    Restart(RestartReason),
}

impl Exit {
    pub fn code(&self) -> i32 {
        match self {
            Exit::Shutdown => 0,
            Exit::Restart(_) => RESTART_EXIT_CODE,
        }
    }
}

enum Wake {
    Stop,
    Changes(Option<BTreeSet<PathBuf>>),
}

/// Owns the registry, the module cache and the reload machinery of one process.
pub struct TemperRuntime {
    config: TemperConfig,
    root: PathBuf,
    registry: Registry,
    modules: Arc<ModuleCache>,
    plugins: PluginLoader,
    reloader: Reloader,
    shutdown: CancellationToken,
}

impl TemperRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Sets up logging and the engine from an already loaded configuration.
    ///
    /// `source` is the configuration file, if any; editing it requires a restart.
    pub fn from_config(
        config: TemperConfig,
        source: Option<PathBuf>,
        loader: Arc<dyn ModuleLoader>,
    ) -> RuntimeResult<Self> {
        logging::init_from_config(&config.logging);
        validate_config(&config)?;

        let root = canonical(&config.watch.root);
        let modules = Arc::new(ModuleCache::new(&root, loader));

        let mut watch = config.watch.clone();
        watch.root = root.clone();
        let mut policy = ReloadPolicy::from_config(&watch);
        if let Some(source) = &source {
            policy = policy.with_entry(canonical(source));
        }

        let registry = Registry::new();
        info!(
            root = %root.display(),
            config = ?source,
            plugins = config.plugins.len(),
            watch = config.watch.enabled,
            "Runtime initialized from configuration"
        );

        Ok(Self {
            plugins: PluginLoader::new(Arc::clone(&modules)),
            reloader: Reloader::new(registry.clone(), Arc::clone(&modules), policy),
            config,
            root,
            registry,
            modules,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &TemperConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn modules(&self) -> &Arc<ModuleCache> {
        &self.modules
    }

    pub fn plugins(&self) -> &PluginLoader {
        &self.plugins
    }

    /// Loads the configured plugin map and emits `ready`.
    pub async fn start(&self) -> RuntimeResult<()> {
        if self.registry.is_ready() {
            warn!("Runtime is already started");
            return Ok(());
        }

        info!("Starting Temper runtime");
        self.plugins
            .apply(&self.registry.root(), &self.config.plugins)
            .await?;
        let listeners = self.registry.start();
        info!(ready_listeners = listeners, "Runtime started");
        Ok(())
    }

    /// Stashes `paths` and runs one reload cycle.
    pub async fn reload<I>(&self, paths: I) -> ReloadOutcome
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.reloader
            .stash(paths.into_iter().map(|path| self.modules.normalize(&path)));
        let outcome = self.reloader.reload().await;

        match &outcome {
            ReloadOutcome::Idle => debug!("No loaded module changed"),
            ReloadOutcome::Deferred => debug!("Reload deferred"),
            ReloadOutcome::Reloaded { plugins, modules } => {
                info!(plugins = ?plugins, modules = modules.len(), "Hot reload complete")
            }
            ReloadOutcome::RolledBack { error } => {
                error!(error = %error, "Hot reload failed, previous version kept")
            }
            ReloadOutcome::Restart(reason) => warn!(reason = %reason, "Restart required"),
        }
        outcome
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Starts, then serves reloads until a signal, [`shutdown`](Self::shutdown)
    /// or a change that needs a restart. Teardown always runs.
    pub async fn run(&self) -> RuntimeResult<Exit> {
        let result = self.serve().await;
        self.stop().await;
        result
    }

    async fn serve(&self) -> RuntimeResult<Exit> {
        self.start().await?;

        let mut changes = if self.config.watch.enabled {
            let watcher = FileWatcher::new(
                &self.root,
                IgnoreSet::new(&self.config.watch.ignored),
                Duration::from_millis(self.config.watch.debounce_ms),
            );
            Some(watcher.start()?)
        } else {
            None
        };

        info!("Temper runtime is now running. Press Ctrl+C to stop.");

        loop {
            let wake = tokio::select! {
                _ = shutdown_signal() => Wake::Stop,
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    Wake::Stop
                }
                batch = next_batch(&mut changes) => Wake::Changes(batch),
            };

            match wake {
                Wake::Stop => return Ok(Exit::Shutdown),
                Wake::Changes(Some(paths)) => {
                    if let ReloadOutcome::Restart(reason) = self.reload(paths).await {
                        return Ok(Exit::Restart(reason));
                    }
                }
                Wake::Changes(None) => {
                    warn!("File watcher stopped, hot reload disabled");
                    changes = None;
                }
            }
        }
    }

    /// Unloads the plugin map and tears the registry down.
    pub async fn stop(&self) {
        if self.registry.is_closed() {
            return;
        }
        info!("Stopping Temper runtime");
        let entries = self.plugins.unload_all().await;
        self.registry.teardown().await;
        info!(entries, "Runtime stopped");
    }
}

async fn next_batch(changes: &mut Option<ChangeStream>) -> Option<BTreeSet<PathBuf>> {
    match changes {
        Some(stream) => stream.next_batch().await,
        None => future::pending().await,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                if signal::ctrl_c().await.is_err() {
                    future::pending::<()>().await;
                }
                info!("Received Ctrl+C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_err() {
            future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`TemperRuntime`].
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    config: Option<TemperConfig>,
    module_loader: Option<Arc<dyn ModuleLoader>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir().with_user_config_dir(),
            config: None,
            module_loader: None,
        }
    }

    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Uses `config` as is; no files or environment are read.
    pub fn config(mut self, config: TemperConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// The module system plugins are resolved through. Defaults to an empty [`StaticLoader`].
    pub fn loader(mut self, loader: impl ModuleLoader) -> Self {
        self.module_loader = Some(Arc::new(loader));
        self
    }

    pub fn build(self) -> RuntimeResult<TemperRuntime> {
        let (config, source) = match self.config {
            Some(config) => (config, None),
            None => self.config_loader.load_with_source()?,
        };
        let loader = self
            .module_loader
            .unwrap_or_else(|| Arc::new(StaticLoader::new()) as Arc<dyn ModuleLoader>);
        TemperRuntime::from_config(config, source, loader)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
