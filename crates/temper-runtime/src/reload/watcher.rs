//! File watching with debounced change batches.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};
use wildmatch::WildMatch;

use crate::config::WatchConfig;

/// Globs, relative to the watched root, whose changes are dropped.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet(Vec<WildMatch>);

impl IgnoreSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            patterns
                .into_iter()
                .map(|pattern| WildMatch::new(pattern.as_ref()))
                .collect(),
        )
    }

    pub fn is_ignored(&self, path: &Path, root: &Path) -> bool {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let relative = relative.to_string_lossy();
        self.0.iter().any(|pattern| pattern.matches(&relative))
    }
}

/// Coalesces raw change notifications into batches.
pub struct ChangeStream {
    rx: mpsc::Receiver<PathBuf>,
    debounce: Duration,
    _watcher: Option<RecommendedWatcher>,
}

impl ChangeStream {
    /// A stream fed by any sender, e.g. a test or a custom notifier.
    pub fn new(rx: mpsc::Receiver<PathBuf>, debounce: Duration) -> Self {
        Self {
            rx,
            debounce,
            _watcher: None,
        }
    }

    /// Waits for a change, then keeps collecting until `debounce` passes
    /// without a new one. Returns `None` once the source is gone.
    pub async fn next_batch(&mut self) -> Option<BTreeSet<PathBuf>> {
        let first = self.rx.recv().await?;
        let mut batch = BTreeSet::from([first]);

        loop {
            match tokio::time::timeout(self.debounce, self.rx.recv()).await {
                Ok(Some(path)) => {
                    batch.insert(path);
                }
                Ok(None) | Err(_) => break,
            }
        }

        debug!(files = batch.len(), "Change batch ready");
        Some(batch)
    }
}

/// Watches a directory tree recursively.
#[derive(Debug, Clone)]
pub struct FileWatcher {
    root: PathBuf,
    ignore: IgnoreSet,
    debounce: Duration,
}

impl FileWatcher {
    pub fn new(root: impl Into<PathBuf>, ignore: IgnoreSet, debounce: Duration) -> Self {
        Self {
            root: root.into(),
            ignore,
            debounce,
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(
            &config.root,
            IgnoreSet::new(&config.ignored),
            Duration::from_millis(config.debounce_ms),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Starts the OS watcher. Events stop when the returned stream is dropped.
    pub fn start(&self) -> Result<ChangeStream, notify::Error> {
        let root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());
        let (tx, rx) = mpsc::channel(256);

        let ignore = self.ignore.clone();
        let watch_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!(error = %e, "File watcher error");
                    return;
                }
            };

            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
                _ => return,
            }

            for path in event.paths {
                if ignore.is_ignored(&path, &watch_root) {
                    trace!(path = %path.display(), "Ignored change");
                    continue;
                }
                if tx.blocking_send(path).is_err() {
                    return;
                }
            }
        })?;

        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "Watching for changes");

        Ok(ChangeStream {
            rx,
            debounce: self.debounce,
            _watcher: Some(watcher),
        })
    }
}
