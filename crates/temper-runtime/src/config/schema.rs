//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemperConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    /// The plugin map: `name`, `name:alias`, `~name` or `group:alias` keys.
    #[serde(default)]
    pub plugins: Map<String, Value>,
}

// =============================================================================
// Logging
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    #[cfg(feature = "json-log")]
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    pub span_events: SpanEventConfig,
    pub thread_ids: bool,
    /// Show file and line of each event.
    pub file_location: bool,
    /// Required when `output = "file"`.
    pub file_path: Option<PathBuf>,
    /// Per-target levels, e.g. `temper_core = "debug"`.
    pub filters: HashMap<String, LogLevel>,
}

// =============================================================================
// Watch
// =============================================================================

/// File watching and hot reload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    /// Directory that is watched and whose modules may be hot-swapped.
    pub root: PathBuf,
    /// Globs, relative to `root`, whose changes are ignored.
    pub ignored: Vec<String>,
    pub debounce_ms: u64,
    /// Entry and config files. Changing one requires a restart.
    pub entry: Vec<PathBuf>,
    /// Globs, relative to `root`, of modules that are never hot-swapped.
    pub no_reload: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("."),
            ignored: vec![
                ".git/*".to_string(),
                "target/*".to_string(),
                "*.swp".to_string(),
                "*~".to_string(),
            ],
            debounce_ms: 100,
            entry: Vec::new(),
            no_reload: Vec::new(),
        }
    }
}
