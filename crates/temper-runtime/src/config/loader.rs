//! Layered configuration loading with figment.
//!
//! # Priority (lowest to highest)
//!
//! 1. Built-in defaults
//! 2. Programmatic overrides passed to [`ConfigLoader::merge`]
//! 3. Profile-specific file (`temper.{profile}.toml` / `temper.{profile}.yaml`)
//! 4. Main file (`temper.toml` / `temper.yaml`), or the file given to [`ConfigLoader::file`]
//! 5. `TEMPER_`-prefixed environment variables, `__` separating nested keys
//!
//! `TEMPER_WATCH__DEBOUNCE_MS=250` sets `watch.debounce_ms`, and
//! `TEMPER_LOGGING__LEVEL=debug` sets `logging.level`.
//!
//! # Feature Flags
//!
//! - `toml-config`: searches and reads TOML files
//! - `yaml-config`: searches and reads YAML files (`.yaml` and `.yml`)
//!
//! ```rust,ignore
//! let (config, source) = ConfigLoader::new()
//!     .profile("production")
//!     .with_current_dir()
//!     .load_with_source()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::TemperConfig;

/// Name of the environment variable selecting the profile.
pub const PROFILE_ENV: &str = "TEMPER_PROFILE";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Reads `TEMPER_PROFILE`, defaulting to development.
    pub fn from_env() -> Self {
        std::env::var(PROFILE_ENV)
            .map(|name| Self::parse(&name))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder over the configuration sources.
pub struct ConfigLoader {
    overrides: Figment,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    config_file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            overrides: Figment::new(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
        }
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Profile::parse(&profile.into());
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.search_path(cwd),
            Err(_) => self,
        }
    }

    /// Adds `<config dir>/temper`, e.g. `~/.config/temper` on Linux.
    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(dir) => self.search_path(dir.join("temper")),
            None => self,
        }
    }

    /// Loads exactly this file instead of searching.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges a programmatic configuration over the defaults.
    pub fn merge(mut self, config: TemperConfig) -> Self {
        self.overrides = self.overrides.merge(Serialized::defaults(config));
        self
    }

    pub fn load(self) -> ConfigResult<TemperConfig> {
        self.load_with_source().map(|(config, _)| config)
    }

    /// Loads the configuration and reports which main file it came from.
    ///
    /// The runtime treats that file as an entry file: editing it requires a restart.
    pub fn load_with_source(mut self) -> ConfigResult<(TemperConfig, Option<PathBuf>)> {
        let profile = self.profile.clone();
        let mut figment = Figment::from(Serialized::defaults(TemperConfig::default()))
            .merge(std::mem::take(&mut self.overrides));

        let source = match self.config_file.clone() {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading configuration file");
                figment = Self::merge_config_file(figment, &path)?;
                Some(path)
            }
            Some(path) => return Err(ConfigError::FileNotFound(path)),
            None => {
                let (merged, found) = self.load_config_files(figment);
                figment = merged;
                found
            }
        };

        if self.load_env {
            trace!("Loading environment variables with TEMPER_ prefix");
            figment = figment.merge(Env::prefixed("TEMPER_").ignore(&["PROFILE"]).split("__"));
        }

        let config: TemperConfig = figment.extract().map_err(|e| {
            ConfigError::ParseError(format!("Failed to extract configuration: {e}"))
        })?;

        debug!(
            profile = %profile,
            logging_level = %config.logging.level,
            plugins = config.plugins.len(),
            "Configuration loaded"
        );
        Ok((config, source))
    }

    #[cfg_attr(
        not(any(feature = "toml-config", feature = "yaml-config")),
        allow(unused_variables)
    )]
    fn merge_config_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            #[cfg(feature = "toml-config")]
            "toml" => Ok(figment.merge(Toml::file(path))),
            #[cfg(feature = "yaml-config")]
            "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
            _ => Err(ConfigError::ParseError(format!(
                "Unsupported or disabled configuration file format: .{ext}"
            ))),
        }
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        let mut paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("temper"));
        }
        paths
    }

    /// Tries `search_paths × file_names`. The profile variant of a name is
    /// merged first, then the base file, and the first base file found wins.
    #[cfg(any(feature = "toml-config", feature = "yaml-config"))]
    fn load_format_files<F>(
        &self,
        mut figment: Figment,
        search_paths: &[PathBuf],
        file_names: &[&str],
        merge: F,
    ) -> (Figment, Option<PathBuf>)
    where
        F: Fn(Figment, &Path) -> Figment,
    {
        for dir in search_paths {
            for file_name in file_names {
                let Some((stem, ext)) = file_name.rsplit_once('.') else {
                    continue;
                };

                let profile_path = dir.join(format!("{stem}.{}.{ext}", self.profile));
                if profile_path.exists() {
                    debug!(path = %profile_path.display(), "Loading profile-specific config");
                    figment = merge(figment, &profile_path);
                }

                let base_path = dir.join(file_name);
                if base_path.exists() {
                    info!(path = %base_path.display(), "Loading configuration file");
                    return (merge(figment, &base_path), Some(base_path));
                }
            }
        }
        (figment, None)
    }

    #[allow(unused_mut)]
    fn load_config_files(&self, mut figment: Figment) -> (Figment, Option<PathBuf>) {
        let search_paths = self.resolve_search_paths();
        let mut found: Option<PathBuf> = None;

        #[cfg(feature = "toml-config")]
        {
            let (merged, path) =
                self.load_format_files(figment, &search_paths, &["temper.toml"], |fig, path| {
                    fig.merge(Toml::file(path))
                });
            figment = merged;
            found = found.or(path);
        }

        #[cfg(feature = "yaml-config")]
        {
            let (merged, path) = self.load_format_files(
                figment,
                &search_paths,
                &["temper.yaml", "temper.yml"],
                |fig, path| fig.merge(Yaml::file(path)),
            );
            figment = merged;
            found = found.or(path);
        }

        if found.is_none() {
            warn!(paths = ?search_paths, "No configuration file found, using defaults");
        }
        (figment, found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let dir = std::env::temp_dir().join("temper-config-test-empty");
        let (config, source) = ConfigLoader::new()
            .search_path(&dir)
            .without_env()
            .load_with_source()
            .unwrap();

        assert!(source.is_none());
        assert_eq!(config.logging.level.as_str(), "info");
        assert_eq!(config.watch.debounce_ms, 100);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_explicit_missing_file() {
        let result = ConfigLoader::new()
            .file("/definitely/not/here/temper.toml")
            .without_env()
            .load();
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_programmatic_override() {
        let mut overrides = TemperConfig::default();
        overrides.watch.debounce_ms = 250;
        overrides
            .plugins
            .insert("echo".to_string(), serde_json::json!({ "prefix": "!" }));

        let config = ConfigLoader::new()
            .search_path(std::env::temp_dir().join("temper-config-test-empty"))
            .without_env()
            .merge(overrides)
            .load()
            .unwrap();
        assert_eq!(config.watch.debounce_ms, 250);
        assert_eq!(config.plugins["echo"]["prefix"], "!");
    }

    #[test]
    fn test_profile_names() {
        assert_eq!(Profile::parse("prod"), Profile::Production);
        assert_eq!(Profile::parse("DEV"), Profile::Development);
        assert_eq!(Profile::parse("staging").as_str(), "staging");
    }

    #[test]
    fn test_unsupported_file_format() {
        let dir = std::env::temp_dir().join(format!("temper-config-ini-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("temper.ini");
        std::fs::write(&file, "debounce_ms = 50\n").unwrap();

        let result = ConfigLoader::new().file(&file).without_env().load();
        std::fs::remove_dir_all(&dir).unwrap();

        assert!(matches!(result, Err(ConfigError::ParseError(ref msg)) if msg.contains(".ini")));
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_toml_file_is_reported_as_source() {
        let dir = std::env::temp_dir().join(format!("temper-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("temper.toml");
        std::fs::write(
            &file,
            "[watch]\ndebounce_ms = 50\n\n[plugins.\"echo:loud\"]\nprefix = \"!!\"\n",
        )
        .unwrap();

        let (config, source) = ConfigLoader::new()
            .search_path(&dir)
            .without_env()
            .load_with_source()
            .unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(source, Some(file));
        assert_eq!(config.watch.debounce_ms, 50);
        assert_eq!(config.plugins["echo:loud"]["prefix"], "!!");
    }
}
