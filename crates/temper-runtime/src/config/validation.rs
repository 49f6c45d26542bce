//! Configuration validation utilities.

use serde_json::{Map, Value};

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogOutput, LoggingConfig, TemperConfig, WatchConfig};
use crate::loader::{GROUP, parse_key, split_options};

/// Validates the entire configuration.
pub fn validate_config(config: &TemperConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_watch_config(&config.watch)?;
    validate_plugin_map(&config.plugins)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when logging.output is \"file\"",
        ));
    }

    if logging.filters.keys().any(|target| target.trim().is_empty()) {
        return Err(ConfigError::validation("Log filter targets cannot be empty"));
    }

    Ok(())
}

fn validate_watch_config(watch: &WatchConfig) -> ConfigResult<()> {
    if watch.debounce_ms == 0 {
        return Err(ConfigError::validation(
            "watch.debounce_ms must be greater than 0",
        ));
    }

    for (field, globs) in [("ignored", &watch.ignored), ("no_reload", &watch.no_reload)] {
        if globs.iter().any(|glob| glob.trim().is_empty()) {
            return Err(ConfigError::validation(format!(
                "watch.{field} cannot contain empty patterns"
            )));
        }
    }

    Ok(())
}

/// Checks every key and `$` option of the plugin map, descending into groups.
fn validate_plugin_map(map: &Map<String, Value>) -> ConfigResult<()> {
    for (key, value) in map {
        let entry = parse_key(key)?;
        let (config, _) = split_options(key, value)?;

        if entry.name == GROUP {
            match &config {
                Value::Object(children) => validate_plugin_map(children)?,
                _ => {
                    return Err(ConfigError::invalid_entry(
                        key,
                        "a group must contain a plugin map",
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_plugins(plugins: Value) -> TemperConfig {
        let mut config = TemperConfig::default();
        if let Value::Object(map) = plugins {
            config.plugins = map;
        }
        config
    }

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&TemperConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_debounce() {
        let mut config = TemperConfig::default();
        config.watch.debounce_ms = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_validate_file_output_without_path() {
        let mut config = TemperConfig::default();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());

        config.logging.file_path = Some("temper.log".into());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_plugin_map() {
        let config = with_plugins(json!({
            "echo": { "prefix": "!" },
            "echo:loud": null,
            "~admin": {},
            "group:chat": {
                "$isolate": ["database"],
                "greeter": { "text": "hi" },
            },
        }));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_bad_nested_option() {
        let config = with_plugins(json!({
            "group:chat": {
                "greeter": { "$isolate": "database" },
            },
        }));
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidEntry { key, .. }) if key == "greeter"
        ));
    }

    #[test]
    fn test_validate_bad_key() {
        let config = with_plugins(json!({ "echo:": {} }));
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidEntry { .. })
        ));

        let config = with_plugins(json!({ "group": 3 }));
        assert!(validate_config(&config).is_err());
    }
}
