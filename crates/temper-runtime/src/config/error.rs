//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The merged sources could not be extracted into the schema.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {message}")]
    ValidationError { message: String },

    /// A plugin map entry has a malformed key or options.
    #[error("Invalid plugin entry '{key}': {reason}")]
    InvalidEntry { key: String, reason: String },
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    pub fn invalid_entry(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEntry {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
