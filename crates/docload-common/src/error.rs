//! Error types shared across docload crates

use thiserror::Error;

/// Result type alias for docload ambient operations
pub type Result<T> = std::result::Result<T, DocloadError>;

/// Errors raised outside the per-document pipeline: configuration, file access
/// and serialization of run artifacts.
#[derive(Error, Debug)]
pub enum DocloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidSetting { name: String, value: String },
}

impl DocloadError {
    /// Build an [`DocloadError::InvalidSetting`] for an environment variable or flag
    pub fn invalid_setting(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidSetting {
            name: name.into(),
            value: value.into(),
        }
    }
}
