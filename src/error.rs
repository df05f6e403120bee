//! Error types for Lynkeus

use thiserror::Error;

/// Main error type for Lynkeus operations
#[derive(Debug, Error)]
pub enum LynkeusError {
    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Malformed recorded script: {0}")]
    ScriptError(String),

    #[error("Browser session error: {0}")]
    SessionError(String),

    #[error("Navigation failed: {0}")]
    NavigationError(String),

    #[error("Navigation timed out after {0} seconds")]
    NavigationTimeout(u64),

    #[error("Work queue is full")]
    QueueFull,

    #[error("Orchestrator is shut down")]
    ShutDown,
}

/// Result type alias for Lynkeus operations
pub type Result<T> = std::result::Result<T, LynkeusError>;
