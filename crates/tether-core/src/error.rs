//! Unified error types for tether

use thiserror::Error;

/// Unified error type for all tether operations
#[derive(Error, Debug)]
pub enum TetherError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Registry errors
    #[error("Registry error: {0}")]
    Registry(String),

    // Degrade path errors
    #[error("Degrade sink error: {0}")]
    DegradeSink(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using TetherError
pub type Result<T> = std::result::Result<T, TetherError>;
