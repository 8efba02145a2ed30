//! Error types for the Pacer service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Pacer operations.
#[derive(Error, Debug)]
pub enum PacerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors surfaced to administrative callers
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for PacerError {
    fn from(err: config::ConfigError) -> Self {
        PacerError::Config(err.to_string())
    }
}

/// Result type alias for Pacer operations.
pub type Result<T> = std::result::Result<T, PacerError>;
