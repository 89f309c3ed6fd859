//! Error types for the palisade engine.

use thiserror::Error;

/// Main error type for palisade operations.
#[derive(Error, Debug)]
pub enum PalisadeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limit key violated the engine contract (empty action or identifier)
    #[error("Invalid limit key: {0}")]
    InvalidKey(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for palisade operations.
pub type Result<T> = std::result::Result<T, PalisadeError>;
