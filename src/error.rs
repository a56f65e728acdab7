//! Error types for tile cache operations
//!
//! Every error here is `Clone`: a single producer failure is delivered
//! unchanged to every caller coalesced onto the same in-flight request.

use thiserror::Error;

/// Main error type for caching and coalescing operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Configuration error - invalid settings or a malformed `cache` flag
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Locator could not be parsed
    #[error("Invalid locator: {0}")]
    LocatorError(String),

    /// Underlying source could not be opened
    #[error("Failed to open source: {0}")]
    OpenError(String),

    /// Underlying fetch failed
    #[error("Source operation failed: {0}")]
    OperationError(String),

    /// Source shutdown failed
    #[error("Shutdown failed: {0}")]
    ShutdownError(String),

    /// Source does not provide the requested operation
    #[error("Operation not supported by source: {0}")]
    Unsupported(String),

    /// The producer of an in-flight request went away without completing it
    #[error("In-flight request for {key} was abandoned before completing")]
    Abandoned { key: String },

    /// The cache has been closed
    #[error("Cache is closed")]
    Closed,

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
