//! Common error types for GenLoop
//!
//! This module defines all error types used across the GenLoop system.
//! Every error carries the status code an outer HTTP layer should answer with.

use thiserror::Error;

/// Main error type for GenLoop
#[derive(Error, Debug)]
pub enum GenLoopError {
    /// The inference resource failed to initialize
    #[error("Model load error: {0}")]
    ModelLoad(String),

    /// An inference call failed after the resource was loaded
    #[error("Generation error: {0}")]
    Generation(String),

    /// Malformed request, rejected before any resource is touched
    #[error("Validation error: {0}")]
    Validation(String),

    /// Frame or container encoding failed
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Persisting an output failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unknown job or resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for GenLoopError {
    fn from(err: config::ConfigError) -> Self {
        GenLoopError::Config(err.to_string())
    }
}

impl GenLoopError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            GenLoopError::Validation(_) => 400,
            GenLoopError::NotFound(_) => 404,
            GenLoopError::ModelLoad(_)
            | GenLoopError::Generation(_)
            | GenLoopError::Encoding(_)
            | GenLoopError::Storage(_)
            | GenLoopError::Config(_)
            | GenLoopError::Serialization(_)
            | GenLoopError::Io(_)
            | GenLoopError::Internal(_) => 500,
        }
    }

    /// Whether the caller can fix this by changing the request
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }

    /// Create a model load error
    pub fn model_load(msg: impl Into<String>) -> Self {
        GenLoopError::ModelLoad(msg.into())
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        GenLoopError::Generation(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        GenLoopError::Validation(msg.into())
    }

    /// Create an encoding error
    pub fn encoding(msg: impl Into<String>) -> Self {
        GenLoopError::Encoding(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        GenLoopError::Storage(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        GenLoopError::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        GenLoopError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        GenLoopError::Internal(msg.into())
    }
}

/// Result type alias for GenLoop operations
pub type Result<T> = std::result::Result<T, GenLoopError>;
