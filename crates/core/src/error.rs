//! Core error types

use std::path::PathBuf;

use thiserror::Error;

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("No shard files matching '{pattern}' found in {}", dir.display())]
    NoShardsFound { pattern: String, dir: PathBuf },

    // Format errors
    #[error("Invalid checkpoint format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDtype(String),

    #[error("No reader available for {format} checkpoint {} and no safetensors fallback exists", path.display())]
    DependencyMissing { format: String, path: PathBuf },

    // Shape errors
    #[error("Shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Dtype mismatch for {name}: expected {expected}, got {got}")]
    DtypeMismatch {
        name: String,
        expected: String,
        got: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Deployment mistakes that must surface immediately and never be retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidConfig(_) | CoreError::NoShardsFound { .. }
        )
    }
}

impl From<safetensors::SafeTensorError> for CoreError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        CoreError::InvalidFormat(e.to_string())
    }
}
