//! Loader error types

use std::path::PathBuf;

use shardload_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Missing weight: {0}")]
    MissingWeight(String),

    /// A per-file task of a parallel load failed; the whole load is aborted
    #[error("Loading {} failed: {source}", path.display())]
    WorkerTask {
        path: PathBuf,
        #[source]
        source: Box<ModelError>,
    },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Worker pool error: {0}")]
    Pool(String),
}

impl ModelError {
    /// Deployment mistakes that must never be retried
    pub fn is_configuration(&self) -> bool {
        match self {
            ModelError::Core(e) => e.is_configuration(),
            ModelError::WorkerTask { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for ModelError {
    fn from(e: std::io::Error) -> Self {
        ModelError::Core(CoreError::Io(e))
    }
}

impl From<safetensors::SafeTensorError> for ModelError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        ModelError::Core(e.into())
    }
}
