//! Load balancer error types

use shardload_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EplbError>;

#[derive(Debug, Error)]
pub enum EplbError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Layer {layer} out of range (num_layers = {num_layers})")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("Invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("Persistence error: {0}")]
    Persist(#[from] CoreError),

    #[error("Background task error: {0}")]
    Task(String),
}

impl From<std::io::Error> for EplbError {
    fn from(e: std::io::Error) -> Self {
        EplbError::Persist(CoreError::Io(e))
    }
}

impl From<serde_json::Error> for EplbError {
    fn from(e: serde_json::Error) -> Self {
        EplbError::Persist(CoreError::Json(e))
    }
}
