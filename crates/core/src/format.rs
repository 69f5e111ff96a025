//! Checkpoint format detection by file suffix

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Serialized checkpoint formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointFormat {
    Safetensors,
    /// Pickled PyTorch state dicts (`.bin`, `.pt`, `.pth`)
    PyTorch,
    Gguf,
    Unknown,
}

impl CheckpointFormat {
    /// Whether this crate can decode the format without an external backend
    pub fn is_native(&self) -> bool {
        matches!(self, CheckpointFormat::Safetensors)
    }
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointFormat::Safetensors => "safetensors",
            CheckpointFormat::PyTorch => "pytorch",
            CheckpointFormat::Gguf => "gguf",
            CheckpointFormat::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Map a path's suffix to a checkpoint format
pub fn detect_format(path: impl AsRef<Path>) -> CheckpointFormat {
    let ext = match path.as_ref().extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return CheckpointFormat::Unknown,
    };

    match ext.as_str() {
        "safetensors" => CheckpointFormat::Safetensors,
        "bin" | "pt" | "pth" => CheckpointFormat::PyTorch,
        "gguf" => CheckpointFormat::Gguf,
        _ => CheckpointFormat::Unknown,
    }
}

/// The safetensors file that may stand in for a non-native checkpoint
pub fn safetensors_sibling(path: impl AsRef<Path>) -> PathBuf {
    path.as_ref().with_extension("safetensors")
}
