//! Direct-transfer loading with transparent fallback

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use shardload_core::{Device, TensorBuffer};
use thiserror::Error;

use super::single::SingleThreadLoader;
use super::{LoadStats, TensorIter, WeightLoader};
use crate::checkpoint::{resolve_all, CheckpointFile, ReadMode};
use crate::error::{ModelError, Result};

/// Failure of a direct-transfer attempt
#[derive(Debug, Error)]
pub enum TransferError {
    /// The path cannot serve this device or file; use the fallback
    #[error("direct transfer unavailable: {0}")]
    Unavailable(String),

    /// The transfer itself failed; use the fallback
    #[error("direct transfer failed: {0}")]
    Failed(String),

    /// The checkpoint is unreadable by any path
    #[error(transparent)]
    Load(#[from] ModelError),
}

/// A path that moves checkpoint bytes to a device without the regular
/// read-and-copy pipeline
pub trait DirectTransfer: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self, device: Device) -> bool;

    fn load_file(
        &self,
        path: &Path,
        device: Device,
    ) -> std::result::Result<Vec<(String, TensorBuffer)>, TransferError>;
}

/// Zero-copy host transfer: buffers are views into a file mapping
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapTransfer;

impl DirectTransfer for MmapTransfer {
    fn name(&self) -> &str {
        "mmap"
    }

    fn is_available(&self, device: Device) -> bool {
        device == Device::Cpu
    }

    fn load_file(
        &self,
        path: &Path,
        device: Device,
    ) -> std::result::Result<Vec<(String, TensorBuffer)>, TransferError> {
        if !self.is_available(device) {
            return Err(TransferError::Unavailable(format!("no host mapping for {}", device)));
        }
        let file = CheckpointFile::open(path, ReadMode::Mapped).map_err(|e| match e {
            ModelError::Core(shardload_core::CoreError::Io(io)) => {
                TransferError::Failed(format!("{}: {}", path.display(), io))
            }
            other => TransferError::Load(other),
        })?;
        Ok(file.read_all(device)?)
    }
}

/// Tries a [`DirectTransfer`] per file and falls back to sequential loading
///
/// Callers see the same buffers either way; only latency differs.
pub struct AcceleratedLoader {
    transfer: Arc<dyn DirectTransfer>,
    fallback: SingleThreadLoader,
    stats: Mutex<LoadStats>,
}

impl AcceleratedLoader {
    pub fn new(transfer: Arc<dyn DirectTransfer>) -> Self {
        Self {
            transfer,
            fallback: SingleThreadLoader::eager(),
            stats: Mutex::new(LoadStats::default()),
        }
    }

    /// Number of files served by the fallback path so far
    pub fn fallback_files(&self) -> usize {
        self.fallback.stats().files_loaded
    }

    fn load_file(&self, path: &Path, device: Device) -> Result<Vec<(String, TensorBuffer)>> {
        let started = Instant::now();

        if self.transfer.is_available(device) {
            match self.transfer.load_file(path, device) {
                Ok(tensors) => {
                    let bytes = tensors.iter().map(|(_, t)| t.size_bytes()).sum();
                    self.stats.lock().record_file(bytes, tensors.len(), started.elapsed());
                    return Ok(tensors);
                }
                Err(TransferError::Load(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        transfer = self.transfer.name(),
                        error = %e,
                        "Direct transfer failed, falling back"
                    );
                }
            }
        } else {
            tracing::debug!(transfer = self.transfer.name(), %device, "Direct transfer unavailable, falling back");
        }

        let tensors = self.fallback.load_file(path, device)?;
        let bytes = tensors.iter().map(|(_, t)| t.size_bytes()).sum();
        self.stats.lock().record_file(bytes, tensors.len(), started.elapsed());
        Ok(tensors)
    }
}

impl Default for AcceleratedLoader {
    fn default() -> Self {
        Self::new(Arc::new(MmapTransfer))
    }
}

impl std::fmt::Debug for AcceleratedLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratedLoader")
            .field("transfer", &self.transfer.name())
            .finish()
    }
}

impl WeightLoader for AcceleratedLoader {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    fn iterate(&self, paths: &[PathBuf], device: Device) -> Result<TensorIter<'_>> {
        let files = resolve_all(paths)?;
        let mut failed = false;
        let iter = files
            .into_iter()
            .map_while(move |path| {
                if failed {
                    return None;
                }
                let result = self.load_file(&path, device);
                failed = result.is_err();
                Some(result)
            })
            .flat_map(|result| match result {
                Ok(tensors) => tensors.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            });
        Ok(Box::new(iter))
    }

    fn stats(&self) -> LoadStats {
        self.stats.lock().clone()
    }
}
