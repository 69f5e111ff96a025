//! Checkpoint loader family
//!
//! Every loader turns a list of checkpoint paths into named buffers through
//! the same [`WeightLoader`] contract:
//!
//! - [`SingleThreadLoader`]: one file at a time, lazy (bounded memory) or
//!   eager (whole file up front)
//! - [`MultiThreadLoader`]: one task per file on an adaptively sized pool
//! - [`AcceleratedLoader`]: direct-transfer attempt with transparent fallback
//! - [`StreamingLoader`]: byte-budgeted batches with priority ordering

mod accelerated;
mod multi;
mod single;
mod streaming;

use std::path::PathBuf;
use std::time::Duration;

use shardload_core::{Device, TensorBuffer, TensorMap, WeightSpec};

use crate::checkpoint::{resolve_checkpoint, CheckpointFile, ReadMode};
use crate::error::Result;

pub use accelerated::{AcceleratedLoader, DirectTransfer, MmapTransfer, TransferError};
pub use multi::MultiThreadLoader;
pub use single::SingleThreadLoader;
pub use streaming::{BatchIter, PriorityNames, StreamingLoader};

/// Lazy sequence of named buffers
pub type TensorIter<'a> = Box<dyn Iterator<Item = Result<(String, TensorBuffer)>> + Send + 'a>;

/// Common loader contract
pub trait WeightLoader: Send + Sync {
    /// Short name for logs and CLI output
    fn name(&self) -> &'static str;

    /// Stream `(name, buffer)` pairs from `paths`
    fn iterate(&self, paths: &[PathBuf], device: Device) -> Result<TensorIter<'_>>;

    /// Header information for every buffer without reading data
    fn specs(&self, paths: &[PathBuf]) -> Result<Vec<WeightSpec>> {
        let mut specs = Vec::new();
        for path in paths {
            let resolved = resolve_checkpoint(path)?;
            specs.extend(CheckpointFile::open(&resolved, ReadMode::Mapped)?.specs());
        }
        Ok(specs)
    }

    /// Materialize every buffer
    fn load(&self, paths: &[PathBuf], device: Device) -> Result<TensorMap> {
        let mut tensors = TensorMap::new();
        for item in self.iterate(paths, device)? {
            let (name, buffer) = item?;
            tensors.insert(name, buffer);
        }
        Ok(tensors)
    }

    /// Snapshot of accumulated statistics
    fn stats(&self) -> LoadStats;
}

/// Accumulated loader statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadStats {
    pub total_bytes: u64,
    pub total_tensors: usize,
    pub load_time: Duration,
    pub files_loaded: usize,
}

impl LoadStats {
    /// Bytes per second
    pub fn throughput(&self) -> f64 {
        let secs = self.load_time.as_secs_f64();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }

    pub fn throughput_gbps(&self) -> f64 {
        self.throughput() / 1e9
    }

    pub(crate) fn record_tensor(&mut self, bytes: usize) {
        self.total_bytes += bytes as u64;
        self.total_tensors += 1;
    }

    pub(crate) fn record_file(&mut self, bytes: usize, tensors: usize, elapsed: Duration) {
        self.total_bytes += bytes as u64;
        self.total_tensors += tensors;
        self.files_loaded += 1;
        self.load_time += elapsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_is_derived() {
        let stats = LoadStats {
            total_bytes: 2_000_000_000,
            total_tensors: 10,
            load_time: Duration::from_secs(2),
            files_loaded: 1,
        };
        assert_eq!(stats.throughput(), 1e9);
        assert_eq!(stats.throughput_gbps(), 1.0);
        assert_eq!(LoadStats::default().throughput(), 0.0);
    }
}
