//! Safetensors checkpoint files
//!
//! A checkpoint is opened once, its header parsed into [`TensorEntry`]
//! records sorted by data offset, and buffers are produced on demand in one
//! of three [`ReadMode`]s.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use safetensors::SafeTensors;
use shardload_core::{
    detect_format, safetensors_sibling, CheckpointFormat, CoreError, DType, Device, Storage,
    TensorBuffer, TensorMap, WeightSpec,
};

use crate::error::Result;

/// How buffers are materialized from an open checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Map the file and copy one buffer at a time into owned memory
    Copy,
    /// Read the whole file up front; buffers are views into that block
    Shared,
    /// Map the file; buffers are zero-copy views into the mapping
    Mapped,
}

/// One header record
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Absolute byte range within the file
    pub start: usize,
    pub end: usize,
}

impl TensorEntry {
    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

/// An open safetensors checkpoint
pub struct CheckpointFile {
    path: PathBuf,
    storage: Arc<Storage>,
    mode: ReadMode,
    entries: Vec<TensorEntry>,
}

impl CheckpointFile {
    pub fn open(path: impl AsRef<Path>, mode: ReadMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let storage = match mode {
            ReadMode::Shared => Storage::Heap(fs::read(&path)?),
            ReadMode::Copy | ReadMode::Mapped => {
                let file = File::open(&path)?;
                // The mapping is read-only and checkpoints are never rewritten in place
                let mmap = unsafe { Mmap::map(&file)? };
                Storage::Mapped(mmap)
            }
        };

        let entries = parse_entries(&path, storage.as_slice())?;
        tracing::trace!(path = %path.display(), tensors = entries.len(), ?mode, "Opened checkpoint");

        Ok(Self {
            path,
            storage: Arc::new(storage),
            mode,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[TensorEntry] {
        &self.entries
    }

    /// Bytes occupied by tensor data
    pub fn data_bytes(&self) -> usize {
        self.entries.iter().map(TensorEntry::size).sum()
    }

    pub fn specs(&self) -> Vec<WeightSpec> {
        self.entries
            .iter()
            .map(|e| WeightSpec {
                name: e.name.clone(),
                shape: e.shape.clone(),
                dtype: e.dtype,
                path: self.path.clone(),
                offset: e.start,
                size: e.size(),
            })
            .collect()
    }

    /// Materialize entry `index`
    pub fn buffer(&self, index: usize, device: Device) -> Result<TensorBuffer> {
        let entry = self.entries.get(index).ok_or_else(|| {
            CoreError::InvalidFormat(format!("{}: no entry {}", self.path.display(), index))
        })?;

        let buffer = match self.mode {
            ReadMode::Copy => {
                let bytes = self.storage.as_slice()[entry.start..entry.end].to_vec();
                TensorBuffer::from_vec(entry.shape.clone(), entry.dtype, bytes)?
            }
            ReadMode::Shared | ReadMode::Mapped => TensorBuffer::from_storage(
                self.storage.clone(),
                entry.start,
                entry.shape.clone(),
                entry.dtype,
            )?,
        };
        Ok(buffer.with_device(device))
    }

    /// Materialize every entry in file order
    pub fn read_all(&self, device: Device) -> Result<Vec<(String, TensorBuffer)>> {
        (0..self.entries.len())
            .map(|i| Ok((self.entries[i].name.clone(), self.buffer(i, device)?)))
            .collect()
    }
}

fn parse_entries(path: &Path, data: &[u8]) -> Result<Vec<TensorEntry>> {
    let (header_len, metadata) = SafeTensors::read_metadata(data).map_err(|e| {
        CoreError::InvalidFormat(format!("{}: {}", path.display(), e))
    })?;
    let data_start = 8 + header_len;

    let mut entries = Vec::new();
    for (name, info) in metadata.tensors() {
        let dtype = DType::from_safetensors(info.dtype)?;
        let (begin, end) = info.data_offsets;
        let start = data_start + begin;
        let end = data_start + end;

        let expected = info.shape.iter().product::<usize>() * dtype.size_bytes();
        if end < start || end - start != expected || end > data.len() {
            return Err(CoreError::InvalidFormat(format!(
                "{}: entry {} has invalid byte range [{}, {})",
                path.display(),
                name,
                start,
                end
            ))
            .into());
        }

        entries.push(TensorEntry {
            name,
            shape: info.shape.clone(),
            dtype,
            start,
            end,
        });
    }

    entries.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}

/// Map a requested checkpoint path to a file this crate can decode
///
/// Pickled PyTorch files are served from a sibling `.safetensors` when one
/// exists; GGUF and unknown suffixes are rejected.
pub fn resolve_checkpoint(path: &Path) -> Result<PathBuf> {
    match detect_format(path) {
        CheckpointFormat::Safetensors => Ok(path.to_path_buf()),
        CheckpointFormat::PyTorch => {
            let sibling = safetensors_sibling(path);
            if sibling.is_file() {
                tracing::debug!(
                    requested = %path.display(),
                    using = %sibling.display(),
                    "No pytorch reader, using safetensors sibling"
                );
                Ok(sibling)
            } else {
                Err(CoreError::DependencyMissing {
                    format: CheckpointFormat::PyTorch.to_string(),
                    path: path.to_path_buf(),
                }
                .into())
            }
        }
        other => Err(CoreError::InvalidFormat(format!(
            "{}: {} checkpoints are not supported",
            path.display(),
            other
        ))
        .into()),
    }
}

pub fn resolve_all(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    paths.iter().map(|p| resolve_checkpoint(p)).collect()
}

/// Serialize named buffers to a safetensors file, replacing `path` atomically
pub fn write_checkpoint(path: impl AsRef<Path>, tensors: &TensorMap) -> Result<()> {
    let path = path.as_ref();
    let bytes = safetensors::serialize(tensors.iter().map(|(name, buf)| (name.as_str(), buf)), &None)?;

    shardload_core::write_atomic(path, |w| {
        std::io::Write::write_all(w, &bytes).map_err(CoreError::from)
    })?;

    tracing::debug!(path = %path.display(), tensors = tensors.len(), bytes = bytes.len(), "Wrote checkpoint");
    Ok(())
}
