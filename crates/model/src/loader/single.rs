//! Sequential loading, one file open at a time

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use shardload_core::{Device, TensorBuffer};

use super::streaming::PriorityNames;
use super::{LoadStats, TensorIter, WeightLoader};
use crate::checkpoint::{resolve_checkpoint, CheckpointFile, ReadMode};
use crate::error::Result;

/// Loads checkpoint files sequentially on the calling thread
///
/// Lazy mode maps each file and copies out one buffer per step, so resident
/// memory is bounded by the largest buffer. Eager mode reads each file into
/// one block up front and hands out views into it.
#[derive(Debug)]
pub struct SingleThreadLoader {
    lazy: bool,
    stats: Mutex<LoadStats>,
}

impl SingleThreadLoader {
    pub fn new(lazy: bool) -> Self {
        Self {
            lazy,
            stats: Mutex::new(LoadStats::default()),
        }
    }

    pub fn lazy() -> Self {
        Self::new(true)
    }

    pub fn eager() -> Self {
        Self::new(false)
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    fn mode(&self) -> ReadMode {
        if self.lazy {
            ReadMode::Copy
        } else {
            ReadMode::Shared
        }
    }

    /// Load one whole file
    pub fn load_file(&self, path: &Path, device: Device) -> Result<Vec<(String, TensorBuffer)>> {
        let started = Instant::now();
        let resolved = resolve_checkpoint(path)?;
        let file = CheckpointFile::open(&resolved, self.mode())?;
        let tensors = file.read_all(device)?;

        self.stats
            .lock()
            .record_file(file.data_bytes(), tensors.len(), started.elapsed());
        tracing::debug!(path = %resolved.display(), tensors = tensors.len(), "Loaded file");
        Ok(tensors)
    }
}

impl Default for SingleThreadLoader {
    fn default() -> Self {
        Self::lazy()
    }
}

impl WeightLoader for SingleThreadLoader {
    fn name(&self) -> &'static str {
        if self.lazy {
            "single-lazy"
        } else {
            "single-eager"
        }
    }

    fn iterate(&self, paths: &[PathBuf], device: Device) -> Result<TensorIter<'_>> {
        Ok(Box::new(FileCursor::new(
            paths.to_vec(),
            self.mode(),
            device,
            &self.stats,
        )))
    }

    fn stats(&self) -> LoadStats {
        self.stats.lock().clone()
    }
}

struct OpenFile {
    file: CheckpointFile,
    order: Vec<usize>,
    pos: usize,
}

/// Walks a list of checkpoint files buffer by buffer
///
/// Only the current file is open. Files are resolved and opened when the
/// previous one is exhausted; the first error ends the sequence.
pub(crate) struct FileCursor<'a> {
    paths: VecDeque<PathBuf>,
    mode: ReadMode,
    device: Device,
    priority: Option<PriorityNames>,
    stats: &'a Mutex<LoadStats>,
    current: Option<OpenFile>,
    failed: bool,
}

impl<'a> FileCursor<'a> {
    pub(crate) fn new(
        paths: Vec<PathBuf>,
        mode: ReadMode,
        device: Device,
        stats: &'a Mutex<LoadStats>,
    ) -> Self {
        Self {
            paths: paths.into(),
            mode,
            device,
            priority: None,
            stats,
            current: None,
            failed: false,
        }
    }

    /// Order each file's buffers so priority names come first
    pub(crate) fn with_priority(mut self, priority: PriorityNames) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Byte size of the next buffer, opening the next file when needed
    pub(crate) fn peek_size(&mut self) -> Result<Option<usize>> {
        loop {
            if let Some(open) = &self.current {
                if let Some(&index) = open.order.get(open.pos) {
                    return Ok(Some(open.file.entries()[index].size()));
                }
                self.finish_file();
            }

            let Some(path) = self.paths.pop_front() else {
                return Ok(None);
            };

            let started = Instant::now();
            let resolved = resolve_checkpoint(&path)?;
            let file = CheckpointFile::open(&resolved, self.mode)?;
            let order = match &self.priority {
                Some(priority) => priority.order(file.entries()),
                None => (0..file.entries().len()).collect(),
            };
            self.stats.lock().load_time += started.elapsed();

            self.current = Some(OpenFile { file, order, pos: 0 });
        }
    }

    /// Materialize the buffer reported by the last [`Self::peek_size`]
    pub(crate) fn take_next(&mut self) -> Option<Result<(String, TensorBuffer)>> {
        let open = self.current.as_mut()?;
        let index = *open.order.get(open.pos)?;
        open.pos += 1;

        let started = Instant::now();
        let entry = &open.file.entries()[index];
        let result = open
            .file
            .buffer(index, self.device)
            .map(|buffer| (entry.name.clone(), buffer));

        let mut stats = self.stats.lock();
        stats.load_time += started.elapsed();
        if result.is_ok() {
            stats.record_tensor(entry.size());
        }
        Some(result)
    }

    fn finish_file(&mut self) {
        if let Some(open) = self.current.take() {
            self.stats.lock().files_loaded += 1;
            tracing::debug!(
                path = %open.file.path().display(),
                tensors = open.order.len(),
                "Finished file"
            );
        }
    }
}

impl Iterator for FileCursor<'_> {
    type Item = Result<(String, TensorBuffer)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.peek_size() {
            Ok(Some(_)) => {
                let item = self.take_next();
                if matches!(item, Some(Err(_))) {
                    self.failed = true;
                }
                item
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
