//! Memory-budgeted streaming
//!
//! Buffers are grouped into batches whose total size stays within a byte
//! budget. A batch is flushed when the next buffer would push it over the
//! budget, so a single buffer larger than the budget travels alone.

use std::path::PathBuf;

use parking_lot::Mutex;
use shardload_core::{Device, LoaderConfig, TensorBuffer};

use super::single::FileCursor;
use super::{LoadStats, TensorIter, WeightLoader};
use crate::checkpoint::{ReadMode, TensorEntry};
use crate::error::{ModelError, Result};

const PRIORITY_KEYWORDS: [&str; 3] = ["embed", "attention", "lm_head"];

/// Decides which buffers load first
///
/// With an explicit allow-list, a name is prioritized when it contains any
/// listed entry. Without one, names containing `embed`, `attention` or
/// `lm_head` are prioritized.
#[derive(Debug, Clone, Default)]
pub struct PriorityNames {
    names: Vec<String>,
}

impl PriorityNames {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn is_priority(&self, name: &str) -> bool {
        if self.names.is_empty() {
            PRIORITY_KEYWORDS.iter().any(|k| name.contains(k))
        } else {
            self.names.iter().any(|n| name.contains(n.as_str()))
        }
    }

    /// Entry indices with priority names first, file order otherwise
    pub(crate) fn order(&self, entries: &[TensorEntry]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by_key(|&i| !self.is_priority(&entries[i].name));
        order
    }
}

/// Loads buffers in budgeted batches
#[derive(Debug)]
pub struct StreamingLoader {
    budget_bytes: usize,
    priority: PriorityNames,
    stats: Mutex<LoadStats>,
}

impl StreamingLoader {
    pub fn new(budget_bytes: usize, priority: PriorityNames) -> Self {
        Self {
            budget_bytes: budget_bytes.max(1),
            priority,
            stats: Mutex::new(LoadStats::default()),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(
            config.memory_budget_bytes,
            PriorityNames::new(config.priority_names.clone()),
        )
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// Stream batches of buffers across `paths`
    pub fn iter_batches(&self, paths: &[PathBuf], device: Device) -> BatchIter<'_> {
        let cursor = FileCursor::new(paths.to_vec(), ReadMode::Copy, device, &self.stats)
            .with_priority(self.priority.clone());
        BatchIter {
            cursor,
            budget: self.budget_bytes,
            deferred: None,
            done: false,
        }
    }
}

impl WeightLoader for StreamingLoader {
    fn name(&self) -> &'static str {
        "streaming"
    }

    fn iterate(&self, paths: &[PathBuf], device: Device) -> Result<TensorIter<'_>> {
        let batches = self.iter_batches(paths, device);
        Ok(Box::new(batches.flat_map(|batch| match batch {
            Ok(items) => items.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        })))
    }

    fn stats(&self) -> LoadStats {
        self.stats.lock().clone()
    }
}

/// Batches of `(name, buffer)` whose combined size respects the budget
pub struct BatchIter<'a> {
    cursor: FileCursor<'a>,
    budget: usize,
    /// Error hit after a partial batch was assembled
    deferred: Option<ModelError>,
    done: bool,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Vec<(String, TensorBuffer)>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.deferred.take() {
            return Some(Err(e));
        }
        if self.done {
            return None;
        }

        let mut batch = Vec::new();
        let mut batch_bytes = 0usize;

        loop {
            let size = match self.cursor.peek_size() {
                Ok(Some(size)) => size,
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    self.done = true;
                    self.deferred = Some(e);
                    break;
                }
            };

            if !batch.is_empty() && batch_bytes + size > self.budget {
                break;
            }

            match self.cursor.take_next() {
                Some(Ok(item)) => {
                    batch_bytes += size;
                    batch.push(item);
                }
                Some(Err(e)) => {
                    self.done = true;
                    self.deferred = Some(e);
                    break;
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }

        if batch.is_empty() {
            return self.deferred.take().map(Err);
        }
        tracing::trace!(tensors = batch.len(), bytes = batch_bytes, "Flushing batch");
        Some(Ok(batch))
    }
}
