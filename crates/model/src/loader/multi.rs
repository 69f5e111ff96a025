//! Parallel per-file loading
//!
//! One task per file on a rayon pool sized to the checkpoint. Results are
//! handed to the consumer as files complete, in no particular order.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use shardload_core::{Device, LoaderConfig, TensorBuffer};

use super::{LoadStats, TensorIter, WeightLoader};
use crate::checkpoint::{resolve_all, CheckpointFile, ReadMode};
use crate::error::{ModelError, Result};

type FileResult = (PathBuf, Result<Vec<(String, TensorBuffer)>>);

/// Loads files concurrently with an adaptively sized worker pool
#[derive(Debug)]
pub struct MultiThreadLoader {
    max_workers: usize,
    adaptive: bool,
    min_bytes_per_worker: u64,
    last_workers: AtomicUsize,
    stats: Arc<Mutex<LoadStats>>,
}

impl MultiThreadLoader {
    pub fn new(max_workers: usize, adaptive: bool, min_bytes_per_worker: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            adaptive,
            min_bytes_per_worker: min_bytes_per_worker.max(1) as u64,
            last_workers: AtomicUsize::new(0),
            stats: Arc::new(Mutex::new(LoadStats::default())),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(
            config.max_workers,
            config.adaptive_workers,
            config.min_bytes_per_worker,
        )
    }

    /// Workers for a load of `total_bytes` spread over `file_count` files
    ///
    /// Never more than one worker per file or more than `max_workers`.
    pub fn worker_count(&self, total_bytes: u64, file_count: usize) -> usize {
        let cap = self.max_workers.min(file_count).max(1);
        if !self.adaptive {
            return cap;
        }
        let wanted = (total_bytes / self.min_bytes_per_worker).min(usize::MAX as u64) as usize;
        wanted.clamp(1, cap)
    }

    /// Pool size chosen by the most recent `iterate`, 0 before the first
    pub fn last_worker_count(&self) -> usize {
        self.last_workers.load(Ordering::Relaxed)
    }

    fn build_pool(workers: usize) -> Result<ThreadPool> {
        ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("shardload-load-{}", i))
            .build()
            .map_err(|e| ModelError::Pool(e.to_string()))
    }
}

impl WeightLoader for MultiThreadLoader {
    fn name(&self) -> &'static str {
        "multi-thread"
    }

    fn iterate(&self, paths: &[PathBuf], device: Device) -> Result<TensorIter<'_>> {
        let files = resolve_all(paths)?;
        let mut total_bytes = 0u64;
        for path in &files {
            total_bytes += fs::metadata(path)?.len();
        }

        let workers = self.worker_count(total_bytes, files.len());
        self.last_workers.store(workers, Ordering::Relaxed);
        tracing::debug!(files = files.len(), total_bytes, workers, "Starting parallel load");

        let pool = Self::build_pool(workers)?;
        let (tx, rx) = mpsc::channel::<FileResult>();
        let cancel = Arc::new(AtomicBool::new(false));

        for path in files {
            let tx = tx.clone();
            let cancel = cancel.clone();
            let stats = self.stats.clone();
            pool.spawn(move || {
                if cancel.load(Ordering::Relaxed) {
                    return;
                }
                let started = Instant::now();
                let result = CheckpointFile::open(&path, ReadMode::Shared).and_then(|file| {
                    let tensors = file.read_all(device)?;
                    stats
                        .lock()
                        .record_file(file.data_bytes(), tensors.len(), started.elapsed());
                    Ok(tensors)
                });
                // The receiver is gone when the consumer stopped early
                let _ = tx.send((path, result));
            });
        }
        drop(tx);

        Ok(Box::new(Completed {
            rx,
            pending: Vec::new().into_iter(),
            cancel,
            done: false,
            _pool: pool,
        }))
    }

    fn stats(&self) -> LoadStats {
        self.stats.lock().clone()
    }
}

/// Yields buffers file by file in completion order
struct Completed {
    rx: Receiver<FileResult>,
    pending: std::vec::IntoIter<(String, TensorBuffer)>,
    cancel: Arc<AtomicBool>,
    done: bool,
    _pool: ThreadPool,
}

impl Iterator for Completed {
    type Item = Result<(String, TensorBuffer)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.next() {
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }

            match self.rx.recv() {
                Ok((_, Ok(tensors))) => self.pending = tensors.into_iter(),
                Ok((path, Err(source))) => {
                    self.done = true;
                    self.cancel.store(true, Ordering::Relaxed);
                    tracing::warn!(path = %path.display(), error = %source, "File load failed, aborting");
                    return Some(Err(ModelError::WorkerTask {
                        path,
                        source: Box::new(source),
                    }));
                }
                Err(_) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

impl Drop for Completed {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}
