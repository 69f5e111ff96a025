//! Prefetching shard loader
//!
//! While the consumer works on shard `i`, shards `i+1..=i+prefetch_count` are
//! already loading on a bounded pool. Reaching a shard whose load is in
//! flight blocks until it completes; reaching one that was never submitted
//! loads it on the calling thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use shardload_core::{CacheConfig, TensorMap};

use crate::error::{ModelError, Result};
use crate::sharded_loader::ShardedStateLoader;

/// Completion slot for one background load
struct PendingShard {
    slot: Mutex<Option<Result<TensorMap>>>,
    ready: Condvar,
}

impl PendingShard {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<TensorMap>) {
        *self.slot.lock() = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<TensorMap> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.ready.wait(&mut slot);
        }
    }
}

/// Loads a rank's shards with look-ahead
pub struct AsyncShardLoader {
    sharded: Arc<ShardedStateLoader>,
    pool: ThreadPool,
    prefetch_count: usize,
    in_flight: DashMap<PathBuf, Arc<PendingShard>>,
}

impl AsyncShardLoader {
    pub fn new(sharded: Arc<ShardedStateLoader>, workers: usize, prefetch_count: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("shardload-prefetch-{}", i))
            .build()
            .map_err(|e| ModelError::Pool(e.to_string()))?;
        Ok(Self {
            sharded,
            pool,
            prefetch_count,
            in_flight: DashMap::new(),
        })
    }

    /// Pool sized to the prefetch depth
    pub fn from_config(sharded: Arc<ShardedStateLoader>, config: &CacheConfig) -> Result<Self> {
        Self::new(sharded, config.prefetch_count, config.prefetch_count)
    }

    pub fn prefetch_count(&self) -> usize {
        self.prefetch_count
    }

    /// Loads submitted but not yet consumed
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Start a background load unless one is already in flight
    fn submit(&self, path: &Path) {
        if self.in_flight.contains_key(path) {
            return;
        }
        let pending = Arc::new(PendingShard::new());
        self.in_flight.insert(path.to_path_buf(), pending.clone());

        let sharded = self.sharded.clone();
        let path = path.to_path_buf();
        self.pool.spawn(move || {
            tracing::trace!(path = %path.display(), "Prefetching shard");
            pending.complete(sharded.load_shard(&path));
        });
    }

    /// Result of the in-flight load for `path`, or a synchronous load
    fn take(&self, path: &Path) -> Result<TensorMap> {
        match self.in_flight.remove(path) {
            Some((_, pending)) => pending.wait(),
            None => self.sharded.load_shard(path),
        }
    }

    /// Forget look-ahead loads nobody will consume
    ///
    /// Their tasks still run to completion; the results are dropped.
    fn discard(&self, paths: &[PathBuf]) {
        for path in paths {
            if self.in_flight.remove(path).is_some() {
                tracing::trace!(path = %path.display(), "Discarded prefetched shard");
            }
        }
    }

    /// Shards in discovery order, prefetching ahead of the consumer
    pub fn stream(&self, model_path: &Path) -> Result<PrefetchIter<'_>> {
        let shards = self.sharded.discover(model_path)?;
        Ok(PrefetchIter {
            owner: self,
            shards,
            next: 0,
        })
    }

    /// Load every shard concurrently and merge them
    pub fn load_all(&self, model_path: &Path) -> Result<TensorMap> {
        let started = Instant::now();
        let shards = self.sharded.discover(model_path)?;
        for shard in &shards {
            self.submit(shard);
        }

        let mut merged = TensorMap::new();
        for (i, shard) in shards.iter().enumerate() {
            match self.take(shard) {
                Ok(tensors) => merged.extend(tensors),
                Err(e) => {
                    self.discard(&shards[i + 1..]);
                    return Err(ModelError::WorkerTask {
                        path: shard.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }

        tracing::info!(
            shards = shards.len(),
            tensors = merged.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Gathered all shards"
        );
        Ok(merged)
    }
}

/// Iterator returned by [`AsyncShardLoader::stream`]
pub struct PrefetchIter<'a> {
    owner: &'a AsyncShardLoader,
    shards: Vec<PathBuf>,
    next: usize,
}

impl PrefetchIter<'_> {
    pub fn shards(&self) -> &[PathBuf] {
        &self.shards
    }
}

impl Iterator for PrefetchIter<'_> {
    type Item = Result<(PathBuf, TensorMap)>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next;
        let path = self.shards.get(index)?.clone();
        self.next += 1;

        let ahead = (index + self.owner.prefetch_count).min(self.shards.len() - 1);
        for shard in &self.shards[index + 1..=ahead] {
            self.owner.submit(shard);
        }

        Some(self.owner.take(&path).map(|tensors| (path, tensors)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.shards.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl Drop for PrefetchIter<'_> {
    fn drop(&mut self) {
        if let Some(rest) = self.shards.get(self.next..) {
            self.owner.discard(rest);
        }
    }
}
