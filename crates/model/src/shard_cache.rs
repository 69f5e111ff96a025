//! Shard and model caches
//!
//! [`IncrementalShardCache`] keeps the most recently used shard files of one
//! rank in memory under a single mutex. [`ModelCache`] keeps whole loaded
//! models for a bounded time.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shardload_core::{Capabilities, CacheConfig, TensorBuffer, TensorMap};

use crate::error::Result;
use crate::sharded_loader::ShardedStateLoader;

/// A cached payload with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub id: String,
    pub payload: Arc<T>,
    /// Content checksum taken at load time
    pub checksum: u64,
    pub loaded_at: Instant,
    pub last_used: Instant,
}

pub type CachedShard = CacheEntry<TensorMap>;
pub type CachedModel = CacheEntry<TensorMap>;

impl CacheEntry<TensorMap> {
    fn new(id: String, payload: TensorMap, caps: &Capabilities) -> Self {
        let checksum = checksum(caps, &payload);
        let now = Instant::now();
        Self {
            id,
            payload: Arc::new(payload),
            checksum,
            loaded_at: now,
            last_used: now,
        }
    }

    /// Recompute the checksum and compare with the recorded one
    pub fn verify(&self, caps: &Capabilities) -> bool {
        checksum(caps, &self.payload) == self.checksum
    }
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() >= ttl
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

/// Order-sensitive checksum over names and bytes
pub fn checksum(caps: &Capabilities, tensors: &TensorMap) -> u64 {
    let mut digest = Vec::with_capacity(tensors.len() * 16);
    for (name, buffer) in tensors {
        digest.extend_from_slice(&caps.hash_bytes(name.as_bytes()).to_le_bytes());
        digest.extend_from_slice(&caps.hash_bytes(buffer.as_bytes()).to_le_bytes());
    }
    caps.hash_bytes(&digest)
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct LruState {
    entries: HashMap<PathBuf, CachedShard>,
    /// Front is least recently used
    order: VecDeque<PathBuf>,
    stats: CacheStats,
}

impl LruState {
    /// Payload of a cached shard, marking it most recently used
    fn touch(&mut self, path: &Path) -> Option<Arc<TensorMap>> {
        let entry = self.entries.get_mut(path)?;
        entry.touch();
        let payload = entry.payload.clone();
        self.promote(path);
        Some(payload)
    }

    /// Cache a freshly loaded shard
    ///
    /// When a concurrent load of the same path finished first, its entry is
    /// kept and promoted instead.
    fn insert(&mut self, path: &Path, entry: CachedShard, capacity: usize) -> Arc<TensorMap> {
        if let Some(existing) = self.touch(path) {
            tracing::trace!(path = %path.display(), "Shard already cached by a concurrent load");
            return existing;
        }
        self.evict_to(capacity);
        let payload = entry.payload.clone();
        self.entries.insert(path.to_path_buf(), entry);
        self.order.push_back(path.to_path_buf());
        self.stats.entries = self.entries.len();
        payload
    }

    fn promote(&mut self, path: &Path) {
        if let Some(pos) = self.order.iter().position(|p| p == path) {
            if let Some(p) = self.order.remove(pos) {
                self.order.push_back(p);
            }
        }
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() >= capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                self.stats.evictions += 1;
                tracing::debug!(path = %oldest.display(), "Evicted shard");
            }
        }
    }
}

/// Bounded LRU cache of loaded shard files keyed by path
pub struct IncrementalShardCache {
    sharded: Arc<ShardedStateLoader>,
    capacity: usize,
    caps: Capabilities,
    state: Mutex<LruState>,
}

impl IncrementalShardCache {
    pub fn new(sharded: Arc<ShardedStateLoader>, capacity: usize) -> Self {
        Self {
            sharded,
            capacity: capacity.max(1),
            caps: Capabilities::reference(),
            state: Mutex::new(LruState::default()),
        }
    }

    pub fn from_config(sharded: Arc<ShardedStateLoader>, config: &CacheConfig) -> Self {
        Self::new(sharded, config.cache_size)
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached shard, loading it from disk on a miss
    pub fn get_or_load(&self, path: &Path) -> Result<Arc<TensorMap>> {
        {
            let mut state = self.state.lock();
            if let Some(payload) = state.touch(path) {
                state.stats.hits += 1;
                return Ok(payload);
            }
            state.stats.misses += 1;
        }

        // Disk reads happen outside the lock so hits are never blocked
        let tensors = self.sharded.load_shard(path)?;
        let entry = CachedShard::new(path.display().to_string(), tensors, &self.caps);
        Ok(self.state.lock().insert(path, entry, self.capacity))
    }

    /// Walk the rank's shards in discovery order, invoking `callback` for
    /// every buffer as each shard becomes available
    pub fn load_incremental<F>(&self, model_path: &Path, mut callback: F) -> Result<usize>
    where
        F: FnMut(&str, &TensorBuffer),
    {
        let shards = self.sharded.discover(model_path)?;
        let mut count = 0;
        for (i, shard) in shards.iter().enumerate() {
            let tensors = self.get_or_load(shard)?;
            for (name, buffer) in tensors.iter() {
                callback(name, buffer);
                count += 1;
            }
            tracing::debug!(shard = i + 1, total = shards.len(), tensors = tensors.len(), "Shard delivered");
        }
        Ok(count)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.state.lock().entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached paths, least recently used first
    pub fn lru_order(&self) -> Vec<PathBuf> {
        self.state.lock().order.iter().cloned().collect()
    }

    /// Re-check a cached shard's checksum; `None` if not cached
    pub fn verify(&self, path: &Path) -> Option<bool> {
        let state = self.state.lock();
        state.entries.get(path).map(|e| e.verify(&self.caps))
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }

    /// Drop every entry; counters are kept
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.stats.entries = 0;
    }
}

/// Time-bounded cache of whole loaded models keyed by model id
pub struct ModelCache {
    ttl: Duration,
    max_models: usize,
    caps: Capabilities,
    state: Mutex<ModelCacheState>,
}

#[derive(Default)]
struct ModelCacheState {
    models: HashMap<String, CachedModel>,
    stats: CacheStats,
}

impl ModelCache {
    pub fn new(ttl: Duration, max_models: usize) -> Self {
        Self {
            ttl,
            max_models: max_models.max(1),
            caps: Capabilities::reference(),
            state: Mutex::new(ModelCacheState::default()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.model_ttl(), config.max_models)
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Cached model `id`, or the result of `load` on a miss or expiry
    pub fn get_or_load<F>(&self, id: &str, load: F) -> Result<Arc<TensorMap>>
    where
        F: FnOnce() -> Result<TensorMap>,
    {
        {
            let mut state = self.state.lock();
            Self::purge_locked(&mut state, self.ttl);
            if let Some(entry) = state.models.get_mut(id) {
                entry.touch();
                let payload = entry.payload.clone();
                state.stats.hits += 1;
                return Ok(payload);
            }
            state.stats.misses += 1;
        }

        let entry = CachedModel::new(id.to_string(), load()?, &self.caps);
        let payload = entry.payload.clone();

        let mut state = self.state.lock();
        while state.models.len() >= self.max_models {
            let oldest = state
                .models
                .values()
                .min_by_key(|e| e.last_used)
                .map(|e| e.id.clone());
            let Some(oldest) = oldest else {
                break;
            };
            state.models.remove(&oldest);
            state.stats.evictions += 1;
            tracing::debug!(model = %oldest, "Evicted model");
        }
        state.models.insert(id.to_string(), entry);
        tracing::info!(model = id, "Cached model");
        Ok(payload)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TensorMap>> {
        let mut state = self.state.lock();
        Self::purge_locked(&mut state, self.ttl);
        state.models.get_mut(id).map(|e| {
            e.touch();
            e.payload.clone()
        })
    }

    /// Drop expired models, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        Self::purge_locked(&mut self.state.lock(), self.ttl)
    }

    fn purge_locked(state: &mut ModelCacheState, ttl: Duration) -> usize {
        let before = state.models.len();
        state.models.retain(|_, e| !e.is_expired(ttl));
        let removed = before - state.models.len();
        state.stats.evictions += removed as u64;
        removed
    }

    pub fn remove(&self, id: &str) -> bool {
        self.state.lock().models.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.models.len(),
            ..state.stats
        }
    }

    pub fn clear(&self) {
        self.state.lock().models.clear();
    }
}
