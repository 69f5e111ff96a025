//! Shardload Model Loading
//!
//! Checkpoint loaders and the per-rank shard pipeline built on them.
//!
//! # Layers
//!
//! - [`loader`]: the [`WeightLoader`] family (sequential, parallel,
//!   accelerated, streaming)
//! - [`SubtensorDeduplicator`]: drops aliased entries from a state map
//! - [`ShardedStateLoader`]: discovers and merges one rank's shard files
//! - [`IncrementalShardCache`] and [`ModelCache`]: bounded in-memory caches
//! - [`AsyncShardLoader`]: look-ahead prefetching over a rank's shards

pub mod checkpoint;
mod dedup;
mod error;
pub mod loader;
mod prefetch;
mod shard_cache;
mod sharded_loader;

#[cfg(test)]
mod test_support;

pub use checkpoint::{resolve_checkpoint, write_checkpoint, CheckpointFile, ReadMode, TensorEntry};
pub use dedup::SubtensorDeduplicator;
pub use error::{ModelError, Result};
pub use loader::{
    AcceleratedLoader, BatchIter, DirectTransfer, LoadStats, MmapTransfer, MultiThreadLoader,
    PriorityNames, SingleThreadLoader, StreamingLoader, TensorIter, TransferError, WeightLoader,
};
pub use prefetch::{AsyncShardLoader, PrefetchIter};
pub use shard_cache::{
    checksum, CacheEntry, CacheStats, CachedModel, CachedShard, IncrementalShardCache, ModelCache,
};
pub use sharded_loader::{ShardIter, ShardedStateLoader};
