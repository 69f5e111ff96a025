//! Engine configuration
//!
//! Values come from [`Default`], from `SHARDLOAD_*` environment variables
//! ([`EngineConfig::from_env`]) or from a JSON file
//! ([`EngineConfig::from_file`]). Every source is checked by
//! [`EngineConfig::validate`] before use.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::shard::ShardPattern;
use crate::tensor::Device;

const MIB: usize = 1024 * 1024;
const GIB: usize = 1024 * MIB;

/// Per-rank shard discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// File name template with `{rank}` and `{part}` placeholders
    pub pattern: String,
    /// This worker's rank
    pub rank: usize,
    /// Number of ranks in the group
    pub world_size: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            pattern: ShardPattern::DEFAULT_TEMPLATE.to_string(),
            rank: 0,
            world_size: 1,
        }
    }
}

/// Loader behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Resident byte budget for streaming loads
    pub memory_budget_bytes: usize,
    /// Upper bound on parallel file loads
    pub max_workers: usize,
    /// Scale the worker count with checkpoint size
    pub adaptive_workers: bool,
    /// Bytes each worker should have to justify spawning it
    pub min_bytes_per_worker: usize,
    /// Stream one buffer at a time instead of reading whole files
    pub lazy: bool,
    /// Names loaded first by the streaming loader
    pub priority_names: Vec<String>,
    /// Placement tag for loaded buffers
    pub device: Device,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 4 * GIB,
            max_workers: 8,
            adaptive_workers: true,
            min_bytes_per_worker: 100 * MIB,
            lazy: true,
            priority_names: Vec::new(),
            device: Device::Cpu,
        }
    }
}

/// Shard and model caching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Shards kept in the LRU cache
    pub cache_size: usize,
    /// Shards loaded ahead of the consumer
    pub prefetch_count: usize,
    /// Whole models kept in the model cache
    pub max_models: usize,
    /// Seconds before a cached model is considered stale
    pub model_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 4,
            prefetch_count: 2,
            max_models: 2,
            model_ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn model_ttl(&self) -> Duration {
        Duration::from_secs(self.model_ttl_secs)
    }
}

/// Rebalancing policy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Global greedy replication
    Default,
    /// Node-aware hierarchical placement
    LocalityAware,
}

impl FromStr for PolicyKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "default" => Ok(PolicyKind::Default),
            "locality_aware" | "locality" | "hierarchical" => Ok(PolicyKind::LocalityAware),
            other => Err(CoreError::InvalidConfig(format!("Unknown policy: {}", other))),
        }
    }
}

/// Expert load balancing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Load samples kept per layer
    pub window_size: usize,
    /// Minimum seconds between background rebalances
    pub rebalance_interval_secs: u64,
    /// Background poll granularity in milliseconds
    pub poll_interval_ms: u64,
    /// max/min average load ratio that triggers a rebalance
    pub load_threshold: f64,
    pub policy: PolicyKind,
    /// Expert groups (locality-aware policy)
    pub num_groups: usize,
    /// Nodes (locality-aware policy)
    pub num_nodes: usize,
    /// GPUs across all nodes (locality-aware policy)
    pub num_gpus: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            rebalance_interval_secs: 60,
            poll_interval_ms: 1000,
            load_threshold: 1.5,
            policy: PolicyKind::Default,
            num_groups: 1,
            num_nodes: 1,
            num_gpus: 1,
        }
    }
}

impl BalancerConfig {
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub shard: ShardConfig,
    pub loader: LoaderConfig,
    pub cache: CacheConfig,
    pub balancer: BalancerConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            shard: ShardConfig {
                pattern: get("SHARDLOAD_SHARD_PATTERN").unwrap_or(defaults.shard.pattern),
                rank: parse_var(&get, "SHARDLOAD_RANK", defaults.shard.rank)?,
                world_size: parse_var(&get, "SHARDLOAD_WORLD_SIZE", defaults.shard.world_size)?,
            },
            loader: LoaderConfig {
                memory_budget_bytes: parse_var(
                    &get,
                    "SHARDLOAD_MEMORY_BUDGET",
                    defaults.loader.memory_budget_bytes,
                )?,
                max_workers: parse_var(&get, "SHARDLOAD_MAX_WORKERS", defaults.loader.max_workers)?,
                adaptive_workers: parse_var(
                    &get,
                    "SHARDLOAD_ADAPTIVE_WORKERS",
                    defaults.loader.adaptive_workers,
                )?,
                min_bytes_per_worker: parse_var(
                    &get,
                    "SHARDLOAD_MIN_BYTES_PER_WORKER",
                    defaults.loader.min_bytes_per_worker,
                )?,
                lazy: parse_var(&get, "SHARDLOAD_LAZY", defaults.loader.lazy)?,
                priority_names: get("SHARDLOAD_PRIORITY_NAMES")
                    .map(|s| {
                        s.split(',')
                            .map(|n| n.trim().to_string())
                            .filter(|n| !n.is_empty())
                            .collect()
                    })
                    .unwrap_or(defaults.loader.priority_names),
                device: parse_var(&get, "SHARDLOAD_DEVICE", defaults.loader.device)?,
            },
            cache: CacheConfig {
                cache_size: parse_var(&get, "SHARDLOAD_CACHE_SIZE", defaults.cache.cache_size)?,
                prefetch_count: parse_var(
                    &get,
                    "SHARDLOAD_PREFETCH_COUNT",
                    defaults.cache.prefetch_count,
                )?,
                max_models: parse_var(&get, "SHARDLOAD_MAX_MODELS", defaults.cache.max_models)?,
                model_ttl_secs: parse_var(&get, "SHARDLOAD_MODEL_TTL", defaults.cache.model_ttl_secs)?,
            },
            balancer: BalancerConfig {
                window_size: parse_var(&get, "SHARDLOAD_WINDOW_SIZE", defaults.balancer.window_size)?,
                rebalance_interval_secs: parse_var(
                    &get,
                    "SHARDLOAD_REBALANCE_INTERVAL",
                    defaults.balancer.rebalance_interval_secs,
                )?,
                poll_interval_ms: parse_var(
                    &get,
                    "SHARDLOAD_POLL_INTERVAL_MS",
                    defaults.balancer.poll_interval_ms,
                )?,
                load_threshold: parse_var(
                    &get,
                    "SHARDLOAD_LOAD_THRESHOLD",
                    defaults.balancer.load_threshold,
                )?,
                policy: parse_var(&get, "SHARDLOAD_POLICY", defaults.balancer.policy)?,
                num_groups: parse_var(&get, "SHARDLOAD_NUM_GROUPS", defaults.balancer.num_groups)?,
                num_nodes: parse_var(&get, "SHARDLOAD_NUM_NODES", defaults.balancer.num_nodes)?,
                num_gpus: parse_var(&get, "SHARDLOAD_NUM_GPUS", defaults.balancer.num_gpus)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that indicate a deployment mistake
    pub fn validate(&self) -> Result<()> {
        ShardPattern::new(self.shard.pattern.as_str())?;

        if self.shard.world_size == 0 {
            return Err(invalid("world_size must be at least 1"));
        }
        if self.shard.rank >= self.shard.world_size {
            return Err(CoreError::InvalidConfig(format!(
                "rank {} out of range for world_size {}",
                self.shard.rank, self.shard.world_size
            )));
        }
        if self.loader.memory_budget_bytes == 0 {
            return Err(invalid("memory_budget_bytes must be positive"));
        }
        if self.loader.max_workers == 0 {
            return Err(invalid("max_workers must be at least 1"));
        }
        if self.loader.min_bytes_per_worker == 0 {
            return Err(invalid("min_bytes_per_worker must be positive"));
        }
        if self.cache.cache_size == 0 {
            return Err(invalid("cache_size must be at least 1"));
        }
        if self.cache.max_models == 0 {
            return Err(invalid("max_models must be at least 1"));
        }
        if self.balancer.window_size == 0 {
            return Err(invalid("window_size must be at least 1"));
        }
        if self.balancer.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be positive"));
        }
        if !(self.balancer.load_threshold >= 1.0) {
            return Err(CoreError::InvalidConfig(format!(
                "load_threshold must be >= 1.0, got {}",
                self.balancer.load_threshold
            )));
        }
        if self.balancer.num_groups == 0 || self.balancer.num_nodes == 0 || self.balancer.num_gpus == 0 {
            return Err(invalid("num_groups, num_nodes and num_gpus must be at least 1"));
        }

        Ok(())
    }

    /// Compiled shard pattern
    pub fn shard_pattern(&self) -> Result<ShardPattern> {
        ShardPattern::new(self.shard.pattern.as_str())
    }
}

fn invalid(msg: &str) -> CoreError {
    CoreError::InvalidConfig(msg.to_string())
}

fn parse_var<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            CoreError::InvalidConfig(format!("{}: cannot parse '{}'", key, raw))
        }),
        None => Ok(default),
    }
}
