//! Per-rank shard discovery and merge
//!
//! Each rank reads only the part files its pattern names for it. Shard
//! buffers either fill a caller-supplied target state (clipped to the
//! target's extents) or are inserted as-is.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use shardload_core::{
    copy_clipped, Capabilities, CoreError, Device, EngineConfig, ShardPattern, TensorBuffer,
    TensorMap,
};

use crate::checkpoint::write_checkpoint;
use crate::dedup::SubtensorDeduplicator;
use crate::error::{ModelError, Result};
use crate::loader::{TensorIter, WeightLoader};

/// Loads the shards belonging to one rank
pub struct ShardedStateLoader {
    pattern: ShardPattern,
    rank: usize,
    world_size: usize,
    loader: Arc<dyn WeightLoader>,
    device: Device,
    caps: Capabilities,
}

impl ShardedStateLoader {
    pub fn new(
        pattern: ShardPattern,
        rank: usize,
        world_size: usize,
        loader: Arc<dyn WeightLoader>,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(CoreError::InvalidConfig(format!(
                "rank {} out of range for world_size {}",
                rank, world_size
            ))
            .into());
        }
        Ok(Self {
            pattern,
            rank,
            world_size,
            loader,
            device: Device::Cpu,
            caps: Capabilities::reference(),
        })
    }

    pub fn from_config(config: &EngineConfig, loader: Arc<dyn WeightLoader>) -> Result<Self> {
        Ok(Self::new(
            config.shard_pattern()?,
            config.shard.rank,
            config.shard.world_size,
            loader,
        )?
        .with_device(config.loader.device))
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn pattern(&self) -> &ShardPattern {
        &self.pattern
    }

    pub fn loader(&self) -> &dyn WeightLoader {
        self.loader.as_ref()
    }

    /// This rank's shard files, sorted by part number
    pub fn discover(&self, model_path: &Path) -> Result<Vec<PathBuf>> {
        let not_found = || CoreError::NoShardsFound {
            pattern: self.pattern.glob(self.rank),
            dir: model_path.to_path_buf(),
        };

        let entries = match fs::read_dir(model_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found().into()),
            Err(e) => return Err(e.into()),
        };

        let mut shards = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some((rank, part)) = self.pattern.parse(file_name) {
                if rank == self.rank && entry.path().is_file() {
                    shards.push((part, entry.path()));
                }
            }
        }

        if shards.is_empty() {
            return Err(not_found().into());
        }

        shards.sort();
        tracing::debug!(rank = self.rank, shards = shards.len(), dir = %model_path.display(), "Discovered shards");
        Ok(shards.into_iter().map(|(_, path)| path).collect())
    }

    /// Load a single shard file
    pub fn load_shard(&self, path: &Path) -> Result<TensorMap> {
        self.loader.load(&[path.to_path_buf()], self.device)
    }

    /// Load every shard of this rank
    ///
    /// With a `target`, names the target already owns are filled in place,
    /// clipping each dimension to the smaller of shard and target; other
    /// names are inserted directly. `strict` makes any owned name that no
    /// shard provided an error.
    pub fn load(&self, model_path: &Path, target: Option<TensorMap>, strict: bool) -> Result<TensorMap> {
        let started = Instant::now();
        let shards = self.discover(model_path)?;

        let mut result = match target {
            Some(target) => SubtensorDeduplicator::new().deduplicate(target),
            None => TensorMap::new(),
        };
        let owned: BTreeSet<String> = result.keys().cloned().collect();
        let mut provided: HashSet<String> = HashSet::new();

        // One call over every shard so parallel loaders can spread the files;
        // items may arrive in any order
        for item in self.loader.iterate(&shards, self.device)? {
            let (name, buffer) = item?;
            if owned.contains(&name) {
                if let Some(dst) = result.get_mut(&name) {
                    self.merge_into(&name, &buffer, dst)?;
                }
            } else {
                result.insert(name.clone(), buffer);
            }
            provided.insert(name);
        }

        if strict {
            let missing: Vec<&str> = owned
                .iter()
                .filter(|name| !provided.contains(*name))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(ModelError::MissingWeight(missing.join(", ")));
            }
        }

        tracing::info!(
            rank = self.rank,
            shards = shards.len(),
            tensors = result.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded rank state"
        );
        Ok(result)
    }

    fn merge_into(&self, name: &str, src: &TensorBuffer, dst: &mut TensorBuffer) -> Result<()> {
        self.caps.validate_merge(name, src.shape(), dst.shape())?;
        copy_clipped(name, src, dst)?;
        if src.shape() != dst.shape() {
            tracing::debug!(
                name,
                shard_shape = ?src.shape(),
                target_shape = ?dst.shape(),
                "Clipped shard buffer to target"
            );
        }
        Ok(())
    }

    /// Lazy sequence over every shard buffer, one shard file open at a time
    pub fn iterate(&self, model_path: &Path) -> Result<ShardIter<'_>> {
        let shards = self.discover(model_path)?;
        Ok(ShardIter {
            owner: self,
            shards,
            next_shard: 0,
            current: None,
            failed: false,
        })
    }

    /// Write named buffers as one shard file, atomically
    pub fn write_shard(path: impl AsRef<Path>, tensors: &TensorMap) -> Result<()> {
        write_checkpoint(path, tensors)
    }

    /// Path of `part` for this rank inside `model_path`
    pub fn shard_path(&self, model_path: &Path, part: usize) -> PathBuf {
        model_path.join(self.pattern.format(self.rank, part))
    }
}

impl std::fmt::Debug for ShardedStateLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStateLoader")
            .field("pattern", &self.pattern.template())
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("loader", &self.loader.name())
            .field("device", &self.device)
            .finish()
    }
}

/// Restartable iterator over a rank's shard buffers
pub struct ShardIter<'a> {
    owner: &'a ShardedStateLoader,
    shards: Vec<PathBuf>,
    next_shard: usize,
    current: Option<TensorIter<'a>>,
    failed: bool,
}

impl ShardIter<'_> {
    pub fn shards(&self) -> &[PathBuf] {
        &self.shards
    }

    /// Rewind to the first shard
    pub fn restart(&mut self) {
        self.next_shard = 0;
        self.current = None;
        self.failed = false;
    }
}

impl Iterator for ShardIter<'_> {
    type Item = Result<(String, TensorBuffer)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(item)) => return Some(Ok(item)),
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }

            let owner = self.owner;
            let shard = self.shards.get(self.next_shard)?;
            self.next_shard += 1;
            match owner.loader.iterate(std::slice::from_ref(shard), owner.device) {
                Ok(iter) => self.current = Some(iter),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
