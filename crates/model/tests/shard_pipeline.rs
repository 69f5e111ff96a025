//! Rank shard pipeline tests
//!
//! Exercises discovery, merging, caching and prefetching over real
//! safetensors files written to a scratch directory:
//! 1. Two shard files for rank 0 are discovered in part order and merged
//! 2. A bounded shard cache evicts the oldest entry and re-reads it later
//! 3. Every loader produces the same state for the same shards
//! 4. A failing file aborts a parallel load with its path attached
//! 5. A rank load hands all of its files to the loader in one call

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use shardload_core::{DType, Device, ShardPattern, TensorBuffer, TensorMap};
use shardload_model::{
    AcceleratedLoader, AsyncShardLoader, IncrementalShardCache, LoadStats, ModelError,
    MultiThreadLoader, PriorityNames, ShardedStateLoader, SingleThreadLoader, StreamingLoader,
    TensorIter, WeightLoader,
};

fn buffer(shape: Vec<usize>, fill: f32) -> TensorBuffer {
    let numel = shape.iter().product();
    TensorBuffer::from_f32(shape, &vec![fill; numel]).unwrap()
}

/// Rank 0 owns parts 0 and 1 with two buffers each; rank 1 owns one part
fn write_model(dir: &Path) -> Vec<PathBuf> {
    let mut part0 = TensorMap::new();
    part0.insert("model.embed_tokens.weight".to_string(), buffer(vec![4, 2], 1.0));
    part0.insert("layers.0.mlp.up_proj.weight".to_string(), buffer(vec![2, 2], 2.0));

    let mut part1 = TensorMap::new();
    part1.insert("layers.1.mlp.up_proj.weight".to_string(), buffer(vec![2, 2], 3.0));
    part1.insert("lm_head.weight".to_string(), buffer(vec![2, 4], 4.0));

    let mut other_rank = TensorMap::new();
    other_rank.insert("layers.0.mlp.down_proj.weight".to_string(), buffer(vec![2, 2], 5.0));

    let pattern = ShardPattern::default();
    let paths = vec![dir.join(pattern.format(0, 0)), dir.join(pattern.format(0, 1))];
    ShardedStateLoader::write_shard(&paths[1], &part1).unwrap();
    ShardedStateLoader::write_shard(&paths[0], &part0).unwrap();
    ShardedStateLoader::write_shard(dir.join(pattern.format(1, 0)), &other_rank).unwrap();
    paths
}

fn rank0(loader: Arc<dyn WeightLoader>) -> ShardedStateLoader {
    ShardedStateLoader::new(ShardPattern::default(), 0, 2, loader).unwrap()
}

#[test]
fn test_discover_and_merge_two_shards() {
    let dir = tempfile::tempdir().unwrap();
    let expected = write_model(dir.path());

    let sharded = rank0(Arc::new(SingleThreadLoader::lazy()));
    assert_eq!(sharded.discover(dir.path()).unwrap(), expected);

    let state = sharded.load(dir.path(), None, false).unwrap();
    let names: Vec<&str> = state.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec![
            "layers.0.mlp.up_proj.weight",
            "layers.1.mlp.up_proj.weight",
            "lm_head.weight",
            "model.embed_tokens.weight",
        ]
    );
    assert_eq!(state["lm_head.weight"].to_f32_vec().unwrap(), vec![4.0; 8]);
}

#[test]
fn test_merge_into_tied_target() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());

    // Tied embedding: lm_head is a second name for the embedding block
    let embed = TensorBuffer::zeros(vec![4, 2], DType::F32);
    let mut target = TensorMap::new();
    target.insert("model.embed_tokens.weight".to_string(), embed.clone());
    target.insert("tied_head".to_string(), embed);

    let sharded = rank0(Arc::new(SingleThreadLoader::eager()));
    let state = sharded.load(dir.path(), Some(target), true).unwrap();

    assert_eq!(state["model.embed_tokens.weight"].to_f32_vec().unwrap(), vec![1.0; 8]);
    assert!(!state.contains_key("tied_head"));
    assert_eq!(state.len(), 4);
}

#[test]
fn test_cache_evicts_oldest_and_rereads() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());
    let pattern = ShardPattern::default();
    let a = dir.path().join(pattern.format(0, 0));
    let b = dir.path().join(pattern.format(0, 1));
    let c = dir.path().join(pattern.format(1, 0));

    let sharded = Arc::new(rank0(Arc::new(SingleThreadLoader::lazy())));
    let cache = IncrementalShardCache::new(sharded, 2);

    cache.get_or_load(&a).unwrap();
    cache.get_or_load(&b).unwrap();
    cache.get_or_load(&c).unwrap();
    assert!(!cache.contains(&a));
    assert_eq!(cache.stats().evictions, 1);

    let misses_before = cache.stats().misses;
    let reloaded = cache.get_or_load(&a).unwrap();
    assert_eq!(cache.stats().misses, misses_before + 1);
    assert!(reloaded.contains_key("model.embed_tokens.weight"));
    assert!(!cache.contains(&b));
}

#[test]
fn test_loaders_agree() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());

    let loaders: Vec<Arc<dyn WeightLoader>> = vec![
        Arc::new(SingleThreadLoader::lazy()),
        Arc::new(SingleThreadLoader::eager()),
        Arc::new(MultiThreadLoader::new(4, false, 1)),
        Arc::new(AcceleratedLoader::default()),
        Arc::new(StreamingLoader::new(20, PriorityNames::default())),
    ];

    let reference = rank0(loaders[0].clone()).load(dir.path(), None, false).unwrap();
    for loader in loaders {
        let name = loader.name();
        let state = rank0(loader).load(dir.path(), None, false).unwrap();
        assert_eq!(state.len(), reference.len(), "{}", name);
        for (key, buf) in &reference {
            assert_eq!(state[key].as_bytes(), buf.as_bytes(), "{} {}", name, key);
        }
    }
}

#[test]
fn test_prefetch_gather_matches_sequential() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());

    let sharded = Arc::new(rank0(Arc::new(SingleThreadLoader::lazy())));
    let sequential = sharded.load(dir.path(), None, false).unwrap();

    let prefetch = AsyncShardLoader::new(sharded, 2, 1).unwrap();
    let gathered = prefetch.load_all(dir.path()).unwrap();
    assert_eq!(
        gathered.keys().collect::<Vec<_>>(),
        sequential.keys().collect::<Vec<_>>()
    );
}

#[test]
fn test_parallel_failure_aborts_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_model(dir.path());
    std::fs::write(&paths[1], b"truncated").unwrap();

    let sharded = rank0(Arc::new(MultiThreadLoader::new(2, false, 1)));
    let err = sharded.load(dir.path(), None, false).unwrap_err();
    match err {
        ModelError::WorkerTask { path, .. } => assert_eq!(path, paths[1]),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_device_tag_flows_through() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());

    let sharded = rank0(Arc::new(AcceleratedLoader::default())).with_device(Device::Cuda(2));
    let state = sharded.load(dir.path(), None, false).unwrap();
    assert!(state.values().all(|b| b.device() == Device::Cuda(2)));
}

/// Records how many files each `iterate` call receives
struct CallLog {
    inner: Arc<MultiThreadLoader>,
    files_per_call: Mutex<Vec<usize>>,
}

impl WeightLoader for CallLog {
    fn name(&self) -> &'static str {
        "call-log"
    }

    fn iterate(&self, paths: &[PathBuf], device: Device) -> shardload_model::Result<TensorIter<'_>> {
        self.files_per_call.lock().push(paths.len());
        self.inner.iterate(paths, device)
    }

    fn stats(&self) -> LoadStats {
        self.inner.stats()
    }
}

#[test]
fn test_rank_load_spreads_files_across_workers() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = ShardPattern::default();
    for part in 0..4 {
        let mut tensors = TensorMap::new();
        tensors.insert(format!("layers.{}.weight", part), buffer(vec![2, 2], part as f32));
        ShardedStateLoader::write_shard(dir.path().join(pattern.format(0, part)), &tensors).unwrap();
    }

    let multi = Arc::new(MultiThreadLoader::new(8, false, 1));
    let log = Arc::new(CallLog {
        inner: multi.clone(),
        files_per_call: Mutex::new(Vec::new()),
    });
    let sharded = ShardedStateLoader::new(pattern, 0, 1, log.clone()).unwrap();

    let state = sharded.load(dir.path(), None, true).unwrap();
    assert_eq!(state.len(), 4);
    assert_eq!(*log.files_per_call.lock(), vec![4]);
    assert_eq!(multi.last_worker_count(), 4);
    assert_eq!(state["layers.3.weight"].to_f32_vec().unwrap(), vec![3.0; 4]);
}
