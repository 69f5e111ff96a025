//! Shardload CLI
//!
//! Operator tool for sharded checkpoints and expert placement:
//!
//! - `inspect`: list a rank's shard files and the buffers they hold
//! - `load`: load a rank with a chosen loader and report throughput
//! - `split`: cut a checkpoint into per-rank, per-part shard files
//! - `plan`: compute an expert mapping from a JSON load matrix

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use shardload_core::{
    detect_format, Capabilities, Device, EngineConfig, PolicyKind, ShardPattern, ShardedTensor,
    TensorMap,
};
use shardload_eplb::{policy_from_config, ExpertLoadBalancer};
use shardload_model::{
    resolve_checkpoint, AcceleratedLoader, AsyncShardLoader, CheckpointFile, MultiThreadLoader,
    ReadMode, ShardedStateLoader, SingleThreadLoader, StreamingLoader, WeightLoader,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shardload", version, about = "Sharded checkpoint loading and expert placement")]
struct Cli {
    /// JSON engine config; defaults and SHARDLOAD_* variables otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List shard files and buffers for one rank
    Inspect {
        model_dir: PathBuf,
        #[command(flatten)]
        rank: RankArgs,
    },

    /// Load one rank's shards and print statistics
    Load {
        model_dir: PathBuf,
        #[command(flatten)]
        rank: RankArgs,
        #[arg(long, value_enum, default_value_t = LoaderKind::Single)]
        loader: LoaderKind,
        /// Gather shards through the prefetching loader
        #[arg(long)]
        prefetch: bool,
        /// Target device tag (cpu, cuda, cuda:N)
        #[arg(long)]
        device: Option<String>,
    },

    /// Split a checkpoint into rank/part shard files
    Split {
        checkpoint: PathBuf,
        out_dir: PathBuf,
        #[arg(long)]
        world_size: usize,
        #[arg(long, default_value_t = 1)]
        parts: usize,
        /// Dimension partitioned across ranks; buffers it does not divide are replicated
        #[arg(long, default_value_t = 0)]
        shard_dim: usize,
    },

    /// Compute an expert mapping from a [layers][logical] load matrix
    Plan {
        loads: PathBuf,
        #[arg(long)]
        num_physical: usize,
        /// default or locality-aware
        #[arg(long)]
        policy: Option<String>,
        /// Write the mapping here as JSON
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct RankArgs {
    #[arg(long)]
    rank: Option<usize>,
    #[arg(long)]
    world_size: Option<usize>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LoaderKind {
    Single,
    Eager,
    Multi,
    Accelerated,
    Streaming,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => EngineConfig::from_env().context("reading SHARDLOAD_* environment")?,
    };

    match cli.command {
        Command::Inspect { model_dir, rank } => {
            rank.apply(&mut config);
            inspect(&config, &model_dir)
        }
        Command::Load {
            model_dir,
            rank,
            loader,
            prefetch,
            device,
        } => {
            rank.apply(&mut config);
            if let Some(device) = device {
                config.loader.device = device.parse()?;
            }
            load(&config, &model_dir, loader, prefetch)
        }
        Command::Split {
            checkpoint,
            out_dir,
            world_size,
            parts,
            shard_dim,
        } => split(&config, &checkpoint, &out_dir, world_size, parts, shard_dim),
        Command::Plan {
            loads,
            num_physical,
            policy,
            out,
        } => {
            if let Some(policy) = policy {
                config.balancer.policy = policy.parse::<PolicyKind>()?;
            }
            plan(&config, &loads, num_physical, out.as_deref())
        }
    }
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl RankArgs {
    fn apply(&self, config: &mut EngineConfig) {
        if let Some(rank) = self.rank {
            config.shard.rank = rank;
        }
        if let Some(world_size) = self.world_size {
            config.shard.world_size = world_size;
        }
    }
}

fn make_loader(kind: LoaderKind, config: &EngineConfig) -> Arc<dyn WeightLoader> {
    match kind {
        LoaderKind::Single => Arc::new(SingleThreadLoader::new(config.loader.lazy)),
        LoaderKind::Eager => Arc::new(SingleThreadLoader::eager()),
        LoaderKind::Multi => Arc::new(MultiThreadLoader::from_config(&config.loader)),
        LoaderKind::Accelerated => Arc::new(AcceleratedLoader::default()),
        LoaderKind::Streaming => Arc::new(StreamingLoader::from_config(&config.loader)),
    }
}

fn inspect(config: &EngineConfig, model_dir: &Path) -> Result<()> {
    config.validate()?;
    let sharded = ShardedStateLoader::from_config(config, Arc::new(SingleThreadLoader::lazy()))?;
    let shards = sharded.discover(model_dir)?;

    println!(
        "rank {}/{}: {} shard file(s) matching {}",
        sharded.rank(),
        sharded.world_size(),
        shards.len(),
        sharded.pattern().glob(sharded.rank())
    );
    for path in &shards {
        let resolved = resolve_checkpoint(path)?;
        let file = CheckpointFile::open(&resolved, ReadMode::Mapped)?;
        println!(
            "\n{} [{}] {} buffer(s), {} bytes",
            resolved.display(),
            detect_format(&resolved),
            file.entries().len(),
            file.data_bytes()
        );
        for entry in file.entries() {
            println!("  {:<48} {:>5} {:?} ({} bytes)", entry.name, entry.dtype.to_string(), entry.shape, entry.size());
        }
    }
    Ok(())
}

fn load(config: &EngineConfig, model_dir: &Path, kind: LoaderKind, prefetch: bool) -> Result<()> {
    config.validate()?;
    let loader = make_loader(kind, config);
    let sharded = Arc::new(ShardedStateLoader::from_config(config, loader.clone())?);

    let started = Instant::now();
    let state = if prefetch {
        AsyncShardLoader::from_config(sharded.clone(), &config.cache)?.load_all(model_dir)?
    } else {
        sharded.load(model_dir, None, false)?
    };
    let elapsed = started.elapsed();

    let bytes: usize = state.values().map(|b| b.size_bytes()).sum();
    let stats = loader.stats();
    println!("loader:     {}", loader.name());
    println!("device:     {}", config.loader.device);
    println!("tensors:    {}", state.len());
    println!("bytes:      {}", bytes);
    println!("files read: {}", stats.files_loaded);
    println!("elapsed:    {:.3}s", elapsed.as_secs_f64());
    println!("throughput: {:.3} GB/s", stats.throughput_gbps());
    Ok(())
}

fn split(
    config: &EngineConfig,
    checkpoint: &Path,
    out_dir: &Path,
    world_size: usize,
    parts: usize,
    shard_dim: usize,
) -> Result<()> {
    if world_size == 0 || parts == 0 {
        bail!("world_size and parts must be positive");
    }
    let pattern: ShardPattern = config.shard_pattern()?;
    let source = CheckpointFile::open(resolve_checkpoint(checkpoint)?, ReadMode::Mapped)?;
    let tensors = source.read_all(Device::Cpu)?;
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    for rank in 0..world_size {
        let mut files = vec![TensorMap::new(); parts];
        for (i, (name, full)) in tensors.iter().enumerate() {
            let divisible = full.shape().get(shard_dim).map_or(false, |&d| d % world_size == 0);
            let local = if divisible {
                ShardedTensor::new(name.as_str(), full.shape().to_vec(), full.dtype(), shard_dim, world_size, rank)?
                    .slice_local(full)?
            } else {
                full.detach()
            };
            files[i % parts].insert(name.clone(), local);
        }
        for (part, file) in files.iter().enumerate() {
            let path = out_dir.join(pattern.format(rank, part));
            ShardedStateLoader::write_shard(&path, file)?;
            tracing::info!(path = %path.display(), tensors = file.len(), "Wrote shard");
        }
    }
    println!(
        "split {} buffer(s) into {} rank(s) x {} part(s) under {}",
        tensors.len(),
        world_size,
        parts,
        out_dir.display()
    );
    Ok(())
}

fn plan(config: &EngineConfig, loads: &Path, num_physical: usize, out: Option<&Path>) -> Result<()> {
    let file = File::open(loads).with_context(|| format!("opening {}", loads.display()))?;
    let weight: Vec<Vec<f64>> =
        serde_json::from_reader(BufReader::new(file)).context("load matrix must be [[number]]")?;
    let num_layers = weight.len();
    let num_logical = weight.first().map_or(0, Vec::len);

    let caps = Capabilities::reference();
    let policy = policy_from_config(&config.balancer, caps.clone());
    let balancer = ExpertLoadBalancer::new(
        num_layers,
        num_logical,
        num_physical,
        config.balancer.window_size,
        policy,
    )?;
    let mapping = balancer.rebalance(Some(weight))?;

    println!(
        "policy {}: {} layer(s), {} logical -> {} physical, fingerprint {:016x}",
        balancer.policy().name(),
        num_layers,
        num_logical,
        num_physical,
        mapping.fingerprint(&caps)
    );
    for (layer, counts) in mapping.replica_count().iter().enumerate() {
        println!("  layer {:>3}: replicas {:?}", layer, counts);
    }
    if let Some(out) = out {
        mapping.save(out)?;
        println!("wrote {}", out.display());
    }
    Ok(())
}
