//! Shardload Core
//!
//! Shared building blocks for the checkpoint loaders and the expert load
//! balancer.
//!
//! # Contents
//!
//! - **Tensors**: [`TensorBuffer`] views over reference-counted storage,
//!   described by shape and dtype. The engine never interprets values.
//! - **Formats**: suffix-based [`CheckpointFormat`] detection.
//! - **Atomic writes**: [`AtomicWriter`] replaces files via same-directory
//!   rename so readers never see a torn file.
//! - **Sharding**: [`ShardPattern`] file naming and [`ShardedTensor`]
//!   partitioning.
//! - **Acceleration**: an injected [`Capabilities`] provider with reference
//!   fallbacks for every native kernel.
//! - **Configuration**: [`EngineConfig`] from defaults, environment or JSON.

pub mod accel;
pub mod atomic;
pub mod config;
pub mod error;
pub mod format;
pub mod shard;
pub mod tensor;

pub use accel::{fnv1a, Capabilities, NativeError, NativeKernels, NativeResult, Packing, Replication};
pub use atomic::{write_atomic, AtomicWriter};
pub use config::{BalancerConfig, CacheConfig, EngineConfig, LoaderConfig, PolicyKind, ShardConfig};
pub use error::{CoreError, Result};
pub use format::{detect_format, safetensors_sibling, CheckpointFormat};
pub use shard::{ShardPattern, ShardedTensor};
pub use tensor::{copy_clipped, row_major_strides, DType, Device, Storage, TensorBuffer, TensorMap, WeightSpec};
