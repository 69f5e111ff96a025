//! Rank-sharded checkpoint naming and tensor partitioning
//!
//! # File naming
//!
//! Each rank owns one or more part files named by a template such as
//! `model-rank-{rank}-part-{part}.safetensors`. [`ShardPattern`] formats the
//! glob for a rank and parses file names back into `(rank, part)`.
//!
//! # Tensor partitioning
//!
//! A [`ShardedTensor`] splits one dimension evenly across `num_shards`
//! ranks. For a `[8192, 28672]` FFN projection sharded on dim 1 across 4
//! ranks, every rank holds `[8192, 7168]`.

use std::ops::Range;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::tensor::{DType, TensorBuffer};

const RANK_PLACEHOLDER: &str = "{rank}";
const PART_PLACEHOLDER: &str = "{part}";

/// Shard file naming template
#[derive(Debug, Clone)]
pub struct ShardPattern {
    template: String,
    regex: Regex,
}

impl ShardPattern {
    pub const DEFAULT_TEMPLATE: &'static str = "model-rank-{rank}-part-{part}.safetensors";

    /// Compile a template containing exactly one `{rank}` and one `{part}`
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        if template.contains('/') || template.contains('\\') {
            return Err(CoreError::InvalidConfig(format!(
                "Shard pattern '{}' must be a file name, not a path",
                template
            )));
        }

        let mut pattern = String::from("^");
        let mut rest = template.as_str();
        let mut seen_rank = false;
        let mut seen_part = false;

        while let Some(start) = rest.find('{') {
            pattern.push_str(&regex::escape(&rest[..start]));
            let placeholder = &rest[start..];

            if let Some(tail) = placeholder.strip_prefix(RANK_PLACEHOLDER) {
                if seen_rank {
                    return Err(duplicate_placeholder(&template, RANK_PLACEHOLDER));
                }
                seen_rank = true;
                pattern.push_str(r"(?P<rank>\d+)");
                rest = tail;
            } else if let Some(tail) = placeholder.strip_prefix(PART_PLACEHOLDER) {
                if seen_part {
                    return Err(duplicate_placeholder(&template, PART_PLACEHOLDER));
                }
                seen_part = true;
                pattern.push_str(r"(?P<part>\d+)");
                rest = tail;
            } else {
                return Err(CoreError::InvalidConfig(format!(
                    "Shard pattern '{}' has an unknown placeholder",
                    template
                )));
            }
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');

        if !seen_rank || !seen_part {
            return Err(CoreError::InvalidConfig(format!(
                "Shard pattern '{}' must contain both {} and {}",
                template, RANK_PLACEHOLDER, PART_PLACEHOLDER
            )));
        }

        let regex = Regex::new(&pattern)
            .map_err(|e| CoreError::InvalidConfig(format!("Shard pattern '{}': {}", template, e)))?;

        Ok(Self { template, regex })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Glob matching every part file of `rank`
    pub fn glob(&self, rank: usize) -> String {
        self.template
            .replace(RANK_PLACEHOLDER, &rank.to_string())
            .replace(PART_PLACEHOLDER, "*")
    }

    /// File name of one part
    pub fn format(&self, rank: usize, part: usize) -> String {
        self.template
            .replace(RANK_PLACEHOLDER, &rank.to_string())
            .replace(PART_PLACEHOLDER, &part.to_string())
    }

    /// Recover `(rank, part)` from a file name
    pub fn parse(&self, file_name: &str) -> Option<(usize, usize)> {
        let caps = self.regex.captures(file_name)?;
        let rank = caps.name("rank")?.as_str().parse().ok()?;
        let part = caps.name("part")?.as_str().parse().ok()?;
        Some((rank, part))
    }
}

impl Default for ShardPattern {
    fn default() -> Self {
        match Self::new(Self::DEFAULT_TEMPLATE) {
            Ok(pattern) => pattern,
            Err(e) => unreachable!("default shard pattern is valid: {}", e),
        }
    }
}

fn duplicate_placeholder(template: &str, placeholder: &str) -> CoreError {
    CoreError::InvalidConfig(format!(
        "Shard pattern '{}' repeats {}",
        template, placeholder
    ))
}

/// A tensor split evenly along one dimension across ranks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedTensor {
    pub name: String,
    /// Full (unsharded) shape
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub shard_dim: usize,
    pub num_shards: usize,
    pub local_shard_index: usize,
}

impl ShardedTensor {
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DType,
        shard_dim: usize,
        num_shards: usize,
        local_shard_index: usize,
    ) -> Result<Self> {
        let name = name.into();
        if shard_dim >= shape.len() {
            return Err(CoreError::InvalidConfig(format!(
                "{}: shard_dim {} out of range for shape {:?}",
                name, shard_dim, shape
            )));
        }
        if num_shards == 0 || local_shard_index >= num_shards {
            return Err(CoreError::InvalidConfig(format!(
                "{}: shard index {} invalid for {} shards",
                name, local_shard_index, num_shards
            )));
        }
        if shape[shard_dim] % num_shards != 0 {
            return Err(CoreError::InvalidConfig(format!(
                "{}: dim {} ({}) must be divisible by num_shards ({})",
                name, shard_dim, shape[shard_dim], num_shards
            )));
        }

        Ok(Self {
            name,
            shape,
            dtype,
            shard_dim,
            num_shards,
            local_shard_index,
        })
    }

    /// Shape of the slice this rank holds
    pub fn local_shape(&self) -> Vec<usize> {
        let mut local = self.shape.clone();
        local[self.shard_dim] /= self.num_shards;
        local
    }

    /// Index range along `shard_dim` owned by this rank
    pub fn local_range(&self) -> Range<usize> {
        let shard_size = self.shape[self.shard_dim] / self.num_shards;
        let start = self.local_shard_index * shard_size;
        start..start + shard_size
    }

    pub fn local_size_bytes(&self) -> usize {
        self.local_shape().iter().product::<usize>() * self.dtype.size_bytes()
    }

    /// Cut this rank's slice out of the full buffer
    pub fn slice_local(&self, full: &TensorBuffer) -> Result<TensorBuffer> {
        if full.shape() != self.shape.as_slice() {
            return Err(CoreError::ShapeMismatch {
                name: self.name.clone(),
                expected: self.shape.clone(),
                got: full.shape().to_vec(),
            });
        }
        if full.dtype() != self.dtype {
            return Err(CoreError::DtypeMismatch {
                name: self.name.clone(),
                expected: self.dtype.to_string(),
                got: full.dtype().to_string(),
            });
        }

        let elem = self.dtype.size_bytes();
        let dim_size = self.shape[self.shard_dim];
        let outer: usize = self.shape[..self.shard_dim].iter().product();
        let inner_bytes = self.shape[self.shard_dim + 1..].iter().product::<usize>() * elem;
        let range = self.local_range();

        let data = full.as_bytes();
        let mut out = Vec::with_capacity(self.local_size_bytes());
        for o in 0..outer {
            let start = (o * dim_size + range.start) * inner_bytes;
            let end = (o * dim_size + range.end) * inner_bytes;
            out.extend_from_slice(&data[start..end]);
        }

        Ok(TensorBuffer::from_vec(self.local_shape(), self.dtype, out)?.with_device(full.device()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pattern_roundtrip() {
        let pattern = ShardPattern::default();
        assert_eq!(pattern.glob(0), "model-rank-0-part-*.safetensors");
        assert_eq!(pattern.format(2, 7), "model-rank-2-part-7.safetensors");
        assert_eq!(pattern.parse("model-rank-2-part-7.safetensors"), Some((2, 7)));
        assert_eq!(pattern.parse("model-rank-2-part-7.bin"), None);
        assert_eq!(pattern.parse("xmodel-rank-2-part-7.safetensors"), None);
    }

    #[test]
    fn test_literal_dots_are_escaped() {
        let pattern = ShardPattern::new("w.{rank}.{part}.st").unwrap();
        assert_eq!(pattern.parse("w.1.3.st"), Some((1, 3)));
        assert_eq!(pattern.parse("wx1x3xst"), None);
    }

    #[test]
    fn test_part_before_rank() {
        let pattern = ShardPattern::new("p{part}_r{rank}.safetensors").unwrap();
        assert_eq!(pattern.parse("p10_r3.safetensors"), Some((3, 10)));
    }

    #[test]
    fn test_bad_patterns() {
        assert!(ShardPattern::new("model-{rank}.safetensors").is_err());
        assert!(ShardPattern::new("model-{rank}-{part}-{rank}.safetensors").is_err());
        assert!(ShardPattern::new("model-{rank}-{shard}-{part}").is_err());
        assert!(ShardPattern::new("dir/model-{rank}-{part}").is_err());
        let err = ShardPattern::new("model.safetensors").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_local_shape_and_range() {
        let t = ShardedTensor::new("mlp.up_proj.weight", vec![8, 16], DType::BF16, 1, 4, 2).unwrap();
        assert_eq!(t.local_shape(), vec![8, 4]);
        assert_eq!(t.local_range(), 8..12);
        assert_eq!(t.local_size_bytes(), 8 * 4 * 2);
    }

    #[test]
    fn test_invalid_sharding() {
        assert!(ShardedTensor::new("w", vec![6], DType::F32, 0, 4, 0).is_err());
        assert!(ShardedTensor::new("w", vec![8], DType::F32, 1, 4, 0).is_err());
        assert!(ShardedTensor::new("w", vec![8], DType::F32, 0, 4, 4).is_err());
    }

    #[test]
    fn test_slice_local_columns() {
        // 2x4 matrix, column shards of width 2
        let values: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let full = TensorBuffer::from_f32(vec![2, 4], &values).unwrap();

        let t = ShardedTensor::new("w", vec![2, 4], DType::F32, 1, 2, 1).unwrap();
        let local = t.slice_local(&full).unwrap();
        assert_eq!(local.shape(), &[2, 2]);
        assert_eq!(local.to_f32_vec().unwrap(), vec![2.0, 3.0, 6.0, 7.0]);

        let t = ShardedTensor::new("w", vec![2, 4], DType::F32, 0, 2, 0).unwrap();
        assert_eq!(t.slice_local(&full).unwrap().to_f32_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
    }
}
