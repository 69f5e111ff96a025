//! Optional native acceleration
//!
//! Hot paths (content hashing, shape validation, expert packing and
//! replication) may be served by a native kernel library. The provider is an
//! explicit [`Capabilities`] value built once at startup and passed down to
//! the components that use it. Every operation has a reference
//! implementation; a missing or failing native kernel falls back to it, and
//! results are identical either way.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::{CoreError, Result};

/// Why a native kernel did not produce a result
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("operation not provided by the native library")]
    Unsupported,

    #[error("native kernel failed: {0}")]
    Failed(String),
}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Output of expert replication: per layer, the logical owner and replica
/// rank of every physical slot, and the replica count of every logical expert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replication {
    pub phy_to_log: Vec<Vec<usize>>,
    pub replica_rank: Vec<Vec<usize>>,
    pub replica_count: Vec<Vec<usize>>,
}

/// Output of balanced packing: per layer, the pack of every item and its
/// position inside that pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packing {
    pub pack_index: Vec<Vec<usize>>,
    pub rank_in_pack: Vec<Vec<usize>>,
}

/// Kernels a native library may provide. Unimplemented methods report
/// [`NativeError::Unsupported`].
pub trait NativeKernels: Send + Sync {
    fn name(&self) -> &str;

    fn hash_bytes(&self, _data: &[u8]) -> NativeResult<u64> {
        Err(NativeError::Unsupported)
    }

    /// Whether `src` may be merged into a buffer of shape `dst`
    fn shapes_compatible(&self, _src: &[usize], _dst: &[usize]) -> NativeResult<bool> {
        Err(NativeError::Unsupported)
    }

    fn balanced_packing(&self, _weight: &[Vec<f64>], _num_packs: usize) -> NativeResult<Packing> {
        Err(NativeError::Unsupported)
    }

    fn replicate_experts(
        &self,
        _weight: &[Vec<f64>],
        _num_physical: usize,
    ) -> NativeResult<Replication> {
        Err(NativeError::Unsupported)
    }
}

/// Capability provider handed to loaders and balancing policies
#[derive(Clone, Default)]
pub struct Capabilities {
    native: Option<Arc<dyn NativeKernels>>,
}

impl Capabilities {
    /// Reference implementations only
    pub fn reference() -> Self {
        Self { native: None }
    }

    pub fn with_native(native: Arc<dyn NativeKernels>) -> Self {
        Self {
            native: Some(native),
        }
    }

    pub fn has_native(&self) -> bool {
        self.native.is_some()
    }

    /// Run a native kernel, returning `None` when the caller must use the
    /// reference path
    pub fn try_native<T>(
        &self,
        op: &str,
        f: impl FnOnce(&dyn NativeKernels) -> NativeResult<T>,
    ) -> Option<T> {
        let native = self.native.as_deref()?;
        match f(native) {
            Ok(value) => Some(value),
            Err(NativeError::Unsupported) => None,
            Err(e) => {
                tracing::debug!(op, library = native.name(), error = %e, "Native kernel failed, using reference path");
                None
            }
        }
    }

    /// 64-bit content hash
    pub fn hash_bytes(&self, data: &[u8]) -> u64 {
        self.try_native("hash_bytes", |k| k.hash_bytes(data))
            .unwrap_or_else(|| fnv1a(data))
    }

    /// Check that a shard buffer can be merged into a target buffer
    ///
    /// Extents may differ (the merge clips each dimension); rank may not.
    pub fn validate_merge(&self, name: &str, src: &[usize], dst: &[usize]) -> Result<()> {
        let compatible = self
            .try_native("shapes_compatible", |k| k.shapes_compatible(src, dst))
            .unwrap_or(src.len() == dst.len());

        if compatible {
            Ok(())
        } else {
            Err(CoreError::ShapeMismatch {
                name: name.to_string(),
                expected: dst.to_vec(),
                got: src.to_vec(),
            })
        }
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("native", &self.native.as_ref().map(|n| n.name().to_string()))
            .finish()
    }
}

/// FNV-1a, the reference content hash
pub fn fnv1a(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 14695981039346656037;
    const FNV_PRIME: u64 = 1099511628211;

    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl NativeKernels for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn hash_bytes(&self, _data: &[u8]) -> NativeResult<u64> {
            Err(NativeError::Failed("device lost".to_string()))
        }

        fn shapes_compatible(&self, _src: &[usize], _dst: &[usize]) -> NativeResult<bool> {
            Err(NativeError::Failed("device lost".to_string()))
        }
    }

    struct Constant;

    impl NativeKernels for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        fn hash_bytes(&self, _data: &[u8]) -> NativeResult<u64> {
            Ok(42)
        }
    }

    #[test]
    fn test_fnv1a() {
        assert_eq!(fnv1a(b"hello world"), fnv1a(b"hello world"));
        assert_ne!(fnv1a(b"hello world"), fnv1a(b"hello worle"));
        assert_eq!(fnv1a(b""), 14695981039346656037);
    }

    #[test]
    fn test_failing_native_matches_reference() {
        let reference = Capabilities::reference();
        let broken = Capabilities::with_native(Arc::new(Broken));

        assert_eq!(broken.hash_bytes(b"abc"), reference.hash_bytes(b"abc"));
        assert!(broken.validate_merge("w", &[4, 4], &[2, 4]).is_ok());
        assert!(broken.validate_merge("w", &[4], &[2, 4]).is_err());
    }

    #[test]
    fn test_native_result_is_used() {
        let caps = Capabilities::with_native(Arc::new(Constant));
        assert!(caps.has_native());
        assert_eq!(caps.hash_bytes(b"abc"), 42);
        // Not provided by Constant: reference path
        assert!(caps.validate_merge("w", &[3], &[3]).is_ok());
    }
}
