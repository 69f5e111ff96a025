//! Named buffer types shared by every loader
//!
//! Buffers are opaque byte ranges described by shape and dtype. A
//! [`TensorBuffer`] is a view into reference-counted [`Storage`]; several
//! buffers may view the same storage (eager file loads, adapters that alias a
//! base weight), which is what [`TensorBuffer::storage_id`] exposes.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use half::{bf16, f16};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Named buffers, ordered by name for reproducible iteration
pub type TensorMap = BTreeMap<String, TensorBuffer>;

/// Tensor data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    /// Convert from the safetensors header dtype
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self> {
        use safetensors::Dtype as St;
        Ok(match dtype {
            St::F64 => DType::F64,
            St::F32 => DType::F32,
            St::F16 => DType::F16,
            St::BF16 => DType::BF16,
            St::I64 => DType::I64,
            St::I32 => DType::I32,
            St::I16 => DType::I16,
            St::I8 => DType::I8,
            St::U8 => DType::U8,
            St::BOOL => DType::Bool,
            other => return Err(CoreError::UnsupportedDtype(format!("{:?}", other))),
        })
    }

    pub fn to_safetensors(self) -> safetensors::Dtype {
        use safetensors::Dtype as St;
        match self {
            DType::F64 => St::F64,
            DType::F32 => St::F32,
            DType::F16 => St::F16,
            DType::BF16 => St::BF16,
            DType::I64 => St::I64,
            DType::I32 => St::I32,
            DType::I16 => St::I16,
            DType::I8 => St::I8,
            DType::U8 => St::U8,
            DType::Bool => St::BOOL,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F64 => "f64",
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::I16 => "i16",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Device location for buffers
///
/// The engine never runs kernels; the device is a placement tag that the
/// deduplicator groups by and that transfer paths inspect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}

impl FromStr for Device {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        if s == "cuda" {
            return Ok(Device::Cuda(0));
        }
        s.strip_prefix("cuda:")
            .and_then(|id| id.parse().ok())
            .map(Device::Cuda)
            .ok_or_else(|| CoreError::InvalidConfig(format!("Unknown device: {}", s)))
    }
}

/// Backing memory for one or more buffers
pub enum Storage {
    Heap(Vec<u8>),
    Mapped(Mmap),
}

impl Storage {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Heap(data) => data,
            Storage::Mapped(map) => map,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Heap(data) => write!(f, "Heap({} bytes)", data.len()),
            Storage::Mapped(map) => write!(f, "Mapped({} bytes)", map.len()),
        }
    }
}

/// A shaped, typed view into shared storage
#[derive(Debug, Clone)]
pub struct TensorBuffer {
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    storage: Arc<Storage>,
    /// Byte offset of the first element within `storage`
    offset: usize,
    /// Byte length of the occupied range
    len: usize,
    contiguous: bool,
}

impl TensorBuffer {
    /// Create a CPU buffer that owns its bytes
    pub fn from_vec(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_bytes();
        if data.len() != expected {
            return Err(CoreError::InvalidFormat(format!(
                "buffer of shape {:?} ({}) needs {} bytes, got {}",
                shape,
                dtype,
                expected,
                data.len()
            )));
        }
        let len = data.len();
        Ok(Self {
            shape,
            dtype,
            device: Device::Cpu,
            storage: Arc::new(Storage::Heap(data)),
            offset: 0,
            len,
            contiguous: true,
        })
    }

    /// Create a zero-filled buffer
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size_bytes();
        Self {
            shape,
            dtype,
            device: Device::Cpu,
            storage: Arc::new(Storage::Heap(vec![0u8; len])),
            offset: 0,
            len,
            contiguous: true,
        }
    }

    /// Create an f32 buffer from values
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_vec(shape, DType::F32, data)
    }

    /// Create a contiguous view at `offset` into existing storage
    pub fn from_storage(
        storage: Arc<Storage>,
        offset: usize,
        shape: Vec<usize>,
        dtype: DType,
    ) -> Result<Self> {
        let len = shape.iter().product::<usize>() * dtype.size_bytes();
        if offset + len > storage.len() {
            return Err(CoreError::InvalidFormat(format!(
                "view [{}, {}) exceeds storage of {} bytes",
                offset,
                offset + len,
                storage.len()
            )));
        }
        Ok(Self {
            shape,
            dtype,
            device: Device::Cpu,
            storage,
            offset,
            len,
            contiguous: true,
        })
    }

    /// Create another buffer aliasing this buffer's storage
    ///
    /// `offset` is absolute within the storage. A non-contiguous alias still
    /// occupies `[offset, offset + numel * size)`, which is the range the
    /// deduplicator compares.
    pub fn alias(&self, offset: usize, shape: Vec<usize>, contiguous: bool) -> Result<Self> {
        let mut view = Self::from_storage(self.storage.clone(), offset, shape, self.dtype)?;
        view.device = self.device;
        view.contiguous = contiguous;
        Ok(view)
    }

    /// Re-tag the buffer with a placement device
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.len
    }

    /// Occupied byte range within the backing storage
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    /// Identity of the backing block, `None` for zero-length buffers
    pub fn storage_id(&self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        Some(Arc::as_ptr(&self.storage) as *const () as usize)
    }

    /// Whether the bytes live in a memory-mapped file
    pub fn is_mapped(&self) -> bool {
        matches!(*self.storage, Storage::Mapped(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.storage.as_slice()[self.byte_range()]
    }

    /// Writable bytes, detaching from shared or mapped storage first
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let writable = matches!(Arc::get_mut(&mut self.storage), Some(Storage::Heap(_)));
        if !writable {
            let copy = self.as_bytes().to_vec();
            self.storage = Arc::new(Storage::Heap(copy));
            self.offset = 0;
        }
        let range = self.byte_range();
        match Arc::get_mut(&mut self.storage) {
            Some(Storage::Heap(data)) => &mut data[range],
            _ => unreachable!("storage was detached into unique heap memory"),
        }
    }

    /// Copy into a standalone buffer that shares nothing
    pub fn detach(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            device: self.device,
            storage: Arc::new(Storage::Heap(self.as_bytes().to_vec())),
            offset: 0,
            len: self.len,
            contiguous: self.contiguous,
        }
    }

    /// Decode floating point buffers to f32
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let bytes = self.as_bytes();
        let values = match self.dtype {
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DType::F16 => bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DType::BF16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DType::F64 => bytes
                .chunks_exact(8)
                .map(|c| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(c);
                    f64::from_le_bytes(raw) as f32
                })
                .collect(),
            other => {
                return Err(CoreError::UnsupportedDtype(format!(
                    "{} cannot be decoded as floating point",
                    other
                )))
            }
        };
        Ok(values)
    }
}

impl<'a> safetensors::View for &'a TensorBuffer {
    fn dtype(&self) -> safetensors::Dtype {
        TensorBuffer::dtype(self).to_safetensors()
    }

    fn shape(&self) -> &[usize] {
        TensorBuffer::shape(self)
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }

    fn data_len(&self) -> usize {
        self.len
    }
}

/// Location and layout of one named buffer inside a checkpoint file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub path: PathBuf,
    /// Absolute byte offset within the file
    pub offset: usize,
    pub size: usize,
}

impl WeightSpec {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Compute strides (in elements) for row-major layout
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Copy `src` into `dst`, clipping every dimension to the smaller extent
///
/// Elements of `dst` outside the clipped region keep their values; elements
/// of `src` outside it are dropped. Returns the number of bytes copied.
pub fn copy_clipped(name: &str, src: &TensorBuffer, dst: &mut TensorBuffer) -> Result<usize> {
    if src.dtype() != dst.dtype() {
        return Err(CoreError::DtypeMismatch {
            name: name.to_string(),
            expected: dst.dtype().to_string(),
            got: src.dtype().to_string(),
        });
    }
    if src.shape().len() != dst.shape().len() {
        return Err(CoreError::ShapeMismatch {
            name: name.to_string(),
            expected: dst.shape().to_vec(),
            got: src.shape().to_vec(),
        });
    }

    let elem = src.dtype().size_bytes();
    let rank = src.shape().len();
    if rank == 0 {
        let n = elem.min(src.size_bytes()).min(dst.size_bytes());
        dst.bytes_mut()[..n].copy_from_slice(&src.as_bytes()[..n]);
        return Ok(n);
    }

    let clip: Vec<usize> = src
        .shape()
        .iter()
        .zip(dst.shape())
        .map(|(&s, &d)| s.min(d))
        .collect();
    if clip.iter().any(|&d| d == 0) {
        return Ok(0);
    }

    let src_strides = row_major_strides(src.shape());
    let dst_strides = row_major_strides(dst.shape());
    let row_bytes = clip[rank - 1] * elem;
    let rows: usize = clip[..rank - 1].iter().product();

    let src_bytes = src.as_bytes();
    let dst_bytes = dst.bytes_mut();
    let mut index = vec![0usize; rank - 1];

    for _ in 0..rows {
        let src_off: usize = index.iter().zip(&src_strides).map(|(i, s)| i * s).sum::<usize>() * elem;
        let dst_off: usize = index.iter().zip(&dst_strides).map(|(i, s)| i * s).sum::<usize>() * elem;
        dst_bytes[dst_off..dst_off + row_bytes]
            .copy_from_slice(&src_bytes[src_off..src_off + row_bytes]);

        for d in (0..rank - 1).rev() {
            index[d] += 1;
            if index[d] < clip[d] {
                break;
            }
            index[d] = 0;
        }
    }

    Ok(rows * row_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::BF16.size_bytes(), 2);
        assert_eq!(DType::F32.size_bytes(), 4);
        assert_eq!(DType::I64.size_bytes(), 8);
        assert_eq!(DType::Bool.size_bytes(), 1);
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert!("tpu:0".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        assert!(TensorBuffer::from_vec(vec![2, 2], DType::F32, vec![0; 15]).is_err());
        assert!(TensorBuffer::from_vec(vec![2, 2], DType::F32, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_alias_shares_storage() {
        let base = TensorBuffer::from_f32(vec![4, 4], &[1.0; 16]).unwrap();
        let row = base.alias(16, vec![4], true).unwrap();
        assert_eq!(base.storage_id(), row.storage_id());
        assert_eq!(row.byte_range(), 16..32);
        assert!(base.alias(60, vec![4], true).is_err());
    }

    #[test]
    fn test_bytes_mut_detaches_shared_storage() {
        let base = TensorBuffer::from_f32(vec![2], &[1.0, 2.0]).unwrap();
        let mut alias = base.alias(0, vec![2], true).unwrap();
        alias.bytes_mut()[0..4].copy_from_slice(&9.0f32.to_le_bytes());

        assert_ne!(base.storage_id(), alias.storage_id());
        assert_eq!(base.to_f32_vec().unwrap(), vec![1.0, 2.0]);
        assert_eq!(alias.to_f32_vec().unwrap(), vec![9.0, 2.0]);
    }

    #[test]
    fn test_zero_length_has_no_identity() {
        let empty = TensorBuffer::zeros(vec![0, 8], DType::BF16);
        assert_eq!(empty.storage_id(), None);
    }

    #[test]
    fn test_strides() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(row_major_strides(&[7]), vec![1]);
        assert!(row_major_strides(&[]).is_empty());
    }

    #[test]
    fn test_copy_clipped_narrows_larger_source() {
        // 3x4 source into a 2x3 target
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let src = TensorBuffer::from_f32(vec![3, 4], &values).unwrap();
        let mut dst = TensorBuffer::zeros(vec![2, 3], DType::F32);

        let copied = copy_clipped("w", &src, &mut dst).unwrap();
        assert_eq!(copied, 6 * 4);
        assert_eq!(dst.to_f32_vec().unwrap(), vec![0.0, 1.0, 2.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_copy_clipped_smaller_source_keeps_tail() {
        let src = TensorBuffer::from_f32(vec![2], &[7.0, 8.0]).unwrap();
        let mut dst = TensorBuffer::from_f32(vec![3], &[1.0, 1.0, 1.0]).unwrap();
        copy_clipped("b", &src, &mut dst).unwrap();
        assert_eq!(dst.to_f32_vec().unwrap(), vec![7.0, 8.0, 1.0]);
    }

    #[test]
    fn test_copy_clipped_rejects_rank_and_dtype_mismatch() {
        let src = TensorBuffer::from_f32(vec![4], &[0.0; 4]).unwrap();
        let mut dst = TensorBuffer::zeros(vec![2, 2], DType::F32);
        assert!(matches!(
            copy_clipped("w", &src, &mut dst),
            Err(CoreError::ShapeMismatch { .. })
        ));

        let mut dst = TensorBuffer::zeros(vec![4], DType::BF16);
        assert!(matches!(
            copy_clipped("w", &src, &mut dst),
            Err(CoreError::DtypeMismatch { .. })
        ));
    }

    #[test]
    fn test_to_f32_from_bf16() {
        let data: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
            .collect();
        let buf = TensorBuffer::from_vec(vec![2], DType::BF16, data).unwrap();
        assert_eq!(buf.to_f32_vec().unwrap(), vec![1.5, -2.0]);
    }
}
