//! Checkpoint fixtures for unit tests

use std::path::{Path, PathBuf};

use shardload_core::{TensorBuffer, TensorMap};

use crate::checkpoint::write_checkpoint;

/// Write f32 buffers to `dir/file_name` and return the path
pub fn write_f32_checkpoint<S: AsRef<str>>(
    dir: &Path,
    file_name: &str,
    tensors: &[(S, Vec<usize>, Vec<f32>)],
) -> PathBuf {
    let mut map = TensorMap::new();
    for (name, shape, values) in tensors {
        let buffer = TensorBuffer::from_f32(shape.clone(), values).unwrap();
        map.insert(name.as_ref().to_string(), buffer);
    }
    let path = dir.join(file_name);
    write_checkpoint(&path, &map).unwrap();
    path
}
