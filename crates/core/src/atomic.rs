//! Crash-safe file replacement
//!
//! [`AtomicWriter`] writes into a temporary file created in the target's own
//! directory (same filesystem, so the final rename is atomic) and only
//! replaces the target on [`AtomicWriter::commit`]. Dropping the writer
//! without committing deletes the temporary file, so readers always observe
//! either the complete old file or the complete new one.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{CoreError, Result};

/// Scoped writer that atomically replaces `target` on commit
pub struct AtomicWriter {
    target: PathBuf,
    writer: BufWriter<NamedTempFile>,
}

impl AtomicWriter {
    /// Open a temporary file next to `target`
    pub fn create(target: impl AsRef<Path>) -> Result<Self> {
        let target = target.as_ref().to_path_buf();
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CoreError::InvalidConfig(format!("Not a file path: {}", target.display())))?;

        fs::create_dir_all(&dir)?;
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name))
            .suffix(".tmp")
            .tempfile_in(&dir)?;

        tracing::trace!(target = %target.display(), temp = %temp.path().display(), "Opened atomic write");

        Ok(Self {
            target,
            writer: BufWriter::new(temp),
        })
    }

    /// Path of the file that will be replaced
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Flush, sync and rename the temporary file over the target
    pub fn commit(self) -> Result<()> {
        let temp = self.writer.into_inner().map_err(|e| CoreError::Io(e.into_error()))?;
        temp.as_file().sync_all()?;
        temp.persist(&self.target).map_err(|e| CoreError::Io(e.error))?;

        tracing::debug!(target = %self.target.display(), "Atomic write committed");
        Ok(())
    }
}

impl Write for AtomicWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Run `f` against an [`AtomicWriter`] for `target`, committing only on success
///
/// Any error from `f` discards the temporary file and is returned unchanged;
/// the target keeps its previous contents.
pub fn write_atomic<T, E, F>(target: impl AsRef<Path>, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(&mut AtomicWriter) -> std::result::Result<T, E>,
    E: From<CoreError>,
{
    let mut writer = AtomicWriter::create(target)?;
    let value = f(&mut writer)?;
    writer.commit()?;
    Ok(value)
}
