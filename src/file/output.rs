//! Memory-mapped output file with all-or-nothing semantics.
//!
//! An [`Output`] is only created once the complete image is available in memory. The
//! bytes are copied into a mapping of the target file, flushed and then marked finalized.
//! If anything fails in between, or the value is dropped without being finalized, the
//! partially written file is deleted again, so an interrupted run never leaves a corrupt
//! executable behind.
//!
//! ```rust,ignore
//! use peweld::file::output::Output;
//!
//! let image: Vec<u8> = vec![0x4D, 0x5A];
//! let mut output = Output::create("out.exe", image.len() as u64)?;
//! output.write_at(0, &image)?;
//! output.finalize()?;
//! # Ok::<(), peweld::Error>(())
//! ```

use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// A memory-mapped output file that removes itself unless finalized.
pub struct Output {
    /// The memory mapping of the target file
    mmap: MmapMut,

    /// The path the file is written to
    target_path: PathBuf,

    /// Whether the file has been finalized
    finalized: bool,
}

impl Output {
    /// Creates a new memory-mapped output file of exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::WriteMmapFailed`] if the target file can not be created,
    /// resized or mapped.
    pub fn create<P: AsRef<Path>>(target_path: P, size: u64) -> Result<Self> {
        let target_path = target_path.as_ref().to_path_buf();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target_path)
            .map_err(|e| Error::WriteMmapFailed {
                message: format!("Failed to create target file: {e}"),
            })?;

        file.set_len(size).map_err(|e| Error::WriteMmapFailed {
            message: format!("Failed to set file size: {e}"),
        })?;

        let mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .map_err(|e| Error::WriteMmapFailed {
                    message: format!("Failed to create memory mapping: {e}"),
                })?
        };

        Ok(Self {
            mmap,
            target_path,
            finalized: false,
        })
    }

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::WriteMmapFailed`] if the write would exceed the file size.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| Error::WriteMmapFailed {
            message: format!("Offset {offset} does not fit the address space"),
        })?;
        let end = start.checked_add(data.len()).unwrap_or(usize::MAX);

        if end > self.mmap.len() {
            return Err(Error::WriteMmapFailed {
                message: format!(
                    "Write of {} bytes at {} exceeds file size {}",
                    data.len(),
                    offset,
                    self.mmap.len()
                ),
            });
        }

        self.mmap[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Flushes pending writes to disk.
    ///
    /// # Errors
    /// Returns [`crate::Error::WriteMmapFailed`] if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.mmap.flush().map_err(|e| Error::WriteMmapFailed {
            message: format!("Failed to flush memory mapping: {e}"),
        })
    }

    /// Flushes and keeps the file. Without this call the file is deleted on drop.
    ///
    /// # Errors
    /// Returns [`crate::Error::WriteFinalizationFailed`] if the flush fails.
    pub fn finalize(mut self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| Error::WriteFinalizationFailed {
                message: format!("Failed to flush memory mapping: {e}"),
            })?;

        self.finalized = true;
        Ok(())
    }}

impl Drop for Output {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self.flush();
            let _ = std::fs::remove_file(&self.target_path);
        }
    }
}
