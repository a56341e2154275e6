//! Input and output plumbing for PE images.
//!
//! This module abstracts over where image bytes come from and where they go:
//!
//! - [`crate::file::Backend`] - Trait for read-only data sources
//! - [`crate::file::physical::Physical`] - Memory-mapped file backend for disk access
//! - [`crate::file::memory::Memory`] - In-memory buffer backend
//! - [`crate::file::File`] - A loaded input, the backend plus its origin
//! - [`crate::file::output::Output`] - Memory-mapped output that only survives if finalized
//! - [`crate::file::parser::Parser`] and [`crate::file::io`] - Bounds-checked decoding helpers
//!
//! The image model in [`crate::image`] copies what it needs out of a [`crate::file::File`] and
//! never keeps a borrow into it, so the input mapping can be dropped right after parsing.

pub mod io;
mod memory;
pub mod output;
pub mod parser;
mod physical;

use std::path::{Path, PathBuf};

use memory::Memory;
use physical::Physical;

use crate::{Error::Empty, Result};

/// Backend for the different data sources of a PE image.
///
/// All implementations must be thread-safe.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// A loaded input image: its bytes and, when it came from disk, its path.
pub struct File {
    data: Box<dyn Backend>,
    path: Option<PathBuf>,
}

impl File {
    /// Map a file from disk.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file can not be opened or mapped,
    /// and [`crate::Error::Empty`] for a zero-length file.
    pub fn from_file(path: &Path) -> Result<File> {
        let backend = Physical::new(path)?;
        Self::load(Box::new(backend), Some(path.to_path_buf()))
    }

    /// Wrap an owned buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] for an empty buffer.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        Self::load(Box::new(Memory::new(data)), None)
    }

    fn load(data: Box<dyn Backend>, path: Option<PathBuf>) -> Result<File> {
        if data.len() == 0 {
            return Err(Empty);
        }

        Ok(File { data, path })
    }

    /// All bytes of the input.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// A bounds-checked slice of the input.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the input.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }

    /// Size of the input in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the input has no bytes (never the case for a loaded file).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Path the input was loaded from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// File name of the input (e.g. `guest.dll`), used to match import descriptors.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.path
            .as_ref()
            .and_then(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn load_file() {
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(b"MZ\x90\x00").unwrap();

        let file = File::from_file(temp.path()).unwrap();
        assert_eq!(file.len(), 4);
        assert_eq!(file.data_slice(0, 2).unwrap(), b"MZ");
        assert!(file.data_slice(2, 8).is_err());
        assert_eq!(file.path(), Some(temp.path()));
        assert!(file.name().is_some());
    }

    #[test]
    fn load_empty() {
        assert!(matches!(File::from_mem(Vec::new()), Err(Empty)));

        let temp = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(File::from_file(temp.path()), Err(Empty)));
    }

    #[test]
    fn load_missing() {
        let result = File::from_file(Path::new("/nonexistent/peweld/guest.dll"));
        assert!(matches!(result, Err(crate::Error::FileError(_))));
    }
}
