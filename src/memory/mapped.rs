//! File-backed pools mapped with memmap2.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use super::pool::{checked_range, MappedPool, MemoryError, MemoryPool};

/// A pool stored in a file and mapped read-write for each request.
#[derive(Debug, Clone)]
pub struct FileMemory {
    path: PathBuf,
    size: usize,
}

impl FileMemory {
    /// Create (or truncate) `path` to `size` zeroed bytes.
    pub fn create(path: impl AsRef<Path>, size: usize) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;
        Ok(Self { path, size })
    }

    /// Use an existing file at its current length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();
        let size = File::open(&path)?.metadata()?.len() as usize;
        Ok(Self { path, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MemoryPool for FileMemory {
    fn size(&self) -> usize {
        self.size
    }

    fn map(&self) -> Result<Box<dyn MappedPool>, MemoryError> {
        if self.size == 0 {
            return Ok(Box::new(FileMapping { mmap: None }));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| MemoryError::Map(format!("{}: {e}", self.path.display())))?;
        // SAFETY: the mapping is private to this request; callers must not
        // resize or rewrite the file while a request that uses it is running.
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| MemoryError::Map(format!("{}: {e}", self.path.display())))?;
        Ok(Box::new(FileMapping { mmap: Some(mmap) }))
    }
}

struct FileMapping {
    // memmap2 cannot map zero-length files.
    mmap: Option<MmapMut>,
}

impl FileMapping {
    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl MappedPool for FileMapping {
    fn len(&self) -> usize {
        self.bytes().len()
    }

    fn read(&self, offset: usize, dest: &mut [u8]) -> Result<(), MemoryError> {
        let bytes = self.bytes();
        let range = checked_range(offset, dest.len(), bytes.len())?;
        dest.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&mut self, offset: usize, src: &[u8]) -> Result<(), MemoryError> {
        let size = self.len();
        let range = checked_range(offset, src.len(), size)?;
        if let Some(mmap) = self.mmap.as_mut() {
            mmap[range].copy_from_slice(src);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MemoryError> {
        match &self.mmap {
            Some(mmap) => mmap.flush().map_err(|e| MemoryError::Flush(e.to_string())),
            None => Ok(()),
        }
    }
}
