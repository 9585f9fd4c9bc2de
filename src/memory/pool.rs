//! Pool traits and the shared host-memory pool.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Range {offset}+{len} exceeds pool size {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("Pool mapping failed: {0}")]
    Map(String),

    #[error("Pool flush failed: {0}")]
    Flush(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-supplied memory referenced by request arguments.
pub trait MemoryPool: Send + Sync {
    /// Size in bytes.
    fn size(&self) -> usize;

    /// Map for the duration of one request.
    fn map(&self) -> Result<Box<dyn MappedPool>, MemoryError>;
}

/// A mapped view of a pool. Unmapped on drop.
pub trait MappedPool: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, offset: usize, dest: &mut [u8]) -> Result<(), MemoryError>;

    fn write(&mut self, offset: usize, src: &[u8]) -> Result<(), MemoryError>;

    /// Make written bytes visible to the pool's owner.
    fn flush(&mut self) -> Result<(), MemoryError>;
}

pub(crate) fn checked_range(offset: usize, len: usize, size: usize) -> Result<Range<usize>, MemoryError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(MemoryError::OutOfBounds { offset, len, size }),
    }
}

/// Heap memory shared between the caller and the runtime.
///
/// Clones share the same bytes, so a caller can keep one handle and read
/// outputs after the request completes.
#[derive(Debug, Clone, Default)]
pub struct HostMemory {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostMemory {
    pub fn new(size: usize) -> Self {
        Self::from_bytes(vec![0; size])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        let bytes = self.bytes.lock();
        let range = checked_range(offset, len, bytes.len())?;
        Ok(bytes[range].to_vec())
    }

    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<(), MemoryError> {
        let mut bytes = self.bytes.lock();
        let range = checked_range(offset, src.len(), bytes.len())?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }
}

impl MemoryPool for HostMemory {
    fn size(&self) -> usize {
        self.bytes.lock().len()
    }

    fn map(&self) -> Result<Box<dyn MappedPool>, MemoryError> {
        Ok(Box::new(HostMapping {
            bytes: Arc::clone(&self.bytes),
        }))
    }
}

/// Locks the shared bytes per access, never across a request.
struct HostMapping {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MappedPool for HostMapping {
    fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    fn read(&self, offset: usize, dest: &mut [u8]) -> Result<(), MemoryError> {
        let bytes = self.bytes.lock();
        let range = checked_range(offset, dest.len(), bytes.len())?;
        dest.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&mut self, offset: usize, src: &[u8]) -> Result<(), MemoryError> {
        let mut bytes = self.bytes.lock();
        let range = checked_range(offset, src.len(), bytes.len())?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MemoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_shares_bytes() {
        let memory = HostMemory::new(8);
        let mut mapped = memory.map().unwrap();
        mapped.write(4, &[1, 2, 3, 4]).unwrap();
        mapped.flush().unwrap();
        assert_eq!(memory.read_at(4, 4).unwrap(), vec![1, 2, 3, 4]);

        let mut dest = [0u8; 2];
        memory.write_at(0, &[9, 8]).unwrap();
        mapped.read(0, &mut dest).unwrap();
        assert_eq!(dest, [9, 8]);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let memory = HostMemory::new(4);
        let mut mapped = memory.map().unwrap();
        assert!(matches!(
            mapped.write(2, &[0; 4]),
            Err(MemoryError::OutOfBounds { offset: 2, len: 4, size: 4 })
        ));
        assert!(memory.read_at(usize::MAX, 2).is_err());
        assert_eq!(memory.size(), 4);
    }
}
