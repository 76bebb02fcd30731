//! Shared-memory regions exchanged with the capture device
//!
//! The device allocates a region, hands the client a handle in a
//! `BufferCreated` event and writes pixels into it before each
//! `BufferReady`. The client maps the handle once and wraps the mapping in
//! a `ClientBuffer`, which frames reference while they are in flight.

use super::BufferId;
use crate::error::{Error, Result};
use crate::frame::FrameBacking;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

#[derive(Debug)]
struct SharedMemory {
    bytes: RwLock<Box<[u8]>>,
}

/// Handle to a shared-memory region. Cloning duplicates the handle, not
/// the memory.
#[derive(Debug, Clone)]
pub struct SharedMemoryHandle {
    memory: Arc<SharedMemory>,
}

impl SharedMemoryHandle {
    /// Allocate a zeroed region of `capacity` bytes
    pub fn allocate(capacity: usize) -> Self {
        Self {
            memory: Arc::new(SharedMemory {
                bytes: RwLock::new(vec![0u8; capacity].into_boxed_slice()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.memory.bytes.read().len()
    }

    /// Producer-side write access
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.memory.bytes.write()
    }

    /// Map the first `size` bytes of the region
    pub fn map(self, size: usize) -> Result<MappedRegion> {
        let capacity = self.capacity();
        if size == 0 {
            return Err(Error::BufferMapping("zero-sized mapping".into()));
        }
        if size > capacity {
            return Err(Error::BufferMapping(format!(
                "mapping {size} bytes of a {capacity}-byte region"
            )));
        }
        Ok(MappedRegion {
            memory: self.memory,
            len: size,
        })
    }
}

/// A mapped view of a shared-memory region
#[derive(Debug)]
pub struct MappedRegion {
    memory: Arc<SharedMemory>,
    len: usize,
}

impl MappedRegion {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        let len = self.len;
        RwLockReadGuard::map(self.memory.bytes.read(), move |b| &b[..len])
    }
}

/// A mapped capture buffer, shared by the buffer map and in-flight frames
#[derive(Debug)]
pub struct ClientBuffer {
    buffer_id: BufferId,
    region: MappedRegion,
}

impl ClientBuffer {
    pub fn new(buffer_id: BufferId, region: MappedRegion) -> Self {
        Self { buffer_id, region }
    }

    pub fn buffer_id(&self) -> BufferId {
        self.buffer_id
    }
}

impl FrameBacking for ClientBuffer {
    fn len(&self) -> usize {
        self.region.len()
    }

    fn bytes(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        self.region.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_checks_size() {
        let handle = SharedMemoryHandle::allocate(64);
        assert!(handle.clone().map(0).is_err());
        assert!(handle.clone().map(65).is_err());
        let region = handle.map(32).unwrap();
        assert_eq!(region.len(), 32);
    }

    #[test]
    fn mapping_sees_producer_writes() {
        let handle = SharedMemoryHandle::allocate(16);
        let buffer = ClientBuffer::new(3, handle.clone().map(16).unwrap());
        handle.write()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&buffer.bytes()[..4], &[1, 2, 3, 4]);
        assert_eq!(buffer.buffer_id(), 3);
    }
}
