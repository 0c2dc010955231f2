//! Device memory chunks.

use std::fmt;
use std::ptr::NonNull;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::backend::DeviceMemoryBackend;
use crate::error::BackendError;

/// Host pointer to the start of a mapped chunk.
#[derive(Debug, Clone, Copy)]
struct MappedPtr(NonNull<u8>);

// SAFETY: The pointer is only produced by the backend's map call and stays
// valid until the chunk is released. Synchronizing access to the memory behind
// it is the caller's job, as with any mapped GPU memory.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

/// One block of device memory cut into equal slots.
///
/// Slot bookkeeping lives in the owning class bucket. The chunk only carries
/// data that is immutable after creation plus the lazily created mapping.
pub struct Chunk<B: DeviceMemoryBackend> {
    memory: B::Memory,
    size: u64,
    memory_type_index: u32,
    class_index: usize,
    /// Index of this chunk in its bucket's arena.
    entry: usize,
    mapped: OnceLock<MappedPtr>,
    map_lock: Mutex<()>,
}

impl<B: DeviceMemoryBackend> Chunk<B> {
    pub(crate) fn new(
        memory: B::Memory,
        size: u64,
        memory_type_index: u32,
        class_index: usize,
        entry: usize,
    ) -> Self {
        Self {
            memory,
            size,
            memory_type_index,
            class_index,
            entry,
            mapped: OnceLock::new(),
            map_lock: Mutex::new(()),
        }
    }

    /// The device memory handle.
    pub fn memory(&self) -> B::Memory {
        self.memory
    }

    /// Size of the chunk in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn class_index(&self) -> usize {
        self.class_index
    }

    pub(crate) fn entry(&self) -> usize {
        self.entry
    }

    /// Whether the chunk has been mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapped.get().is_some()
    }

    /// Host address of the chunk start, mapping it on first use.
    ///
    /// Concurrent first calls result in exactly one backend map call.
    pub(crate) fn mapped_address(&self, backend: &B) -> Result<NonNull<u8>, BackendError> {
        if let Some(ptr) = self.mapped.get() {
            return Ok(ptr.0);
        }

        let _guard = self.map_lock.lock();
        if let Some(ptr) = self.mapped.get() {
            return Ok(ptr.0);
        }

        let ptr = backend.map_memory(self.memory, 0, self.size)?;
        tracing::trace!(
            "Mapped chunk {:?} of memory type {} ({} bytes)",
            self.memory,
            self.memory_type_index,
            self.size
        );
        Ok(self.mapped.get_or_init(|| MappedPtr(ptr)).0)
    }

    /// Unmap (if mapped) and free the device memory.
    pub(crate) fn release(&self, backend: &B) {
        if self.is_mapped() {
            backend.unmap_memory(self.memory);
        }
        backend.free_memory(self.memory);
    }
}

impl<B: DeviceMemoryBackend> fmt::Debug for Chunk<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("memory", &self.memory)
            .field("size", &self.size)
            .field("memory_type_index", &self.memory_type_index)
            .field("class_index", &self.class_index)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AllocationRequest;
    use crate::classes::MIB;
    use crate::mock::{MockBackend, MockMemory};

    fn chunk(backend: &MockBackend, memory_type_index: u32) -> Chunk<MockBackend> {
        let memory: MockMemory = backend
            .allocate_memory(&AllocationRequest {
                size: MIB,
                memory_type_index,
                dedicated: None,
                device_address: false,
            })
            .unwrap();
        Chunk::new(memory, MIB, memory_type_index, 0, 0)
    }

    #[test]
    fn maps_once_and_unmaps_on_release() {
        let backend = MockBackend::discrete();
        let chunk = chunk(&backend, 1);
        assert!(!chunk.is_mapped());

        let first = chunk.mapped_address(&backend).unwrap();
        let second = chunk.mapped_address(&backend).unwrap();
        assert_eq!(first, second);
        assert!(chunk.is_mapped());
        assert_eq!(backend.map_calls(), 1);

        chunk.release(&backend);
        assert_eq!(backend.unmap_calls(), 1);
        assert_eq!(backend.free_calls(), 1);
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn failed_map_can_be_retried() {
        let backend = MockBackend::discrete();
        let chunk = chunk(&backend, 0);

        assert_eq!(
            chunk.mapped_address(&backend),
            Err(BackendError::MemoryMapFailed)
        );
        assert!(!chunk.is_mapped());

        // Never mapped, so release only frees.
        chunk.release(&backend);
        assert_eq!(backend.unmap_calls(), 0);
        assert_eq!(backend.free_calls(), 1);
    }
}
