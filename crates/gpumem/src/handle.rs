//! Allocation handles.

use std::fmt;
use std::sync::Arc;

use crate::backend::DeviceMemoryBackend;
use crate::chunk::Chunk;

/// One allocation handed out by the manager.
///
/// The caller owns the handle and must give it back to
/// [`GpuMemoryManager::free_memory`](crate::GpuMemoryManager::free_memory),
/// which resets it to the empty state. Dedicated allocations carry no chunk
/// and always start at offset 0.
pub struct GpuMemoryHandle<B: DeviceMemoryBackend> {
    pub(crate) memory: Option<B::Memory>,
    pub(crate) offset: u64,
    pub(crate) chunk: Option<Arc<Chunk<B>>>,
    pub(crate) memory_type_index: u32,
    pub(crate) size: u64,
}

impl<B: DeviceMemoryBackend> Default for GpuMemoryHandle<B> {
    fn default() -> Self {
        Self {
            memory: None,
            offset: 0,
            chunk: None,
            memory_type_index: 0,
            size: 0,
        }
    }
}

impl<B: DeviceMemoryBackend> GpuMemoryHandle<B> {
    /// Whether the handle holds no allocation.
    pub fn is_empty(&self) -> bool {
        self.memory.is_none()
    }

    /// Whether this is a dedicated allocation.
    pub fn is_dedicated(&self) -> bool {
        self.memory.is_some() && self.chunk.is_none()
    }

    /// Device memory to bind, `None` when empty.
    pub fn memory(&self) -> Option<B::Memory> {
        self.memory
    }

    /// Byte offset inside the device memory.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// The chunk this allocation lives in, `None` for dedicated allocations.
    pub fn chunk(&self) -> Option<&Arc<Chunk<B>>> {
        self.chunk.as_ref()
    }
}

impl<B: DeviceMemoryBackend> fmt::Debug for GpuMemoryHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuMemoryHandle")
            .field("memory", &self.memory)
            .field("offset", &self.offset)
            .field("dedicated", &self.is_dedicated())
            .field("memory_type_index", &self.memory_type_index)
            .field("size", &self.size)
            .finish()
    }
}
