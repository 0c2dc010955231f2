//! Device memory backend interface.
//!
//! The manager never talks to a graphics API directly. Everything it needs
//! from the device goes through [`DeviceMemoryBackend`]: querying the memory
//! type table, allocating and freeing raw blocks, and mapping them.

use std::fmt;
use std::ptr::NonNull;

use bitflags::bitflags;

use crate::error::BackendError;

bitflags! {
    /// Memory property flags of a memory type.
    ///
    /// Bit positions match `VkMemoryPropertyFlagBits`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryPropertyFlags: u32 {
        /// Fast memory local to the device.
        const DEVICE_LOCAL     = 0b0000_0001;
        /// Can be mapped for host access.
        const HOST_VISIBLE     = 0b0000_0010;
        /// Host writes are visible without explicit flushes.
        const HOST_COHERENT    = 0b0000_0100;
        /// Cached on the host.
        const HOST_CACHED      = 0b0000_1000;
        /// Backing may be lazily committed.
        const LAZILY_ALLOCATED = 0b0001_0000;
        /// Protected memory.
        const PROTECTED        = 0b0010_0000;
    }
}

bitflags! {
    /// Memory heap flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryHeapFlags: u32 {
        /// The heap lives in device-local memory.
        const DEVICE_LOCAL = 0b0000_0001;
    }
}

/// One memory type as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

/// One memory heap as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub flags: MemoryHeapFlags,
}

/// The device's memory type and heap tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub types: Vec<MemoryType>,
    pub heaps: Vec<MemoryHeap>,
}

/// A raw device allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest<R> {
    /// Exact number of bytes.
    pub size: u64,
    /// Memory type to allocate from.
    pub memory_type_index: u32,
    /// Resource the memory is dedicated to, if any.
    pub dedicated: Option<R>,
    /// Request buffer device address support on the block.
    pub device_address: bool,
}

/// Raw device memory operations used by the manager.
///
/// Implementations must be callable from many threads at once.
pub trait DeviceMemoryBackend: Send + Sync {
    /// Opaque device memory handle.
    type Memory: Copy + Eq + fmt::Debug + Send + Sync;

    /// Resource a dedicated allocation is bound to.
    type Resource: Copy + fmt::Debug;

    /// Query the memory type and heap tables.
    fn memory_properties(&self) -> MemoryProperties;

    /// Alignment required between neighbouring linear and optimal resources.
    fn buffer_image_granularity(&self) -> u64;

    /// Allocate one block of device memory.
    fn allocate_memory(
        &self,
        request: &AllocationRequest<Self::Resource>,
    ) -> Result<Self::Memory, BackendError>;

    /// Free a block returned by [`allocate_memory`](Self::allocate_memory).
    fn free_memory(&self, memory: Self::Memory);

    /// Map `size` bytes of `memory` starting at `offset`.
    fn map_memory(
        &self,
        memory: Self::Memory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, BackendError>;

    /// Unmap a block mapped with [`map_memory`](Self::map_memory).
    fn unmap_memory(&self, memory: Self::Memory);
}
