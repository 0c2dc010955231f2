//! Class-based GPU memory sub-allocator.
//!
//! This crate provides:
//! - Memory type discovery, including small device-local + host-visible pools
//! - Segregated-size suballocation out of large device memory chunks
//! - Dedicated allocations for large resources
//! - Lazy, map-once host mapping of chunks
//! - Usage statistics
//! - Deferred freeing for frames in flight
//!
//! The device is reached only through [`DeviceMemoryBackend`]. See the
//! `gpumem-vulkan` crate for the Vulkan implementation, or the [`mock`]
//! module (feature `mock`) for an in-memory one.
//!
//! # Example
//!
//! ```ignore
//! use gpumem::{GpuMemoryManager, ManagerConfig, MemoryPropertyFlags};
//!
//! let manager = GpuMemoryManager::new(backend, ManagerConfig::default())?;
//! let memory_type = manager
//!     .find_memory_type(type_bits, MemoryPropertyFlags::DEVICE_LOCAL, MemoryPropertyFlags::empty())
//!     .expect("no device-local memory");
//! let mut handle = manager.allocate_memory(memory_type, size, alignment)?;
//! // bind handle.memory() at handle.offset() ...
//! manager.free_memory(&mut handle)?;
//! ```

pub mod backend;
pub mod chunk;
pub mod class_allocator;
pub mod classes;
pub mod config;
pub mod deferred;
pub mod error;
pub mod handle;
pub mod manager;
pub mod memory_type;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod stats;

pub use backend::{
    AllocationRequest, DeviceMemoryBackend, MemoryHeap, MemoryHeapFlags, MemoryProperties,
    MemoryPropertyFlags, MemoryType,
};
pub use chunk::Chunk;
pub use class_allocator::ClassAllocator;
pub use classes::{AllocationClassInfo, CONSTRAINED_CLASSES, NORMAL_CLASSES};
pub use config::{EmptyChunkPolicy, ManagerConfig, OomPolicy};
pub use deferred::DeferredFreeQueue;
pub use error::{BackendError, MemoryError, Result};
pub use handle::GpuMemoryHandle;
pub use manager::GpuMemoryManager;
pub use memory_type::MemoryTypeInfo;
pub use stats::{ClassAllocatorStats, GpuMemoryManagerStats};
