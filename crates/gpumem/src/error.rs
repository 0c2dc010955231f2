//! Memory manager error types.

use thiserror::Error;

/// Errors reported by the memory manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The device reported something the manager cannot work with.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No allocation class can hold the request. Use a dedicated allocation.
    #[error(
        "Request of {size} bytes (alignment {alignment}) exceeds every allocation class of memory type {memory_type_index}"
    )]
    RequestTooLarge {
        memory_type_index: u32,
        size: u64,
        alignment: u64,
    },

    /// The device ran out of memory.
    #[error("Out of GPU memory: memory type {memory_type_index}, requested {size} bytes")]
    OutOfDeviceMemory { memory_type_index: u32, size: u64 },

    /// Device memory cannot be zero bytes.
    #[error("Zero-sized allocation from memory type {0}")]
    ZeroSize(u32),

    /// Memory type index outside the device's table.
    #[error("Invalid memory type index: {0}")]
    InvalidMemoryType(u32),

    /// Mapping was requested for memory the host cannot see.
    #[error("Memory type {0} is not host visible")]
    NotHostVisible(u32),

    /// Dedicated allocations are not mapped by the manager.
    #[error("Dedicated allocations cannot be mapped through the manager")]
    DedicatedNotMappable,

    /// The handle is empty or was already freed.
    #[error("Invalid or empty memory handle")]
    InvalidHandle,

    /// The backend failed to map a chunk.
    #[error("Failed to map memory of type {memory_type_index}: {reason}")]
    MapFailed {
        memory_type_index: u32,
        reason: String,
    },

    /// The manager was already destroyed.
    #[error("Memory manager has been destroyed")]
    Destroyed,

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Errors returned by a [`DeviceMemoryBackend`](crate::DeviceMemoryBackend).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Device memory exhausted.
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// Host memory exhausted.
    #[error("Out of host memory")]
    OutOfHostMemory,

    /// Mapping failed.
    #[error("Memory map failed")]
    MemoryMapFailed,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Whether this error means the allocation could not be satisfied.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfDeviceMemory | Self::OutOfHostMemory)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, MemoryError>;
