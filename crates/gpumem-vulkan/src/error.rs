//! Vulkan resource error types.

use ash::vk;
use gpumem::{BackendError, MemoryError};
use thiserror::Error;

/// Errors from creating and freeing Vulkan resources.
#[derive(Error, Debug)]
pub enum VulkanError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Memory manager error.
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// No memory type satisfies the resource.
    #[error("No suitable memory type for {0}")]
    NoSuitableMemoryType(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, VulkanError>;

/// Translate a Vulkan result into a backend error.
pub fn backend_error(result: vk::Result) -> BackendError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => BackendError::OutOfDeviceMemory,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => BackendError::OutOfHostMemory,
        vk::Result::ERROR_MEMORY_MAP_FAILED => BackendError::MemoryMapFailed,
        other => BackendError::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_results_map_to_oom() {
        assert!(backend_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_out_of_memory());
        assert!(backend_error(vk::Result::ERROR_OUT_OF_HOST_MEMORY).is_out_of_memory());
        assert_eq!(
            backend_error(vk::Result::ERROR_MEMORY_MAP_FAILED),
            BackendError::MemoryMapFailed
        );
        assert!(!backend_error(vk::Result::ERROR_DEVICE_LOST).is_out_of_memory());
    }
}
