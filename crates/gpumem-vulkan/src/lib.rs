//! Vulkan backend for `gpumem`.
//!
//! This crate provides:
//! - [`VulkanMemoryBackend`], the `ash` implementation of the device seam
//! - Memory type selection by [`MemoryLocation`]
//! - Buffer and image creation bound to managed memory

pub mod backend;
pub mod error;
pub mod location;
pub mod resources;

pub use backend::{VulkanMemoryBackend, VulkanResource};
pub use error::{Result, VulkanError};
pub use location::{select_memory_type, MemoryLocation};
pub use resources::{
    allocate_for_resource, map_for_host, unmap_for_host, GpuBuffer, GpuImage, ResourceRequirements,
    VulkanAllocator,
};

pub use ash::vk;
