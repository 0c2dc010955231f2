//! Vulkan device memory backend.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpumem::{
    AllocationRequest, BackendError, DeviceMemoryBackend, MemoryHeap, MemoryHeapFlags,
    MemoryProperties, MemoryPropertyFlags, MemoryType,
};

use crate::error::backend_error;

/// Resource a dedicated allocation is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VulkanResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// [`DeviceMemoryBackend`] over an `ash` device.
pub struct VulkanMemoryBackend {
    device: Arc<ash::Device>,
    properties: MemoryProperties,
    granularity: u64,
}

impl VulkanMemoryBackend {
    /// Query the physical device's memory tables and limits.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid, and the device
    /// must outlive every allocation made through this backend.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        // SAFETY: Caller guarantees the instance and physical device are valid
        let (memory_properties, properties) = unsafe {
            (
                instance.get_physical_device_memory_properties(physical_device),
                instance.get_physical_device_properties(physical_device),
            )
        };

        Self {
            device,
            properties: convert_memory_properties(&memory_properties),
            granularity: properties.limits.buffer_image_granularity,
        }
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }
}

/// Convert Vulkan's fixed-size tables into [`MemoryProperties`].
pub fn convert_memory_properties(
    properties: &vk::PhysicalDeviceMemoryProperties,
) -> MemoryProperties {
    let types = properties
        .memory_types
        .iter()
        .take(properties.memory_type_count as usize)
        .map(|ty| MemoryType {
            flags: MemoryPropertyFlags::from_bits_truncate(ty.property_flags.as_raw()),
            heap_index: ty.heap_index,
        })
        .collect();

    let heaps = properties
        .memory_heaps
        .iter()
        .take(properties.memory_heap_count as usize)
        .map(|heap| MemoryHeap {
            size: heap.size,
            flags: MemoryHeapFlags::from_bits_truncate(heap.flags.as_raw()),
        })
        .collect();

    MemoryProperties { types, heaps }
}

impl DeviceMemoryBackend for VulkanMemoryBackend {
    type Memory = vk::DeviceMemory;
    type Resource = VulkanResource;

    fn memory_properties(&self) -> MemoryProperties {
        self.properties.clone()
    }

    fn buffer_image_granularity(&self) -> u64 {
        self.granularity
    }

    fn allocate_memory(
        &self,
        request: &AllocationRequest<VulkanResource>,
    ) -> Result<vk::DeviceMemory, BackendError> {
        let mut dedicated_info = request.dedicated.map(|resource| match resource {
            VulkanResource::Buffer(buffer) => vk::MemoryDedicatedAllocateInfo::default().buffer(buffer),
            VulkanResource::Image(image) => vk::MemoryDedicatedAllocateInfo::default().image(image),
        });
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);

        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(request.size)
            .memory_type_index(request.memory_type_index);
        if let Some(dedicated_info) = dedicated_info.as_mut() {
            allocate_info = allocate_info.push_next(dedicated_info);
        }
        if request.device_address {
            allocate_info = allocate_info.push_next(&mut flags_info);
        }

        // SAFETY: The device is valid for the lifetime of the backend
        unsafe { self.device.allocate_memory(&allocate_info, None) }.map_err(backend_error)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: The manager only frees memory it allocated, once
        unsafe { self.device.free_memory(memory, None) };
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, BackendError> {
        // SAFETY: The manager maps each block at most once and only host-visible types
        let ptr = unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }
        .map_err(backend_error)?;

        NonNull::new(ptr.cast::<u8>()).ok_or(BackendError::MemoryMapFailed)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Only called for blocks mapped through this backend
        unsafe { self.device.unmap_memory(memory) };
    }
}
