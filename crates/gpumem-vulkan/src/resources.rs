//! Buffers and images backed by the class allocator.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpumem::{
    DeviceMemoryBackend, GpuMemoryHandle, GpuMemoryManager, ManagerConfig, MemoryError,
    MemoryTypeInfo,
};

use crate::backend::{VulkanMemoryBackend, VulkanResource};
use crate::error::{Result, VulkanError};
use crate::location::{select_memory_type, MemoryLocation};

type Handle = GpuMemoryHandle<VulkanMemoryBackend>;

/// Host pointer into mapped buffer memory.
#[derive(Debug, Clone, Copy)]
struct HostPtr(NonNull<u8>);

// SAFETY: The pointer stays valid until the buffer is freed. Writers must
// synchronize with the GPU themselves.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

/// What a resource needs from memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
    /// The driver prefers or requires a dedicated allocation.
    pub prefers_dedicated: bool,
}

impl ResourceRequirements {
    fn from_vk(memory: vk::MemoryRequirements, dedicated: &vk::MemoryDedicatedRequirements) -> Self {
        Self {
            size: memory.size,
            alignment: memory.alignment,
            memory_type_bits: memory.memory_type_bits,
            prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE
                || dedicated.requires_dedicated_allocation == vk::TRUE,
        }
    }
}

/// Pick a memory type for `location` and allocate.
///
/// Goes dedicated when the driver asks for it or no class can hold the
/// request.
pub fn allocate_for_resource<B: DeviceMemoryBackend>(
    manager: &GpuMemoryManager<B>,
    requirements: ResourceRequirements,
    location: MemoryLocation,
    resource: B::Resource,
    name: &str,
) -> Result<GpuMemoryHandle<B>> {
    let ResourceRequirements {
        size,
        alignment,
        memory_type_bits,
        prefers_dedicated,
    } = requirements;

    let memory_type = select_memory_type(manager, memory_type_bits, location).ok_or_else(|| {
        VulkanError::NoSuitableMemoryType(format!(
            "'{name}' ({location:?}, bits {memory_type_bits:#b})"
        ))
    })?;

    let dedicated = prefers_dedicated || !manager.can_suballocate(memory_type, size, alignment);

    tracing::trace!(
        "Allocating {} bytes for '{}' from memory type {}{}",
        size,
        name,
        memory_type,
        if dedicated { " (dedicated)" } else { "" }
    );

    let handle = if dedicated {
        manager.allocate_memory_dedicated(memory_type, size, resource)?
    } else {
        manager.allocate_memory(memory_type, size, alignment)?
    };
    Ok(handle)
}

/// Host address of `handle` if `location` wants host access.
///
/// Suballocations share their chunk's mapping. Dedicated blocks are mapped on
/// their own and must be given back with [`unmap_for_host`].
pub fn map_for_host<B: DeviceMemoryBackend>(
    manager: &GpuMemoryManager<B>,
    handle: &GpuMemoryHandle<B>,
    location: MemoryLocation,
) -> Result<Option<NonNull<u8>>> {
    let host_visible = manager
        .memory_type(handle.memory_type_index())
        .is_some_and(MemoryTypeInfo::is_host_visible);
    if !location.is_host_visible() || !host_visible {
        return Ok(None);
    }

    if !handle.is_dedicated() {
        return Ok(Some(manager.mapped_address(handle)?));
    }

    let memory = handle.memory().ok_or(MemoryError::InvalidHandle)?;
    let ptr = manager
        .backend()
        .map_memory(memory, 0, handle.size())
        .map_err(MemoryError::from)?;
    Ok(Some(ptr))
}

/// Undo [`map_for_host`] before `handle` is freed.
///
/// Chunk mappings stay alive for the other slots, so only dedicated blocks
/// are unmapped.
pub fn unmap_for_host<B: DeviceMemoryBackend>(
    manager: &GpuMemoryManager<B>,
    handle: &GpuMemoryHandle<B>,
    was_mapped: bool,
) {
    if !was_mapped || !handle.is_dedicated() {
        return;
    }
    if let Some(memory) = handle.memory() {
        manager.backend().unmap_memory(memory);
    }
}

/// Creates Vulkan resources and binds them to managed memory.
pub struct VulkanAllocator {
    manager: Option<GpuMemoryManager<VulkanMemoryBackend>>,
    device: Arc<ash::Device>,
}

impl VulkanAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        config: ManagerConfig,
    ) -> Result<Self> {
        // SAFETY: Forwarded from the caller
        let backend = unsafe { VulkanMemoryBackend::new(instance, device.clone(), physical_device) };
        let manager = GpuMemoryManager::new(backend, config)?;

        Ok(Self {
            manager: Some(manager),
            device,
        })
    }

    /// The memory manager behind this allocator.
    pub fn manager(&self) -> Result<&GpuMemoryManager<VulkanMemoryBackend>> {
        self.manager
            .as_ref()
            .ok_or_else(|| VulkanError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Allocate a buffer.
    ///
    /// Host-visible locations are mapped before returning.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let manager = self.manager()?;
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = self.buffer_requirements(buffer);

        let memory = match allocate_for_resource(
            manager,
            requirements,
            location,
            VulkanResource::Buffer(buffer),
            name,
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mut buffer = GpuBuffer {
            buffer,
            memory,
            size,
            mapped: None,
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer.buffer, buffer.memory_object(), buffer.memory.offset())
                .map_err(VulkanError::from)
        }
        .and_then(|()| map_for_host(manager, &buffer.memory, location));

        match bound {
            Ok(mapped) => {
                buffer.mapped = mapped.map(HostPtr);
                Ok(buffer)
            }
            Err(e) => {
                // Best effort, the original error is the interesting one.
                let _ = self.free_buffer(&mut buffer);
                Err(e)
            }
        }
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        let manager = self.manager()?;

        unmap_for_host(manager, &buffer.memory, buffer.mapped.take().is_some());
        manager.free_memory(&mut buffer.memory)?;

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Allocate an image.
    pub fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        let manager = self.manager()?;
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = self.image_requirements(image);

        let memory = match allocate_for_resource(
            manager,
            requirements,
            location,
            VulkanResource::Image(image),
            name,
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let mut image = GpuImage {
            image,
            memory,
            format: create_info.format,
            extent: create_info.extent,
        };

        let memory_object = image.memory.memory().unwrap_or_default();
        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image.image, memory_object, image.memory.offset())
        } {
            let _ = self.free_image(&mut image);
            return Err(e.into());
        }

        Ok(image)
    }

    /// Free an image allocation.
    pub fn free_image(&self, image: &mut GpuImage) -> Result<()> {
        self.manager()?.free_memory(&mut image.memory)?;

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(manager) = self.manager.take() {
            tracing::debug!("GPU memory at shutdown: {}", manager.stats().summary());
            drop(manager);
        }
    }

    fn buffer_requirements(&self, buffer: vk::Buffer) -> ResourceRequirements {
        let info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        unsafe {
            self.device
                .get_buffer_memory_requirements2(&info, &mut requirements);
        }
        let memory = requirements.memory_requirements;

        ResourceRequirements::from_vk(memory, &dedicated)
    }

    fn image_requirements(&self, image: vk::Image) -> ResourceRequirements {
        let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        unsafe {
            self.device
                .get_image_memory_requirements2(&info, &mut requirements);
        }
        let memory = requirements.memory_requirements;

        ResourceRequirements::from_vk(memory, &dedicated)
    }
}

impl Drop for VulkanAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its memory.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: Handle,
    pub size: u64,
    mapped: Option<HostPtr>,
}

impl GpuBuffer {
    /// The `VkDeviceMemory` the buffer is bound to.
    pub fn memory_object(&self) -> vk::DeviceMemory {
        self.memory.memory().unwrap_or_default()
    }

    /// Get the device address of this buffer.
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }

    /// Host pointer to the start of the buffer, if it is mapped.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped.map(|p| p.0.as_ptr())
    }

    /// Write data to the start of the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Copy bytes in at `offset`. Fails if the buffer is not mapped or the
    /// range runs past its end.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| VulkanError::InvalidState("Buffer not mapped".to_string()))?;

        match offset.checked_add(data.len() as u64) {
            Some(end) if end <= self.size => {}
            _ => {
                return Err(VulkanError::InvalidState(format!(
                    "Write of {} bytes at {} does not fit a {} byte buffer",
                    data.len(),
                    offset,
                    self.size
                )))
            }
        }

        // SAFETY: The range was checked against the mapped size above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Write typed data at `offset` (must be host-visible).
    pub fn write_range<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }
}

/// A GPU image with its memory.
pub struct GpuImage {
    pub image: vk::Image,
    pub memory: Handle,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpumem::mock::{MockBackend, MockResource};
    use gpumem::OomPolicy;

    const MIB: u64 = 1024 * 1024;

    fn manager() -> GpuMemoryManager<MockBackend> {
        GpuMemoryManager::new(
            MockBackend::discrete(),
            ManagerConfig::default().with_oom_policy(OomPolicy::ReturnError),
        )
        .unwrap()
    }

    fn requirements(size: u64, prefers_dedicated: bool) -> ResourceRequirements {
        ResourceRequirements {
            size,
            alignment: 256,
            memory_type_bits: u32::MAX,
            prefers_dedicated,
        }
    }

    #[test]
    fn oversized_requests_go_dedicated() {
        let mgr = manager();
        let mut small = allocate_for_resource(
            &mgr,
            requirements(64 * 1024, false),
            MemoryLocation::GpuOnly,
            MockResource::Buffer(1),
            "small",
        )
        .unwrap();
        let mut large = allocate_for_resource(
            &mgr,
            requirements(300 * MIB, false),
            MemoryLocation::GpuOnly,
            MockResource::Image(2),
            "large",
        )
        .unwrap();
        let mut preferred = allocate_for_resource(
            &mgr,
            requirements(64 * 1024, true),
            MemoryLocation::GpuOnly,
            MockResource::Image(3),
            "preferred",
        )
        .unwrap();

        assert!(!small.is_dedicated());
        assert!(large.is_dedicated());
        assert!(preferred.is_dedicated());
        let info = mgr.backend().allocation(large.memory().unwrap()).unwrap();
        assert_eq!(info.dedicated, Some(MockResource::Image(2)));
        assert_eq!(mgr.stats().dedicated_count, 2);

        for handle in [&mut small, &mut large, &mut preferred] {
            mgr.free_memory(handle).unwrap();
        }
    }

    #[test]
    fn no_matching_type_is_an_error() {
        let mgr = manager();
        let mut reqs = requirements(1024, false);
        // Only the device-only type is allowed.
        reqs.memory_type_bits = 0b0001;
        let err = allocate_for_resource(
            &mgr,
            reqs,
            MemoryLocation::CpuToGpu,
            MockResource::Buffer(1),
            "upload",
        )
        .unwrap_err();
        assert!(matches!(err, VulkanError::NoSuitableMemoryType(_)));
        assert_eq!(mgr.backend().allocate_calls(), 0);
    }

    #[test]
    fn suballocation_is_mapped_through_its_chunk() {
        let mgr = manager();
        let mut handle = allocate_for_resource(
            &mgr,
            requirements(1024, false),
            MemoryLocation::CpuToGpu,
            MockResource::Buffer(1),
            "staging",
        )
        .unwrap();
        assert!(!handle.is_dedicated());

        let ptr = map_for_host(&mgr, &handle, MemoryLocation::CpuToGpu)
            .unwrap()
            .unwrap();
        assert_eq!(ptr, mgr.mapped_address(&handle).unwrap());
        assert!(handle.chunk().unwrap().is_mapped());

        unmap_for_host(&mgr, &handle, true);
        assert_eq!(mgr.backend().unmap_calls(), 0);
        mgr.free_memory(&mut handle).unwrap();
    }

    #[test]
    fn dedicated_host_buffer_is_unmapped_on_free() {
        let mgr = manager();
        let mut handle = allocate_for_resource(
            &mgr,
            requirements(300 * MIB, false),
            MemoryLocation::CpuToGpu,
            MockResource::Buffer(9),
            "big upload",
        )
        .unwrap();
        assert!(handle.is_dedicated());

        let ptr = map_for_host(&mgr, &handle, MemoryLocation::CpuToGpu).unwrap();
        assert!(ptr.is_some());
        assert_eq!(mgr.backend().map_calls(), 1);
        let memory = handle.memory().unwrap();
        assert!(mgr.backend().allocation(memory).unwrap().mapped);

        unmap_for_host(&mgr, &handle, true);
        assert_eq!(mgr.backend().unmap_calls(), 1);
        assert!(!mgr.backend().allocation(memory).unwrap().mapped);
        mgr.free_memory(&mut handle).unwrap();
        assert_eq!(mgr.backend().live_allocations(), 0);
    }

    #[test]
    fn device_only_memory_is_not_mapped() {
        let mgr = manager();
        let mut handle = allocate_for_resource(
            &mgr,
            requirements(1024, false),
            MemoryLocation::GpuOnly,
            MockResource::Buffer(1),
            "vertices",
        )
        .unwrap();

        assert_eq!(map_for_host(&mgr, &handle, MemoryLocation::GpuOnly).unwrap(), None);
        unmap_for_host(&mgr, &handle, false);
        assert_eq!(mgr.backend().map_calls(), 0);
        mgr.free_memory(&mut handle).unwrap();
    }
}
