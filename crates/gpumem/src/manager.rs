//! Top-level GPU memory manager.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::backend::{AllocationRequest, DeviceMemoryBackend, MemoryPropertyFlags};
use crate::class_allocator::ClassAllocator;
use crate::classes::{AllocationClassInfo, CONSTRAINED_CLASSES, NORMAL_CLASSES};
use crate::config::{ManagerConfig, OomPolicy};
use crate::error::{MemoryError, Result};
use crate::handle::GpuMemoryHandle;
use crate::memory_type::{find_memory_type, resolve_memory_types, MemoryTypeInfo};
use crate::stats::{ClassAllocatorStats, GpuMemoryManagerStats};

/// Most memory types a device can report.
pub const MAX_MEMORY_TYPES: usize = 32;

/// Suballocating GPU memory manager.
///
/// Holds one [`ClassAllocator`] per memory type. Small and medium requests
/// are served from shared chunks; large resources go through
/// [`allocate_memory_dedicated`](Self::allocate_memory_dedicated). All
/// methods taking `&self` may be called from any number of threads.
pub struct GpuMemoryManager<B: DeviceMemoryBackend> {
    backend: B,
    config: ManagerConfig,
    memory_types: Vec<MemoryTypeInfo>,
    allocators: Vec<ClassAllocator<B>>,
    granularity: u64,
    dedicated_memory: AtomicU64,
    dedicated_count: AtomicU32,
    destroyed: bool,
}

impl<B: DeviceMemoryBackend> GpuMemoryManager<B> {
    /// Query the device and build the per-type allocators.
    pub fn new(backend: B, config: ManagerConfig) -> Result<Self> {
        let granularity = backend.buffer_image_granularity();
        if granularity == 0 || !granularity.is_power_of_two() {
            return Err(MemoryError::Configuration(format!(
                "Buffer/image granularity must be a power of two, got {granularity}"
            )));
        }

        let properties = backend.memory_properties();
        if properties.types.is_empty() || properties.types.len() > MAX_MEMORY_TYPES {
            return Err(MemoryError::Configuration(format!(
                "Device reports {} memory types",
                properties.types.len()
            )));
        }

        if granularity > config.granularity_warning_threshold {
            tracing::warn!(
                "Buffer/image granularity is too high ({} bytes). It forces large alignments and wastes memory",
                granularity
            );
        }

        let memory_types = resolve_memory_types(&properties, config.constrained_heap_threshold);

        let uses_normal = memory_types.iter().any(|ty| !ty.is_constrained());
        let uses_constrained = memory_types.iter().any(MemoryTypeInfo::is_constrained);
        let tables: [(bool, &[AllocationClassInfo]); 2] = [
            (uses_normal, &NORMAL_CLASSES[..]),
            (uses_constrained, &CONSTRAINED_CLASSES[..]),
        ];
        for class in tables
            .iter()
            .filter(|(used, _)| *used)
            .flat_map(|(_, table)| table.iter())
        {
            if !class.is_usable_with_granularity(granularity) {
                tracing::warn!(
                    "Allocation class with sub-allocation size {} is not aligned to the buffer/image granularity ({}). It will not be used",
                    class.sub_allocation_size,
                    granularity
                );
            }
        }

        let allocators = memory_types
            .iter()
            .map(|ty| {
                ClassAllocator::new(
                    ty.index,
                    class_table(ty),
                    granularity,
                    config.expose_device_address,
                    config.empty_chunk_policy,
                )
            })
            .collect();

        if config.log_memory_information {
            log_memory_information(&memory_types);
        }

        tracing::info!(
            "GPU memory manager initialized: {} memory types, granularity {} bytes",
            memory_types.len(),
            granularity
        );

        Ok(Self {
            backend,
            config,
            memory_types,
            allocators,
            granularity,
            dedicated_memory: AtomicU64::new(0),
            dedicated_count: AtomicU32::new(0),
            destroyed: false,
        })
    }

    /// Get the device backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Get the configuration the manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Buffer/image granularity of the device.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// All memory types of the device.
    pub fn memory_types(&self) -> &[MemoryTypeInfo] {
        &self.memory_types
    }

    pub fn memory_type(&self, memory_type_index: u32) -> Option<&MemoryTypeInfo> {
        self.memory_types.get(memory_type_index as usize)
    }

    /// The class allocator of a memory type.
    pub fn class_allocator(&self, memory_type_index: u32) -> Option<&ClassAllocator<B>> {
        self.allocators.get(memory_type_index as usize)
    }

    /// Find a memory type allowed by `type_bits` that has every `prefer`
    /// flag and none of the `avoid` flags.
    ///
    /// Returns `None` if nothing qualifies; the caller is expected to retry
    /// with looser flags.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        prefer: MemoryPropertyFlags,
        avoid: MemoryPropertyFlags,
    ) -> Option<u32> {
        find_memory_type(&self.memory_types, type_bits, prefer, avoid)
    }

    /// Largest request that can be suballocated from a memory type.
    pub fn max_suballocation_size(&self, memory_type_index: u32, alignment: u64) -> Option<u64> {
        self.class_allocator(memory_type_index)?
            .max_suballocation_size(alignment.max(self.granularity))
    }

    /// Whether [`allocate_memory`](Self::allocate_memory) can serve the request.
    pub fn can_suballocate(&self, memory_type_index: u32, size: u64, alignment: u64) -> bool {
        self.class_allocator(memory_type_index)
            .is_some_and(|a| a.class_for(size, alignment.max(self.granularity)).is_some())
    }

    /// Suballocate `size` bytes from a memory type.
    ///
    /// The effective alignment is at least the buffer/image granularity.
    /// Device out-of-memory follows the configured [`OomPolicy`].
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: u64,
        alignment: u64,
    ) -> Result<GpuMemoryHandle<B>> {
        self.check_alive()?;
        let allocator = self
            .class_allocator(memory_type_index)
            .ok_or(MemoryError::InvalidMemoryType(memory_type_index))?;
        if size == 0 {
            return Err(MemoryError::ZeroSize(memory_type_index));
        }

        let alignment = alignment.max(self.granularity);
        let (chunk, offset) = allocator
            .allocate(&self.backend, size, alignment)
            .map_err(|e| self.allocation_failed(e, memory_type_index, size))?;
        debug_assert_eq!(offset % alignment, 0);

        if self.config.log_allocations {
            tracing::debug!(
                "Allocated {} bytes from memory type {} at offset {} of {:?}",
                size,
                memory_type_index,
                offset,
                chunk.memory()
            );
        }

        Ok(GpuMemoryHandle {
            memory: Some(chunk.memory()),
            offset,
            chunk: Some(chunk),
            memory_type_index,
            size,
        })
    }

    /// Allocate memory for exactly one resource, bypassing suballocation.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn allocate_memory_dedicated(
        &self,
        memory_type_index: u32,
        size: u64,
        resource: B::Resource,
    ) -> Result<GpuMemoryHandle<B>> {
        self.check_alive()?;
        if self.memory_type(memory_type_index).is_none() {
            return Err(MemoryError::InvalidMemoryType(memory_type_index));
        }
        if size == 0 {
            return Err(MemoryError::ZeroSize(memory_type_index));
        }

        let memory = self
            .backend
            .allocate_memory(&AllocationRequest {
                size,
                memory_type_index,
                dedicated: Some(resource),
                device_address: self.config.expose_device_address,
            })
            .map_err(|e| self.allocation_failed(e.into(), memory_type_index, size))?;

        self.dedicated_memory.fetch_add(size, Ordering::Relaxed);
        self.dedicated_count.fetch_add(1, Ordering::Relaxed);

        if self.config.log_allocations {
            tracing::debug!(
                "Allocated {} dedicated bytes from memory type {} for {:?}",
                size,
                memory_type_index,
                resource
            );
        }

        Ok(GpuMemoryHandle {
            memory: Some(memory),
            offset: 0,
            chunk: None,
            memory_type_index,
            size,
        })
    }

    /// Free an allocation and reset the handle to empty.
    ///
    /// Freeing an empty handle only logs a warning.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn free_memory(&self, handle: &mut GpuMemoryHandle<B>) -> Result<()> {
        let handle = std::mem::take(handle);
        let Some(memory) = handle.memory else {
            tracing::warn!("Freeing an empty GPU memory handle");
            return Ok(());
        };
        self.check_alive()?;

        if self.config.log_frees {
            tracing::debug!(
                "Freeing {} bytes of memory type {} at offset {} of {:?}",
                handle.size,
                handle.memory_type_index,
                handle.offset,
                memory
            );
        }

        match handle.chunk {
            None => {
                self.backend.free_memory(memory);
                let prev_memory = self.dedicated_memory.fetch_sub(handle.size, Ordering::Relaxed);
                let prev_count = self.dedicated_count.fetch_sub(1, Ordering::Relaxed);
                debug_assert!(
                    prev_memory >= handle.size && prev_count > 0,
                    "Dedicated allocation counters went negative, double free?"
                );
                Ok(())
            }
            Some(chunk) => self
                .class_allocator(handle.memory_type_index)
                .ok_or(MemoryError::InvalidHandle)?
                .free(&self.backend, &chunk, handle.offset),
        }
    }

    /// Host address of a suballocation.
    ///
    /// The owning chunk is mapped on first use and stays mapped until it is
    /// released.
    pub fn mapped_address(&self, handle: &GpuMemoryHandle<B>) -> Result<NonNull<u8>> {
        self.check_alive()?;
        if handle.is_empty() {
            return Err(MemoryError::InvalidHandle);
        }
        let Some(chunk) = handle.chunk.as_ref() else {
            return Err(MemoryError::DedicatedNotMappable);
        };

        let index = handle.memory_type_index;
        if !self.memory_type(index).is_some_and(MemoryTypeInfo::is_host_visible) {
            return Err(MemoryError::NotHostVisible(index));
        }

        let base = chunk
            .mapped_address(&self.backend)
            .map_err(|e| MemoryError::MapFailed {
                memory_type_index: index,
                reason: e.to_string(),
            })?;

        // SAFETY: The offset was handed out for this chunk, so it lies inside
        // the mapped range and the result is non-null.
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(handle.offset as usize)) })
    }

    /// Usage totals split into device and host memory.
    pub fn stats(&self) -> GpuMemoryManagerStats {
        let mut device = ClassAllocatorStats::default();
        let mut host = ClassAllocatorStats::default();
        for (ty, allocator) in self.memory_types.iter().zip(&self.allocators) {
            if ty.is_device_local() {
                device += allocator.stats();
            } else {
                host += allocator.stats();
            }
        }

        let dedicated = self.dedicated_memory.load(Ordering::Relaxed);
        GpuMemoryManagerStats {
            device_memory_allocated: device.allocated_size + dedicated,
            device_memory_in_use: device.in_use_size + dedicated,
            device_chunk_count: device.chunk_count,
            host_memory_allocated: host.allocated_size,
            host_memory_in_use: host.in_use_size,
            host_chunk_count: host.chunk_count,
            dedicated_memory: dedicated,
            dedicated_count: self.dedicated_count.load(Ordering::Relaxed),
        }
    }

    /// Usage of a single memory type, dedicated allocations excluded.
    pub fn memory_type_stats(&self, memory_type_index: u32) -> Result<ClassAllocatorStats> {
        self.class_allocator(memory_type_index)
            .map(ClassAllocator::stats)
            .ok_or(MemoryError::InvalidMemoryType(memory_type_index))
    }

    /// Give every retained empty chunk back to the device.
    pub fn trim_empty_chunks(&self) -> usize {
        if self.destroyed {
            return 0;
        }
        let released: usize = self
            .allocators
            .iter()
            .map(|a| a.trim(&self.backend))
            .sum();
        if released > 0 {
            tracing::debug!("Released {} empty chunks", released);
        }
        released
    }

    /// Free all device memory owned by the manager.
    ///
    /// Every allocation must have been freed before. Debug builds assert it.
    pub fn destroy(&mut self) {
        let leaked = self.release_all();
        debug_assert!(!leaked, "GPU memory was not freed before destroying the manager");
    }

    /// Returns whether anything leaked.
    fn release_all(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        self.destroyed = true;

        let leaked_slots: u32 = self
            .allocators
            .iter()
            .map(|a| a.destroy(&self.backend))
            .sum();
        let leaked_dedicated = self.dedicated_count.load(Ordering::Relaxed);

        if leaked_slots > 0 || leaked_dedicated > 0 {
            tracing::warn!(
                "Forgot to free GPU memory: {} suballocations and {} dedicated allocations ({} bytes)",
                leaked_slots,
                leaked_dedicated,
                self.dedicated_memory.load(Ordering::Relaxed)
            );
            return true;
        }
        false
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed {
            Err(MemoryError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn allocation_failed(&self, err: MemoryError, memory_type_index: u32, size: u64) -> MemoryError {
        match err {
            MemoryError::Backend(ref e) if e.is_out_of_memory() => {
                tracing::error!(
                    "Out of GPU memory. Memory type: {}, requested size: {} bytes",
                    memory_type_index,
                    size
                );
                if self.config.oom_policy == OomPolicy::Abort {
                    std::process::abort();
                }
                MemoryError::OutOfDeviceMemory {
                    memory_type_index,
                    size,
                }
            }
            other => other,
        }
    }
}

impl<B: DeviceMemoryBackend> Drop for GpuMemoryManager<B> {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn class_table(ty: &MemoryTypeInfo) -> &'static [AllocationClassInfo] {
    if ty.is_constrained() {
        &CONSTRAINED_CLASSES
    } else {
        &NORMAL_CLASSES
    }
}

fn log_memory_information(memory_types: &[MemoryTypeInfo]) {
    for ty in memory_types {
        tracing::info!(
            "Memory type {}: {:?}, heap {} ({} MB), device local: {}, constrained: {}",
            ty.index,
            ty.flags,
            ty.heap_index,
            ty.heap_size / (1024 * 1024),
            ty.is_device_local(),
            ty.is_constrained()
        );
    }

    let mut tables: Vec<(&str, &[AllocationClassInfo])> = vec![("normal", &NORMAL_CLASSES[..])];
    if memory_types.iter().any(MemoryTypeInfo::is_constrained) {
        tables.push(("constrained", &CONSTRAINED_CLASSES[..]));
    }
    for (name, table) in tables {
        for class in table {
            tracing::info!(
                "Memory class ({}): chunk size {}, sub-allocation size {}, slots per chunk {}",
                name,
                class.chunk_size,
                class.sub_allocation_size,
                class.slots_per_chunk()
            );
        }
    }
}
