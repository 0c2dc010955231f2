//! In-memory device backend.
//!
//! Simulates heaps with hard budgets, memory types, buffer/image granularity
//! and host mapping backed by real host storage. Every backend call is
//! counted so tests can check how often the manager reached the device.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::backend::{
    AllocationRequest, DeviceMemoryBackend, MemoryHeap, MemoryHeapFlags, MemoryProperties,
    MemoryPropertyFlags, MemoryType,
};
use crate::classes::MIB;
use crate::error::BackendError;

const GIB: u64 = 1024 * MIB;

/// Device memory handle handed out by [`MockBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockMemory(pub u64);

/// Resource a mock dedicated allocation is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockResource {
    Buffer(u64),
    Image(u64),
}

/// Snapshot of one live mock allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockAllocationInfo {
    pub size: u64,
    pub memory_type_index: u32,
    pub dedicated: Option<MockResource>,
    pub device_address: bool,
    pub mapped: bool,
}

struct MockAllocation {
    info: MockAllocationInfo,
    storage: Option<Box<[u8]>>,
}

#[derive(Default)]
struct MockState {
    allocations: HashMap<u64, MockAllocation>,
    heap_usage: Vec<u64>,
}

/// Device backend that lives entirely in host memory.
pub struct MockBackend {
    properties: MemoryProperties,
    granularity: u64,
    state: Mutex<MockState>,
    next_id: AtomicU64,
    allocate_calls: AtomicUsize,
    free_calls: AtomicUsize,
    map_calls: AtomicUsize,
    unmap_calls: AtomicUsize,
}

/// Builder for [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockBackendBuilder {
    properties: MemoryProperties,
    granularity: u64,
}

impl Default for MockBackendBuilder {
    fn default() -> Self {
        Self {
            properties: MemoryProperties::default(),
            granularity: 1,
        }
    }
}

impl MockBackendBuilder {
    /// Add a heap.
    pub fn heap(mut self, size: u64, device_local: bool) -> Self {
        let flags = if device_local {
            MemoryHeapFlags::DEVICE_LOCAL
        } else {
            MemoryHeapFlags::empty()
        };
        self.properties.heaps.push(MemoryHeap { size, flags });
        self
    }

    /// Add a memory type living on `heap_index`.
    pub fn memory_type(mut self, flags: MemoryPropertyFlags, heap_index: u32) -> Self {
        self.properties.types.push(MemoryType { flags, heap_index });
        self
    }

    /// Set the buffer/image granularity.
    pub fn granularity(mut self, granularity: u64) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn build(self) -> MockBackend {
        let heap_count = self.properties.heaps.len();
        MockBackend {
            properties: self.properties,
            granularity: self.granularity,
            state: Mutex::new(MockState {
                allocations: HashMap::new(),
                heap_usage: vec![0; heap_count],
            }),
            next_id: AtomicU64::new(1),
            allocate_calls: AtomicUsize::new(0),
            free_calls: AtomicUsize::new(0),
            map_calls: AtomicUsize::new(0),
            unmap_calls: AtomicUsize::new(0),
        }
    }
}

impl MockBackend {
    /// Start describing a custom device.
    pub fn builder() -> MockBackendBuilder {
        MockBackendBuilder::default()
    }

    /// Discrete GPU with a small device-local, host-visible window.
    ///
    /// | type | flags | heap |
    /// |---|---|---|
    /// | 0 | device local | 0: 8 GiB VRAM |
    /// | 1 | host visible, coherent | 1: 16 GiB system |
    /// | 2 | host visible, coherent, cached | 1 |
    /// | 3 | device local, host visible, coherent | 2: 256 MiB VRAM |
    pub fn discrete() -> Self {
        let host = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        Self::builder()
            .heap(8 * GIB, true)
            .heap(16 * GIB, false)
            .heap(256 * MIB, true)
            .memory_type(MemoryPropertyFlags::DEVICE_LOCAL, 0)
            .memory_type(host, 1)
            .memory_type(host | MemoryPropertyFlags::HOST_CACHED, 1)
            .memory_type(host | MemoryPropertyFlags::DEVICE_LOCAL, 2)
            .granularity(1024)
            .build()
    }

    /// Discrete GPU with resizable BAR: all VRAM is host visible.
    pub fn rebar() -> Self {
        let host = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        Self::builder()
            .heap(8 * GIB, true)
            .heap(16 * GIB, false)
            .memory_type(MemoryPropertyFlags::DEVICE_LOCAL, 0)
            .memory_type(host, 1)
            .memory_type(host | MemoryPropertyFlags::DEVICE_LOCAL, 0)
            .granularity(1024)
            .build()
    }

    /// Integrated GPU sharing one heap with the host.
    pub fn integrated() -> Self {
        let shared = MemoryPropertyFlags::DEVICE_LOCAL
            | MemoryPropertyFlags::HOST_VISIBLE
            | MemoryPropertyFlags::HOST_COHERENT;
        Self::builder()
            .heap(4 * GIB, true)
            .memory_type(MemoryPropertyFlags::DEVICE_LOCAL, 0)
            .memory_type(shared, 0)
            .memory_type(shared | MemoryPropertyFlags::HOST_CACHED, 0)
            .granularity(1)
            .build()
    }

    pub fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::Relaxed)
    }

    pub fn free_calls(&self) -> usize {
        self.free_calls.load(Ordering::Relaxed)
    }

    pub fn map_calls(&self) -> usize {
        self.map_calls.load(Ordering::Relaxed)
    }

    pub fn unmap_calls(&self) -> usize {
        self.unmap_calls.load(Ordering::Relaxed)
    }

    /// Number of live device allocations.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Bytes currently allocated from a heap.
    pub fn heap_usage(&self, heap_index: u32) -> u64 {
        self.state
            .lock()
            .heap_usage
            .get(heap_index as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Details of a live allocation.
    pub fn allocation(&self, memory: MockMemory) -> Option<MockAllocationInfo> {
        self.state.lock().allocations.get(&memory.0).map(|a| a.info)
    }

    fn heap_of(&self, memory_type_index: u32) -> Option<usize> {
        self.properties
            .types
            .get(memory_type_index as usize)
            .map(|ty| ty.heap_index as usize)
    }
}

impl DeviceMemoryBackend for MockBackend {
    type Memory = MockMemory;
    type Resource = MockResource;

    fn memory_properties(&self) -> MemoryProperties {
        self.properties.clone()
    }

    fn buffer_image_granularity(&self) -> u64 {
        self.granularity
    }

    fn allocate_memory(
        &self,
        request: &AllocationRequest<MockResource>,
    ) -> Result<MockMemory, BackendError> {
        self.allocate_calls.fetch_add(1, Ordering::Relaxed);

        let heap = self.heap_of(request.memory_type_index).ok_or_else(|| {
            BackendError::Other(format!(
                "Unknown memory type {}",
                request.memory_type_index
            ))
        })?;
        let heap_size = self.properties.heaps.get(heap).map_or(0, |h| h.size);

        let mut state = self.state.lock();
        let used = state.heap_usage.get(heap).copied().unwrap_or(0);
        if used + request.size > heap_size {
            return Err(BackendError::OutOfDeviceMemory);
        }
        if let Some(usage) = state.heap_usage.get_mut(heap) {
            *usage += request.size;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.allocations.insert(
            id,
            MockAllocation {
                info: MockAllocationInfo {
                    size: request.size,
                    memory_type_index: request.memory_type_index,
                    dedicated: request.dedicated,
                    device_address: request.device_address,
                    mapped: false,
                },
                storage: None,
            },
        );

        Ok(MockMemory(id))
    }

    fn free_memory(&self, memory: MockMemory) {
        self.free_calls.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        let Some(allocation) = state.allocations.remove(&memory.0) else {
            tracing::error!("Mock backend: free of unknown memory {:?}", memory);
            return;
        };
        if let Some(heap) = self.heap_of(allocation.info.memory_type_index) {
            if let Some(usage) = state.heap_usage.get_mut(heap) {
                *usage -= allocation.info.size;
            }
        }
    }

    fn map_memory(
        &self,
        memory: MockMemory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, BackendError> {
        self.map_calls.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        let allocation = state
            .allocations
            .get_mut(&memory.0)
            .ok_or(BackendError::MemoryMapFailed)?;

        let host_visible = self
            .properties
            .types
            .get(allocation.info.memory_type_index as usize)
            .is_some_and(|ty| ty.flags.contains(MemoryPropertyFlags::HOST_VISIBLE));
        if !host_visible || allocation.info.mapped || offset + size > allocation.info.size {
            return Err(BackendError::MemoryMapFailed);
        }

        let len = allocation.info.size as usize;
        let storage = allocation
            .storage
            .get_or_insert_with(|| vec![0u8; len].into_boxed_slice());
        allocation.info.mapped = true;

        // The boxed slice does not move while the allocation is live.
        NonNull::new(storage[offset as usize..].as_mut_ptr()).ok_or(BackendError::MemoryMapFailed)
    }

    fn unmap_memory(&self, memory: MockMemory) {
        self.unmap_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(allocation) = self.state.lock().allocations.get_mut(&memory.0) {
            allocation.info.mapped = false;
        }
    }
}
