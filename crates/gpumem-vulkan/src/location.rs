//! Memory type selection by intended usage.

use gpumem::{DeviceMemoryBackend, GpuMemoryManager, MemoryPropertyFlags as Flags};

/// Where a resource's memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLocation {
    /// Device memory the host never touches.
    #[default]
    GpuOnly,
    /// Host memory written by the CPU and read by the GPU.
    CpuToGpu,
    /// Host memory written by the GPU and read back by the CPU.
    GpuToCpu,
    /// Device-local memory the CPU can write directly, falling back to plain
    /// host memory when the device has none.
    DeviceMappable,
}

const HOST: Flags = Flags::HOST_VISIBLE.union(Flags::HOST_COHERENT);

/// `(prefer, avoid)` pairs tried in order.
const GPU_ONLY: &[(Flags, Flags)] = &[
    (Flags::DEVICE_LOCAL, Flags::HOST_VISIBLE),
    (Flags::DEVICE_LOCAL, Flags::empty()),
    (Flags::empty(), Flags::empty()),
];

const CPU_TO_GPU: &[(Flags, Flags)] = &[
    (HOST, Flags::DEVICE_LOCAL.union(Flags::HOST_CACHED)),
    (HOST, Flags::DEVICE_LOCAL),
    (HOST, Flags::empty()),
    (Flags::HOST_VISIBLE, Flags::empty()),
];

// Cached reads matter more than coherence for readback.
const GPU_TO_CPU: &[(Flags, Flags)] = &[
    (HOST.union(Flags::HOST_CACHED), Flags::empty()),
    (Flags::HOST_VISIBLE.union(Flags::HOST_CACHED), Flags::empty()),
    (Flags::HOST_VISIBLE, Flags::empty()),
];

const DEVICE_MAPPABLE: &[(Flags, Flags)] = &[
    (HOST.union(Flags::DEVICE_LOCAL), Flags::empty()),
    (HOST, Flags::empty()),
];

impl MemoryLocation {
    /// Preference ladder for this location.
    pub fn ladder(self) -> &'static [(Flags, Flags)] {
        match self {
            Self::GpuOnly => GPU_ONLY,
            Self::CpuToGpu => CPU_TO_GPU,
            Self::GpuToCpu => GPU_TO_CPU,
            Self::DeviceMappable => DEVICE_MAPPABLE,
        }
    }

    /// Whether the chosen memory must be host visible.
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }
}

/// Walk the location's ladder and return the first memory type that fits.
///
/// Falling through to the last rung of a host-visible ladder is logged as a
/// warning.
pub fn select_memory_type<B: DeviceMemoryBackend>(
    manager: &GpuMemoryManager<B>,
    type_bits: u32,
    location: MemoryLocation,
) -> Option<u32> {
    let (memory_type, step) = select_with_step(manager, type_bits, location)?;
    if is_last_resort(location, step) {
        tracing::warn!(
            "Using a fallback mode for {:?} memory (memory type {})",
            location,
            memory_type
        );
    }
    Some(memory_type)
}

/// The chosen memory type and the ladder rung that matched.
fn select_with_step<B: DeviceMemoryBackend>(
    manager: &GpuMemoryManager<B>,
    type_bits: u32,
    location: MemoryLocation,
) -> Option<(u32, usize)> {
    location
        .ladder()
        .iter()
        .enumerate()
        .find_map(|(step, &(prefer, avoid))| {
            manager
                .find_memory_type(type_bits, prefer, avoid)
                .map(|ty| (ty, step))
        })
}

fn is_last_resort(location: MemoryLocation, step: usize) -> bool {
    let ladder = location.ladder();
    location.is_host_visible() && ladder.len() > 1 && step + 1 == ladder.len()
}
