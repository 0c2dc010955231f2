//! Memory type discovery and selection.

use crate::backend::{MemoryHeapFlags, MemoryProperties, MemoryPropertyFlags};

/// Flags a memory type must match exactly to be considered constrained.
pub const CONSTRAINED_FLAGS: MemoryPropertyFlags = MemoryPropertyFlags::DEVICE_LOCAL
    .union(MemoryPropertyFlags::HOST_VISIBLE)
    .union(MemoryPropertyFlags::HOST_COHERENT);

/// Properties of one memory type, resolved against its heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeInfo {
    pub index: u32,
    pub flags: MemoryPropertyFlags,
    pub heap_index: u32,
    pub heap_size: u64,
    /// Taken from the heap, not the type flags.
    pub device_local: bool,
    /// Small, fast pool visible to both host and device.
    pub constrained: bool,
}

impl MemoryTypeInfo {
    #[inline]
    #[must_use]
    pub const fn is_device_local(&self) -> bool {
        self.device_local
    }

    #[inline]
    #[must_use]
    pub const fn is_host_visible(&self) -> bool {
        self.flags.contains(MemoryPropertyFlags::HOST_VISIBLE)
    }

    #[inline]
    #[must_use]
    pub const fn is_host_coherent(&self) -> bool {
        self.flags.contains(MemoryPropertyFlags::HOST_COHERENT)
    }

    #[inline]
    #[must_use]
    pub const fn is_host_cached(&self) -> bool {
        self.flags.contains(MemoryPropertyFlags::HOST_CACHED)
    }

    #[inline]
    #[must_use]
    pub const fn heap_size(&self) -> u64 {
        self.heap_size
    }

    #[inline]
    #[must_use]
    pub const fn is_constrained(&self) -> bool {
        self.constrained
    }
}

/// Resolve the raw device tables into per-type info.
///
/// Types pointing at a heap the device did not report get a zero-sized,
/// host-side heap.
pub fn resolve_memory_types(
    properties: &MemoryProperties,
    constrained_heap_threshold: u64,
) -> Vec<MemoryTypeInfo> {
    properties
        .types
        .iter()
        .enumerate()
        .map(|(i, ty)| {
            let heap = properties.heaps.get(ty.heap_index as usize);
            let heap_size = heap.map_or(0, |h| h.size);
            let device_local = heap.is_some_and(|h| h.flags.contains(MemoryHeapFlags::DEVICE_LOCAL));
            let constrained = ty.flags == CONSTRAINED_FLAGS && heap_size <= constrained_heap_threshold;

            MemoryTypeInfo {
                index: i as u32,
                flags: ty.flags,
                heap_index: ty.heap_index,
                heap_size,
                device_local,
                constrained,
            }
        })
        .collect()
}

/// Pick a memory type for a resource.
///
/// `type_bits` is the resource's allowed-type mask. A candidate needs every
/// `prefer` flag and none of the `avoid` flags. Among candidates the one on
/// the larger heap wins, the lower index on ties.
pub fn find_memory_type(
    types: &[MemoryTypeInfo],
    type_bits: u32,
    prefer: MemoryPropertyFlags,
    avoid: MemoryPropertyFlags,
) -> Option<u32> {
    let mut best: Option<&MemoryTypeInfo> = None;

    for ty in types.iter().take(32) {
        if type_bits & (1u32 << ty.index) == 0 {
            continue;
        }
        if !ty.flags.contains(prefer) || ty.flags.intersects(avoid) {
            continue;
        }
        if best.map_or(true, |b| ty.heap_size > b.heap_size) {
            best = Some(ty);
        }
    }

    best.map(|ty| ty.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryHeap, MemoryType};
    use crate::classes::MIB;

    const GIB: u64 = 1024 * MIB;

    fn props(types: &[(MemoryPropertyFlags, u32)], heaps: &[(u64, bool)]) -> MemoryProperties {
        MemoryProperties {
            types: types
                .iter()
                .map(|&(flags, heap_index)| MemoryType { flags, heap_index })
                .collect(),
            heaps: heaps
                .iter()
                .map(|&(size, device_local)| MemoryHeap {
                    size,
                    flags: if device_local {
                        MemoryHeapFlags::DEVICE_LOCAL
                    } else {
                        MemoryHeapFlags::empty()
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn device_local_comes_from_heap() {
        let p = props(
            &[
                (MemoryPropertyFlags::DEVICE_LOCAL, 0),
                (MemoryPropertyFlags::HOST_VISIBLE, 0),
            ],
            &[(8 * GIB, true)],
        );
        let types = resolve_memory_types(&p, 256 * MIB);
        assert!(types[0].is_device_local());
        assert!(types[1].is_device_local());
        assert!(types[1].is_host_visible());
    }

    #[test]
    fn constrained_needs_exact_flags_and_small_heap() {
        let p = props(
            &[
                (CONSTRAINED_FLAGS, 1),
                (CONSTRAINED_FLAGS, 0),
                (CONSTRAINED_FLAGS | MemoryPropertyFlags::HOST_CACHED, 1),
                (CONSTRAINED_FLAGS, 2),
            ],
            &[(8 * GIB, true), (256 * MIB, true), (128 * MIB, true)],
        );
        let types = resolve_memory_types(&p, 256 * MIB);
        assert!(types[0].is_constrained());
        assert!(!types[1].is_constrained());
        assert!(!types[2].is_constrained());
        assert!(types[3].is_constrained());
    }

    #[test]
    fn find_respects_prefer_and_avoid() {
        let p = props(
            &[
                (MemoryPropertyFlags::DEVICE_LOCAL, 0),
                (
                    MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                    1,
                ),
                (CONSTRAINED_FLAGS, 2),
            ],
            &[(8 * GIB, true), (16 * GIB, false), (256 * MIB, true)],
        );
        let types = resolve_memory_types(&p, 256 * MIB);

        assert_eq!(
            find_memory_type(
                &types,
                !0,
                MemoryPropertyFlags::DEVICE_LOCAL,
                MemoryPropertyFlags::HOST_VISIBLE
            ),
            Some(0)
        );
        assert_eq!(
            find_memory_type(
                &types,
                !0,
                MemoryPropertyFlags::HOST_VISIBLE,
                MemoryPropertyFlags::DEVICE_LOCAL
            ),
            Some(1)
        );
        assert_eq!(
            find_memory_type(
                &types,
                0b100,
                MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::HOST_VISIBLE,
                MemoryPropertyFlags::empty()
            ),
            Some(2)
        );
        // Type 2 is excluded by the resource mask.
        assert_eq!(
            find_memory_type(
                &types,
                0b011,
                MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::HOST_VISIBLE,
                MemoryPropertyFlags::empty()
            ),
            None
        );
    }

    #[test]
    fn ties_go_to_the_larger_heap() {
        let p = props(
            &[
                (MemoryPropertyFlags::DEVICE_LOCAL, 0),
                (MemoryPropertyFlags::DEVICE_LOCAL, 1),
                (MemoryPropertyFlags::DEVICE_LOCAL, 1),
            ],
            &[(256 * MIB, true), (8 * GIB, true)],
        );
        let types = resolve_memory_types(&p, 256 * MIB);
        assert_eq!(
            find_memory_type(
                &types,
                !0,
                MemoryPropertyFlags::DEVICE_LOCAL,
                MemoryPropertyFlags::empty()
            ),
            Some(1)
        );
    }
}
