//! Allocation class tables.
//!
//! An allocation class is a size bucket: chunks of `chunk_size` bytes cut into
//! equal slots of `sub_allocation_size` bytes. A request is served by the
//! smallest class whose slot can hold it.

/// Bytes in a kibibyte.
pub const KIB: u64 = 1024;
/// Bytes in a mebibyte.
pub const MIB: u64 = 1024 * KIB;

/// Upper bound of slots per chunk. The slot tracker is a `u64` bitset.
pub const MAX_SLOTS_PER_CHUNK: u64 = 64;

/// One size bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationClassInfo {
    /// Size of every chunk of this class.
    pub chunk_size: u64,
    /// Size of every slot inside a chunk.
    pub sub_allocation_size: u64,
}

impl AllocationClassInfo {
    pub const fn new(chunk_size: u64, sub_allocation_size: u64) -> Self {
        Self {
            chunk_size,
            sub_allocation_size,
        }
    }

    /// Number of slots in one chunk.
    #[inline]
    #[must_use]
    pub const fn slots_per_chunk(&self) -> u32 {
        (self.chunk_size / self.sub_allocation_size) as u32
    }

    /// Whether slots of this class keep neighbours `granularity` apart.
    #[inline]
    #[must_use]
    pub const fn is_usable_with_granularity(&self, granularity: u64) -> bool {
        self.sub_allocation_size % granularity == 0
    }
}

/// Classes for ordinary memory types.
pub const NORMAL_CLASSES: [AllocationClassInfo; 7] = [
    AllocationClassInfo::new(256 * KIB, 4 * KIB),
    AllocationClassInfo::new(4 * MIB, 64 * KIB),
    AllocationClassInfo::new(16 * MIB, 256 * KIB),
    AllocationClassInfo::new(32 * MIB, MIB),
    AllocationClassInfo::new(64 * MIB, 8 * MIB),
    AllocationClassInfo::new(128 * MIB, 32 * MIB),
    AllocationClassInfo::new(256 * MIB, 128 * MIB),
];

/// Classes for small device-local + host-visible pools (ReBAR style).
///
/// One slot per chunk so nothing of the pool is reserved ahead of use.
pub const CONSTRAINED_CLASSES: [AllocationClassInfo; 3] = [
    AllocationClassInfo::new(MIB, MIB),
    AllocationClassInfo::new(12 * MIB, 12 * MIB),
    AllocationClassInfo::new(24 * MIB, 24 * MIB),
];

const fn table_is_valid(table: &[AllocationClassInfo]) -> bool {
    let mut i = 0;
    while i < table.len() {
        let class = table[i];
        if class.sub_allocation_size == 0
            || class.chunk_size % class.sub_allocation_size != 0
            || class.chunk_size / class.sub_allocation_size > MAX_SLOTS_PER_CHUNK
        {
            return false;
        }
        if i > 0 && table[i - 1].sub_allocation_size >= class.sub_allocation_size {
            return false;
        }
        i += 1;
    }
    true
}

const _: () = assert!(table_is_valid(&NORMAL_CLASSES));
const _: () = assert!(table_is_valid(&CONSTRAINED_CLASSES));
