//! Memory usage statistics.

use std::ops::AddAssign;

/// Usage of one class allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassAllocatorStats {
    /// Bytes obtained from the device for chunks.
    pub allocated_size: u64,
    /// Bytes of slots currently handed out.
    pub in_use_size: u64,
    /// Live chunks, empty ones included.
    pub chunk_count: u32,
}

impl AddAssign for ClassAllocatorStats {
    fn add_assign(&mut self, rhs: Self) {
        self.allocated_size += rhs.allocated_size;
        self.in_use_size += rhs.in_use_size;
        self.chunk_count += rhs.chunk_count;
    }
}

/// Usage of the whole manager.
///
/// Device and host buckets are split by each memory type's heap. Dedicated
/// allocations are folded into the device bucket and also reported on
/// their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuMemoryManagerStats {
    pub device_memory_allocated: u64,
    pub device_memory_in_use: u64,
    pub device_chunk_count: u32,
    pub host_memory_allocated: u64,
    pub host_memory_in_use: u64,
    pub host_chunk_count: u32,
    pub dedicated_memory: u64,
    pub dedicated_count: u32,
}

impl GpuMemoryManagerStats {
    /// Total bytes obtained from the device.
    pub fn total_allocated(&self) -> u64 {
        self.device_memory_allocated + self.host_memory_allocated
    }

    /// Total bytes handed out to callers.
    pub fn total_in_use(&self) -> u64 {
        self.device_memory_in_use + self.host_memory_in_use
    }

    /// Get a human-readable summary.
    pub fn summary(&self) -> String {
        const MB: f64 = 1024.0 * 1024.0;
        format!(
            "device {:.1}/{:.1} MB in {} chunks, host {:.1}/{:.1} MB in {} chunks, {} dedicated ({:.1} MB)",
            self.device_memory_in_use as f64 / MB,
            self.device_memory_allocated as f64 / MB,
            self.device_chunk_count,
            self.host_memory_in_use as f64 / MB,
            self.host_memory_allocated as f64 / MB,
            self.host_chunk_count,
            self.dedicated_count,
            self.dedicated_memory as f64 / MB,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_stats_accumulate() {
        let mut total = ClassAllocatorStats::default();
        total += ClassAllocatorStats {
            allocated_size: 256 * 1024,
            in_use_size: 4096,
            chunk_count: 1,
        };
        total += ClassAllocatorStats {
            allocated_size: 4 * 1024 * 1024,
            in_use_size: 0,
            chunk_count: 1,
        };
        assert_eq!(total.allocated_size, 256 * 1024 + 4 * 1024 * 1024);
        assert_eq!(total.in_use_size, 4096);
        assert_eq!(total.chunk_count, 2);
    }

    #[test]
    fn totals_and_summary() {
        let stats = GpuMemoryManagerStats {
            device_memory_allocated: 3 * 1024 * 1024,
            device_memory_in_use: 1024 * 1024,
            device_chunk_count: 1,
            host_memory_allocated: 1024 * 1024,
            host_memory_in_use: 0,
            host_chunk_count: 1,
            dedicated_memory: 0,
            dedicated_count: 0,
        };
        assert_eq!(stats.total_allocated(), 4 * 1024 * 1024);
        assert_eq!(stats.total_in_use(), 1024 * 1024);
        assert!(stats.summary().starts_with("device 1.0/3.0 MB in 1 chunks"));
    }
}
