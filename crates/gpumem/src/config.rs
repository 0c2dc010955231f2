//! Manager configuration.

use crate::classes::{KIB, MIB};

/// What happens to a chunk whose last slot is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyChunkPolicy {
    /// Keep it for the next allocation of the same class.
    #[default]
    Retain,
    /// Give it back to the device right away.
    Release,
}

/// What happens when the device runs out of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OomPolicy {
    /// Log the failure and abort the process.
    #[default]
    Abort,
    /// Return [`MemoryError::OutOfDeviceMemory`](crate::MemoryError::OutOfDeviceMemory).
    ReturnError,
}

/// Configuration for [`GpuMemoryManager`](crate::GpuMemoryManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Request buffer device address support on every allocation.
    pub expose_device_address: bool,
    /// Heaps at or below this size holding device-local, host-visible,
    /// host-coherent types use the constrained class table.
    pub constrained_heap_threshold: u64,
    /// Granularity above this value triggers a warning at init.
    pub granularity_warning_threshold: u64,
    pub empty_chunk_policy: EmptyChunkPolicy,
    pub oom_policy: OomPolicy,
    /// Log the memory type table and class layout at init.
    pub log_memory_information: bool,
    /// Log every allocation at debug level.
    pub log_allocations: bool,
    /// Log every free at debug level.
    pub log_frees: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            expose_device_address: false,
            constrained_heap_threshold: 256 * MIB,
            granularity_warning_threshold: 4 * KIB,
            empty_chunk_policy: EmptyChunkPolicy::Retain,
            oom_policy: OomPolicy::Abort,
            log_memory_information: cfg!(debug_assertions),
            log_allocations: false,
            log_frees: false,
        }
    }
}

impl ManagerConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request buffer device address support on allocations.
    pub fn with_device_address(mut self, expose: bool) -> Self {
        self.expose_device_address = expose;
        self
    }

    /// Set the heap size limit for constrained memory types.
    pub fn with_constrained_heap_threshold(mut self, bytes: u64) -> Self {
        self.constrained_heap_threshold = bytes;
        self
    }

    /// Set the granularity above which init warns.
    pub fn with_granularity_warning_threshold(mut self, bytes: u64) -> Self {
        self.granularity_warning_threshold = bytes;
        self
    }

    /// Set what happens to chunks that become empty.
    pub fn with_empty_chunk_policy(mut self, policy: EmptyChunkPolicy) -> Self {
        self.empty_chunk_policy = policy;
        self
    }

    /// Set what happens on device out-of-memory.
    pub fn with_oom_policy(mut self, policy: OomPolicy) -> Self {
        self.oom_policy = policy;
        self
    }

    /// Enable or disable the memory table dump at init.
    pub fn with_memory_information_logging(mut self, enable: bool) -> Self {
        self.log_memory_information = enable;
        self
    }

    /// Enable or disable per-allocation and per-free logging.
    pub fn with_allocation_logging(mut self, allocations: bool, frees: bool) -> Self {
        self.log_allocations = allocations;
        self.log_frees = frees;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = ManagerConfig::default();
        assert!(!config.expose_device_address);
        assert_eq!(config.constrained_heap_threshold, 256 * MIB);
        assert_eq!(config.granularity_warning_threshold, 4 * KIB);
        assert_eq!(config.empty_chunk_policy, EmptyChunkPolicy::Retain);
        assert_eq!(config.oom_policy, OomPolicy::Abort);
        assert!(!config.log_allocations && !config.log_frees);
    }

    #[test]
    fn builder_overrides() {
        let config = ManagerConfig::new()
            .with_device_address(true)
            .with_constrained_heap_threshold(512 * MIB)
            .with_granularity_warning_threshold(64 * KIB)
            .with_empty_chunk_policy(EmptyChunkPolicy::Release)
            .with_oom_policy(OomPolicy::ReturnError)
            .with_memory_information_logging(false)
            .with_allocation_logging(true, false);

        assert!(config.expose_device_address);
        assert_eq!(config.constrained_heap_threshold, 512 * MIB);
        assert_eq!(config.granularity_warning_threshold, 64 * KIB);
        assert_eq!(config.empty_chunk_policy, EmptyChunkPolicy::Release);
        assert_eq!(config.oom_policy, OomPolicy::ReturnError);
        assert!(!config.log_memory_information);
        assert!(config.log_allocations && !config.log_frees);
    }
}
