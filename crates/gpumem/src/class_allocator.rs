//! Segregated-size suballocation within one memory type.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{AllocationRequest, DeviceMemoryBackend};
use crate::chunk::Chunk;
use crate::classes::AllocationClassInfo;
use crate::config::EmptyChunkPolicy;
use crate::error::{MemoryError, Result};
use crate::stats::ClassAllocatorStats;

/// A chunk plus its slot bookkeeping.
struct ChunkEntry<B: DeviceMemoryBackend> {
    chunk: Arc<Chunk<B>>,
    /// Bit `i` set means slot `i` is handed out.
    in_use: u64,
    in_use_count: u32,
}

/// Chunks of one class. Freed arena slots are recycled through
/// `free_entries` so chunk indices stay stable.
struct BucketState<B: DeviceMemoryBackend> {
    entries: Vec<Option<ChunkEntry<B>>>,
    free_entries: Vec<usize>,
}

impl<B: DeviceMemoryBackend> BucketState<B> {
    fn live(&self) -> impl Iterator<Item = &ChunkEntry<B>> {
        self.entries.iter().flatten()
    }

    fn remove(&mut self, index: usize) -> Option<ChunkEntry<B>> {
        let entry = self.entries.get_mut(index)?.take()?;
        self.free_entries.push(index);
        Some(entry)
    }
}

struct ClassBucket<B: DeviceMemoryBackend> {
    info: AllocationClassInfo,
    /// False when the slot size breaks the device granularity.
    usable: bool,
    state: Mutex<BucketState<B>>,
}

/// Allocator for all classes of a single memory type.
pub struct ClassAllocator<B: DeviceMemoryBackend> {
    memory_type_index: u32,
    device_address: bool,
    empty_chunk_policy: EmptyChunkPolicy,
    buckets: Vec<ClassBucket<B>>,
}

impl<B: DeviceMemoryBackend> ClassAllocator<B> {
    /// Create an allocator over `classes`.
    ///
    /// Classes whose slot size is not a multiple of `granularity` are kept in
    /// the table but never selected.
    pub fn new(
        memory_type_index: u32,
        classes: &[AllocationClassInfo],
        granularity: u64,
        device_address: bool,
        empty_chunk_policy: EmptyChunkPolicy,
    ) -> Self {
        let buckets = classes
            .iter()
            .map(|&info| ClassBucket {
                info,
                usable: info.is_usable_with_granularity(granularity),
                state: Mutex::new(BucketState {
                    entries: Vec::new(),
                    free_entries: Vec::new(),
                }),
            })
            .collect();

        Self {
            memory_type_index,
            device_address,
            empty_chunk_policy,
            buckets,
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// The class table this allocator was built with.
    pub fn classes(&self) -> impl Iterator<Item = AllocationClassInfo> + '_ {
        self.buckets.iter().map(|b| b.info)
    }

    /// Whether class `index` can be selected.
    pub fn is_class_usable(&self, index: usize) -> bool {
        self.buckets.get(index).is_some_and(|b| b.usable)
    }

    /// Index of the smallest usable class that fits `size` at `alignment`.
    pub fn class_for(&self, size: u64, alignment: u64) -> Option<usize> {
        let size = size.max(1);
        let alignment = alignment.max(1);
        self.buckets.iter().position(|b| {
            b.usable
                && b.info.sub_allocation_size >= size
                && b.info.sub_allocation_size % alignment == 0
        })
    }

    /// Largest slot size usable at `alignment`.
    pub fn max_suballocation_size(&self, alignment: u64) -> Option<u64> {
        let alignment = alignment.max(1);
        self.buckets
            .iter()
            .filter(|b| b.usable && b.info.sub_allocation_size % alignment == 0)
            .map(|b| b.info.sub_allocation_size)
            .max()
    }

    /// Claim one slot that fits `size` bytes at `alignment`.
    ///
    /// Returns the owning chunk and the byte offset of the slot.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn allocate(
        &self,
        backend: &B,
        size: u64,
        alignment: u64,
    ) -> Result<(Arc<Chunk<B>>, u64)> {
        let class_index =
            self.class_for(size, alignment)
                .ok_or(MemoryError::RequestTooLarge {
                    memory_type_index: self.memory_type_index,
                    size,
                    alignment,
                })?;
        let bucket = &self.buckets[class_index];
        let slots = bucket.info.slots_per_chunk();

        let mut state = bucket.state.lock();
        let found = state
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.in_use_count < slots));
        let index = match found {
            Some(index) => index,
            None => self.create_chunk(backend, class_index, &mut state)?,
        };

        let entry = state.entries[index]
            .as_mut()
            .expect("entry was just found or created");
        let slot = (!entry.in_use).trailing_zeros();
        debug_assert!(slot < slots);
        entry.in_use |= 1u64 << slot;
        entry.in_use_count += 1;

        let offset = u64::from(slot) * bucket.info.sub_allocation_size;
        Ok((Arc::clone(&entry.chunk), offset))
    }

    fn create_chunk(
        &self,
        backend: &B,
        class_index: usize,
        state: &mut BucketState<B>,
    ) -> Result<usize> {
        let info = self.buckets[class_index].info;
        let memory = backend.allocate_memory(&AllocationRequest {
            size: info.chunk_size,
            memory_type_index: self.memory_type_index,
            dedicated: None,
            device_address: self.device_address,
        })?;

        let index = state.free_entries.pop().unwrap_or(state.entries.len());
        let entry = ChunkEntry {
            chunk: Arc::new(Chunk::new(
                memory,
                info.chunk_size,
                self.memory_type_index,
                class_index,
                index,
            )),
            in_use: 0,
            in_use_count: 0,
        };
        if index == state.entries.len() {
            state.entries.push(Some(entry));
        } else {
            state.entries[index] = Some(entry);
        }

        tracing::debug!(
            "Created chunk of {} bytes for memory type {} (class {}, {} slots of {} bytes)",
            info.chunk_size,
            self.memory_type_index,
            class_index,
            info.slots_per_chunk(),
            info.sub_allocation_size
        );

        Ok(index)
    }

    /// Return the slot at `offset` of `chunk`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn free(&self, backend: &B, chunk: &Arc<Chunk<B>>, offset: u64) -> Result<()> {
        let bucket = self
            .buckets
            .get(chunk.class_index())
            .ok_or(MemoryError::InvalidHandle)?;
        let slot = offset / bucket.info.sub_allocation_size;
        if slot >= u64::from(bucket.info.slots_per_chunk()) {
            return Err(MemoryError::InvalidHandle);
        }
        let bit = 1u64 << slot;

        let mut state = bucket.state.lock();
        let entry = state
            .entries
            .get_mut(chunk.entry())
            .and_then(Option::as_mut)
            .filter(|e| Arc::ptr_eq(&e.chunk, chunk))
            .ok_or(MemoryError::InvalidHandle)?;

        if entry.in_use & bit == 0 {
            tracing::error!(
                "Double free of slot {} in chunk {:?} (memory type {})",
                slot,
                chunk.memory(),
                self.memory_type_index
            );
            return Err(MemoryError::InvalidHandle);
        }
        entry.in_use &= !bit;
        entry.in_use_count -= 1;

        if entry.in_use_count == 0 && self.empty_chunk_policy == EmptyChunkPolicy::Release {
            if let Some(empty) = state.remove(chunk.entry()) {
                empty.chunk.release(backend);
                tracing::debug!(
                    "Released empty chunk of memory type {} (class {})",
                    self.memory_type_index,
                    chunk.class_index()
                );
            }
        }

        Ok(())
    }

    /// Release every empty chunk. Returns how many were released.
    pub fn trim(&self, backend: &B) -> usize {
        let mut released = 0;
        for bucket in &self.buckets {
            let mut state = bucket.state.lock();
            let empty: Vec<usize> = state
                .entries
                .iter()
                .enumerate()
                .filter_map(|(i, e)| e.as_ref().filter(|e| e.in_use_count == 0).map(|_| i))
                .collect();
            for index in empty {
                if let Some(entry) = state.remove(index) {
                    entry.chunk.release(backend);
                    released += 1;
                }
            }
        }
        released
    }

    /// Usage summed across all classes.
    pub fn stats(&self) -> ClassAllocatorStats {
        let mut stats = ClassAllocatorStats::default();
        for bucket in &self.buckets {
            let state = bucket.state.lock();
            for entry in state.live() {
                stats.allocated_size += entry.chunk.size();
                stats.in_use_size +=
                    u64::from(entry.in_use_count) * bucket.info.sub_allocation_size;
                stats.chunk_count += 1;
            }
        }
        stats
    }

    /// Release every chunk. Returns the number of slots still handed out.
    pub fn destroy(&self, backend: &B) -> u32 {
        let mut leaked = 0;
        for bucket in &self.buckets {
            let mut state = bucket.state.lock();
            for entry in state.entries.drain(..).flatten() {
                leaked += entry.in_use_count;
                entry.chunk.release(backend);
            }
            state.free_entries.clear();
        }
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::{CONSTRAINED_CLASSES, KIB, MIB, NORMAL_CLASSES};
    use crate::mock::MockBackend;

    fn allocator(granularity: u64, policy: EmptyChunkPolicy) -> ClassAllocator<MockBackend> {
        ClassAllocator::new(0, &NORMAL_CLASSES, granularity, false, policy)
    }

    #[test]
    fn class_selection_is_smallest_fit() {
        let alloc = allocator(1, EmptyChunkPolicy::Retain);

        for size in [1, 100, 4 * KIB, 4 * KIB + 1, 200 * KIB, MIB, 3 * MIB, 100 * MIB, 128 * MIB] {
            let index = alloc.class_for(size, 1).unwrap();
            let chosen = NORMAL_CLASSES[index].sub_allocation_size;
            assert!(chosen >= size);
            assert!(
                NORMAL_CLASSES[..index]
                    .iter()
                    .all(|c| c.sub_allocation_size < size),
                "a smaller class would have fit {size}"
            );
        }
        assert_eq!(alloc.class_for(128 * MIB + 1, 1), None);
    }

    #[test]
    fn alignment_can_push_to_a_bigger_class() {
        let alloc = allocator(1, EmptyChunkPolicy::Retain);
        assert_eq!(alloc.class_for(100, 4 * KIB), Some(0));
        assert_eq!(alloc.class_for(100, 64 * KIB), Some(1));
        assert_eq!(alloc.class_for(100, MIB), Some(3));
    }

    #[test]
    fn misaligned_classes_are_never_selected() {
        let alloc = allocator(64 * KIB, EmptyChunkPolicy::Retain);
        assert!(!alloc.is_class_usable(0));
        assert!(alloc.is_class_usable(1));
        assert_eq!(alloc.class_for(100, 1), Some(1));
    }

    #[test]
    fn request_too_large() {
        let backend = MockBackend::discrete();
        let alloc = allocator(1, EmptyChunkPolicy::Retain);
        let err = alloc.allocate(&backend, 300 * MIB, 1).unwrap_err();
        assert!(matches!(err, MemoryError::RequestTooLarge { size, .. } if size == 300 * MIB));
        assert_eq!(backend.allocate_calls(), 0);
    }

    #[test]
    fn slots_fill_before_new_chunk() {
        let backend = MockBackend::discrete();
        let alloc = allocator(1, EmptyChunkPolicy::Retain);
        let slots = NORMAL_CLASSES[0].slots_per_chunk();

        let mut offsets = Vec::new();
        for _ in 0..slots {
            let (chunk, offset) = alloc.allocate(&backend, 100, 256).unwrap();
            assert_eq!(chunk.entry(), 0);
            offsets.push(offset);
        }
        assert_eq!(backend.allocate_calls(), 1);

        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), slots as usize);

        let (chunk, offset) = alloc.allocate(&backend, 100, 256).unwrap();
        assert_eq!(chunk.entry(), 1);
        assert_eq!(offset, 0);
        assert_eq!(backend.allocate_calls(), 2);
        assert_eq!(alloc.stats().chunk_count, 2);
    }

    #[test]
    fn freed_slot_is_reused() {
        let backend = MockBackend::discrete();
        let alloc = allocator(1, EmptyChunkPolicy::Retain);

        let (a, a_off) = alloc.allocate(&backend, 5 * KIB, 1).unwrap();
        let (_b, b_off) = alloc.allocate(&backend, 5 * KIB, 1).unwrap();
        assert_ne!(a_off, b_off);

        alloc.free(&backend, &a, a_off).unwrap();
        let (c, c_off) = alloc.allocate(&backend, 5 * KIB, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(c_off, a_off);
    }

    #[test]
    fn double_free_is_rejected() {
        let backend = MockBackend::discrete();
        let alloc = allocator(1, EmptyChunkPolicy::Retain);
        let (chunk, offset) = alloc.allocate(&backend, KIB, 1).unwrap();
        let (_keep, _) = alloc.allocate(&backend, KIB, 1).unwrap();

        alloc.free(&backend, &chunk, offset).unwrap();
        assert_eq!(
            alloc.free(&backend, &chunk, offset),
            Err(MemoryError::InvalidHandle)
        );
    }

    #[test]
    fn retain_policy_keeps_empty_chunks() {
        let backend = MockBackend::discrete();
        let alloc = allocator(1, EmptyChunkPolicy::Retain);

        let (chunk, offset) = alloc.allocate(&backend, 2 * MIB, 1).unwrap();
        alloc.free(&backend, &chunk, offset).unwrap();

        let stats = alloc.stats();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.in_use_size, 0);
        assert_eq!(backend.free_calls(), 0);

        assert_eq!(alloc.trim(&backend), 1);
        assert_eq!(alloc.stats().chunk_count, 0);
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn release_policy_frees_empty_chunks() {
        let backend = MockBackend::discrete();
        let alloc = allocator(1, EmptyChunkPolicy::Release);

        let (a, a_off) = alloc.allocate(&backend, 2 * MIB, 1).unwrap();
        let (b, b_off) = alloc.allocate(&backend, 2 * MIB, 1).unwrap();
        alloc.free(&backend, &a, a_off).unwrap();
        assert_eq!(backend.live_allocations(), 1);
        alloc.free(&backend, &b, b_off).unwrap();
        assert_eq!(backend.live_allocations(), 0);
        assert_eq!(alloc.stats(), ClassAllocatorStats::default());

        // The arena slot is recycled for the next chunk.
        let (c, _) = alloc.allocate(&backend, 2 * MIB, 1).unwrap();
        assert_eq!(c.entry(), 0);
    }

    #[test]
    fn constrained_table_one_slot_per_chunk() {
        let backend = MockBackend::discrete();
        let alloc = ClassAllocator::new(3, &CONSTRAINED_CLASSES, 1, false, EmptyChunkPolicy::Retain);

        let (a, a_off) = alloc.allocate(&backend, 512 * KIB, 1).unwrap();
        let (b, b_off) = alloc.allocate(&backend, 512 * KIB, 1).unwrap();
        assert_eq!((a_off, b_off), (0, 0));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.size(), MIB);
        assert!(alloc.allocate(&backend, 25 * MIB, 1).is_err());
    }

    #[test]
    fn destroy_reports_leaks() {
        let backend = MockBackend::discrete();
        let alloc = allocator(1, EmptyChunkPolicy::Retain);
        let _ = alloc.allocate(&backend, KIB, 1).unwrap();
        let _ = alloc.allocate(&backend, 20 * MIB, 1).unwrap();

        assert_eq!(alloc.destroy(&backend), 2);
        assert_eq!(backend.live_allocations(), 0);
    }
}
