//! Deferred freeing for multi-frame-in-flight rendering.
//!
//! Memory used by a submitted frame cannot be reused until the GPU is done
//! with that frame. Handles queued here are freed once enough frames have
//! passed.

use std::collections::VecDeque;

use crate::backend::DeviceMemoryBackend;
use crate::error::Result;
use crate::handle::GpuMemoryHandle;
use crate::manager::GpuMemoryManager;

/// A handle waiting to be freed.
pub struct PendingFree<B: DeviceMemoryBackend> {
    pub handle: GpuMemoryHandle<B>,
    /// Frame number when the handle was queued.
    pub frame_queued: u64,
}

/// Queue of handles freed after `frames_in_flight` frames.
pub struct DeferredFreeQueue<B: DeviceMemoryBackend> {
    pending: VecDeque<PendingFree<B>>,
    frames_in_flight: usize,
}

impl<B: DeviceMemoryBackend> DeferredFreeQueue<B> {
    /// Create a queue that keeps handles alive for `frames_in_flight` frames.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue a handle. Empty handles are dropped.
    pub fn queue(&mut self, handle: GpuMemoryHandle<B>, frame_number: u64) {
        if handle.is_empty() {
            return;
        }
        self.pending.push_back(PendingFree {
            handle,
            frame_queued: frame_number,
        });
    }

    /// Return to the manager every handle queued more than `frames_in_flight`
    /// frames before `current_frame_number`, and report how many went back.
    ///
    /// Handles queued within the window stay pending.
    pub fn process(
        &mut self,
        manager: &GpuMemoryManager<B>,
        current_frame_number: u64,
    ) -> Result<usize> {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        // The queue is ordered by frame, stop at the first handle still in use.
        let mut freed = 0;
        while let Some(pending) = self.pending.front_mut() {
            if pending.frame_queued >= cutoff {
                break;
            }
            manager.free_memory(&mut pending.handle)?;
            self.pending.pop_front();
            freed += 1;
        }

        Ok(freed)
    }

    /// Return every pending handle regardless of age.
    ///
    /// Nothing queued may still be referenced by submitted GPU work.
    pub fn flush(&mut self, manager: &GpuMemoryManager<B>) -> Result<usize> {
        let mut freed = 0;
        while let Some(mut pending) = self.pending.pop_front() {
            manager.free_memory(&mut pending.handle)?;
            freed += 1;
        }
        Ok(freed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Change how many frames a queued handle waits before it is freed.
    pub fn set_frames_in_flight(&mut self, frames_in_flight: usize) {
        self.frames_in_flight = frames_in_flight;
    }
}
