//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! When using multiple frames in flight, GPU resources cannot be released
//! immediately as they may still be in use by a previous frame. This module
//! provides a queue that holds resources until no in-flight frame can
//! reference them, then drops them so their own teardown runs.

use std::collections::VecDeque;

/// A resource pending deletion.
struct PendingDeletion<T> {
    resource: T,
    /// Frame number when this resource was queued for deletion.
    frame_queued: u64,
}

/// Queue for deferred resource deletions.
///
/// Resources are queued with a frame number and only dropped once enough
/// frames have passed to guarantee they are no longer in use by any
/// in-flight frame. Works with any owning type whose `Drop` releases the
/// underlying object, e.g. [`AllocatedBuffer`](crate::memory::AllocatedBuffer)
/// or [`AllocatedImage`](crate::memory::AllocatedImage).
pub struct DeferredDeletionQueue<T> {
    pending: VecDeque<PendingDeletion<T>>,
    /// Number of frames in flight (determines how long to wait before freeing).
    frames_in_flight: usize,
}

impl<T> DeferredDeletionQueue<T> {
    /// Create a new deferred deletion queue.
    ///
    /// Resources will be kept for `frames_in_flight` frames before being
    /// dropped.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue a resource for deferred deletion at the current frame number.
    pub fn queue(&mut self, resource: T, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            resource,
            frame_queued: frame_number,
        });
    }

    /// Drop the resources that are safe to delete.
    ///
    /// Call this at the start of each frame.
    pub fn process(&mut self, current_frame_number: u64) {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        // Frame numbers are non-decreasing in queue order, so only the front
        // can have matured.
        while let Some(front) = self.pending.front() {
            if front.frame_queued >= cutoff {
                break;
            }
            self.pending.pop_front();
        }
    }

    /// Drop all pending resources immediately.
    ///
    /// Call this during shutdown after `device_wait_idle()`.
    pub fn flush(&mut self) {
        self.pending.clear();
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Update the frames in flight count.
    ///
    /// Call this when the swapchain is recreated with a different image count.
    pub fn set_frames_in_flight(&mut self, frames_in_flight: usize) {
        self.frames_in_flight = frames_in_flight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountedDrop(Arc<AtomicUsize>);

    impl Drop for CountedDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn resources_survive_while_frames_are_in_flight() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut queue = DeferredDeletionQueue::new(2);

        queue.queue(CountedDrop(Arc::clone(&drops)), 0);

        queue.process(1);
        queue.process(2);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_count(), 1);

        queue.process(3);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn only_matured_resources_are_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut queue = DeferredDeletionQueue::new(2);

        queue.queue(CountedDrop(Arc::clone(&drops)), 0);
        queue.queue(CountedDrop(Arc::clone(&drops)), 2);

        queue.process(3);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 1);

        queue.process(5);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flush_drops_everything() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut queue = DeferredDeletionQueue::new(3);

        queue.queue(CountedDrop(Arc::clone(&drops)), 0);
        queue.queue(CountedDrop(Arc::clone(&drops)), 1);

        queue.flush();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn shrinking_frames_in_flight_matures_sooner() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut queue = DeferredDeletionQueue::new(10);

        queue.queue(CountedDrop(Arc::clone(&drops)), 0);
        queue.process(3);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        queue.set_frames_in_flight(2);
        queue.process(3);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
