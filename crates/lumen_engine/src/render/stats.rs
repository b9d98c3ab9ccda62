//! Frame statistics
//!
//! Components report through a shared [`StatsSink`] handed out by the
//! [`RenderContext`](super::RenderContext). [`FrameStats`] is the lock-free
//! default implementation.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Weight of the newest sample in the smoothed frame time
const FRAME_TIME_SMOOTHING: f32 = 0.1;

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Frames submitted for presentation
    pub frames_submitted: u64,
    /// Frames skipped because the swapchain was being rebuilt
    pub frames_skipped: u64,
    /// Swapchain rebuilds
    pub swapchain_rebuilds: u64,
    /// Exponentially smoothed frame time in seconds
    pub smoothed_frame_time: f32,
}

impl StatsSnapshot {
    /// Frames per second derived from the smoothed frame time
    pub fn fps(&self) -> f32 {
        if self.smoothed_frame_time > 0.0 {
            1.0 / self.smoothed_frame_time
        } else {
            0.0
        }
    }
}

/// Receiver of per-frame statistics
pub trait StatsSink: Send + Sync {
    /// Record the CPU time of the last frame
    fn record_frame_time(&self, seconds: f32);

    /// A frame was submitted
    fn record_submitted(&self);

    /// A frame was skipped
    fn record_skipped(&self);

    /// The swapchain was rebuilt
    fn record_swapchain_rebuild(&self);

    /// Current values
    fn snapshot(&self) -> StatsSnapshot;
}

/// Atomic counters plus a smoothed frame time
#[derive(Debug, Default)]
pub struct FrameStats {
    submitted: AtomicU64,
    skipped: AtomicU64,
    rebuilds: AtomicU64,
    frame_time_bits: AtomicU32,
}

impl FrameStats {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatsSink for FrameStats {
    fn record_frame_time(&self, seconds: f32) {
        // fetch_update never fails when the closure always returns Some
        let _ = self
            .frame_time_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let previous = f32::from_bits(bits);
                let next = if previous == 0.0 {
                    seconds
                } else {
                    previous + (seconds - previous) * FRAME_TIME_SMOOTHING
                };
                Some(next.to_bits())
            });
    }

    fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_swapchain_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_submitted: self.submitted.load(Ordering::Relaxed),
            frames_skipped: self.skipped.load(Ordering::Relaxed),
            swapchain_rebuilds: self.rebuilds.load(Ordering::Relaxed),
            smoothed_frame_time: f32::from_bits(self.frame_time_bits.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let stats = FrameStats::new();
        stats.record_submitted();
        stats.record_submitted();
        stats.record_skipped();
        stats.record_swapchain_rebuild();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_submitted, 2);
        assert_eq!(snapshot.frames_skipped, 1);
        assert_eq!(snapshot.swapchain_rebuilds, 1);
    }

    #[test]
    fn test_frame_time_smoothing() {
        let stats = FrameStats::new();
        stats.record_frame_time(0.02);
        assert_relative_eq!(stats.snapshot().smoothed_frame_time, 0.02);
        stats.record_frame_time(0.03);
        assert_relative_eq!(stats.snapshot().smoothed_frame_time, 0.021, epsilon = 1e-6);
        assert_relative_eq!(stats.snapshot().fps(), 1.0 / 0.021, epsilon = 1e-2);
    }

    #[test]
    fn test_shared_across_threads() {
        let stats = Arc::new(FrameStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stats.record_submitted();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().frames_submitted, 400);
    }
}
