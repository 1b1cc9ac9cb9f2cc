use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use serde::Serialize;

use crate::types::Frame;

/// Counters for the handoff between the sample-stream thread and the consumer.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub total_pushed: u64,
    pub total_popped: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub capacity: usize,
}

/// Bounded FIFO of averaged frames.
///
/// A push into a full queue discards the incoming frame and keeps the queued
/// ones in order; overflow is counted, never reported as an error.
pub struct HandoffQueue {
    queue: ArrayQueue<Frame>,
    total_pushed: AtomicU64,
    total_popped: AtomicU64,
    total_dropped: AtomicU64,
}

impl HandoffQueue {
    /// `capacity` must be non-zero; the config layer enforces it.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            total_pushed: AtomicU64::new(0),
            total_popped: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking. Returns `false` when the frame was dropped.
    pub fn push(&self, frame: Frame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => {
                self.total_pushed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.total_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<Frame> {
        self.queue.pop().map(|frame| {
            self.total_popped.fetch_add(1, Ordering::Relaxed);
            frame
        })
    }

    /// Pops until empty, handing each frame to `apply` oldest first.
    /// Returns the number of frames drained.
    pub fn drain_with(&self, mut apply: impl FnMut(Frame)) -> usize {
        let mut drained = 0;
        while let Some(frame) = self.pop() {
            apply(frame);
            drained += 1;
        }
        drained
    }

    /// Discards queued frames without counting them as consumed.
    pub fn clear(&self) -> usize {
        let mut cleared = 0;
        while self.queue.pop().is_some() {
            cleared += 1;
        }
        cleared
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_popped: self.total_popped.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: f64) -> Frame {
        Frame {
            samples: vec![tag; 4],
            sample_spacing_ps: 1.0,
            pulse_period_ns: 16.0,
            ref_50ohm: 0.5,
            ref_unit_amp: 0.25,
        }
    }

    #[test]
    fn overflow_drops_the_newest_frame() {
        let queue = HandoffQueue::new(10);
        for i in 0..10 {
            assert!(queue.push(tagged(i as f64)));
        }
        assert!(!queue.push(tagged(10.0)));

        let mut order = Vec::new();
        let drained = queue.drain_with(|frame| order.push(frame.samples[0]));
        assert_eq!(drained, 10);
        assert_eq!(order, (0..10).map(|i| i as f64).collect::<Vec<_>>());

        let metrics = queue.metrics();
        assert_eq!(metrics.total_pushed, 10);
        assert_eq!(metrics.total_dropped, 1);
        assert_eq!(metrics.total_popped, 10);
        assert_eq!(metrics.current_size, 0);
    }

    #[test]
    fn clear_discards_without_counting_pops() {
        let queue = HandoffQueue::new(3);
        queue.push(tagged(1.0));
        queue.push(tagged(2.0));
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.metrics().current_size, 0);
        assert_eq!(queue.metrics().total_popped, 0);
        assert!(queue.push(tagged(3.0)));
        assert_eq!(queue.pop().map(|f| f.samples[0]), Some(3.0));
    }
}
