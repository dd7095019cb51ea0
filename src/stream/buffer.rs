//! Bounded sample buffers for the acquisition loop
//!
//! Both buffers evict the oldest entry on overflow so the producer never
//! blocks behind a slow consumer.

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::Sample;

/// Lock-free delivery queue with drop-oldest overflow
pub struct DeliveryQueue {
    queue: ArrayQueue<Sample>,
    overflow_count: AtomicUsize,
}

impl DeliveryQueue {
    /// Create a queue holding at most `capacity` samples (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push a sample, evicting the oldest one if the queue is full.
    /// Returns the evicted sample.
    pub fn push(&self, sample: Sample) -> Option<Sample> {
        let evicted = self.queue.force_push(sample);
        if evicted.is_some() {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Pop the oldest queued sample
    pub fn pop(&self) -> Option<Sample> {
        self.queue.pop()
    }

    /// Remove and return everything queued, oldest first
    pub fn drain(&self) -> Vec<Sample> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(sample) = self.queue.pop() {
            out.push(sample);
        }
        out
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Number of samples evicted because the queue was full
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Rolling history of the most recent samples
///
/// Reads copy out without draining, so several consumers (visualization,
/// status endpoints) can look at the same window.
pub struct SampleHistory {
    samples: Mutex<VecDeque<Sample>>,
    capacity: usize,
}

impl SampleHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a sample, dropping the oldest on overflow
    pub fn push(&self, sample: Sample) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// The most recent `max` samples (all if `None`), oldest first
    pub fn recent(&self, max: Option<usize>) -> Vec<Sample> {
        let samples = self.samples.lock();
        let skip = match max {
            Some(max) => samples.len().saturating_sub(max),
            None => 0,
        };
        samples.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(i: usize) -> Sample {
        Sample::new("test", vec![i as f64], i as f64)
    }

    #[test]
    fn test_delivery_queue_basic() {
        let queue = DeliveryQueue::new(4);

        assert!(queue.push(sample(0)).is_none());
        assert!(queue.push(sample(1)).is_none());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().unwrap().timestamp(), 0.0);
        assert_eq!(queue.pop().unwrap().timestamp(), 1.0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_delivery_queue_evicts_oldest() {
        let queue = DeliveryQueue::new(2);
        queue.push(sample(0));
        queue.push(sample(1));

        let evicted = queue.push(sample(2)).unwrap();
        assert_eq!(evicted.timestamp(), 0.0);
        assert_eq!(queue.overflow_count(), 1);
        assert!(queue.is_full());

        let rest: Vec<f64> = queue.drain().iter().map(|s| s.timestamp()).collect();
        assert_eq!(rest, vec![1.0, 2.0]);
    }

    #[test]
    fn test_history_recent_does_not_drain() {
        let history = SampleHistory::new(10);
        for i in 0..5 {
            history.push(sample(i));
        }

        let last_two: Vec<f64> = history.recent(Some(2)).iter().map(|s| s.timestamp()).collect();
        assert_eq!(last_two, vec![3.0, 4.0]);
        assert_eq!(history.recent(None).len(), 5);
        assert_eq!(history.recent(Some(100)).len(), 5);
        assert_eq!(history.len(), 5);

        history.clear();
        assert!(history.is_empty());
    }

    proptest! {
        #[test]
        fn prop_buffers_keep_most_recent(capacity in 1usize..64, count in 0usize..256) {
            let queue = DeliveryQueue::new(capacity);
            let history = SampleHistory::new(capacity);
            for i in 0..count {
                queue.push(sample(i));
                history.push(sample(i));
            }

            let expected: Vec<f64> = (count.saturating_sub(capacity)..count).map(|i| i as f64).collect();
            let from_history: Vec<f64> = history.recent(None).iter().map(|s| s.timestamp()).collect();
            let from_queue: Vec<f64> = queue.drain().iter().map(|s| s.timestamp()).collect();

            prop_assert_eq!(&from_history, &expected);
            prop_assert_eq!(&from_queue, &expected);
            prop_assert_eq!(queue.overflow_count(), count.saturating_sub(capacity));
        }
    }
}
