//! Relay performance counters and rolling averages

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::constants::{LATENCY_WINDOW, THROUGHPUT_WINDOW};

/// Point-in-time copy of the collected metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub samples_sent: u64,
    /// Samples evicted from the offline buffer
    pub samples_dropped: u64,
    /// Payload bytes handed to the broker
    pub bytes_sent: u64,
    pub connection_errors: u64,
    pub publish_errors: u64,
    /// Mean age of samples, by source timestamp, when handed to the relay
    pub average_latency_ms: f64,
    /// Samples per second
    pub average_throughput: f64,
    pub uptime_secs: f64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Streaming Metrics Summary:")?;
        writeln!(f, "-------------------------")?;
        writeln!(f, "Uptime: {:.1}s", self.uptime_secs)?;
        writeln!(f, "Samples sent: {}", self.samples_sent)?;
        writeln!(f, "Samples dropped: {}", self.samples_dropped)?;
        writeln!(f, "Bytes sent: {}", self.bytes_sent)?;
        writeln!(f, "Connection errors: {}", self.connection_errors)?;
        writeln!(f, "Publish errors: {}", self.publish_errors)?;
        writeln!(f, "Average latency: {:.2}ms", self.average_latency_ms)?;
        write!(f, "Average throughput: {:.2} samples/sec", self.average_throughput)
    }
}

struct Windows {
    /// Set by `start`; uptime is zero before that
    started_at: Option<Instant>,
    /// Previous send, for the throughput window
    last_sample_at: Option<Instant>,
    /// Seconds
    latencies: VecDeque<f64>,
    /// Samples per second
    throughput: VecDeque<f64>,
}

impl Windows {
    fn new() -> Self {
        Self {
            started_at: None,
            last_sample_at: None,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            throughput: VecDeque::with_capacity(THROUGHPUT_WINDOW),
        }
    }
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64, capacity: usize) {
    if window.len() >= capacity {
        window.pop_front();
    }
    window.push_back(value);
}

fn average(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    }
}

/// Thread-safe streaming metrics
pub struct MetricsCollector {
    samples_sent: AtomicU64,
    samples_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    connection_errors: AtomicU64,
    publish_errors: AtomicU64,
    /// Rolling windows and timing, behind one lock
    windows: Mutex<Windows>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            samples_sent: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            windows: Mutex::new(Windows::new()),
        }
    }

    /// Start the uptime clock and forget the last sample time
    pub fn start(&self) {
        let mut windows = self.windows.lock();
        windows.started_at = Some(Instant::now());
        windows.last_sample_at = None;
    }

    pub fn record_sample_sent(&self, bytes: usize) {
        self.record_sample_sent_at(bytes, Instant::now());
    }

    /// Record a sent sample observed at `now`
    pub fn record_sample_sent_at(&self, bytes: usize, now: Instant) {
        self.samples_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);

        let mut windows = self.windows.lock();
        if let Some(last) = windows.last_sample_at {
            let delta = now.saturating_duration_since(last).as_secs_f64();
            if delta > 0.0 {
                push_bounded(&mut windows.throughput, 1.0 / delta, THROUGHPUT_WINDOW);
            }
        }
        windows.last_sample_at = Some(now);
    }

    pub fn record_sample_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, seconds: f64) {
        if seconds.is_finite() {
            push_bounded(&mut self.windows.lock().latencies, seconds, LATENCY_WINDOW);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let windows = self.windows.lock();
        MetricsSnapshot {
            samples_sent: self.samples_sent.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            average_latency_ms: average(&windows.latencies) * 1000.0,
            average_throughput: average(&windows.throughput),
            uptime_secs: windows.started_at.map_or(0.0, |t| t.elapsed().as_secs_f64()),
        }
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        self.snapshot().to_string()
    }

    /// Zero every counter and window; uptime restarts on the next `start`
    pub fn reset(&self) {
        self.samples_sent.store(0, Ordering::Relaxed);
        self.samples_dropped.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.connection_errors.store(0, Ordering::Relaxed);
        self.publish_errors.store(0, Ordering::Relaxed);
        *self.windows.lock() = Windows::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_throughput_from_uniform_spacing() {
        let metrics = MetricsCollector::new();
        metrics.start();

        let base = Instant::now();
        for i in 0..5 {
            metrics.record_sample_sent_at(100, base + Duration::from_millis(10 * i));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.samples_sent, 5);
        assert_eq!(snapshot.bytes_sent, 500);
        assert!((snapshot.average_throughput - 100.0).abs() < 10.0);
    }

    #[test]
    fn test_first_sample_has_no_throughput() {
        let metrics = MetricsCollector::new();
        metrics.record_sample_sent(10);
        assert_eq!(metrics.snapshot().average_throughput, 0.0);
    }

    #[test]
    fn test_counters_and_latency() {
        let metrics = MetricsCollector::new();
        metrics.record_sample_dropped();
        metrics.record_sample_dropped();
        metrics.record_connection_error();
        metrics.record_publish_error();
        metrics.record_latency(0.010);
        metrics.record_latency(0.030);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.samples_dropped, 2);
        assert_eq!(snapshot.connection_errors, 1);
        assert_eq!(snapshot.publish_errors, 1);
        assert!((snapshot.average_latency_ms - 20.0).abs() < 1e-9);
        assert_eq!(snapshot.uptime_secs, 0.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = MetricsCollector::new();
        for _ in 0..LATENCY_WINDOW {
            metrics.record_latency(1.0);
        }
        for _ in 0..LATENCY_WINDOW {
            metrics.record_latency(0.0);
        }
        assert_eq!(metrics.snapshot().average_latency_ms, 0.0);
    }

    #[test]
    fn test_reset_and_summary() {
        let metrics = MetricsCollector::new();
        metrics.start();
        metrics.record_sample_sent(42);
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.samples_sent, 0);
        assert_eq!(snapshot.bytes_sent, 0);

        let summary = metrics.summary();
        assert!(summary.starts_with("Streaming Metrics Summary:"));
        assert!(summary.contains("Samples sent: 0"));
        assert!(summary.contains("Average throughput: 0.00 samples/sec"));
    }
}
