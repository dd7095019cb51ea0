//! Sample acquisition from a connected stream
//!
//! Each reader runs one dedicated thread that pulls samples with a bounded
//! timeout, stamps them with clock metadata, keeps a rolling history,
//! feeds a drop-oldest delivery queue and invokes the sample callback.
//! Only [`StreamReader::stop`] ends the loop; read failures are logged,
//! backed off and retried.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::{
    DEFAULT_MAX_BUFFER_SAMPLES, DEFAULT_MAX_CHUNK_SAMPLES, DEFAULT_READER_BUFFER, JOIN_TIMEOUT,
    PULL_TIMEOUT, READ_ERROR_BACKOFF,
};
use crate::error::StreamError;
use crate::stream::buffer::{DeliveryQueue, SampleHistory};
use crate::stream::registry::StreamRegistry;
use crate::sync::TimestampSynchronizer;
use crate::transport::SharedChannel;
use crate::types::{Sample, StreamDescriptor};

/// Callback invoked on the acquisition thread for every sample
pub type SampleCallback = Arc<dyn Fn(Sample) + Send + Sync>;

/// Reader tuning
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Capacity of both the history ring and the delivery queue
    pub buffer_size: usize,
    /// Longest a single pull blocks before the run flag is rechecked
    pub pull_timeout: Duration,
    /// Pause after a failed read or while no channel is open
    pub error_backoff: Duration,
    /// Bound on waiting for the thread to start or stop
    pub join_timeout: Duration,
    /// Transport-side buffering, in seconds of data
    pub max_buffer_samples: usize,
    /// Transport chunk size; 0 leaves it to the sender
    pub max_chunk_samples: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_READER_BUFFER,
            pull_timeout: PULL_TIMEOUT,
            error_backoff: READ_ERROR_BACKOFF,
            join_timeout: JOIN_TIMEOUT,
            max_buffer_samples: DEFAULT_MAX_BUFFER_SAMPLES,
            max_chunk_samples: DEFAULT_MAX_CHUNK_SAMPLES,
        }
    }
}

impl ReaderConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// State shared between the reader handle and its acquisition thread
struct ReaderShared {
    history: SampleHistory,
    /// Consumed by `next_sample`/`drain_queue`
    queue: DeliveryQueue,
    samples_read: AtomicU64,
    read_errors: AtomicU64,
    /// Callback invocations that panicked
    callback_errors: AtomicU64,
}

/// One acquisition thread. Each start gets its own run flag, so a thread
/// detached by a timed-out stop can never be revived by a later start.
struct Worker {
    handle: JoinHandle<()>,
    done_rx: Receiver<()>,
    running: Arc<AtomicBool>,
}

impl Worker {
    /// Wait up to `timeout` for the loop to exit; hands the worker back if it did not
    fn join(self, timeout: Duration) -> Result<(), Worker> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) => {
                let _ = self.handle.join();
                Ok(())
            }
            Err(_) => Err(self),
        }
    }
}

/// Everything the acquisition thread owns
struct AcquisitionLoop {
    /// Registry key of the stream
    key: String,
    /// Source of the current channel, re-fetched after read errors
    registry: Arc<StreamRegistry>,
    synchronizer: Arc<TimestampSynchronizer>,
    shared: Arc<ReaderShared>,
    callback: Option<SampleCallback>,
    /// This worker's flag; cleared once and never set again
    running: Arc<AtomicBool>,
    pull_timeout: Duration,
    error_backoff: Duration,
}

impl AcquisitionLoop {
    fn run(self, started_tx: Sender<()>, done_tx: Sender<()>) {
        let _ = started_tx.send(());
        tracing::debug!("Reading loop started for {}", self.key);

        let mut channel: Option<SharedChannel> = None;
        let mut consecutive_errors: u64 = 0;

        while self.running.load(Ordering::Relaxed) {
            let current = match &channel {
                Some(current) => current.clone(),
                None => match self.registry.get_channel(&self.key) {
                    Some(fresh) => {
                        channel = Some(fresh.clone());
                        fresh
                    }
                    None => {
                        consecutive_errors += 1;
                        if consecutive_errors.is_power_of_two() {
                            tracing::warn!("No open channel for {}, waiting", self.key);
                        }
                        thread::sleep(self.error_backoff);
                        continue;
                    }
                },
            };

            match current.pull(self.pull_timeout) {
                Ok(None) => continue,
                Ok(Some(pulled)) => {
                    consecutive_errors = 0;
                    let mut sample = Sample::new(self.key.clone(), pulled.data, pulled.timestamp);
                    self.synchronizer.enrich(&mut sample, Some(current.as_ref()));
                    self.deliver(sample);
                }
                Err(e) => {
                    if !self.running.load(Ordering::Relaxed) {
                        break;
                    }
                    consecutive_errors += 1;
                    self.shared.read_errors.fetch_add(1, Ordering::Relaxed);
                    if consecutive_errors.is_power_of_two() {
                        tracing::error!(
                            "Error reading sample from {} ({} consecutive): {}",
                            self.key,
                            consecutive_errors,
                            e
                        );
                    }
                    // Re-fetch on the next pass so a reconnected channel is picked up
                    channel = None;
                    thread::sleep(self.error_backoff);
                }
            }
        }

        tracing::debug!("Reading loop stopped for {}", self.key);
        let _ = done_tx.send(());
    }

    fn deliver(&self, sample: Sample) {
        self.shared.history.push(sample.clone());
        if self.shared.queue.push(sample.clone()).is_some() {
            tracing::trace!("Delivery queue full for {}, dropped oldest sample", self.key);
        }
        self.shared.samples_read.fetch_add(1, Ordering::Relaxed);

        if let Some(callback) = &self.callback {
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(sample)));
            if result.is_err() {
                self.shared.callback_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Sample callback for {} panicked", self.key);
            }
        }
    }
}

/// Reads samples from one stream on a background thread
pub struct StreamReader {
    registry: Arc<StreamRegistry>,
    /// Name or source id as given by the caller
    stream_id: String,
    config: ReaderConfig,
    /// Possibly shared with other readers
    synchronizer: Arc<TimestampSynchronizer>,
    /// Handed to the worker at `start`
    callback: Option<SampleCallback>,
    /// Buffers and counters, kept across restarts
    shared: Arc<ReaderShared>,
    /// Resolved at `start`
    descriptor: Option<StreamDescriptor>,
    /// The live acquisition thread
    worker: Option<Worker>,
    /// A stopped thread that missed its join deadline
    lingering: Option<Worker>,
}

impl StreamReader {
    pub fn new(registry: Arc<StreamRegistry>, stream_id: impl Into<String>, config: ReaderConfig) -> Self {
        let shared = Arc::new(ReaderShared {
            history: SampleHistory::new(config.buffer_size),
            queue: DeliveryQueue::new(config.buffer_size),
            samples_read: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            callback_errors: AtomicU64::new(0),
        });

        Self {
            registry,
            stream_id: stream_id.into(),
            config,
            synchronizer: Arc::new(TimestampSynchronizer::new()),
            callback: None,
            shared,
            descriptor: None,
            worker: None,
            lingering: None,
        }
    }

    /// Set the per-sample callback (takes effect on the next `start`)
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Sample) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn set_callback(&mut self, callback: SampleCallback) {
        self.callback = Some(callback);
    }

    /// Share a synchronizer so clock offsets are cached across readers
    pub fn with_synchronizer(mut self, synchronizer: Arc<TimestampSynchronizer>) -> Self {
        self.synchronizer = synchronizer;
        self
    }

    /// Connect (if needed) and launch the acquisition thread.
    ///
    /// Returns once the thread is running, not once data has arrived.
    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.is_running() {
            tracing::warn!("Reader for {} already running", self.stream_id);
            return Ok(());
        }

        let key = self
            .registry
            .connect(
                &self.stream_id,
                self.config.max_buffer_samples,
                self.config.max_chunk_samples,
            )
            .map_err(|e| {
                tracing::error!("Failed to connect to stream {}: {}", self.stream_id, e);
                e
            })?;
        self.descriptor = self.registry.get_descriptor(&key);

        if let Some(previous) = self.lingering.take() {
            // Its flag is already cleared; give it one more chance to finish
            if let Err(previous) = previous.join(self.config.join_timeout) {
                tracing::warn!("Previous reader thread for {} still busy", key);
                self.lingering = Some(previous);
            }
        }

        let (started_tx, started_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let running = Arc::new(AtomicBool::new(true));

        let acquisition = AcquisitionLoop {
            key: key.clone(),
            registry: self.registry.clone(),
            synchronizer: self.synchronizer.clone(),
            shared: self.shared.clone(),
            callback: self.callback.clone(),
            running: running.clone(),
            pull_timeout: self.config.pull_timeout,
            error_backoff: self.config.error_backoff,
        };

        let handle = thread::Builder::new()
            .name(format!("reader-{}", key))
            .spawn(move || acquisition.run(started_tx, done_tx))
            .map_err(|e| StreamError::Spawn(e.to_string()))?;

        if started_rx.recv_timeout(self.config.join_timeout).is_err() {
            running.store(false, Ordering::SeqCst);
            return Err(StreamError::Spawn(format!("reader thread for {} did not start", key)));
        }

        self.worker = Some(Worker {
            handle,
            done_rx,
            running,
        });
        tracing::info!("Started reading from stream: {}", key);
        Ok(())
    }

    /// Signal the loop to exit and wait for it (bounded). No-op when idle.
    pub fn stop(&mut self) {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return,
        };
        worker.running.store(false, Ordering::SeqCst);

        match worker.join(self.config.join_timeout) {
            Ok(()) => tracing::info!("Stopped reading from stream: {}", self.stream_id),
            Err(worker) => {
                tracing::warn!(
                    "Reader for {} did not stop within {:?}, detaching",
                    self.stream_id,
                    self.config.join_timeout
                );
                self.lingering = Some(worker);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| worker.running.load(Ordering::SeqCst))
    }

    /// Most recent `max` buffered samples (all if `None`), oldest first, without draining
    pub fn get_buffered_samples(&self, max: Option<usize>) -> Vec<Sample> {
        self.shared.history.recent(max)
    }

    /// Empty both the history and the delivery queue
    pub fn clear_buffer(&self) {
        self.shared.history.clear();
        self.shared.queue.clear();
    }

    pub fn buffered_count(&self) -> usize {
        self.shared.history.len()
    }

    /// Take the oldest sample from the delivery queue
    pub fn next_sample(&self) -> Option<Sample> {
        self.shared.queue.pop()
    }

    /// Take everything from the delivery queue, oldest first
    pub fn drain_queue(&self) -> Vec<Sample> {
        self.shared.queue.drain()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.queue.len()
    }

    /// Samples evicted from the delivery queue because nobody consumed them
    pub fn dropped_count(&self) -> usize {
        self.shared.queue.overflow_count()
    }

    pub fn samples_read(&self) -> u64 {
        self.shared.samples_read.load(Ordering::Relaxed)
    }

    pub fn read_errors(&self) -> u64 {
        self.shared.read_errors.load(Ordering::Relaxed)
    }

    pub fn callback_errors(&self) -> u64 {
        self.shared.callback_errors.load(Ordering::Relaxed)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Descriptor resolved by the last successful `start`
    pub fn descriptor(&self) -> Option<&StreamDescriptor> {
        self.descriptor.as_ref()
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryStream, MemoryTransport};
    use crate::types::ChannelFormat;
    use parking_lot::Mutex;
    use std::time::Instant;

    fn fast_config(buffer_size: usize) -> ReaderConfig {
        ReaderConfig {
            buffer_size,
            pull_timeout: Duration::from_millis(5),
            error_backoff: Duration::from_millis(1),
            ..ReaderConfig::default()
        }
    }

    fn setup() -> (Arc<MemoryTransport>, Arc<MemoryStream>, Arc<StreamRegistry>) {
        let transport = Arc::new(MemoryTransport::new());
        let stream = transport.add_stream(StreamDescriptor::new("EEG", "EEG", 2, 100.0, ChannelFormat::Float32));
        stream.set_clock_offset(0.01);
        let registry = Arc::new(StreamRegistry::with_discovery_timeout(
            transport.clone(),
            Duration::from_millis(5),
        ));
        (transport, stream, registry)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_callback_sees_samples_in_pull_order() {
        let (_transport, stream, registry) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut reader = StreamReader::new(registry, "EEG", fast_config(100))
            .with_callback(move |s: Sample| sink.lock().push(s.timestamp()));
        reader.start().unwrap();
        assert!(reader.is_running());

        for i in 0..20 {
            stream.push(vec![i as f64, 0.0], i as f64);
        }
        assert!(wait_for(|| seen.lock().len() == 20));
        reader.stop();

        let expected: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(*seen.lock(), expected);
        assert_eq!(reader.samples_read(), 20);
    }

    #[test]
    fn test_samples_carry_clock_metadata() {
        let (_transport, stream, registry) = setup();
        let mut reader = StreamReader::new(registry, "EEG", fast_config(10));
        reader.start().unwrap();

        stream.push(vec![1.0, 2.0], 5.0);
        assert!(wait_for(|| reader.buffered_count() == 1));
        reader.stop();

        let sample = &reader.get_buffered_samples(None)[0];
        let meta = sample.metadata().unwrap();
        assert_eq!(meta.lsl_timestamp, 5.0);
        assert_eq!(meta.clock_offset, Some(0.01));
        assert!(meta.transmission_time.is_some());
        assert_eq!(sample.stream_id(), "EEG");
    }

    #[test]
    fn test_overflow_keeps_most_recent() {
        let (_transport, stream, registry) = setup();
        let mut reader = StreamReader::new(registry, "EEG", fast_config(5));
        reader.start().unwrap();

        for i in 0..12 {
            stream.push(vec![0.0, 0.0], i as f64);
        }
        assert!(wait_for(|| reader.samples_read() == 12));
        reader.stop();

        let history: Vec<f64> = reader.get_buffered_samples(None).iter().map(|s| s.timestamp()).collect();
        assert_eq!(history, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
        let queued: Vec<f64> = reader.drain_queue().iter().map(|s| s.timestamp()).collect();
        assert_eq!(queued, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
        assert_eq!(reader.dropped_count(), 7);
    }

    #[test]
    fn test_panicking_callback_does_not_kill_loop() {
        let (_transport, stream, registry) = setup();
        let mut reader = StreamReader::new(registry, "EEG", fast_config(10)).with_callback(|s: Sample| {
            if s.timestamp() == 0.0 {
                panic!("bad sample");
            }
        });
        reader.start().unwrap();

        stream.push(vec![0.0, 0.0], 0.0);
        stream.push(vec![0.0, 0.0], 1.0);
        assert!(wait_for(|| reader.samples_read() == 2));
        assert!(reader.is_running());
        assert_eq!(reader.callback_errors(), 1);
        reader.stop();
    }

    #[test]
    fn test_read_errors_are_retried() {
        let (_transport, stream, registry) = setup();
        let mut reader = StreamReader::new(registry, "EEG", fast_config(10));
        reader.start().unwrap();

        stream.inject_pull_errors(3);
        stream.push(vec![0.0, 0.0], 1.0);
        assert!(wait_for(|| reader.buffered_count() == 1));
        assert_eq!(reader.read_errors(), 3);
        assert!(reader.is_running());
        reader.stop();
    }

    #[test]
    fn test_reader_picks_up_reconnected_channel() {
        let (transport, stream, registry) = setup();
        let mut reader = StreamReader::new(registry.clone(), "EEG", fast_config(10));
        reader.start().unwrap();

        registry.disconnect("EEG");
        registry.connect("EEG", 360, 0).unwrap();
        assert_eq!(transport.channels_opened(), 2);

        stream.push(vec![0.0, 0.0], 3.0);
        assert!(wait_for(|| reader.buffered_count() == 1));
        reader.stop();
    }

    #[test]
    fn test_start_fails_for_unknown_stream() {
        let (_transport, _stream, registry) = setup();
        let mut reader = StreamReader::new(registry, "Nope", fast_config(10));
        assert!(matches!(reader.start(), Err(StreamError::NotFound(_))));
        assert!(!reader.is_running());
    }

    #[test]
    fn test_restart_after_stuck_stop_uses_single_loop() {
        let (_transport, stream, registry) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = ReaderConfig {
            join_timeout: Duration::from_millis(50),
            ..fast_config(20)
        };
        let mut reader = StreamReader::new(registry, "EEG", config).with_callback(move |s: Sample| {
            sink.lock().push((s.timestamp(), thread::current().id()));
            if s.timestamp() == 0.0 {
                thread::sleep(Duration::from_millis(300));
            }
        });
        reader.start().unwrap();

        stream.push(vec![0.0, 0.0], 0.0);
        assert!(wait_for(|| seen.lock().len() == 1));
        reader.stop();
        assert!(!reader.is_running());

        reader.start().unwrap();
        assert!(reader.is_running());
        for i in 1..=6 {
            stream.push(vec![0.0, 0.0], i as f64);
        }
        assert!(wait_for(|| seen.lock().len() == 7));
        // Let the stuck callback return so a revived loop would have time to pull
        thread::sleep(Duration::from_millis(350));
        reader.stop();

        let seen = seen.lock();
        assert_eq!(seen.len(), 7);
        let stuck_thread = seen[0].1;
        let restarted: Vec<f64> = seen[1..].iter().map(|(ts, _)| *ts).collect();
        assert_eq!(restarted, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let live_thread = seen[1].1;
        assert_ne!(live_thread, stuck_thread);
        assert!(seen[1..].iter().all(|(_, id)| *id == live_thread));
    }

    #[test]
    fn test_stop_when_idle_and_clear_buffer() {
        let (_transport, stream, registry) = setup();
        let mut reader = StreamReader::new(registry, "EEG", fast_config(10));
        reader.stop();

        reader.start().unwrap();
        stream.push(vec![0.0, 0.0], 1.0);
        assert!(wait_for(|| reader.buffered_count() == 1));
        reader.stop();
        reader.stop();

        reader.clear_buffer();
        assert_eq!(reader.buffered_count(), 0);
        assert_eq!(reader.queued_count(), 0);
        assert!(reader.next_sample().is_none());
    }
}
