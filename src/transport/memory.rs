//! In-process transport
//!
//! Streams are plain queues: whoever owns a [`MemoryStream`] pushes samples
//! and channels opened on it pull them. Failures can be injected at every
//! transport operation.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Channel, PulledSample, SharedChannel, Transport};
use crate::error::TransportError;
use crate::types::{SampleData, StreamDescriptor};

/// An advertised in-process stream
pub struct MemoryStream {
    descriptor: StreamDescriptor,
    tx: Sender<PulledSample>,
    rx: Receiver<PulledSample>,
    clock_offset: Mutex<Result<f64, String>>,
    pending_pull_errors: AtomicUsize,
    pushed: AtomicUsize,
}

impl MemoryStream {
    fn new(descriptor: StreamDescriptor) -> Self {
        let (tx, rx) = unbounded();
        Self {
            descriptor,
            tx,
            rx,
            clock_offset: Mutex::new(Ok(0.0)),
            pending_pull_errors: AtomicUsize::new(0),
            pushed: AtomicUsize::new(0),
        }
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    /// Queue a sample for pulling
    pub fn push(&self, data: impl Into<SampleData>, timestamp: f64) {
        self.push_sample(PulledSample::new(data, timestamp));
    }

    pub fn push_sample(&self, sample: PulledSample) {
        // The stream holds its own receiver, so the send cannot fail.
        let _ = self.tx.send(sample);
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of samples queued but not yet pulled
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn pushed(&self) -> usize {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn set_clock_offset(&self, offset: f64) {
        *self.clock_offset.lock() = Ok(offset);
    }

    /// Make clock correction queries fail until the next `set_clock_offset`
    pub fn fail_clock_correction(&self, reason: impl Into<String>) {
        *self.clock_offset.lock() = Err(reason.into());
    }

    /// The next `count` pulls fail with a read error
    pub fn inject_pull_errors(&self, count: usize) {
        self.pending_pull_errors.fetch_add(count, Ordering::SeqCst);
    }

    fn take_pull_error(&self) -> bool {
        self.pending_pull_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct MemoryChannel {
    stream: Arc<MemoryStream>,
    closed: AtomicBool,
}

impl Channel for MemoryChannel {
    fn pull(&self, timeout: Duration) -> Result<Option<PulledSample>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.stream.take_pull_error() {
            return Err(TransportError::Pull("injected read failure".to_string()));
        }
        match self.stream.rx.recv_timeout(timeout) {
            Ok(sample) => Ok(Some(sample)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn clock_correction(&self) -> Result<f64, TransportError> {
        self.stream
            .clock_offset
            .lock()
            .clone()
            .map_err(TransportError::ClockCorrection)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Transport over in-process streams
#[derive(Default)]
pub struct MemoryTransport {
    streams: Mutex<Vec<Arc<MemoryStream>>>,
    resolve_failure: Mutex<Option<String>>,
    open_failures: Mutex<HashSet<String>>,
    resolve_calls: AtomicUsize,
    channels_opened: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a new stream
    pub fn add_stream(&self, descriptor: StreamDescriptor) -> Arc<MemoryStream> {
        let stream = Arc::new(MemoryStream::new(descriptor));
        self.streams.lock().push(stream.clone());
        stream
    }

    /// Stop advertising the stream with the given key
    pub fn remove_stream(&self, key: &str) {
        self.streams.lock().retain(|s| s.descriptor.key() != key);
    }

    /// Make every resolve fail with `reason` (None restores normal behaviour)
    pub fn fail_resolve(&self, reason: Option<&str>) {
        *self.resolve_failure.lock() = reason.map(str::to_string);
    }

    /// Make opening a channel on stream `key` fail
    pub fn fail_open(&self, key: &str, fail: bool) {
        let mut failures = self.open_failures.lock();
        if fail {
            failures.insert(key.to_string());
        } else {
            failures.remove(key);
        }
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::Relaxed)
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::Relaxed)
    }
}

impl Transport for MemoryTransport {
    fn resolve(&self, _timeout: Duration) -> Result<Vec<StreamDescriptor>, TransportError> {
        self.resolve_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(reason) = self.resolve_failure.lock().clone() {
            return Err(TransportError::Resolve(reason));
        }
        Ok(self
            .streams
            .lock()
            .iter()
            .map(|s| s.descriptor.clone())
            .collect())
    }

    fn open_channel(
        &self,
        descriptor: &StreamDescriptor,
        _max_buffer_samples: usize,
        _max_chunk_samples: usize,
    ) -> Result<SharedChannel, TransportError> {
        let key = descriptor.key();
        if self.open_failures.lock().contains(key) {
            return Err(TransportError::Open(format!("stream {} refused inlet", key)));
        }

        let stream = self
            .streams
            .lock()
            .iter()
            .find(|s| s.descriptor.key() == key)
            .cloned()
            .ok_or_else(|| TransportError::Open(format!("stream {} no longer advertised", key)))?;

        self.channels_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemoryChannel {
            stream,
            closed: AtomicBool::new(false),
        }))
    }
}
