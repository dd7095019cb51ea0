//! Stream discovery and connection management
//!
//! The registry owns every discovered [`StreamDescriptor`] and every open
//! channel. Both tables sit behind one mutex; transport resolves run outside
//! it and are merged afterwards so a slow network never blocks connect or
//! disconnect callers.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::{DEFAULT_DISCOVERY_TIMEOUT, JOIN_TIMEOUT};
use crate::error::StreamError;
use crate::transport::{SharedChannel, Transport};
use crate::types::{StreamDescriptor, StreamStatus};

/// Both tables are keyed by [`StreamDescriptor::key`]
#[derive(Default)]
struct Tables {
    /// Every stream seen by a discovery round
    descriptors: HashMap<String, StreamDescriptor>,
    /// Open channels; at most one per stream
    connections: HashMap<String, SharedChannel>,
}

impl Tables {
    /// Map a user-supplied id (key, uid or name) to a registry key
    fn resolve_key(&self, id: &str) -> Option<String> {
        if self.descriptors.contains_key(id) || self.connections.contains_key(id) {
            return Some(id.to_string());
        }
        self.descriptors
            .values()
            .find(|d| d.matches(id))
            .map(|d| d.key().to_string())
    }
}

struct RegistryInner {
    transport: Arc<dyn Transport>,
    /// Wait per discovery round
    discovery_timeout: Duration,
    tables: Mutex<Tables>,
}

impl RegistryInner {
    fn discover(
        &self,
        name: Option<&str>,
        stream_type: Option<&str>,
        timeout: Option<Duration>,
    ) -> Vec<StreamDescriptor> {
        let timeout = timeout.unwrap_or(self.discovery_timeout);
        tracing::debug!("Discovering streams (timeout: {:?})", timeout);

        let resolved = match self.transport.resolve(timeout) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!("Error during stream discovery: {}", e);
                return Vec::new();
            }
        };

        let matching: Vec<StreamDescriptor> = resolved
            .into_iter()
            .filter(|d| name.map_or(true, |n| d.name == n))
            .filter(|d| stream_type.map_or(true, |t| d.stream_type == t))
            .collect();

        let mut tables = self.tables.lock();
        let discovered = matching
            .into_iter()
            .map(|mut descriptor| {
                let key = descriptor.key().to_string();
                descriptor.status = tables
                    .descriptors
                    .get(&key)
                    .map(|existing| existing.status)
                    .unwrap_or(StreamStatus::Disconnected);
                tracing::debug!(
                    "Discovered stream: {} ({}) [{}]",
                    descriptor.name,
                    descriptor.stream_type,
                    descriptor.status
                );
                tables.descriptors.insert(key, descriptor.clone());
                descriptor
            })
            .collect::<Vec<_>>();

        tracing::debug!("Discovered {} stream(s)", discovered.len());
        discovered
    }
}

/// Background discovery thread and its stop signal
struct DiscoveryWorker {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Registry of discovered streams and their open channels
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
    /// Continuous discovery, when running
    discovery: Mutex<Option<DiscoveryWorker>>,
}

impl StreamRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_discovery_timeout(transport, DEFAULT_DISCOVERY_TIMEOUT)
    }

    pub fn with_discovery_timeout(transport: Arc<dyn Transport>, discovery_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                discovery_timeout,
                tables: Mutex::new(Tables::default()),
            }),
            discovery: Mutex::new(None),
        }
    }

    /// Discover advertised streams, optionally filtered by exact name and type.
    ///
    /// Never fails: transport errors are logged and yield an empty list.
    pub fn discover(
        &self,
        name: Option<&str>,
        stream_type: Option<&str>,
        timeout: Option<Duration>,
    ) -> Vec<StreamDescriptor> {
        self.inner.discover(name, stream_type, timeout)
    }

    /// Open a channel to a stream, returning its registry key.
    ///
    /// Idempotent: an already connected stream returns immediately without
    /// opening a second channel. Unknown ids trigger one discovery round.
    pub fn connect(
        &self,
        stream_id: &str,
        max_buffer_samples: usize,
        max_chunk_samples: usize,
    ) -> Result<String, StreamError> {
        let known = {
            let tables = self.inner.tables.lock();
            match tables.resolve_key(stream_id) {
                Some(key) if tables.connections.contains_key(&key) => {
                    tracing::debug!("Stream {} already connected", key);
                    return Ok(key);
                }
                Some(_) => true,
                None => false,
            }
        };

        if !known {
            tracing::info!("Stream {} unknown, running discovery", stream_id);
            self.inner.discover(None, None, None);
        }

        let mut tables = self.inner.tables.lock();
        let key = tables.resolve_key(stream_id).ok_or_else(|| {
            tracing::error!("Stream {} not found during discovery", stream_id);
            StreamError::NotFound(stream_id.to_string())
        })?;

        // Another caller may have connected while discovery ran unlocked
        if tables.connections.contains_key(&key) {
            return Ok(key);
        }

        let descriptor = match tables.descriptors.get_mut(&key) {
            Some(descriptor) => {
                descriptor.status = StreamStatus::Connecting;
                descriptor.clone()
            }
            None => return Err(StreamError::NotFound(stream_id.to_string())),
        };

        match self
            .inner
            .transport
            .open_channel(&descriptor, max_buffer_samples, max_chunk_samples)
        {
            Ok(channel) => {
                tables.connections.insert(key.clone(), channel);
                if let Some(d) = tables.descriptors.get_mut(&key) {
                    d.status = StreamStatus::Connected;
                }
                tracing::info!("Connected to stream: {} ({})", descriptor.name, key);
                Ok(key)
            }
            Err(e) => {
                if let Some(d) = tables.descriptors.get_mut(&key) {
                    d.status = StreamStatus::Error;
                }
                tracing::error!("Error opening channel for {}: {}", key, e);
                Err(StreamError::ConnectionFailed {
                    stream_id: key,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Close a stream's channel. Returns false if it was not connected.
    pub fn disconnect(&self, stream_id: &str) -> bool {
        let mut tables = self.inner.tables.lock();
        let key = match tables.resolve_key(stream_id) {
            Some(key) => key,
            None => {
                tracing::warn!("Stream {} not connected", stream_id);
                return false;
            }
        };

        match tables.connections.remove(&key) {
            Some(channel) => {
                channel.close();
                if let Some(d) = tables.descriptors.get_mut(&key) {
                    d.status = StreamStatus::Disconnected;
                }
                tracing::info!("Disconnected from stream: {}", key);
                true
            }
            None => {
                tracing::warn!("Stream {} not connected", key);
                false
            }
        }
    }

    pub fn get_descriptor(&self, stream_id: &str) -> Option<StreamDescriptor> {
        let tables = self.inner.tables.lock();
        let key = tables.resolve_key(stream_id)?;
        tables.descriptors.get(&key).cloned()
    }

    /// Every descriptor known to the registry
    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        self.inner.tables.lock().descriptors.values().cloned().collect()
    }

    /// Keys of all connected streams
    pub fn list_connected(&self) -> Vec<String> {
        self.inner.tables.lock().connections.keys().cloned().collect()
    }

    pub fn is_connected(&self, stream_id: &str) -> bool {
        let tables = self.inner.tables.lock();
        tables
            .resolve_key(stream_id)
            .map_or(false, |key| tables.connections.contains_key(&key))
    }

    /// Channel of a connected stream
    pub fn get_channel(&self, stream_id: &str) -> Option<SharedChannel> {
        let tables = self.inner.tables.lock();
        let key = tables.resolve_key(stream_id)?;
        tables.connections.get(&key).cloned()
    }

    /// Run discovery every `interval` on a background thread until stopped
    pub fn start_continuous_discovery(&self, interval: Duration) -> Result<(), StreamError> {
        let mut discovery = self.discovery.lock();
        if discovery.is_some() {
            tracing::warn!("Discovery already running");
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let inner = self.inner.clone();

        let handle = thread::Builder::new()
            .name("stream-discovery".to_string())
            .spawn(move || {
                loop {
                    let round = panic::catch_unwind(AssertUnwindSafe(|| {
                        inner.discover(None, None, None);
                    }));
                    if round.is_err() {
                        tracing::error!("Discovery round panicked, continuing");
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| StreamError::Spawn(e.to_string()))?;

        *discovery = Some(DiscoveryWorker {
            stop_tx,
            done_rx,
            handle,
        });
        tracing::info!("Started continuous stream discovery (every {:?})", interval);
        Ok(())
    }

    pub fn stop_continuous_discovery(&self) {
        let worker = match self.discovery.lock().take() {
            Some(worker) => worker,
            None => return,
        };

        let _ = worker.stop_tx.try_send(());
        // A resolve in flight can outlast the join budget; the thread then exits on its own.
        match worker.done_rx.recv_timeout(self.inner.discovery_timeout + JOIN_TIMEOUT) {
            Ok(()) => {
                let _ = worker.handle.join();
                tracing::info!("Stopped continuous stream discovery");
            }
            Err(_) => tracing::warn!("Discovery thread did not stop in time, detaching"),
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.lock().is_some()
    }

    /// Stop discovery and disconnect every stream. Safe to call repeatedly.
    pub fn shutdown_all(&self) {
        self.stop_continuous_discovery();

        let connected = self.list_connected();
        for key in &connected {
            self.disconnect(key);
        }
        if !connected.is_empty() {
            tracing::info!("Disconnected from {} stream(s)", connected.len());
        }
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::types::ChannelFormat;

    fn setup() -> (Arc<MemoryTransport>, StreamRegistry) {
        let transport = Arc::new(MemoryTransport::new());
        transport.add_stream(StreamDescriptor::new("EEG", "EEG", 4, 250.0, ChannelFormat::Float32));
        transport.add_stream(
            StreamDescriptor::new("Markers", "Markers", 1, 0.0, ChannelFormat::String).with_uid("mk-1"),
        );
        let registry = StreamRegistry::with_discovery_timeout(transport.clone(), Duration::from_millis(10));
        (transport, registry)
    }

    #[test]
    fn test_discover_filters() {
        let (_transport, registry) = setup();

        assert_eq!(registry.discover(None, None, None).len(), 2);
        let eeg = registry.discover(Some("EEG"), None, None);
        assert_eq!(eeg.len(), 1);
        assert_eq!(eeg[0].status, StreamStatus::Disconnected);
        assert_eq!(registry.discover(None, Some("Markers"), None)[0].key(), "mk-1");
        assert!(registry.discover(Some("EEG"), Some("Markers"), None).is_empty());
    }

    #[test]
    fn test_discover_swallows_transport_errors() {
        let (transport, registry) = setup();
        transport.fail_resolve(Some("multicast unavailable"));
        assert!(registry.discover(None, None, None).is_empty());
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (transport, registry) = setup();
        registry.discover(None, None, None);

        assert_eq!(registry.connect("EEG", 360, 0).unwrap(), "EEG");
        assert_eq!(registry.connect("EEG", 360, 0).unwrap(), "EEG");
        assert_eq!(transport.channels_opened(), 1);
        assert_eq!(registry.get_descriptor("EEG").unwrap().status, StreamStatus::Connected);
        assert_eq!(registry.list_connected(), vec!["EEG".to_string()]);
    }

    #[test]
    fn test_rediscovery_preserves_status() {
        let (_transport, registry) = setup();
        registry.connect("EEG", 360, 0).unwrap();

        let rediscovered = registry.discover(Some("EEG"), None, None);
        assert_eq!(rediscovered[0].status, StreamStatus::Connected);
    }

    #[test]
    fn test_connect_unknown_runs_discovery() {
        let (transport, registry) = setup();

        let key = registry.connect("Markers", 360, 0).unwrap();
        assert_eq!(key, "mk-1");
        assert_eq!(transport.resolve_calls(), 1);
        assert!(registry.is_connected("Markers"));
        assert!(registry.get_channel("mk-1").is_some());
    }

    #[test]
    fn test_connect_not_found() {
        let (_transport, registry) = setup();
        let err = registry.connect("Gaze", 360, 0).unwrap_err();
        assert!(matches!(err, StreamError::NotFound(id) if id == "Gaze"));
    }

    #[test]
    fn test_connect_failure_marks_error() {
        let (transport, registry) = setup();
        transport.fail_open("EEG", true);

        let err = registry.connect("EEG", 360, 0).unwrap_err();
        assert!(matches!(err, StreamError::ConnectionFailed { .. }));
        assert_eq!(registry.get_descriptor("EEG").unwrap().status, StreamStatus::Error);
        assert!(!registry.is_connected("EEG"));
    }

    #[test]
    fn test_disconnect() {
        let (_transport, registry) = setup();
        registry.connect("EEG", 360, 0).unwrap();
        let channel = registry.get_channel("EEG").unwrap();

        assert!(registry.disconnect("EEG"));
        assert!(!registry.disconnect("EEG"));
        assert!(registry.get_channel("EEG").is_none());
        assert_eq!(registry.get_descriptor("EEG").unwrap().status, StreamStatus::Disconnected);
        assert!(channel.pull(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_concurrent_connect_opens_one_channel() {
        let (transport, registry) = setup();
        let registry = Arc::new(registry);
        registry.discover(None, None, None);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.connect("EEG", 360, 0).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "EEG");
        }
        assert_eq!(transport.channels_opened(), 1);
    }

    #[test]
    fn test_continuous_discovery_and_shutdown() {
        let (transport, registry) = setup();
        registry.start_continuous_discovery(Duration::from_millis(5)).unwrap();
        assert!(registry.is_discovering());

        transport.add_stream(StreamDescriptor::new("Gaze", "Gaze", 2, 60.0, ChannelFormat::Float32));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while registry.get_descriptor("Gaze").is_none() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(registry.get_descriptor("Gaze").is_some());

        registry.connect("EEG", 360, 0).unwrap();
        registry.shutdown_all();
        registry.shutdown_all();
        assert!(!registry.is_discovering());
        assert!(registry.list_connected().is_empty());
    }

    #[test]
    fn test_continuous_discovery_survives_failures() {
        let (transport, registry) = setup();
        transport.fail_resolve(Some("flaky"));
        registry.start_continuous_discovery(Duration::from_millis(5)).unwrap();

        thread::sleep(Duration::from_millis(30));
        transport.fail_resolve(None);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while registry.descriptors().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(registry.descriptors().len(), 2);
        registry.stop_continuous_discovery();
    }
}
