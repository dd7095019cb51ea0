//! Store-and-forward relay to a message broker
//!
//! While disconnected, published samples are held in a bounded FIFO
//! (oldest evicted first). When the broker acknowledges a connection the
//! buffer is flushed in submission order before any newer publish is
//! accepted. A publish that fails while connected is dropped, not buffered.

use parking_lot::{Condvar, Mutex};
use rumqttc::QoS;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::constants::{BROKER_CONNECT_TIMEOUT, RELAY_BUFFER_CAPACITY};
use crate::error::RelayError;
use crate::relay::broker::{Broker, BrokerEvent, EventSink};
use crate::relay::formatter::MessageFormatter;
use crate::relay::metrics::MetricsCollector;
use crate::types::Sample;

/// Observer notified with `true` on connect and `false` on disconnect or failure
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Connected,
}

/// What `try_publish` did with a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    Buffered,
}

/// Relay tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Messages held while disconnected before the oldest is evicted
    pub buffer_capacity: usize,
    /// How long `try_connect` waits for the broker's acknowledgment
    pub connect_timeout: Duration,
    /// Delivery guarantee for every publish
    pub qos: QoS,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: RELAY_BUFFER_CAPACITY,
            connect_timeout: BROKER_CONNECT_TIMEOUT,
            qos: QoS::AtLeastOnce,
        }
    }
}

struct RelayShared {
    state: RelayState,
    /// Reason for the last failed or dropped connection
    last_error: Option<String>,
    /// Samples waiting for a connection, with their topics, oldest first
    buffer: VecDeque<(Sample, String)>,
    buffer_evictions: u64,
    /// Bumped on every connect attempt and teardown; events tagged with an
    /// older value come from a session that no longer exists
    session: u64,
}

struct RelayInner {
    shared: Mutex<RelayShared>,
    /// Signalled on every state change, waited on by `try_connect`
    state_changed: Condvar,
    observers: Mutex<Vec<ConnectionCallback>>,
    metrics: Option<Arc<MetricsCollector>>,
    config: RelayConfig,
}

impl RelayInner {
    /// Serialize and hand one sample to the broker. Failures are logged and counted.
    fn send(&self, broker: &dyn Broker, sample: &Sample, topic: &str) -> Result<(), RelayError> {
        let payload = match MessageFormatter::format_sample(sample) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Error formatting sample from {}: {}", sample.stream_id(), e);
                self.record(|m| m.record_publish_error());
                return Err(e);
            }
        };

        let bytes = payload.len();
        match broker.publish(topic, payload.into_bytes(), self.config.qos) {
            Ok(()) => {
                self.record(|m| m.record_sample_sent(bytes));
                Ok(())
            }
            Err(e) => {
                tracing::error!("MQTT publish to {} failed: {}", topic, e);
                self.record(|m| m.record_publish_error());
                Err(e)
            }
        }
    }

    fn record(&self, f: impl FnOnce(&MetricsCollector)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    fn handle_event(&self, broker: &dyn Broker, session: u64, event: BrokerEvent) {
        let mut shared = self.shared.lock();
        if shared.session != session {
            tracing::debug!("Ignoring {:?} from a closed broker session", event);
            return;
        }

        let notify = match event {
            BrokerEvent::Connected => {
                shared.state = RelayState::Connected;
                shared.last_error = None;

                // Flush under the lock so no newer publish can overtake the backlog
                let backlog = shared.buffer.len();
                if backlog > 0 {
                    tracing::info!("Flushing {} buffered messages", backlog);
                }
                while let Some((sample, topic)) = shared.buffer.pop_front() {
                    let _ = self.send(broker, &sample, &topic);
                }
                Some(true)
            }
            BrokerEvent::ConnectFailed(reason) => {
                shared.state = RelayState::Disconnected;
                shared.last_error = Some(reason);
                self.record(|m| m.record_connection_error());
                Some(false)
            }
            BrokerEvent::Disconnected(reason) => {
                let was_connected = shared.state == RelayState::Connected;
                shared.state = RelayState::Disconnected;
                shared.last_error = Some(reason);
                if was_connected {
                    tracing::warn!("MQTT connection lost");
                    self.record(|m| m.record_connection_error());
                }
                was_connected.then_some(false)
            }
        };
        self.state_changed.notify_all();
        drop(shared);

        if let Some(connected) = notify {
            self.notify_observers(connected);
        }
    }

    fn notify_observers(&self, connected: bool) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(connected))).is_err() {
                tracing::error!("Connection callback panicked");
            }
        }
    }
}

/// Relays samples to a broker with buffering across outages
pub struct MqttRelay {
    broker: Arc<dyn Broker>,
    inner: Arc<RelayInner>,
}

impl MqttRelay {
    pub fn new(broker: Arc<dyn Broker>, config: RelayConfig) -> Self {
        Self::build(broker, config, None)
    }

    /// Relay that reports sends, drops and errors to `metrics`
    pub fn with_metrics(broker: Arc<dyn Broker>, config: RelayConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self::build(broker, config, Some(metrics))
    }

    fn build(broker: Arc<dyn Broker>, config: RelayConfig, metrics: Option<Arc<MetricsCollector>>) -> Self {
        let capacity = config.buffer_capacity.max(1);
        Self {
            broker,
            inner: Arc::new(RelayInner {
                shared: Mutex::new(RelayShared {
                    state: RelayState::Disconnected,
                    last_error: None,
                    buffer: VecDeque::with_capacity(capacity),
                    buffer_evictions: 0,
                    session: 0,
                }),
                state_changed: Condvar::new(),
                observers: Mutex::new(Vec::new()),
                metrics,
                config: RelayConfig {
                    buffer_capacity: capacity,
                    ..config
                },
            }),
        }
    }

    /// Sink for events of broker session `session`
    fn event_sink(&self, session: u64) -> EventSink {
        let inner: Weak<RelayInner> = Arc::downgrade(&self.inner);
        let broker: Weak<dyn Broker> = Arc::downgrade(&self.broker);
        Arc::new(move |event| {
            if let (Some(inner), Some(broker)) = (inner.upgrade(), broker.upgrade()) {
                inner.handle_event(broker.as_ref(), session, event);
            }
        })
    }

    /// Invalidate the current session and close the client.
    ///
    /// Events the client delivers while shutting down are ignored.
    fn tear_down(&self, mut shared: parking_lot::MutexGuard<'_, RelayShared>) {
        shared.state = RelayState::Disconnected;
        shared.session += 1;
        self.inner.state_changed.notify_all();
        drop(shared);
        self.broker.disconnect();
    }

    /// Connect and wait for the broker's acknowledgment.
    ///
    /// Fails with `ConnectionFailed` on refusal and `Timeout` when no
    /// acknowledgment arrives within the configured connect timeout.
    pub fn try_connect(&self) -> Result<(), RelayError> {
        let session = {
            let mut shared = self.inner.shared.lock();
            if shared.state == RelayState::Connected {
                tracing::warn!("MQTT relay already connected");
                return Ok(());
            }
            shared.state = RelayState::Connecting;
            shared.last_error = None;
            shared.session += 1;
            shared.session
        };

        if let Err(e) = self.broker.connect(self.event_sink(session)) {
            let shared = self.inner.shared.lock();
            if shared.session == session {
                self.tear_down(shared);
            }
            self.inner.record(|m| m.record_connection_error());
            return Err(e);
        }

        let timeout = self.inner.config.connect_timeout;
        let deadline = Instant::now() + timeout;
        let mut shared = self.inner.shared.lock();
        loop {
            match shared.state {
                RelayState::Connected => {
                    tracing::info!("Connected to MQTT broker");
                    return Ok(());
                }
                RelayState::Disconnected => {
                    let reason = shared
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "connection closed".to_string());
                    if shared.session == session {
                        self.tear_down(shared);
                    }
                    return Err(RelayError::ConnectionFailed(reason));
                }
                RelayState::Connecting => {
                    if self
                        .inner
                        .state_changed
                        .wait_until(&mut shared, deadline)
                        .timed_out()
                        && shared.state == RelayState::Connecting
                    {
                        tracing::error!("Connection timeout to MQTT broker");
                        if shared.session == session {
                            self.tear_down(shared);
                        }
                        self.inner.record(|m| m.record_connection_error());
                        return Err(RelayError::Timeout(timeout));
                    }
                }
            }
        }
    }

    /// Connect, logging rather than returning the failure
    pub fn connect(&self) -> bool {
        match self.try_connect() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Error connecting to MQTT broker: {}", e);
                false
            }
        }
    }

    /// Close the broker connection. Safe to call when not connected.
    pub fn disconnect(&self) {
        let shared = self.inner.shared.lock();
        let was_connected = shared.state == RelayState::Connected;
        self.tear_down(shared);

        if was_connected {
            self.inner.notify_observers(false);
        }
    }

    /// Send a sample, or buffer it while disconnected
    pub fn try_publish(&self, sample: Sample, topic: &str) -> Result<PublishOutcome, RelayError> {
        let mut shared = self.inner.shared.lock();
        if shared.state != RelayState::Connected {
            if shared.buffer.len() >= self.inner.config.buffer_capacity {
                shared.buffer.pop_front();
                shared.buffer_evictions += 1;
                self.inner.record(|m| m.record_sample_dropped());
                if shared.buffer_evictions.is_power_of_two() {
                    tracing::warn!(
                        "Relay buffer full, {} oldest messages evicted so far",
                        shared.buffer_evictions
                    );
                }
            }
            shared.buffer.push_back((sample, topic.to_string()));
            tracing::debug!("Not connected to MQTT broker, buffering message");
            return Ok(PublishOutcome::Buffered);
        }

        self.inner.send(self.broker.as_ref(), &sample, topic)?;
        Ok(PublishOutcome::Sent)
    }

    /// `true` only when the sample was handed to a connected broker
    pub fn publish(&self, sample: Sample, topic: &str) -> bool {
        matches!(self.try_publish(sample, topic), Ok(PublishOutcome::Sent))
    }

    pub fn add_connection_callback<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.observers.lock().push(Arc::new(callback));
    }

    pub fn is_connected(&self) -> bool {
        self.state() == RelayState::Connected
    }

    pub fn state(&self) -> RelayState {
        self.inner.shared.lock().state
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.shared.lock().buffer.len()
    }

    /// Messages evicted from a full buffer
    pub fn buffer_evictions(&self) -> u64 {
        self.inner.shared.lock().buffer_evictions
    }
}

impl Drop for MqttRelay {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Broker double: connects (or refuses) synchronously on `connect`
    #[derive(Default)]
    struct MockBroker {
        refuse: AtomicBool,
        silent: AtomicBool,
        fail_publish: AtomicBool,
        /// Deliver an in-flight acknowledgment while being torn down
        ack_on_disconnect: AtomicBool,
        sink: Mutex<Option<EventSink>>,
        published: Mutex<Vec<(String, String)>>,
        connects: AtomicUsize,
    }

    impl MockBroker {
        fn emit(&self, event: BrokerEvent) {
            let sink = self.sink.lock().clone();
            if let Some(sink) = sink {
                sink(event);
            }
        }

        fn timestamps(&self) -> Vec<f64> {
            self.published
                .lock()
                .iter()
                .map(|(_, payload)| {
                    let message = MessageFormatter::parse_sample(payload).unwrap();
                    message.timestamp_metadata().unwrap().lsl_timestamp
                })
                .collect()
        }
    }

    impl Broker for MockBroker {
        fn connect(&self, events: EventSink) -> Result<(), RelayError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            *self.sink.lock() = Some(events.clone());
            if self.silent.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.refuse.load(Ordering::SeqCst) {
                events(BrokerEvent::ConnectFailed("refused".to_string()));
            } else {
                events(BrokerEvent::Connected);
            }
            Ok(())
        }

        fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<(), RelayError> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(RelayError::Publish("queue full".to_string()));
            }
            let payload = String::from_utf8(payload).unwrap();
            self.published.lock().push((topic.to_string(), payload));
            Ok(())
        }

        fn disconnect(&self) {
            if self.ack_on_disconnect.load(Ordering::SeqCst) {
                self.emit(BrokerEvent::Connected);
            }
        }
    }

    fn relay_with(broker: &Arc<MockBroker>, capacity: usize) -> MqttRelay {
        let config = RelayConfig {
            buffer_capacity: capacity,
            connect_timeout: Duration::from_millis(50),
            qos: QoS::AtLeastOnce,
        };
        MqttRelay::new(broker.clone(), config)
    }

    fn sample(ts: f64) -> Sample {
        Sample::new("EEG", vec![ts], ts)
    }

    #[test]
    fn test_publish_while_disconnected_buffers() {
        let broker = Arc::new(MockBroker::default());
        let relay = relay_with(&broker, 10);

        assert!(!relay.publish(sample(1.0), "lsl/eeg"));
        assert_eq!(relay.try_publish(sample(2.0), "lsl/eeg"), Ok(PublishOutcome::Buffered));
        assert_eq!(relay.buffered_len(), 2);
        assert!(broker.published.lock().is_empty());
    }

    #[test]
    fn test_connect_flushes_backlog_before_new_samples() {
        let broker = Arc::new(MockBroker::default());
        let relay = relay_with(&broker, 10);

        for i in 0..3 {
            relay.publish(sample(i as f64), "lsl/eeg");
        }
        assert!(relay.connect());
        assert!(relay.publish(sample(3.0), "lsl/eeg"));

        assert_eq!(broker.timestamps(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(relay.buffered_len(), 0);
    }

    #[test]
    fn test_buffer_keeps_last_capacity_messages() {
        let broker = Arc::new(MockBroker::default());
        let relay = relay_with(&broker, 5);

        for i in 0..10 {
            relay.publish(sample(i as f64), "lsl/eeg");
        }
        assert_eq!(relay.buffered_len(), 5);
        assert_eq!(relay.buffer_evictions(), 5);

        relay.connect();
        assert_eq!(broker.timestamps(), vec![5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_refused_connection() {
        let broker = Arc::new(MockBroker::default());
        broker.refuse.store(true, Ordering::SeqCst);
        let relay = relay_with(&broker, 5);

        assert_eq!(
            relay.try_connect(),
            Err(RelayError::ConnectionFailed("refused".to_string()))
        );
        assert!(!relay.is_connected());
    }

    #[test]
    fn test_connect_timeout() {
        let broker = Arc::new(MockBroker::default());
        broker.silent.store(true, Ordering::SeqCst);
        let relay = relay_with(&broker, 5);

        assert_eq!(relay.try_connect(), Err(RelayError::Timeout(Duration::from_millis(50))));
        assert_eq!(relay.state(), RelayState::Disconnected);
    }

    #[test]
    fn test_ack_arriving_after_timeout_is_ignored() {
        let broker = Arc::new(MockBroker::default());
        broker.silent.store(true, Ordering::SeqCst);
        broker.ack_on_disconnect.store(true, Ordering::SeqCst);
        let relay = relay_with(&broker, 5);

        assert_eq!(relay.try_connect(), Err(RelayError::Timeout(Duration::from_millis(50))));
        assert!(!relay.is_connected());

        assert_eq!(relay.try_publish(sample(1.0), "lsl/eeg"), Ok(PublishOutcome::Buffered));
        assert_eq!(relay.buffered_len(), 1);

        broker.silent.store(false, Ordering::SeqCst);
        assert!(relay.connect());
        assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
        assert_eq!(broker.timestamps(), vec![1.0]);
    }

    #[test]
    fn test_events_after_disconnect_are_ignored() {
        let broker = Arc::new(MockBroker::default());
        let relay = relay_with(&broker, 5);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        relay.add_connection_callback(move |connected| seen.lock().push(connected));

        assert!(relay.connect());
        broker.ack_on_disconnect.store(true, Ordering::SeqCst);
        relay.disconnect();
        assert!(!relay.is_connected());

        // The closed session's sink stays inert afterwards too
        broker.emit(BrokerEvent::Connected);
        assert!(!relay.is_connected());
        assert!(!relay.publish(sample(2.0), "lsl/eeg"));
        assert_eq!(relay.buffered_len(), 1);
        assert_eq!(*transitions.lock(), vec![true, false]);
    }

    #[test]
    fn test_live_publish_failure_is_dropped() {
        let broker = Arc::new(MockBroker::default());
        let metrics = Arc::new(MetricsCollector::new());
        let relay = MqttRelay::with_metrics(broker.clone(), RelayConfig::default(), metrics.clone());
        relay.connect();

        broker.fail_publish.store(true, Ordering::SeqCst);
        assert!(!relay.publish(sample(1.0), "lsl/eeg"));
        assert_eq!(relay.buffered_len(), 0);
        assert_eq!(metrics.snapshot().publish_errors, 1);

        broker.fail_publish.store(false, Ordering::SeqCst);
        assert!(relay.publish(sample(2.0), "lsl/eeg"));
        assert_eq!(metrics.snapshot().samples_sent, 1);
    }

    #[test]
    fn test_serialization_error_surfaces() {
        let broker = Arc::new(MockBroker::default());
        let relay = relay_with(&broker, 5);
        relay.connect();

        let bad = Sample::new("EEG", vec![f64::INFINITY], 1.0);
        assert!(matches!(
            relay.try_publish(bad, "lsl/eeg"),
            Err(RelayError::Serialization(_))
        ));
        assert!(relay.is_connected());
    }

    #[test]
    fn test_broker_drop_then_reconnect() {
        let broker = Arc::new(MockBroker::default());
        let relay = relay_with(&broker, 10);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        relay.add_connection_callback(move |connected| seen.lock().push(connected));
        relay.add_connection_callback(|_| panic!("observer bug"));

        relay.connect();
        broker.emit(BrokerEvent::Disconnected("network down".to_string()));
        assert!(!relay.is_connected());

        relay.publish(sample(1.0), "lsl/eeg");
        broker.emit(BrokerEvent::Connected);
        assert!(relay.is_connected());

        assert_eq!(broker.timestamps(), vec![1.0]);
        assert_eq!(*transitions.lock(), vec![true, false, true]);
    }

    #[test]
    fn test_connect_is_idempotent_and_disconnect_safe() {
        let broker = Arc::new(MockBroker::default());
        let relay = relay_with(&broker, 5);
        relay.disconnect();

        assert!(relay.connect());
        assert!(relay.connect());
        assert_eq!(broker.connects.load(Ordering::SeqCst), 1);

        relay.disconnect();
        assert!(!relay.is_connected());
    }
}
