//! Message broker seam and its MQTT implementation
//!
//! The relay talks to a [`Broker`]; connection state changes arrive
//! asynchronously through an [`EventSink`] invoked from the broker's own
//! network thread.

use parking_lot::Mutex;
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Packet, QoS, RecvTimeoutError, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::{DEFAULT_KEEPALIVE_SECS, DEFAULT_MQTT_PORT, RELAY_BUFFER_CAPACITY};
use crate::error::RelayError;

/// Connection state changes reported by a broker client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    /// The initial connection attempt was refused or failed
    ConnectFailed(String),
    /// An established connection dropped
    Disconnected(String),
}

pub type EventSink = Arc<dyn Fn(BrokerEvent) + Send + Sync>;

/// Publish/subscribe broker client
pub trait Broker: Send + Sync {
    /// Begin connecting; the outcome is reported through `events`
    fn connect(&self, events: EventSink) -> Result<(), RelayError>;

    /// Hand `payload` to the client for delivery on `topic`
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), RelayError>;

    /// Close the connection. Safe to call when not connected.
    fn disconnect(&self);
}

/// Map a numeric QoS level (0..=2)
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// MQTT connection settings
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Credentials are sent only when both are set and the username is non-empty
    pub username: Option<String>,
    pub password: Option<String>,
    /// Connect over TLS with rumqttc's default configuration
    pub tls: bool,
    pub keepalive: Duration,
    /// Bound of the client's outgoing request queue
    pub request_capacity: usize,
    /// Generated per connection when unset
    pub client_id: Option<String>,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_MQTT_PORT,
            username: None,
            password: None,
            tls: false,
            keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            request_capacity: RELAY_BUFFER_CAPACITY + 100,
            client_id: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = self.client_id.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("lsl-relay-{}", &id[..8])
        });

        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keepalive.max(Duration::from_secs(5)));

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            if !username.is_empty() {
                options.set_credentials(username.clone(), password.clone());
            }
        }
        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

struct Session {
    client: Client,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// [`Broker`] backed by rumqttc's synchronous client
pub struct MqttBroker {
    settings: MqttSettings,
    session: Mutex<Option<Session>>,
}

impl MqttBroker {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    fn close_session(session: Session) {
        session.running.store(false, Ordering::SeqCst);
        if let Err(e) = session.client.try_disconnect() {
            tracing::debug!("MQTT disconnect request not delivered: {}", e);
        }
        // The network loop polls with a short timeout, so the join is bounded
        let _ = session.handle.join();
    }
}

impl Broker for MqttBroker {
    fn connect(&self, events: EventSink) -> Result<(), RelayError> {
        let previous = self.session.lock().take();
        if let Some(previous) = previous {
            Self::close_session(previous);
        }

        // Held until the session is stored so a fast ConnAck cannot publish into an empty slot
        let mut slot = self.session.lock();
        let (client, connection) = Client::new(self.settings.options(), self.settings.request_capacity.max(10));
        let running = Arc::new(AtomicBool::new(true));
        let loop_running = running.clone();
        let endpoint = format!("{}:{}", self.settings.host, self.settings.port);

        let handle = thread::Builder::new()
            .name("mqtt-network".to_string())
            .spawn(move || network_loop(connection, loop_running, events, endpoint))
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;

        tracing::info!(
            "Connecting to MQTT broker {}:{}...",
            self.settings.host,
            self.settings.port
        );
        *slot = Some(Session {
            client,
            running,
            handle,
        });
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), RelayError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(RelayError::NotConnected)?;
        session
            .client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| RelayError::Publish(e.to_string()))
    }

    fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            Self::close_session(session);
            tracing::info!("Disconnected from MQTT broker");
        }
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            Self::close_session(session);
        }
    }
}

/// Drive the MQTT event loop until stopped. rumqttc reconnects on its own
/// after a drop; a failure before the first acknowledgment ends the loop.
fn network_loop(mut connection: Connection, running: Arc<AtomicBool>, events: EventSink, endpoint: String) {
    let mut ever_connected = false;
    let mut connected = false;

    while running.load(Ordering::Relaxed) {
        match connection.recv_timeout(POLL_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                if ack.code == ConnectReturnCode::Success {
                    ever_connected = true;
                    connected = true;
                    tracing::info!("MQTT connection established with {}", endpoint);
                    events(BrokerEvent::Connected);
                } else {
                    tracing::error!("MQTT connection to {} refused: {:?}", endpoint, ack.code);
                    events(BrokerEvent::ConnectFailed(format!("{:?}", ack.code)));
                    if !ever_connected {
                        break;
                    }
                }
            }
            Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                if connected {
                    connected = false;
                    events(BrokerEvent::Disconnected("broker sent disconnect".to_string()));
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if !ever_connected {
                    tracing::error!("Error connecting to MQTT broker {}: {}", endpoint, e);
                    events(BrokerEvent::ConnectFailed(e.to_string()));
                    break;
                }
                if connected {
                    connected = false;
                    tracing::warn!("MQTT connection lost: {}", e);
                    events(BrokerEvent::Disconnected(e.to_string()));
                }
                sleep_while_running(&running, RECONNECT_BACKOFF);
            }
        }
    }
    tracing::debug!("MQTT network loop for {} exited", endpoint);
}

fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}
