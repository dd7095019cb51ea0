//! Cloud relay: wire format, broker client, retry policy and metrics

pub mod broker;
pub mod formatter;
pub mod metrics;
pub mod mqtt;
pub mod reliability;

pub use broker::{qos_from_level, Broker, BrokerEvent, EventSink, MqttBroker, MqttSettings};
pub use formatter::{MessageFormatter, WireMessage};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use mqtt::{ConnectionCallback, MqttRelay, PublishOutcome, RelayConfig, RelayState};
pub use reliability::{ReliabilityManager, RetryPolicy, RetryStrategy};
