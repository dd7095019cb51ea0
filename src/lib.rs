//! # LSL Relay
//!
//! Discovery, buffered acquisition and cloud relay of Lab Streaming Layer
//! streams.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                         Transport (LSL / memory)                      │
//! └───────────────┬───────────────────────────────────────┬───────────────┘
//!                 │ resolve                               │ pull
//!                 ▼                                       ▼
//! ┌───────────────────────────────┐      ┌───────────────────────────────┐
//! │ StreamRegistry (stream::)     │─────▶│ StreamReader (one per stream) │
//! │  descriptors + channel table  │ open │  acquisition thread           │
//! │  continuous discovery thread  │      │  history ring + delivery queue│
//! └───────────────────────────────┘      └───────────────┬───────────────┘
//!                                                        │ callback
//!                                                        ▼
//!                                        ┌───────────────────────────────┐
//!                                        │ TimestampSynchronizer (sync::)│
//!                                        └───────────────┬───────────────┘
//!                                                        ▼
//! ┌───────────────────────────────┐      ┌───────────────────────────────┐
//! │ ReliabilityManager (relay::)  │─────▶│ MqttRelay (store-and-forward) │
//! │  retry / backoff on connect   │      │  bounded outbound buffer      │
//! └───────────────────────────────┘      └───────────────┬───────────────┘
//!                                                        │ outcome
//!                                                        ▼
//!                                        ┌───────────────────────────────┐
//!                                        │ MetricsCollector              │
//!                                        └───────────────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod relay;
pub mod stream;
pub mod sync;
pub mod transport;
pub mod types;
pub mod viz;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default timeout for a discovery round
    pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);

    /// Default interval between continuous discovery rounds
    pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

    /// Default transport-side buffer length (samples)
    pub const DEFAULT_MAX_BUFFER_SAMPLES: usize = 360;

    /// Default maximum chunk length (0 = transport decides)
    pub const DEFAULT_MAX_CHUNK_SAMPLES: usize = 0;

    /// Default reader history / delivery queue capacity
    pub const DEFAULT_READER_BUFFER: usize = 1000;

    /// Timeout for a single pull in the acquisition loop
    pub const PULL_TIMEOUT: Duration = Duration::from_millis(100);

    /// Backoff after a failed pull
    pub const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

    /// Minimum age of a clock-correction result before a channel re-queries
    pub const CLOCK_CORRECTION_INTERVAL: Duration = Duration::from_secs(5);

    /// Bounded wait when joining background workers
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

    /// Outbound relay buffer capacity (messages)
    pub const RELAY_BUFFER_CAPACITY: usize = 1000;

    /// Time to wait for the broker's connect acknowledgment
    pub const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default MQTT port
    pub const DEFAULT_MQTT_PORT: u16 = 1883;

    /// Default MQTT keepalive in seconds
    pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;

    /// Rolling latency window length
    pub const LATENCY_WINDOW: usize = 1000;

    /// Rolling throughput window length
    pub const THROUGHPUT_WINDOW: usize = 100;

    /// Default web visualization port
    pub const DEFAULT_HTTP_PORT: u16 = 8000;
}
