//! Error types for the stream relay

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Visualization error: {0}")]
    Visualization(#[from] VisualizationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the underlying stream transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Stream resolution failed: {0}")]
    Resolve(String),

    #[error("Failed to open channel: {0}")]
    Open(String),

    #[error("Pull failed: {0}")]
    Pull(String),

    #[error("Clock correction unavailable: {0}")]
    ClockCorrection(String),
}

/// Stream registry and reader errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Connection to stream {stream_id} failed: {reason}")]
    ConnectionFailed { stream_id: String, reason: String },

    #[error("Reader already running")]
    AlreadyRunning,

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Broker relay errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Broker did not acknowledge connection within {0:?}")]
    Timeout(Duration),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation failed:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Visualization backend errors
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("Invalid backend type: {0}. Must be one of: 'mne-lsl', 'pyqt5', 'web'")]
    UnknownBackend(String),

    #[error("{backend} backend not available: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Failed to start backend: {0}")]
    Start(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
