//! Application configuration
//!
//! Loaded from TOML. `${VAR}` references are expanded from the environment
//! before parsing; references to unset variables are kept verbatim.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    BROKER_CONNECT_TIMEOUT, DEFAULT_HTTP_PORT, DEFAULT_KEEPALIVE_SECS, DEFAULT_MQTT_PORT, DEFAULT_READER_BUFFER,
    RELAY_BUFFER_CAPACITY,
};
use crate::error::ConfigError;
use crate::relay::{qos_from_level, MqttSettings, RelayConfig, RetryPolicy, RetryStrategy};
use crate::types::StreamDescriptor;
use crate::viz::KNOWN_BACKENDS;

const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default `tracing` filter; `RUST_LOG` and `--log-level` take precedence
    pub log_level: String,
    pub visualization: VisualizationConfig,
    pub cloud_streaming: CloudStreamingConfig,
    pub reliability: ReliabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            visualization: VisualizationConfig::default(),
            cloud_streaming: CloudStreamingConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationConfig {
    /// `web`, `mne-lsl` or `pyqt5`
    pub backend: String,
    /// Stream names to show; empty means every discovered stream
    pub streams: Vec<String>,
    /// Frames per second
    pub update_rate: f64,
    /// Samples kept per stream
    pub buffer_size: usize,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            backend: "web".to_string(),
            streams: Vec::new(),
            update_rate: 30.0,
            buffer_size: DEFAULT_READER_BUFFER,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudStreamingConfig {
    pub enabled: bool,
    /// Required when `enabled`
    pub mqtt: Option<MqttConfig>,
}

/// Stream name to topic override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMapping {
    /// Stream name or uid
    pub stream: String,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
    #[serde(default)]
    pub topics: Vec<TopicMapping>,
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_qos() -> u8 {
    1
}

fn default_keepalive() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}

fn default_buffer_capacity() -> usize {
    RELAY_BUFFER_CAPACITY
}

fn default_connect_timeout() -> f64 {
    BROKER_CONNECT_TIMEOUT.as_secs_f64()
}

impl MqttConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: DEFAULT_MQTT_PORT,
            username: None,
            password: None,
            tls: false,
            qos: default_qos(),
            keepalive: DEFAULT_KEEPALIVE_SECS,
            buffer_capacity: RELAY_BUFFER_CAPACITY,
            connect_timeout_secs: default_connect_timeout(),
            topics: Vec::new(),
        }
    }

    /// Topic for a stream: the configured mapping, else `lsl/{type}/{id}`
    pub fn topic_for(&self, descriptor: &StreamDescriptor) -> String {
        self.topics
            .iter()
            .find(|m| m.stream == descriptor.name || descriptor.uid.as_deref() == Some(m.stream.as_str()))
            .map(|m| m.topic.clone())
            .unwrap_or_else(|| default_topic(descriptor))
    }

    pub fn settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.broker.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            tls: self.tls,
            keepalive: Duration::from_secs(self.keepalive),
            request_capacity: self.buffer_capacity + 100,
            client_id: None,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        let connect_timeout = if self.connect_timeout_secs.is_finite() && self.connect_timeout_secs > 0.0 {
            Duration::from_secs_f64(self.connect_timeout_secs)
        } else {
            BROKER_CONNECT_TIMEOUT
        };
        RelayConfig {
            buffer_capacity: self.buffer_capacity,
            connect_timeout,
            qos: qos_from_level(self.qos).unwrap_or(rumqttc::QoS::AtLeastOnce),
        }
    }
}

/// Topic used when no mapping is configured for a stream
pub fn default_topic(descriptor: &StreamDescriptor) -> String {
    let stream_type = if descriptor.stream_type.is_empty() {
        "unknown"
    } else {
        descriptor.stream_type.as_str()
    };
    format!("lsl/{}/{}", stream_type, descriptor.key())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Reconnect attempts after the first failure
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_secs: f64,
    /// Upper bound on any single backoff delay
    pub max_delay_secs: f64,
    pub strategy: RetryStrategy,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_secs: 1.0,
            max_delay_secs: 60.0,
            strategy: RetryStrategy::Exponential,
        }
    }
}

impl ReliabilityConfig {
    pub fn policy(&self) -> RetryPolicy {
        let secs = |v: f64| Duration::from_secs_f64(if v.is_finite() { v.max(0.0) } else { 0.0 });
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: secs(self.initial_delay_secs),
            max_delay: secs(self.max_delay_secs),
            strategy: self.strategy,
        }
    }
}

impl Config {
    /// Parse TOML text after environment substitution. Does not validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let expanded = substitute_env_vars(text);
        Ok(toml::from_str(&expanded)?)
    }

    /// Load and validate a config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;

        let errors = config.validate();
        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Every problem found, empty when the configuration is usable
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let backend = self.visualization.backend.to_lowercase();
        if !KNOWN_BACKENDS.contains(&backend.as_str()) {
            errors.push(format!(
                "Invalid visualization backend: {}. Must be one of {:?}",
                self.visualization.backend, KNOWN_BACKENDS
            ));
        }
        if self.visualization.update_rate.is_nan() || self.visualization.update_rate <= 0.0 {
            errors.push("Visualization update_rate must be positive".to_string());
        }
        if self.visualization.buffer_size == 0 {
            errors.push("Visualization buffer_size must be positive".to_string());
        }

        if self.cloud_streaming.enabled {
            match &self.cloud_streaming.mqtt {
                None => errors.push("Cloud streaming enabled but MQTT configuration missing".to_string()),
                Some(mqtt) => {
                    if mqtt.broker.trim().is_empty() {
                        errors.push("MQTT broker address is required".to_string());
                    }
                    if mqtt.port == 0 {
                        errors.push("MQTT port must be between 1 and 65535".to_string());
                    }
                    if qos_from_level(mqtt.qos).is_none() {
                        errors.push(format!("MQTT qos must be 0, 1 or 2 (got {})", mqtt.qos));
                    }
                }
            }
        }

        errors
    }

    /// The MQTT section, when cloud streaming is enabled
    pub fn mqtt(&self) -> Option<&MqttConfig> {
        if self.cloud_streaming.enabled {
            self.cloud_streaming.mqtt.as_ref()
        } else {
            None
        }
    }
}

/// Candidate config files, in search order
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE), Path::new("config").join(CONFIG_FILE)];
    if let Some(dirs) = directories::ProjectDirs::from("", "", "lsl-relay") {
        paths.push(dirs.config_dir().join(CONFIG_FILE));
    }
    paths
}

/// Load `path`, or the first existing file from [`search_paths`].
/// With no explicit path and no file found, defaults are returned.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = path {
        return Config::from_file(path);
    }

    match search_paths().into_iter().find(|p| p.exists()) {
        Some(found) => Config::from_file(found),
        None => {
            tracing::warn!("No configuration file found, using defaults");
            Ok(Config::default())
        }
    }
}

/// Expand `${VAR}` from the process environment
pub fn substitute_env_vars(text: &str) -> String {
    substitute_with(text, |name| std::env::var(name).ok())
}

/// Expand `${VAR}` using `lookup`; unresolved references stay as written
pub fn substitute_with<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
