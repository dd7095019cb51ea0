//! Core data types shared across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection status of a discovered stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    Disconnected,
    Discovering,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Discovering => "discovering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Value format of a stream's channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelFormat {
    #[default]
    Float32,
    Double64,
    Int8,
    Int16,
    Int32,
    Int64,
    String,
}

impl ChannelFormat {
    /// Whether samples of this format carry text rather than numbers
    pub fn is_text(&self) -> bool {
        matches!(self, Self::String)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Double64 => "double64",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::String => "string",
        }
    }
}

impl fmt::Display for ChannelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discoverable stream as advertised by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    /// Content type such as `EEG` or `Markers`
    #[serde(rename = "type")]
    pub stream_type: String,
    pub channel_count: usize,
    /// Nominal sampling rate in Hz (0 = irregular)
    pub nominal_srate: f64,
    pub channel_format: ChannelFormat,
    #[serde(default)]
    pub source_id: Option<String>,
    /// Unique per stream instance; preferred registry key
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Maintained by the registry
    #[serde(default)]
    pub status: StreamStatus,
}

impl StreamDescriptor {
    pub fn new(
        name: impl Into<String>,
        stream_type: impl Into<String>,
        channel_count: usize,
        nominal_srate: f64,
        channel_format: ChannelFormat,
    ) -> Self {
        Self {
            name: name.into(),
            stream_type: stream_type.into(),
            channel_count,
            nominal_srate,
            channel_format,
            source_id: None,
            uid: None,
            hostname: None,
            status: StreamStatus::Disconnected,
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Identity key used by the registry: the unique id if present, else the name
    pub fn key(&self) -> &str {
        self.uid.as_deref().unwrap_or(&self.name)
    }

    /// Whether `id` refers to this stream by key, uid or name
    pub fn matches(&self, id: &str) -> bool {
        self.name == id || self.uid.as_deref() == Some(id)
    }
}

/// Clock-synchronization metadata attached to a sample
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampMetadata {
    /// Source-clock timestamp (seconds)
    pub lsl_timestamp: f64,
    /// Offset to add to `lsl_timestamp` to reach the shared reference clock
    pub clock_offset: Option<f64>,
    /// Wall-clock time the sample was handed to the relay
    pub transmission_time: Option<DateTime<Utc>>,
}

impl TimestampMetadata {
    pub fn new(lsl_timestamp: f64) -> Self {
        Self {
            lsl_timestamp,
            clock_offset: None,
            transmission_time: None,
        }
    }

    /// Source timestamp mapped into the reference clock, if an offset is known
    pub fn corrected_timestamp(&self) -> Option<f64> {
        self.clock_offset.map(|offset| self.lsl_timestamp + offset)
    }
}

/// Channel values of one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleData {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl SampleData {
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<f64>> for SampleData {
    fn from(values: Vec<f64>) -> Self {
        Self::Numeric(values)
    }
}

impl From<Vec<f32>> for SampleData {
    fn from(values: Vec<f32>) -> Self {
        Self::Numeric(values.into_iter().map(f64::from).collect())
    }
}

impl From<Vec<String>> for SampleData {
    fn from(values: Vec<String>) -> Self {
        Self::Text(values)
    }
}

/// One timestamped observation pulled from a stream
///
/// Metadata can be attached once; after that the sample is read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    data: SampleData,
    timestamp: f64,
    stream_id: String,
    metadata: Option<TimestampMetadata>,
}

impl Sample {
    pub fn new(stream_id: impl Into<String>, data: impl Into<SampleData>, timestamp: f64) -> Self {
        Self {
            data: data.into(),
            timestamp,
            stream_id: stream_id.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: TimestampMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn data(&self) -> &SampleData {
        &self.data
    }

    /// Source timestamp in the stream's clock domain
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn metadata(&self) -> Option<&TimestampMetadata> {
        self.metadata.as_ref()
    }

    pub fn is_enriched(&self) -> bool {
        self.metadata.is_some()
    }

    /// Attach metadata unless some is already present. Returns whether it was attached.
    pub(crate) fn attach_metadata(&mut self, metadata: TimestampMetadata) -> bool {
        if self.metadata.is_some() {
            return false;
        }
        self.metadata = Some(metadata);
        true
    }
}
