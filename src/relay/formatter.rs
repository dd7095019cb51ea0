//! JSON wire format for relayed samples
//!
//! ```json
//! {
//!   "stream_id": "EEG",
//!   "sample_data": [0.1, 0.2],
//!   "lsl_timestamp": "12.345678900",
//!   "clock_offset": "0.001000000",
//!   "transmission_time": "2024-03-05T14:30:15.123456Z"
//! }
//! ```
//!
//! Timestamps travel as fixed 9-decimal strings so they survive consumers
//! that parse JSON numbers as 32-bit floats.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::types::{Sample, SampleData, TimestampMetadata};

/// One sample as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Registry key of the source stream
    pub stream_id: String,
    pub sample_data: SampleData,
    /// Decimal string so no precision is lost in transit
    pub lsl_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_offset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// RFC 3339 UTC
    pub transmission_time: Option<String>,
}

impl WireMessage {
    pub fn from_sample(sample: &Sample) -> Result<Self, RelayError> {
        if let SampleData::Numeric(values) = sample.data() {
            if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
                return Err(RelayError::Serialization(format!(
                    "non-finite value {} in sample from {}",
                    bad,
                    sample.stream_id()
                )));
            }
        }

        let metadata = sample.metadata();
        let lsl_timestamp = metadata.map_or(sample.timestamp(), |m| m.lsl_timestamp);
        if !lsl_timestamp.is_finite() {
            return Err(RelayError::Serialization(format!(
                "non-finite timestamp in sample from {}",
                sample.stream_id()
            )));
        }

        Ok(Self {
            stream_id: sample.stream_id().to_string(),
            sample_data: sample.data().clone(),
            lsl_timestamp: format_seconds(lsl_timestamp),
            clock_offset: metadata
                .and_then(|m| m.clock_offset)
                .filter(|o| o.is_finite())
                .map(format_seconds),
            transmission_time: metadata
                .and_then(|m| m.transmission_time)
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
        })
    }

    /// Recover the timestamp metadata carried by this message
    pub fn timestamp_metadata(&self) -> Result<TimestampMetadata, RelayError> {
        let lsl_timestamp = parse_seconds("lsl_timestamp", &self.lsl_timestamp)?;
        let clock_offset = self
            .clock_offset
            .as_deref()
            .map(|v| parse_seconds("clock_offset", v))
            .transpose()?;
        let transmission_time = self
            .transmission_time
            .as_deref()
            .map(|v| {
                DateTime::parse_from_rfc3339(v)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| RelayError::Serialization(format!("transmission_time: {}", e)))
            })
            .transpose()?;

        Ok(TimestampMetadata {
            lsl_timestamp,
            clock_offset,
            transmission_time,
        })
    }

    /// Rebuild a sample with its metadata attached
    pub fn into_sample(self) -> Result<Sample, RelayError> {
        let metadata = self.timestamp_metadata()?;
        Ok(Sample::new(self.stream_id, self.sample_data, metadata.lsl_timestamp).with_metadata(metadata))
    }
}

fn format_seconds(value: f64) -> String {
    format!("{:.9}", value)
}

fn parse_seconds(field: &str, value: &str) -> Result<f64, RelayError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|e| RelayError::Serialization(format!("{}: {}", field, e)))
}

/// Renders samples to JSON payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageFormatter;

impl MessageFormatter {
    pub fn format_sample(sample: &Sample) -> Result<String, RelayError> {
        let message = WireMessage::from_sample(sample)?;
        serde_json::to_string(&message).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    /// JSON array of wire messages; fails if any sample cannot be rendered
    pub fn format_batch(samples: &[Sample]) -> Result<String, RelayError> {
        let messages = samples
            .iter()
            .map(WireMessage::from_sample)
            .collect::<Result<Vec<_>, _>>()?;
        serde_json::to_string(&messages).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    pub fn parse_sample(payload: &str) -> Result<WireMessage, RelayError> {
        serde_json::from_str(payload).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    pub fn parse_batch(payload: &str) -> Result<Vec<WireMessage>, RelayError> {
        serde_json::from_str(payload).map_err(|e| RelayError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn enriched(ts: f64, offset: Option<f64>) -> Sample {
        let metadata = TimestampMetadata {
            lsl_timestamp: ts,
            clock_offset: offset,
            transmission_time: Some(Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 15).unwrap()),
        };
        Sample::new("EEG", vec![0.5, -1.25], ts).with_metadata(metadata)
    }

    #[test]
    fn test_format_sample_fields() {
        let json = MessageFormatter::format_sample(&enriched(12.3456789, Some(0.001))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["stream_id"], "EEG");
        assert_eq!(value["sample_data"], serde_json::json!([0.5, -1.25]));
        assert_eq!(value["lsl_timestamp"], "12.345678900");
        assert_eq!(value["clock_offset"], "0.001000000");
        assert_eq!(value["transmission_time"], "2024-03-05T14:30:15.000000Z");
    }

    #[test]
    fn test_unenriched_sample_omits_optional_fields() {
        let sample = Sample::new("Markers", vec!["start".to_string()], 3.0);
        let json = MessageFormatter::format_sample(&sample).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["sample_data"], serde_json::json!(["start"]));
        assert_eq!(value["lsl_timestamp"], "3.000000000");
        assert!(value.get("clock_offset").is_none());
        assert!(value.get("transmission_time").is_none());
    }

    #[test]
    fn test_non_finite_value_is_serialization_error() {
        let sample = Sample::new("EEG", vec![1.0, f64::NAN], 1.0);
        assert!(matches!(
            MessageFormatter::format_sample(&sample),
            Err(RelayError::Serialization(_))
        ));
    }

    #[test]
    fn test_batch_is_json_array() {
        let batch = vec![enriched(1.0, None), enriched(2.0, Some(0.5))];
        let json = MessageFormatter::format_batch(&batch).unwrap();
        let parsed = MessageFormatter::parse_batch(&json).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].lsl_timestamp, "1.000000000");
        assert_eq!(parsed[1].clock_offset.as_deref(), Some("0.500000000"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(MessageFormatter::parse_sample("{not json").is_err());
        let bad_ts = r#"{"stream_id":"x","sample_data":[1.0],"lsl_timestamp":"soon"}"#;
        let message = MessageFormatter::parse_sample(bad_ts).unwrap();
        assert!(message.timestamp_metadata().is_err());
    }

    #[test]
    fn test_into_sample_restores_metadata() {
        let original = enriched(5.5, Some(-0.25));
        let json = MessageFormatter::format_sample(&original).unwrap();
        let restored = MessageFormatter::parse_sample(&json).unwrap().into_sample().unwrap();

        assert_eq!(restored.stream_id(), "EEG");
        assert_eq!(restored.data(), original.data());
        assert_eq!(restored.metadata(), original.metadata());
    }

    proptest! {
        #[test]
        fn prop_timestamp_metadata_round_trips(
            ts in 0.0f64..1.0e7,
            offset in proptest::option::of(-100.0f64..100.0),
        ) {
            let sample = enriched(ts, offset);
            let json = MessageFormatter::format_sample(&sample).unwrap();
            let metadata = MessageFormatter::parse_sample(&json).unwrap().timestamp_metadata().unwrap();

            prop_assert!((metadata.lsl_timestamp - ts).abs() <= 1e-9 * ts.abs().max(1.0));
            match (metadata.clock_offset, offset) {
                (Some(parsed), Some(expected)) => prop_assert!((parsed - expected).abs() <= 1e-9),
                (None, None) => {}
                other => prop_assert!(false, "offset mismatch: {:?}", other),
            }
        }
    }
}
