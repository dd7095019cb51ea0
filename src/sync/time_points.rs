//! Labelled wall-clock / local-clock sync points
//!
//! A sync point pairs a UTC datetime with the local monotonic clock reading
//! taken at the same moment, so local-clock timestamps can later be mapped
//! to absolute time. Points serialise to flat key/value entries suitable for
//! a stream description.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeMap;

use crate::clock::local_clock;

pub const STREAM_START: &str = "stream_start";
pub const RECORDING_START: &str = "recording_start";

const DATETIME_SUFFIX: &str = "_datetime";
const OFFSET_SUFFIX: &str = "_lsl_local_offset_seconds";
const READABLE_FORMAT: &str = "%Y-%m-%d %I:%M:%S %p";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPoint {
    pub datetime: DateTime<Utc>,
    /// Local clock reading in seconds
    pub local_clock: f64,
}

impl SyncPoint {
    /// Absolute time of a local-clock timestamp, relative to this point
    pub fn to_datetime(&self, local_timestamp: f64) -> DateTime<Utc> {
        let delta_us = ((local_timestamp - self.local_clock) * 1_000_000.0).round() as i64;
        self.datetime + chrono::Duration::microseconds(delta_us)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSyncPoints {
    points: BTreeMap<String, SyncPoint>,
}

impl TimeSyncPoints {
    /// New set with `stream_start` captured now
    pub fn new() -> Self {
        let mut points = Self::default();
        points.capture_now(STREAM_START);
        points
    }

    pub fn add_sync_point(&mut self, label: impl Into<String>, datetime: DateTime<Utc>, local_clock: f64) {
        self.points.insert(label.into(), SyncPoint { datetime, local_clock });
    }

    /// Record the current wall-clock and local-clock time under `label`
    pub fn capture_now(&mut self, label: impl Into<String>) -> SyncPoint {
        let point = SyncPoint {
            local_clock: local_clock(),
            datetime: Utc::now(),
        };
        self.points.insert(label.into(), point);
        point
    }

    pub fn capture_recording_start(&mut self) -> SyncPoint {
        self.capture_now(RECORDING_START)
    }

    pub fn get(&self, label: &str) -> Option<&SyncPoint> {
        self.points.get(label)
    }

    pub fn stream_start(&self) -> Option<&SyncPoint> {
        self.get(STREAM_START)
    }

    pub fn recording_start(&self) -> Option<&SyncPoint> {
        self.get(RECORDING_START)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Flatten into `{label}_datetime` / `{label}_lsl_local_offset_seconds` entries
    pub fn to_desc_entries(&self) -> Vec<(String, String)> {
        self.points
            .iter()
            .flat_map(|(label, point)| {
                [
                    (
                        format!("{}{}", label, DATETIME_SUFFIX),
                        point.datetime.format(READABLE_FORMAT).to_string(),
                    ),
                    (format!("{}{}", label, OFFSET_SUFFIX), point.local_clock.to_string()),
                ]
            })
            .collect()
    }

    /// Rebuild from description entries. Unrelated keys are ignored; labels
    /// missing either half or with unparsable values are skipped.
    pub fn from_desc_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut datetimes = BTreeMap::new();
        let mut offsets = BTreeMap::new();

        for (key, value) in entries {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            if let Some(label) = key.strip_suffix(DATETIME_SUFFIX) {
                match NaiveDateTime::parse_from_str(value, READABLE_FORMAT) {
                    Ok(naive) => {
                        datetimes.insert(label.to_string(), Utc.from_utc_datetime(&naive));
                    }
                    Err(e) => tracing::warn!("Ignoring sync point {}: {}", key, e),
                }
            } else if let Some(label) = key.strip_suffix(OFFSET_SUFFIX) {
                match value.parse::<f64>() {
                    Ok(offset) => {
                        offsets.insert(label.to_string(), offset);
                    }
                    Err(e) => tracing::warn!("Ignoring sync point {}: {}", key, e),
                }
            }
        }

        let mut points = Self::default();
        for (label, datetime) in datetimes {
            if let Some(&offset) = offsets.get(&label) {
                points.add_sync_point(label, datetime, offset);
            }
        }
        points
    }
}
