//! Clock-offset enrichment of samples
//!
//! Each sample leaves the acquisition side with the source timestamp, the
//! best known clock offset for its stream and the wall-clock time it was
//! handed on. A failed clock-correction query falls back to the last offset
//! observed for the same stream; without a channel there is nothing to query
//! and no offset is reported.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::clock::local_clock;
use crate::transport::Channel;
use crate::types::{Sample, TimestampMetadata};

#[derive(Debug, Clone, Copy)]
struct CachedOffset {
    offset: f64,
    /// Local clock reading when the offset was observed
    observed_at: f64,
}

/// Attaches [`TimestampMetadata`] to samples
#[derive(Default)]
pub struct TimestampSynchronizer {
    offsets: Mutex<HashMap<String, CachedOffset>>,
}

impl TimestampSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata for a sample of `stream_id` taken at `lsl_timestamp`.
    ///
    /// The cached offset is used only when `channel` is given and its query
    /// fails. With no channel the offset is `None`.
    pub fn metadata_for(
        &self,
        stream_id: &str,
        lsl_timestamp: f64,
        channel: Option<&dyn Channel>,
    ) -> TimestampMetadata {
        let clock_offset = match channel.map(|c| c.clock_correction()) {
            Some(Ok(offset)) => {
                self.offsets.lock().insert(
                    stream_id.to_string(),
                    CachedOffset {
                        offset,
                        observed_at: local_clock(),
                    },
                );
                Some(offset)
            }
            Some(Err(e)) => {
                tracing::debug!("Could not get clock correction for {}: {}", stream_id, e);
                self.clock_offset(stream_id)
            }
            None => None,
        };

        TimestampMetadata {
            lsl_timestamp,
            clock_offset,
            transmission_time: Some(Utc::now()),
        }
    }

    /// Attach metadata to `sample` unless it already carries some.
    /// Returns whether metadata was attached.
    pub fn enrich(&self, sample: &mut Sample, channel: Option<&dyn Channel>) -> bool {
        if sample.is_enriched() {
            return false;
        }
        let metadata = self.metadata_for(sample.stream_id(), sample.timestamp(), channel);
        sample.attach_metadata(metadata)
    }

    /// Last successfully observed offset for a stream
    pub fn clock_offset(&self, stream_id: &str) -> Option<f64> {
        self.offsets.lock().get(stream_id).map(|c| c.offset)
    }

    /// Local clock time of the last successful correction for a stream
    pub fn last_correction_time(&self, stream_id: &str) -> Option<f64> {
        self.offsets.lock().get(stream_id).map(|c| c.observed_at)
    }

    pub fn reset(&self) {
        self.offsets.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, Transport};
    use crate::types::{ChannelFormat, StreamDescriptor};
    use std::sync::Arc;

    fn channel_with_offset(offset: f64) -> (Arc<crate::transport::MemoryStream>, crate::transport::SharedChannel) {
        let transport = MemoryTransport::new();
        let descriptor = StreamDescriptor::new("EEG", "EEG", 1, 100.0, ChannelFormat::Float32);
        let stream = transport.add_stream(descriptor.clone());
        stream.set_clock_offset(offset);
        let channel = transport.open_channel(&descriptor, 360, 0).unwrap();
        (stream, channel)
    }

    #[test]
    fn test_enrich_attaches_offset_and_transmission_time() {
        let (_stream, channel) = channel_with_offset(0.125);
        let sync = TimestampSynchronizer::new();

        let mut sample = Sample::new("EEG", vec![1.0], 42.0);
        assert!(sync.enrich(&mut sample, Some(channel.as_ref())));

        let meta = sample.metadata().unwrap();
        assert_eq!(meta.lsl_timestamp, 42.0);
        assert_eq!(meta.clock_offset, Some(0.125));
        assert!(meta.transmission_time.is_some());
        assert_eq!(sync.clock_offset("EEG"), Some(0.125));
        assert!(sync.last_correction_time("EEG").is_some());
    }

    #[test]
    fn test_enrich_is_idempotent() {
        let (stream, channel) = channel_with_offset(0.5);
        let sync = TimestampSynchronizer::new();

        let mut sample = Sample::new("EEG", vec![1.0], 1.0);
        sync.enrich(&mut sample, Some(channel.as_ref()));
        let first = sample.metadata().cloned();

        stream.set_clock_offset(9.0);
        assert!(!sync.enrich(&mut sample, Some(channel.as_ref())));
        assert_eq!(sample.metadata().cloned(), first);
    }

    #[test]
    fn test_failed_correction_uses_cached_offset() {
        let (stream, channel) = channel_with_offset(0.25);
        let sync = TimestampSynchronizer::new();

        let mut first = Sample::new("EEG", vec![1.0], 1.0);
        sync.enrich(&mut first, Some(channel.as_ref()));

        stream.fail_clock_correction("peer unreachable");
        let mut second = Sample::new("EEG", vec![2.0], 2.0);
        sync.enrich(&mut second, Some(channel.as_ref()));
        assert_eq!(second.metadata().unwrap().clock_offset, Some(0.25));
    }

    #[test]
    fn test_offsets_are_cached_per_stream() {
        let (_stream, channel) = channel_with_offset(0.25);
        let sync = TimestampSynchronizer::new();

        let mut eeg = Sample::new("EEG", vec![1.0], 1.0);
        sync.enrich(&mut eeg, Some(channel.as_ref()));

        let mut markers = Sample::new("Markers", vec!["go".to_string()], 1.0);
        sync.enrich(&mut markers, None);
        assert_eq!(markers.metadata().unwrap().clock_offset, None);

        sync.reset();
        assert_eq!(sync.clock_offset("EEG"), None);
    }

    #[test]
    fn test_no_channel_means_no_offset_even_when_cached() {
        let (_stream, channel) = channel_with_offset(0.75);
        let sync = TimestampSynchronizer::new();
        sync.metadata_for("EEG", 1.0, Some(channel.as_ref()));
        assert_eq!(sync.clock_offset("EEG"), Some(0.75));

        let meta = sync.metadata_for("EEG", 2.0, None);
        assert_eq!(meta.clock_offset, None);
        assert!(meta.transmission_time.is_some());
        assert_eq!(sync.clock_offset("EEG"), Some(0.75));
    }
}
