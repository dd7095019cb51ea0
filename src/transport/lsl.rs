//! Lab Streaming Layer transport
//!
//! Wraps liblsl's resolver and inlets. Enabled with the `lsl-support`
//! feature since liblsl needs a native build toolchain.

use lsl::Pullable;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Channel, CorrectionCache, PulledSample, SharedChannel, Transport};
use crate::constants::CLOCK_CORRECTION_INTERVAL;
use crate::error::TransportError;
use crate::types::{ChannelFormat, SampleData, StreamDescriptor};

/// Timeout for time-correction queries (seconds)
const TIME_CORRECTION_TIMEOUT: f64 = 1.0;

/// Transport backed by liblsl
#[derive(Default)]
pub struct LslTransport {
    /// Native stream infos from the last resolve, keyed by identity key
    resolved: Mutex<HashMap<String, lsl::StreamInfo>>,
}

impl LslTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn convert_format(format: lsl::ChannelFormat) -> ChannelFormat {
        match format {
            lsl::ChannelFormat::Float32 => ChannelFormat::Float32,
            lsl::ChannelFormat::Double64 => ChannelFormat::Double64,
            lsl::ChannelFormat::Int8 => ChannelFormat::Int8,
            lsl::ChannelFormat::Int16 => ChannelFormat::Int16,
            lsl::ChannelFormat::Int32 => ChannelFormat::Int32,
            lsl::ChannelFormat::Int64 => ChannelFormat::Int64,
            lsl::ChannelFormat::String => ChannelFormat::String,
            _ => ChannelFormat::Float32,
        }
    }

    fn descriptor_from(info: &lsl::StreamInfo) -> StreamDescriptor {
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        let mut descriptor = StreamDescriptor::new(
            info.stream_name(),
            info.stream_type(),
            info.channel_count().max(0) as usize,
            info.nominal_srate(),
            Self::convert_format(info.channel_format()),
        );
        descriptor.source_id = non_empty(info.source_id());
        descriptor.uid = non_empty(info.uid());
        descriptor.hostname = non_empty(info.hostname());
        descriptor
    }
}

impl Transport for LslTransport {
    fn resolve(&self, timeout: Duration) -> Result<Vec<StreamDescriptor>, TransportError> {
        let infos = lsl::resolve_streams(timeout.as_secs_f64())
            .map_err(|e| TransportError::Resolve(format!("{:?}", e)))?;

        let mut resolved = self.resolved.lock();
        let descriptors = infos
            .into_iter()
            .map(|info| {
                let descriptor = Self::descriptor_from(&info);
                resolved.insert(descriptor.key().to_string(), info);
                descriptor
            })
            .collect();
        Ok(descriptors)
    }

    fn open_channel(
        &self,
        descriptor: &StreamDescriptor,
        max_buffer_samples: usize,
        max_chunk_samples: usize,
    ) -> Result<SharedChannel, TransportError> {
        let info = self
            .resolved
            .lock()
            .get(descriptor.key())
            .cloned()
            .ok_or_else(|| TransportError::Open(format!("{} has not been resolved", descriptor.key())))?;

        let inlet = lsl::StreamInlet::new(&info, max_buffer_samples as i32, max_chunk_samples as i32, true)
            .map_err(|e| TransportError::Open(format!("{:?}", e)))?;

        Ok(Arc::new(LslChannel {
            inlet: Mutex::new(Some(inlet)),
            text: descriptor.channel_format.is_text(),
            correction: CorrectionCache::new(CLOCK_CORRECTION_INTERVAL),
        }))
    }
}

struct LslChannel {
    inlet: Mutex<Option<lsl::StreamInlet>>,
    text: bool,
    /// Queried at most once per `CLOCK_CORRECTION_INTERVAL`
    correction: CorrectionCache,
}

impl Channel for LslChannel {
    fn pull(&self, timeout: Duration) -> Result<Option<PulledSample>, TransportError> {
        let guard = self.inlet.lock();
        let inlet = guard.as_ref().ok_or(TransportError::Closed)?;
        let timeout = timeout.as_secs_f64();

        // liblsl signals "no sample" with a zero timestamp
        if self.text {
            let (values, ts): (Vec<String>, f64) = inlet
                .pull_sample(timeout)
                .map_err(|e| TransportError::Pull(format!("{:?}", e)))?;
            Ok((ts != 0.0).then(|| PulledSample::new(SampleData::Text(values), ts)))
        } else {
            let (values, ts): (Vec<f64>, f64) = inlet
                .pull_sample(timeout)
                .map_err(|e| TransportError::Pull(format!("{:?}", e)))?;
            Ok((ts != 0.0).then(|| PulledSample::new(SampleData::Numeric(values), ts)))
        }
    }

    fn clock_correction(&self) -> Result<f64, TransportError> {
        let guard = self.inlet.lock();
        let inlet = guard.as_ref().ok_or(TransportError::Closed)?;
        self.correction.get_or_query(Instant::now(), || {
            inlet
                .time_correction(TIME_CORRECTION_TIMEOUT)
                .map_err(|e| TransportError::ClockCorrection(format!("{:?}", e)))
        })
    }

    fn close(&self) {
        self.correction.invalidate();
        if let Some(inlet) = self.inlet.lock().take() {
            inlet.close_stream();
        }
    }
}
