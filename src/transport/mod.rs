//! Stream transport abstraction
//!
//! The registry and readers only talk to a [`Transport`] and the
//! [`Channel`]s it opens. liblsl sits behind the `lsl-support` feature;
//! [`memory::MemoryTransport`] serves simulation and tests.

pub mod correction;
pub mod memory;
pub mod simulate;

#[cfg(feature = "lsl-support")]
pub mod lsl;

use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::types::{SampleData, StreamDescriptor};

pub use correction::CorrectionCache;
pub use memory::{MemoryStream, MemoryTransport};
pub use simulate::SimulatedSource;

#[cfg(feature = "lsl-support")]
pub use self::lsl::LslTransport;

/// One sample as returned by a channel pull
#[derive(Debug, Clone, PartialEq)]
pub struct PulledSample {
    pub data: SampleData,
    /// Timestamp in the stream's local clock domain
    pub timestamp: f64,
}

impl PulledSample {
    pub fn new(data: impl Into<SampleData>, timestamp: f64) -> Self {
        Self {
            data: data.into(),
            timestamp,
        }
    }
}

/// An open receive handle bound to one stream
pub trait Channel: Send + Sync {
    /// Wait up to `timeout` for the next sample. `Ok(None)` means no data arrived.
    fn pull(&self, timeout: Duration) -> Result<Option<PulledSample>, TransportError>;

    /// Current estimate of (reference clock - stream clock) in seconds
    fn clock_correction(&self) -> Result<f64, TransportError>;

    /// Release the channel. Subsequent pulls fail with [`TransportError::Closed`].
    fn close(&self);
}

/// Shared handle to an open channel
pub type SharedChannel = Arc<dyn Channel>;

/// Stream discovery and channel factory
pub trait Transport: Send + Sync {
    /// All streams currently advertised, waiting at most `timeout`
    fn resolve(&self, timeout: Duration) -> Result<Vec<StreamDescriptor>, TransportError>;

    fn open_channel(
        &self,
        descriptor: &StreamDescriptor,
        max_buffer_samples: usize,
        max_chunk_samples: usize,
    ) -> Result<SharedChannel, TransportError>;
}
