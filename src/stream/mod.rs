//! Stream discovery, connection and acquisition

pub mod buffer;
pub mod reader;
pub mod registry;

pub use buffer::{DeliveryQueue, SampleHistory};
pub use reader::{ReaderConfig, SampleCallback, StreamReader};
pub use registry::StreamRegistry;
