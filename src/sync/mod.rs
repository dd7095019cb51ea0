//! Timestamp synchronization

pub mod time_points;
pub mod timestamp;

pub use time_points::{SyncPoint, TimeSyncPoints};
pub use timestamp::TimestampSynchronizer;
