//! Local monotonic clock in the transport's clock domain
//!
//! liblsl timestamps are seconds on a monotonic clock with an arbitrary
//! epoch. The in-process transports and the time-sync points use this clock
//! so their timestamps are comparable.

#[cfg(not(feature = "lsl-support"))]
use std::sync::OnceLock;
#[cfg(not(feature = "lsl-support"))]
use std::time::Instant;

#[cfg(not(feature = "lsl-support"))]
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed on the local monotonic clock
pub fn local_clock() -> f64 {
    #[cfg(feature = "lsl-support")]
    {
        lsl::local_clock()
    }
    #[cfg(not(feature = "lsl-support"))]
    {
        EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
    }
}
