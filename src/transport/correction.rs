//! Rate limiting for clock-correction queries
//!
//! A correction query can block on a network round trip, so channels that
//! are asked once per sample answer from the last result until it is
//! older than the refresh interval.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::error::TransportError;

/// Last clock-correction result of one channel and when it was taken
pub struct CorrectionCache {
    interval: Duration,
    last: Mutex<Option<(Instant, Result<f64, TransportError>)>>,
}

impl CorrectionCache {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// The cached result if it is fresh at `now`, otherwise the result of `query`.
    ///
    /// Failures are cached too so an unreachable peer is not re-queried for
    /// every sample.
    pub fn get_or_query<F>(&self, now: Instant, query: F) -> Result<f64, TransportError>
    where
        F: FnOnce() -> Result<f64, TransportError>,
    {
        let mut last = self.last.lock();
        if let Some((taken_at, result)) = last.as_ref() {
            if now.saturating_duration_since(*taken_at) < self.interval {
                return result.clone();
            }
        }
        let result = query();
        *last = Some((now, result.clone()));
        result
    }

    /// Forget the cached result
    pub fn invalidate(&self) {
        *self.last.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_queries_once_per_interval() {
        let cache = CorrectionCache::new(Duration::from_secs(5));
        let calls = Cell::new(0);
        let query = || {
            calls.set(calls.get() + 1);
            Ok(0.25 * calls.get() as f64)
        };
        let start = Instant::now();

        assert_eq!(cache.get_or_query(start, query), Ok(0.25));
        for ms in [1, 100, 4_999] {
            assert_eq!(cache.get_or_query(start + Duration::from_millis(ms), query), Ok(0.25));
        }
        assert_eq!(calls.get(), 1);

        assert_eq!(cache.get_or_query(start + Duration::from_secs(5), query), Ok(0.5));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_failure_is_cached_until_refresh() {
        let cache = CorrectionCache::new(Duration::from_secs(5));
        let calls = Cell::new(0);
        let start = Instant::now();
        let failing = || {
            calls.set(calls.get() + 1);
            Err(TransportError::ClockCorrection("timeout".to_string()))
        };

        assert!(cache.get_or_query(start, failing).is_err());
        assert!(cache.get_or_query(start + Duration::from_secs(1), failing).is_err());
        assert_eq!(calls.get(), 1);

        assert_eq!(cache.get_or_query(start + Duration::from_secs(6), || Ok(0.1)), Ok(0.1));
    }

    #[test]
    fn test_invalidate_forces_query() {
        let cache = CorrectionCache::new(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(cache.get_or_query(start, || Ok(1.0)), Ok(1.0));
        cache.invalidate();
        assert_eq!(cache.get_or_query(start, || Ok(2.0)), Ok(2.0));
    }
}
