//! Retry with configurable backoff

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Constant `initial_delay`
    None,
    /// `initial_delay * attempt`
    Linear,
    /// `initial_delay * 2^(attempt - 1)`
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means a single try
    pub max_retries: u32,
    /// Base delay the strategy scales
    pub initial_delay: Duration,
    /// Cap applied to every computed delay
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), clamped to `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let factor = match self.strategy {
            RetryStrategy::None => 1.0,
            RetryStrategy::Linear => attempt as f64,
            RetryStrategy::Exponential => 2f64.powi((attempt - 1).min(1023) as i32),
        };
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Runs an operation until it succeeds or the retry budget is spent
#[derive(Clone)]
pub struct ReliabilityManager {
    policy: RetryPolicy,
    sleeper: Sleeper,
}

impl fmt::Debug for ReliabilityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliabilityManager")
            .field("policy", &self.policy)
            .finish()
    }
}

impl Default for ReliabilityManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ReliabilityManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::new(thread::sleep),
        }
    }

    /// Replace the blocking sleep between attempts
    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` up to `max_retries + 1` times.
    ///
    /// `on_retry(attempt, &error)` runs before each backoff sleep; a panic
    /// inside it is logged and ignored. The last error is returned as is.
    pub fn execute_with_retry<T, E, F>(
        &self,
        mut operation: F,
        mut on_retry: Option<&mut dyn FnMut(u32, &E)>,
    ) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation() {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        "Attempt {}/{} failed: {}. Retrying in {:.2}s",
                        attempt,
                        self.policy.max_retries + 1,
                        e,
                        delay.as_secs_f64()
                    );

                    if let Some(callback) = on_retry.as_mut() {
                        let notified = panic::catch_unwind(AssertUnwindSafe(|| callback(attempt, &e)));
                        if notified.is_err() {
                            tracing::error!("Retry callback panicked");
                        }
                    }

                    (self.sleeper)(delay);
                }
                Err(e) => {
                    tracing::error!("Operation failed after {} attempts: {}", attempt + 1, e);
                    return Err(e);
                }
            }
        }
    }
}
