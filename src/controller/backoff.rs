//! # Exponential Backoff
//!
//! Per-key retry delay calculator used by the work queue's rate limiter.
//!
//! Each failing key gets its own [`RetryBackoff`]: the delay doubles on
//! every failure and is capped at a maximum, which bounds retry storms on a
//! persistently failing key while guaranteeing eventual retry. A successful
//! reconcile resets the key to the base delay.
//!
//! Defaults follow the conventional controller work queue rate limiter:
//! 5 ms base, 1000 s cap.

use std::time::Duration;

/// Default base delay for the first retry of a key.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default cap applied to the per-key retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator for a single key.
///
/// # Example
///
/// ```
/// use service_exposer_controller::controller::backoff::RetryBackoff;
/// use std::time::Duration;
///
/// let mut backoff = RetryBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(5));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(10));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(20));
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_millis(5));
/// ```
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    retries: u32,
}

impl RetryBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            retries: 0,
        }
    }

    /// Delay to apply for the next retry, advancing the failure count.
    ///
    /// Returns `base * 2^failures`, saturating, never above `max`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.retries).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.retries = self.retries.saturating_add(1);
        delay
    }

    /// Number of failures recorded since construction or the last reset.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Reset to the base delay after a successful reconcile.
    pub fn reset(&mut self) {
        self.retries = 0;
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}
