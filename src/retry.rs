//! Retry classification and backoff.
//!
//! Everything here is pure: no sleeping, no I/O. Workers ask [`classify`] what
//! kind of failure they hit, [`RetryPolicy::should_retry`] whether to try
//! again, and [`RetryPolicy::compute_delay`] how long to wait first.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use extaudit::retry::{ErrorClass, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30), Duration::ZERO);
//!
//! assert!(policy.should_retry(1, &ErrorClass::Transient));
//! assert!(!policy.should_retry(1, &ErrorClass::Permanent));
//! assert!(policy.compute_delay(1, &ErrorClass::Transient) <= Duration::from_millis(1200));
//! ```

use crate::error::ScanError;
use crate::model::ErrorKind;
use rand::Rng;
use std::time::Duration;

/// Uniform jitter applied around every computed delay (±20%).
pub const JITTER_RATIO: f64 = 0.2;

/// How a failed remote call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The service asked us to slow down, optionally saying for how long.
    RateLimited { hint: Option<Duration> },
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorClass::RateLimited { .. } => ErrorKind::RateLimited,
            ErrorClass::Transient => ErrorKind::Transient,
            ErrorClass::Permanent => ErrorKind::Permanent,
        }
    }
}

/// Maps a client error onto a retry class.
pub fn classify(error: &ScanError) -> ErrorClass {
    match error {
        ScanError::RateLimited { retry_after } => ErrorClass::RateLimited { hint: *retry_after },
        ScanError::Network(_) | ScanError::Timeout => ErrorClass::Transient,
        ScanError::Server { status } if *status == 408 || *status >= 500 => ErrorClass::Transient,
        ScanError::Server { .. }
        | ScanError::Rejected { .. }
        | ScanError::NotFound(_)
        | ScanError::Analysis(_)
        | ScanError::InvalidResponse(_)
        | ScanError::Cancelled => ErrorClass::Permanent,
    }
}

/// `attempt` is the 1-based number of the attempt that just failed.
pub fn should_retry(attempt: u32, class: &ErrorClass, max_attempts: u32) -> bool {
    match class {
        ErrorClass::Permanent => false,
        ErrorClass::RateLimited { .. } | ErrorClass::Transient => attempt < max_attempts,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    ceiling: Duration,
    floor: Duration,
}

impl RetryPolicy {
    /// `max_retries` counts retries after the first attempt. The floor is
    /// capped at the ceiling.
    pub fn new(max_retries: u32, base_delay: Duration, ceiling: Duration, floor: Duration) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            base_delay,
            ceiling,
            floor: floor.min(ceiling),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn should_retry(&self, attempt: u32, class: &ErrorClass) -> bool {
        should_retry(attempt, class, self.max_attempts)
    }

    /// Un-jittered exponential delay: `base * 2^(attempt - 1)`, capped at the ceiling.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_secs_f64() * 2f64.powi(exp);
        Duration::from_secs_f64(scaled.min(self.ceiling.as_secs_f64()))
    }

    pub fn compute_delay(&self, attempt: u32, class: &ErrorClass) -> Duration {
        self.compute_delay_with(attempt, class, &mut rand::rng())
    }

    /// Same as [`compute_delay`](Self::compute_delay) with a caller-supplied RNG.
    ///
    /// A server hint is clamped to the ceiling and only jittered upwards, so a
    /// retry never happens earlier than the service asked. The result always
    /// lies in `[floor, ceiling * 1.2]`.
    pub fn compute_delay_with<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        class: &ErrorClass,
        rng: &mut R,
    ) -> Duration {
        let ceiling = self.ceiling.as_secs_f64();
        let upper_cap = ceiling * (1.0 + JITTER_RATIO);

        let jittered = match class {
            ErrorClass::RateLimited { hint: Some(hint) } => {
                let anchor = hint.as_secs_f64().min(ceiling);
                anchor * rng.random_range(1.0..=1.0 + JITTER_RATIO)
            }
            _ => {
                let anchor = self.backoff_delay(attempt).as_secs_f64();
                anchor * rng.random_range(1.0 - JITTER_RATIO..=1.0 + JITTER_RATIO)
            }
        };

        let secs = jittered.max(self.floor.as_secs_f64()).min(upper_cap);
        Duration::from_secs_f64(secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30), Duration::from_millis(100))
    }
}
