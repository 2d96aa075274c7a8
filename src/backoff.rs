//! Backoff schedule for the retry cascade.
//!
//! Maps a 0-based attempt index to the time a message waits in that attempt's wait queue.
//! Attempt `0` is the wait after the first failed delivery; the schedule is exhausted once
//! `attempt >= max_attempts`. Every delay is clamped to `[0, max_wait]`.
//!
//! Two growth formulas are available:
//! - [`Growth::Exponential`] (default): `initial_interval * factor^attempt`.
//! - [`Growth::Subtractive`]: `initial_interval - factor^attempt` (milliseconds). This shrinks
//!   as `attempt` grows for `factor > 1`; it exists for deployments that already depend on it.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use cascade_retry::BackoffSchedule;
//!
//! let schedule = BackoffSchedule::builder()
//!     .initial_interval(Duration::from_millis(1000))
//!     .factor(3.0)
//!     .max_wait(Duration::from_secs(10))
//!     .max_attempts(3)
//!     .build()
//!     .unwrap();
//! assert_eq!(schedule.delay(0), Duration::from_millis(1000));
//! assert_eq!(schedule.delay(1), Duration::from_millis(3000));
//! assert_eq!(schedule.delay(2), Duration::from_millis(9000));
//! assert_eq!(schedule.delay(3), Duration::from_secs(10)); // capped
//! assert!(schedule.is_exhausted(3));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Largest accepted `max_wait` (1 day). Broker TTLs beyond this are almost always a typo.
pub const MAX_WAIT_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned while building a [`BackoffSchedule`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError {
    MaxAttemptsMustBePositive,
    MaxWaitMustBePositive,
    MaxWaitTooLarge(Duration),
    InvalidFactor(f64),
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxAttemptsMustBePositive => write!(f, "max_attempts must be > 0"),
            BackoffError::MaxWaitMustBePositive => write!(f, "max_wait must be greater than zero"),
            BackoffError::MaxWaitTooLarge(max) => {
                write!(f, "max_wait ({:?}) exceeds the ceiling of {:?}", max, MAX_WAIT_CEILING)
            }
            BackoffError::InvalidFactor(factor) => {
                write!(f, "factor must be finite and >= 0 (got {})", factor)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// How the raw delay grows with the attempt index before clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Growth {
    /// `initial_interval * factor^attempt`
    #[default]
    Exponential,
    /// `initial_interval - factor^attempt`, floored at zero.
    Subtractive,
}

/// Immutable backoff policy: `(initial_interval, factor, max_wait, max_attempts)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSchedule {
    initial_interval: Duration,
    factor: f64,
    max_wait: Duration,
    max_attempts: u32,
    growth: Growth,
}

impl BackoffSchedule {
    /// Construct a new builder with the reference defaults (1s, x3.0, 10s cap, 3 attempts).
    pub fn builder() -> BackoffScheduleBuilder {
        BackoffScheduleBuilder::new()
    }

    /// Shorthand for an exponential schedule.
    pub fn new(
        initial_interval: Duration,
        factor: f64,
        max_wait: Duration,
        max_attempts: u32,
    ) -> Result<Self, BackoffError> {
        Self::builder()
            .initial_interval(initial_interval)
            .factor(factor)
            .max_wait(max_wait)
            .max_attempts(max_attempts)
            .build()
    }

    /// Wait duration for the given attempt, clamped to `[0, max_wait]`.
    ///
    /// Total for every `attempt`, including exhausted ones.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let power = self.factor.powi(exponent);
        let initial_ms = self.initial_interval.as_millis() as f64;
        let raw_ms = match self.growth {
            Growth::Exponential => initial_ms * power,
            Growth::Subtractive => initial_ms - power,
        };
        clamp_millis(raw_ms, self.max_wait)
    }

    /// `true` iff `attempt >= max_attempts`.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn growth(&self) -> Growth {
        self.growth
    }

    /// All delays of the cascade in attempt order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(move |attempt| self.delay(attempt))
    }
}

// NaN only arises from `0 * inf`, whose intended value is zero.
fn clamp_millis(raw_ms: f64, max_wait: Duration) -> Duration {
    if raw_ms.is_nan() || raw_ms <= 0.0 {
        return Duration::ZERO;
    }
    let max_ms = max_wait.as_millis() as f64;
    if raw_ms >= max_ms {
        return max_wait;
    }
    Duration::from_millis(raw_ms as u64)
}

/// Builder for [`BackoffSchedule`].
#[derive(Debug, Clone)]
pub struct BackoffScheduleBuilder {
    initial_interval: Duration,
    factor: f64,
    max_wait: Duration,
    max_attempts: u32,
    growth: Growth,
}

impl BackoffScheduleBuilder {
    pub fn new() -> Self {
        Self {
            initial_interval: Duration::from_millis(1000),
            factor: 3.0,
            max_wait: Duration::from_millis(10_000),
            max_attempts: 3,
            growth: Growth::Exponential,
        }
    }

    pub fn initial_interval(mut self, initial_interval: Duration) -> Self {
        self.initial_interval = initial_interval;
        self
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Number of wait queues in the cascade. Must be > 0.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn growth(mut self, growth: Growth) -> Self {
        self.growth = growth;
        self
    }

    /// Build the schedule, validating inputs.
    pub fn build(self) -> Result<BackoffSchedule, BackoffError> {
        if self.max_attempts == 0 {
            return Err(BackoffError::MaxAttemptsMustBePositive);
        }
        if self.max_wait.is_zero() {
            return Err(BackoffError::MaxWaitMustBePositive);
        }
        if self.max_wait > MAX_WAIT_CEILING {
            return Err(BackoffError::MaxWaitTooLarge(self.max_wait));
        }
        if !self.factor.is_finite() || self.factor < 0.0 {
            return Err(BackoffError::InvalidFactor(self.factor));
        }
        Ok(BackoffSchedule {
            initial_interval: self.initial_interval,
            factor: self.factor,
            max_wait: self.max_wait,
            max_attempts: self.max_attempts,
            growth: self.growth,
        })
    }
}

impl Default for BackoffScheduleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
