//! Jitter for wait-queue expirations.
//!
//! Many consumers failing on the same upstream outage reschedule in lock-step; their messages
//! then expire from the wait queue together and hammer the ingress queue at once. Jitter
//! spreads the per-message expiration while keeping it within `[0, delay]`, so the
//! `max_wait` cap of the schedule still holds.
//!
//! - `None`: the exact schedule delay (default).
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`.
//!
//! There is no stateful (decorrelated) variant: a jitter that remembers the previous sleep would
//! need per-message state, and all state in the cascade travels inside the message.
//!
//! Example:
//! ```rust
//! use cascade_retry::Jitter;
//! use std::time::Duration;
//!
//! let jittered = Jitter::equal().apply(Duration::from_millis(1000));
//! assert!(jittered >= Duration::from_millis(500));
//! assert!(jittered <= Duration::from_millis(1000));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing wait-queue expirations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Full jitter: random between 0 and delay
    Full,
    /// Equal jitter: random between delay/2 and delay
    Equal,
}

impl Jitter {
    /// Create a full jitter strategy
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Create an equal jitter strategy
    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                let half = millis / 2;
                Duration::from_millis(rng.random_range(half..=millis))
            }
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
