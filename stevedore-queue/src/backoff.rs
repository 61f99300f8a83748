//! Retry backoff policy.
//!
//! A failed job becomes leasable again no earlier than `now + delay`, where
//! the delay doubles with every attempt:
//!
//! ```
//! use stevedore_queue::backoff::next_delay;
//! use std::time::Duration;
//!
//! let base = Duration::from_millis(2000);
//! assert_eq!(next_delay(1, base), Duration::from_millis(2000));
//! assert_eq!(next_delay(2, base), Duration::from_millis(4000));
//! assert_eq!(next_delay(3, base), Duration::from_millis(8000));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base delay applied when a job is enqueued without an explicit policy.
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(2000);

/// Exponential backoff: `base_delay * 2^(attempts_made - 1)`.
///
/// `attempts_made` of zero is treated as the first attempt. The result
/// saturates instead of overflowing.
pub fn next_delay(attempts_made: u32, base_delay: Duration) -> Duration {
    let exponent = attempts_made.max(1) - 1;
    let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Doubles on every attempt
    #[default]
    Exponential,
    /// Same delay every attempt
    Fixed,
}

/// Backoff settings fixed on a job at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Growth strategy
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Base delay in milliseconds
    pub delay_ms: u64,

    /// Fraction of the computed delay added as random extra wait (0.0 = none)
    #[serde(default)]
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_BACKOFF_DELAY)
    }
}

impl BackoffPolicy {
    /// Exponential policy with the given base delay.
    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            jitter: 0.0,
        }
    }

    /// Constant delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            ..Self::exponential(delay)
        }
    }

    /// Add random jitter, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Base delay.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Delay before the attempt following `attempts_made` failed attempts.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let delay = match self.kind {
            BackoffKind::Exponential => next_delay(attempts_made, self.base_delay()),
            BackoffKind::Fixed => self.base_delay(),
        };

        if self.jitter <= 0.0 {
            return delay;
        }

        let max_extra = (delay.as_millis() as f64 * self.jitter) as u64;
        if max_extra == 0 {
            return delay;
        }
        let extra = rand::rng().random_range(0..=max_extra);
        delay.saturating_add(Duration::from_millis(extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubling_law() {
        let base = Duration::from_millis(2000);
        assert_eq!(next_delay(1, base), Duration::from_millis(2000));
        assert_eq!(next_delay(2, base), Duration::from_millis(4000));
        assert_eq!(next_delay(3, base), Duration::from_millis(8000));
        assert_eq!(next_delay(4, base), Duration::from_millis(16000));
    }

    #[test]
    fn test_zero_attempts_uses_base_delay() {
        let base = Duration::from_millis(500);
        assert_eq!(next_delay(0, base), base);
    }

    #[test]
    fn test_next_delay_saturates() {
        let base = Duration::from_millis(2000);
        assert_eq!(next_delay(200, base), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.kind, BackoffKind::Exponential);
        assert_eq!(policy.base_delay(), DEFAULT_BACKOFF_DELAY);
        assert_eq!(policy.jitter, 0.0);
        assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_fixed_policy() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(750));
        assert_eq!(policy.delay_for(1), Duration::from_millis(750));
        assert_eq!(policy.delay_for(5), Duration::from_millis(750));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(1000)).with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_jitter_is_clamped() {
        assert_eq!(BackoffPolicy::default().with_jitter(4.0).jitter, 1.0);
        assert_eq!(BackoffPolicy::default().with_jitter(-1.0).jitter, 0.0);
        assert_eq!(BackoffPolicy::default().with_jitter(f64::NAN).jitter, 0.0);
    }

    #[test]
    fn test_policy_serialization_shape() {
        let value = serde_json::to_value(BackoffPolicy::default()).unwrap();
        assert_eq!(value["type"], "exponential");
        assert_eq!(value["delayMs"], 2000);
    }
}
