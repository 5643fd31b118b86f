//! Retry policy for placement rounds

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};

use super::duration_millis;

/// How many times a placer walks the whole candidate list, and how long it
/// waits between walks
///
/// Supports exponential backoff with jitter so that many calls failing at
/// once do not re-hit the pool in lockstep.
///
/// # Example
///
/// ```
/// use switchyard_placement::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_millis(10))
///     .with_max_interval(Duration::from_millis(200));
///
/// assert!(policy.has_attempts_remaining(2));
/// assert!(!policy.has_attempts_remaining(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of rounds (including the first)
    pub max_attempts: u32,

    /// Delay before the second round
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between rounds
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential), at least 1.0
    #[serde(deserialize_with = "deserialize_coefficient")]
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    #[serde(deserialize_with = "deserialize_jitter")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with defaults suited to placement
    ///
    /// - 5 rounds
    /// - 10 millisecond initial interval
    /// - 1 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// A single round: every candidate is tried at most once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = clamp_coefficient(coefficient);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = clamp_jitter(jitter);
        self
    }

    /// Delay before the given round (1-based); zero for the first round
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        // Public fields may bypass the setters
        let coefficient = clamp_coefficient(self.backoff_coefficient);
        let jitter = clamp_jitter(self.jitter);

        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let base = self.initial_interval.as_secs_f64() * coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            capped + jitter_offset
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(self.max_interval)
    }

    /// Check if there are remaining rounds after `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// NaN and values below 1.0 would shrink or flip the delay
fn clamp_coefficient(coefficient: f64) -> f64 {
    if coefficient.is_nan() {
        1.0
    } else {
        coefficient.max(1.0)
    }
}

fn clamp_jitter(jitter: f64) -> f64 {
    if jitter.is_nan() {
        0.0
    } else {
        jitter.clamp(0.0, 1.0)
    }
}

fn deserialize_coefficient<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    f64::deserialize(deserializer).map(clamp_coefficient)
}

fn deserialize_jitter<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    f64::deserialize(deserializer).map(clamp_jitter)
}
