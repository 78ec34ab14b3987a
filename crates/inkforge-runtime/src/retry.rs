//! Retry policies
//!
//! Backoff schedules for node-level retries (linear) and queue-level
//! redelivery (exponential with jitter).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for retries
///
/// # Example
///
/// ```
/// use inkforge_runtime::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_secs(2))
///     .with_max_interval(Duration::from_secs(30));
///
/// // First retry after ~2 seconds, second after ~4, capped at 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Base delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Cap on the delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (1.0 = linear growth, 2.0 = exponential)
    pub backoff_coefficient: f64,

    /// Jitter fraction in [0, 1]: the delay is drawn uniformly from
    /// `[capped * (1 - jitter), capped]`. 1.0 is full jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 3 attempts, 2s base, 30s cap, full jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 1.0,
        }
    }

    /// Linear backoff: delay grows as `base * retry_number`, no jitter
    pub fn linear(base: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: base,
            max_interval: base * max_attempts.max(1),
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the base interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the interval cap
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the jitter fraction (clamped to [0, 1])
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether another attempt is allowed after `current_attempt` attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Delay before the given attempt number (1-based; attempt 1 is the
    /// initial call and has no delay)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = attempt - 1;

        let base = if (self.backoff_coefficient - 1.0).abs() < f64::EPSILON {
            // Linear: base * retry number
            self.initial_interval.as_secs_f64() * f64::from(retry_num)
        } else {
            self.initial_interval.as_secs_f64()
                * self.backoff_coefficient.powi(retry_num as i32 - 1)
        };
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let floor = capped * (1.0 - self.jitter);
            rand::thread_rng().gen_range(floor..=capped)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
