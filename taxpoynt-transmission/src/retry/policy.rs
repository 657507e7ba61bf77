//! Retry policies and backoff calculation.

use std::{collections::HashSet, fmt, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use taxpoynt_common::TransmissionStatus;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    /// `base * multiplier^attempt`
    #[default]
    ExponentialBackoff,
    /// `base`
    FixedDelay,
    /// `base * (attempt + 1)`
    LinearBackoff,
    /// `base * fib(attempt + 1)`
    FibonacciBackoff,
}

/// Failure class derived from a result's error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryReason {
    NetworkError,
    Timeout,
    ServerError,
    AuthenticationError,
    RateLimit,
    TemporaryFailure,
    Unknown,
}

impl RetryReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ServerError => "SERVER_ERROR",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
            Self::RateLimit => "RATE_LIMIT",
            Self::TemporaryFailure => "TEMPORARY_FAILURE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When and how often a failed transmission is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub strategy: RetryStrategy,

    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: f64,

    /// Upper bound applied after jitter.
    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: f64,

    #[serde(default = "defaults::backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Symmetric jitter as a fraction of the delay, e.g. `0.1` for ±10%.
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,

    #[serde(default = "defaults::retry_on_status")]
    pub retry_on_status: HashSet<TransmissionStatus>,

    #[serde(default = "defaults::retry_on_reasons")]
    pub retry_on_reasons: HashSet<RetryReason>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            strategy: RetryStrategy::default(),
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            backoff_multiplier: defaults::backoff_multiplier(),
            jitter_factor: defaults::jitter_factor(),
            retry_on_status: defaults::retry_on_status(),
            retry_on_reasons: defaults::retry_on_reasons(),
        }
    }
}

impl RetryPolicy {
    /// Whether a failure with `status` and `reason` qualifies for a retry.
    #[must_use]
    pub fn is_eligible(&self, status: TransmissionStatus, reason: RetryReason) -> bool {
        self.retry_on_status.contains(&status) && self.retry_on_reasons.contains(&reason)
    }

    /// Delay before retry number `attempt` (0-indexed).
    ///
    /// Jitter is applied to the raw delay and the result is clamped to
    /// `[0, max_delay]`. A raw delay that overflows to infinity yields
    /// `max_delay`.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_secs;
        let raw = match self.strategy {
            RetryStrategy::ExponentialBackoff => {
                base * self
                    .backoff_multiplier
                    .powi(i32::try_from(attempt).unwrap_or(i32::MAX))
            }
            RetryStrategy::FixedDelay => base,
            RetryStrategy::LinearBackoff => base * (f64::from(attempt) + 1.0),
            RetryStrategy::FibonacciBackoff => base * fibonacci(attempt.saturating_add(1)),
        };

        let jittered = if raw.is_finite() && self.jitter_factor > 0.0 {
            let spread = rand::rng().random_range(-1.0..=1.0);
            raw + raw * self.jitter_factor * spread
        } else {
            raw
        };

        let max = self.max_delay_secs.max(0.0);
        let secs = if jittered.is_nan() {
            max
        } else {
            jittered.clamp(0.0, max)
        };

        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// `fib(1) = fib(2) = 1`, saturating at infinity.
fn fibonacci(n: u32) -> f64 {
    let (mut previous, mut current) = (0.0_f64, 1.0_f64);
    for _ in 1..n {
        (previous, current) = (current, previous + current);
        if current.is_infinite() {
            break;
        }
    }
    if n == 0 { 0.0 } else { current }
}

mod defaults {
    use std::collections::HashSet;

    use taxpoynt_common::TransmissionStatus;

    use super::RetryReason;

    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn base_delay_secs() -> f64 {
        1.0
    }

    pub const fn max_delay_secs() -> f64 {
        300.0
    }

    pub const fn backoff_multiplier() -> f64 {
        2.0
    }

    pub const fn jitter_factor() -> f64 {
        0.1
    }

    pub fn retry_on_status() -> HashSet<TransmissionStatus> {
        HashSet::from([TransmissionStatus::Failed])
    }

    pub fn retry_on_reasons() -> HashSet<RetryReason> {
        HashSet::from([
            RetryReason::NetworkError,
            RetryReason::Timeout,
            RetryReason::ServerError,
            RetryReason::RateLimit,
            RetryReason::TemporaryFailure,
        ])
    }
}
