//! Redelivery policy for a consumer queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between redeliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same interval every time
    #[default]
    Fixed,
    /// interval * 2^(attempt - 1)
    Exponential,
    /// interval * attempt
    Linear,
}

impl BackoffStrategy {
    /// Case-insensitive parse of `fixed` / `exponential` / `linear`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "exponential" => Some(Self::Exponential),
            "linear" => Some(Self::Linear),
            _ => None,
        }
    }
}

/// Bounded retry settings.
///
/// A message that fails strictly more than `max_retries` times is dead-lettered:
/// deliveries with `attempt < max_retries` are redelivered, the one with
/// `attempt == max_retries` is the last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Redeliveries allowed after the first attempt (0 = no retries)
    pub max_retries: u32,
    /// Base delay between redeliveries
    pub interval: Duration,
    /// Upper bound for growing strategies
    pub max_interval: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(60),
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Dead-letter on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
            max_interval: interval,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_retries: u32, interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
            max_interval: max_interval.max(interval),
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn linear(max_retries: u32, interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
            max_interval: max_interval.max(interval),
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Delay before redelivery number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.interval,
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.capped(self.interval.checked_mul(factor))
            }
            BackoffStrategy::Linear => self.capped(self.interval.checked_mul(attempt)),
        }
    }

    /// Whether a delivery that failed at `attempt` (0-indexed) gets another one.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    fn capped(&self, delay: Option<Duration>) -> Duration {
        delay.map_or(self.max_interval, |d| d.min(self.max_interval))
    }
}
