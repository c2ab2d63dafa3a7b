//! Pipeline configuration loaded from environment variables.
//!
//! | variable | default |
//! |----------|---------|
//! | `STOCKRELAY_EXCHANGE` | `inventory` |
//! | `STOCKRELAY_PUBLISH_TIMEOUT_MS` | 5000 |
//! | `STOCKRELAY_FAILURE_THRESHOLD` | 2 |
//! | `STOCKRELAY_BREAK_DURATION_MS` | 8000 |
//! | `STOCKRELAY_RETRY_COUNT` | 3 |
//! | `STOCKRELAY_RETRY_INTERVAL_MS` | 2000 |
//! | `STOCKRELAY_RETRY_MAX_INTERVAL_MS` | 60000 |
//! | `STOCKRELAY_RETRY_BACKOFF` | `fixed` |
//! | `STOCKRELAY_CONCURRENCY_LIMIT` | 1 |
//! | `DATABASE_URL` | unset (in-memory audit log) |
//! | `AMQP_URL` | unset (in-process broker) |
//! | `STOCKRELAY_AMQP_PREFETCH` | 32 |
//! | `STOCKRELAY_FORWARD_DEAD_LETTERS` | `true` with `AMQP_URL`, else `false` |

use std::str::FromStr;
use std::time::Duration;

use stockrelay_products::EXCHANGE;

use crate::consumer::{BackoffStrategy, ConsumerConfig, RetryPolicy};
use crate::delivery::DeliveryPolicyConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub exchange: String,
    pub delivery: DeliveryPolicyConfig,
    pub retry: RetryPolicy,
    pub concurrency_limit: usize,
    /// Postgres URL for the audit log; `None` keeps the audit log in memory.
    pub database_url: Option<String>,
    /// RabbitMQ URL; `None` runs on the in-process broker.
    pub amqp_url: Option<String>,
    /// Unacknowledged deliveries the AMQP broker hands out per queue.
    pub amqp_prefetch: u16,
    /// Copy dead-lettered envelopes to the error exchange.
    pub forward_dead_letters: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            exchange: EXCHANGE.to_string(),
            delivery: DeliveryPolicyConfig::default(),
            retry: RetryPolicy::default(),
            concurrency_limit: 1,
            database_url: None,
            amqp_url: None,
            amqp_prefetch: 32,
            forward_dead_letters: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (tests pass a map instead of touching the process env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let exchange = read("STOCKRELAY_EXCHANGE").unwrap_or(defaults.exchange);

        let delivery = DeliveryPolicyConfig {
            timeout_budget: millis(&read, "STOCKRELAY_PUBLISH_TIMEOUT_MS")?
                .unwrap_or(defaults.delivery.timeout_budget),
            failure_threshold: parse(&read, "STOCKRELAY_FAILURE_THRESHOLD")?
                .unwrap_or(defaults.delivery.failure_threshold),
            break_duration: millis(&read, "STOCKRELAY_BREAK_DURATION_MS")?
                .unwrap_or(defaults.delivery.break_duration),
        };
        delivery.validate()?;

        let strategy = match read("STOCKRELAY_RETRY_BACKOFF") {
            None => defaults.retry.strategy,
            Some(raw) => BackoffStrategy::parse(&raw).ok_or_else(|| {
                ConfigError::invalid(
                    "STOCKRELAY_RETRY_BACKOFF",
                    format!("expected fixed, exponential or linear, got {raw:?}"),
                )
            })?,
        };
        let interval =
            millis(&read, "STOCKRELAY_RETRY_INTERVAL_MS")?.unwrap_or(defaults.retry.interval);
        let max_interval = millis(&read, "STOCKRELAY_RETRY_MAX_INTERVAL_MS")?
            .unwrap_or(Duration::from_secs(60))
            .max(interval);
        let retry = RetryPolicy {
            max_retries: parse(&read, "STOCKRELAY_RETRY_COUNT")?.unwrap_or(defaults.retry.max_retries),
            interval,
            max_interval,
            strategy,
        };

        let concurrency_limit: usize =
            parse(&read, "STOCKRELAY_CONCURRENCY_LIMIT")?.unwrap_or(defaults.concurrency_limit);
        if concurrency_limit == 0 {
            return Err(ConfigError::invalid("STOCKRELAY_CONCURRENCY_LIMIT", "must be at least 1"));
        }

        let amqp_prefetch: u16 =
            parse(&read, "STOCKRELAY_AMQP_PREFETCH")?.unwrap_or(defaults.amqp_prefetch);
        if amqp_prefetch == 0 {
            return Err(ConfigError::invalid("STOCKRELAY_AMQP_PREFETCH", "must be at least 1"));
        }

        // Only a durable broker has an error queue someone else can drain.
        let amqp_url = read("AMQP_URL");
        let forward_dead_letters =
            parse(&read, "STOCKRELAY_FORWARD_DEAD_LETTERS")?.unwrap_or(amqp_url.is_some());

        Ok(Self {
            exchange,
            delivery,
            retry,
            concurrency_limit,
            database_url: read("DATABASE_URL"),
            amqp_url,
            amqp_prefetch,
            forward_dead_letters,
        })
    }

    /// Consumer settings for one queue, sharing this pipeline's retry policy.
    pub fn consumer_config(&self, queue: impl Into<String>) -> ConsumerConfig {
        ConsumerConfig::new(queue)
            .with_retry(self.retry.clone())
            .with_concurrency_limit(self.concurrency_limit)
    }
}

fn parse<T, R>(read: &R, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    R: Fn(&str) -> Option<String>,
{
    read(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| ConfigError::invalid(key, format!("{raw:?}: {e}")))
        })
        .transpose()
}

fn millis<R>(read: &R, key: &str) -> Result<Option<Duration>, ConfigError>
where
    R: Fn(&str) -> Option<String>,
{
    Ok(parse::<u64, R>(read, key)?.map(Duration::from_millis))
}
