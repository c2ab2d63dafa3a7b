//! Infrastructure for the inventory event pipeline.
//!
//! - [`broker`]: networked broker transports (RabbitMQ behind the `amqp` feature)
//! - [`delivery`]: timeout + circuit breaker guard, guarded publisher, topology
//! - [`consumer`]: retrying consumer, dead-letter router, retry policy
//! - [`audit`]: append-only audit log (in-memory and Postgres)
//! - [`config`]: environment-driven pipeline configuration

pub mod audit;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod delivery;

#[cfg(test)]
mod test_support;

pub use audit::{
    AuditEntryId, AuditError, AuditLog, AuditLogEntry, AuditOutcome, AuditQuery, AuditRecord,
    InMemoryAuditLog, PostgresAuditLog,
};
#[cfg(feature = "amqp")]
pub use broker::{AmqpBroker, AmqpConfig};
pub use config::{ConfigError, PipelineConfig};
pub use consumer::{
    BackoffStrategy, ConsumerConfig, ConsumerHandle, ConsumerStats, DeadLetterRouter, DivertError,
    ProcessingOutcome, RetryPolicy, RetryingConsumer,
};
pub use delivery::{
    BoundaryStatus, CircuitSnapshot, CircuitState, DeliveryError, DeliveryPolicy,
    DeliveryPolicyConfig, EventPublisher, PublishError, Topology,
};
