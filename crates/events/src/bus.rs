//! Broker publish/consume abstraction (mechanics only).
//!
//! This module models a **topic-exchange broker**:
//!
//! ```text
//! publisher ─publish(exchange, envelope)─▶ exchange ─routing key match─▶ queue(s) ─receive─▶ consumer
//!                                                                           ▲                  │
//!                                                                           └──redeliver(+1)───┤
//!                                                                                  ack ◀───────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a received message stays unacknowledged until `ack`; it may be
//!   delivered again after a crash or an explicit `redeliver`.
//! - **Attempt counter**: `redeliver` hands the message back with `attempt + 1`, so a
//!   consumer reads the attempt number from the envelope instead of owning it.
//! - **Ordering**: FIFO per queue. Nothing is guaranteed across queues.
//!
//! ## Thread Safety
//!
//! Implementations are shared across publishers and consumer loops (`Send + Sync`);
//! connection pooling, if any, is the implementation's concern.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::envelope::EventEnvelope;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("exchange not declared: {0}")]
    UnknownExchange(String),

    #[error("queue not declared: {0}")]
    UnknownQueue(String),

    #[error("unknown delivery tag {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },

    #[error("broker rejected message: {0}")]
    Rejected(String),

    /// Internal lock poisoning (in-process brokers).
    #[error("broker state poisoned")]
    Poisoned,
}

/// A durable queue bound to an exchange with a binding key pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    /// Topic pattern (`*` = exactly one word, `#` = zero or more words).
    pub binding_key: String,
}

impl QueueBinding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        binding_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            binding_key: binding_key.into(),
        }
    }
}

/// A message handed to a consumer, awaiting `ack` or `redeliver`.
#[derive(Debug, Clone)]
pub struct Delivery {
    queue: String,
    tag: u64,
    envelope: EventEnvelope,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, tag: u64, envelope: EventEnvelope) -> Self {
        Self {
            queue: queue.into(),
            tag,
            envelope,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Broker-assigned delivery tag (unique per delivery, not per message).
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    pub fn into_envelope(self) -> EventEnvelope {
        self.envelope
    }
}

/// Topic-exchange broker client.
///
/// `publish` returning `Ok` means the broker **accepted** the message; it says
/// nothing about consumers. Unroutable messages (no matching binding) are accepted
/// and dropped, like an AMQP topic exchange without the mandatory flag.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a topic exchange (idempotent).
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Declare a durable queue and bind it to an exchange (idempotent).
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError>;

    /// Publish an envelope to an exchange using its routing key.
    async fn publish(&self, exchange: &str, envelope: &EventEnvelope) -> Result<(), BrokerError>;

    /// Wait for the next message on a queue.
    ///
    /// Returns `Ok(None)` once the broker is closed. Must be cancel-safe: dropping
    /// the future never loses a message.
    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery (removes the message for good).
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Return a delivery to its queue after `delay`, with `attempt + 1`.
    async fn redeliver(&self, delivery: Delivery, delay: Duration) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        (**self).declare_exchange(exchange).await
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        (**self).bind_queue(binding).await
    }

    async fn publish(&self, exchange: &str, envelope: &EventEnvelope) -> Result<(), BrokerError> {
        (**self).publish(exchange, envelope).await
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        (**self).receive(queue).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery).await
    }

    async fn redeliver(&self, delivery: Delivery, delay: Duration) -> Result<(), BrokerError> {
        (**self).redeliver(delivery, delay).await
    }
}
