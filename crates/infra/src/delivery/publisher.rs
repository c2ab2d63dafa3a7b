use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use stockrelay_core::MessageId;
use stockrelay_events::{Broker, BrokerError, EnvelopeError, EventEnvelope, IntegrationEvent};

use super::policy::{DeliveryError, DeliveryPolicy};

/// Why a publish did not go through. Every variant reaches the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Broker judged unhealthy; nothing was sent.
    #[error("broker temporarily unavailable (retry after {retry_after:?})")]
    CircuitOpen { retry_after: Duration },

    /// The broker did not confirm in time; the message may or may not be queued.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Encode(#[from] EnvelopeError),
}

/// Outcome class for a request/response boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundaryStatus {
    ServiceUnavailable,
    GatewayTimeout,
    InternalError,
}

impl BoundaryStatus {
    pub fn http_status(&self) -> u16 {
        match self {
            BoundaryStatus::ServiceUnavailable => 503,
            BoundaryStatus::GatewayTimeout => 504,
            BoundaryStatus::InternalError => 500,
        }
    }
}

impl PublishError {
    pub fn boundary_status(&self) -> BoundaryStatus {
        match self {
            PublishError::CircuitOpen { .. } => BoundaryStatus::ServiceUnavailable,
            PublishError::Timeout(_) => BoundaryStatus::GatewayTimeout,
            PublishError::Broker(_) | PublishError::Encode(_) => BoundaryStatus::InternalError,
        }
    }
}

impl From<DeliveryError<BrokerError>> for PublishError {
    fn from(err: DeliveryError<BrokerError>) -> Self {
        match err {
            DeliveryError::CircuitOpen { retry_after } => PublishError::CircuitOpen { retry_after },
            DeliveryError::Timeout(budget) => PublishError::Timeout(budget),
            DeliveryError::Failed(e) => PublishError::Broker(e),
        }
    }
}

/// Publishes envelopes to one exchange through a [`DeliveryPolicy`].
///
/// `Ok` means the broker accepted the message. Delivery to consumers is not
/// confirmed (at-least-once from the producer's side).
#[derive(Debug, Clone)]
pub struct EventPublisher<B> {
    broker: B,
    exchange: String,
    policy: Arc<DeliveryPolicy>,
}

impl<B: Broker> EventPublisher<B> {
    pub fn new(broker: B, exchange: impl Into<String>, policy: Arc<DeliveryPolicy>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            policy,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn policy(&self) -> &Arc<DeliveryPolicy> {
        &self.policy
    }

    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        self.publish_within(envelope, self.policy.config().timeout_budget)
            .await
    }

    /// Publish with a caller deadline; the policy budget still caps it.
    #[instrument(
        skip(self, envelope),
        fields(
            exchange = %self.exchange,
            event_type = %envelope.event_type(),
            routing_key = %envelope.routing_key(),
            message_id = %envelope.message_id()
        ),
        err
    )]
    pub async fn publish_within(
        &self,
        envelope: &EventEnvelope,
        deadline: Duration,
    ) -> Result<(), PublishError> {
        self.policy
            .execute_within(deadline, || self.broker.publish(&self.exchange, envelope))
            .await
            .map_err(PublishError::from)
    }

    /// Wrap a typed event in a fresh envelope and publish it.
    pub async fn publish_event<E: IntegrationEvent>(&self, event: &E) -> Result<MessageId, PublishError> {
        let envelope = EventEnvelope::from_event(event)?;
        self.publish(&envelope).await?;
        Ok(envelope.message_id())
    }
}
