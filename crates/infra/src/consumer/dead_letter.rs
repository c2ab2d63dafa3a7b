use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use stockrelay_events::{Broker, BrokerError, Delivery};

use crate::audit::{AuditEntryId, AuditError, AuditLog, AuditRecord};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DivertError {
    /// Nothing was recorded and the message is still unacknowledged.
    #[error("dead-letter audit append failed: {0}")]
    Audit(#[from] AuditError),

    /// Recorded, but the original could not be acknowledged.
    #[error("dead-lettered message could not be acknowledged: {0}")]
    Ack(#[from] BrokerError),
}

/// Takes a message out of normal processing for good.
///
/// Order of operations: audit append, forward to the error exchange (best
/// effort), ack the original. Never retries on its own.
#[derive(Clone)]
pub struct DeadLetterRouter {
    broker: Arc<dyn Broker>,
    audit: Arc<dyn AuditLog>,
    error_exchange: Option<String>,
}

impl DeadLetterRouter {
    pub fn new(broker: Arc<dyn Broker>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            broker,
            audit,
            error_exchange: None,
        }
    }

    /// Also copy diverted envelopes to `exchange` (e.g. `inventory.errors`).
    pub fn with_error_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.error_exchange = Some(exchange.into());
        self
    }

    pub fn error_exchange(&self) -> Option<&str> {
        self.error_exchange.as_deref()
    }

    pub async fn divert(
        &self,
        delivery: &Delivery,
        attempts_made: u32,
        reason: &str,
        received_at: DateTime<Utc>,
    ) -> Result<AuditEntryId, DivertError> {
        let envelope = delivery.envelope();
        let record = AuditRecord::dead_lettered(delivery, attempts_made, received_at, reason);
        let entry_id = self.audit.append(record).await?;

        warn!(
            queue = delivery.queue(),
            message_id = %envelope.message_id(),
            event_type = envelope.event_type(),
            attempts = attempts_made,
            reason,
            audit_entry = %entry_id,
            "message dead-lettered"
        );

        if let Some(exchange) = &self.error_exchange {
            if let Err(err) = self.broker.publish(exchange, envelope).await {
                error!(
                    error_exchange = %exchange,
                    message_id = %envelope.message_id(),
                    error = %err,
                    "failed to forward dead-lettered message"
                );
            }
        }

        self.broker.ack(delivery).await?;
        Ok(entry_id)
    }
}

impl core::fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("error_exchange", &self.error_exchange)
            .finish_non_exhaustive()
    }
}
