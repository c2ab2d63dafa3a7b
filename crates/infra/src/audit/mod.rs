//! Append-only audit log of terminal consumer outcomes.
//!
//! Every consumed message ends in exactly one entry: `Processed` when its handler
//! succeeded, `DeadLettered` when it was diverted. Entries are never updated or
//! deleted here; retention is an operational concern.
//!
//! Delivery is at-least-once, so a message may appear more than once (e.g. a
//! crash between append and ack). `entries_for_message` is the idempotency check.

mod in_memory;
mod postgres;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockrelay_core::MessageId;
use stockrelay_events::Delivery;

pub use in_memory::InMemoryAuditLog;
pub use postgres::PostgresAuditLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Processed,
    DeadLettered,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Processed => "processed",
            AuditOutcome::DeadLettered => "dead_lettered",
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(AuditOutcome::Processed),
            "dead_lettered" => Ok(AuditOutcome::DeadLettered),
            other => Err(AuditError::Corrupt(format!("unknown audit outcome: {other}"))),
        }
    }
}

impl core::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-assigned entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditEntryId(pub i64);

impl core::fmt::Display for AuditEntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// What gets written for one terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub message_id: MessageId,
    pub event_type: String,
    pub routing_key: String,
    pub source_queue: String,
    /// Verbatim envelope payload.
    pub payload: JsonValue,
    /// Deliveries handled for this message, including the final one.
    pub attempts: u32,
    pub received_at: DateTime<Utc>,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl AuditRecord {
    pub fn processed(delivery: &Delivery, attempts: u32, received_at: DateTime<Utc>) -> Self {
        Self::from_delivery(delivery, attempts, received_at, AuditOutcome::Processed, None)
    }

    pub fn dead_lettered(
        delivery: &Delivery,
        attempts: u32,
        received_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self::from_delivery(
            delivery,
            attempts,
            received_at,
            AuditOutcome::DeadLettered,
            Some(reason.into()),
        )
    }

    fn from_delivery(
        delivery: &Delivery,
        attempts: u32,
        received_at: DateTime<Utc>,
        outcome: AuditOutcome,
        error_detail: Option<String>,
    ) -> Self {
        let envelope = delivery.envelope();
        Self {
            message_id: envelope.message_id(),
            event_type: envelope.event_type().to_string(),
            routing_key: envelope.routing_key().to_string(),
            source_queue: delivery.queue().to_string(),
            payload: envelope.payload().clone(),
            attempts,
            received_at,
            outcome,
            error_detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: AuditEntryId,
    #[serde(flatten)]
    pub record: AuditRecord,
}

/// Filter for reading the log back. Results come oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditQuery {
    pub outcome: Option<AuditOutcome>,
    pub event_type: Option<String>,
    pub message_id: Option<MessageId>,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            outcome: None,
            event_type: None,
            message_id: None,
            limit: 100,
        }
    }
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.outcome.is_none_or(|o| o == record.outcome)
            && self
                .event_type
                .as_deref()
                .is_none_or(|t| t == record.event_type)
            && self.message_id.is_none_or(|id| id == record.message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(String),

    #[error("audit record rejected by store: {0}")]
    Rejected(String),

    #[error("corrupt audit row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append one record; the store assigns the id.
    async fn append(&self, record: AuditRecord) -> Result<AuditEntryId, AuditError>;

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, AuditError>;

    async fn count(&self, outcome: AuditOutcome) -> Result<u64, AuditError>;

    /// Every entry recorded for one message id.
    async fn entries_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.query(&AuditQuery::new().message_id(message_id).limit(usize::MAX))
            .await
    }
}

#[async_trait]
impl<L> AuditLog for Arc<L>
where
    L: AuditLog + ?Sized,
{
    async fn append(&self, record: AuditRecord) -> Result<AuditEntryId, AuditError> {
        (**self).append(record).await
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, AuditError> {
        (**self).query(query).await
    }

    async fn count(&self, outcome: AuditOutcome) -> Result<u64, AuditError> {
        (**self).count(outcome).await
    }

    async fn entries_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        (**self).entries_for_message(message_id).await
    }
}
