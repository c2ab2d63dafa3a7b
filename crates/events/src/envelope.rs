use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockrelay_core::MessageId;

use crate::event::IntegrationEvent;

/// Envelope for an integration event, as it travels through the broker.
///
/// Notes:
/// - `event_type` and `routing_key` are fixed at creation; there are no setters.
/// - `payload` is the JSON form of exactly one event schema, selected by `event_type`.
/// - `attempt` counts processing attempts already made. The broker bumps it by one
///   on every redelivery; producers always publish with `attempt == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    message_id: MessageId,
    event_type: String,
    routing_key: String,
    payload: JsonValue,

    #[serde(default)]
    attempt: u32,

    published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("payload does not match schema for {event_type}: {reason}")]
    SchemaMismatch { event_type: String, reason: String },
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        routing_key: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            event_type: event_type.into(),
            routing_key: routing_key.into(),
            payload,
            attempt: 0,
            published_at: Utc::now(),
        }
    }

    /// Build an envelope from a typed event, taking its event type and routing key.
    pub fn from_event<E: IntegrationEvent>(event: &E) -> Result<Self, EnvelopeError> {
        Ok(Self::new(event.event_type(), event.routing_key(), event.to_payload()?))
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// The same message, as seen on its next delivery.
    pub fn redelivered(mut self) -> Self {
        self.attempt = self.attempt.saturating_add(1);
        self
    }

    /// Decode the payload into the typed event selected by `event_type`.
    pub fn decode<E: IntegrationEvent>(&self) -> Result<E, EnvelopeError> {
        E::from_payload(&self.event_type, &self.payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn new_envelope_starts_at_attempt_zero() {
        let env = EventEnvelope::new("ProductCreated", "product.created", json!({"id": 1}));
        assert_eq!(env.attempt(), 0);
        assert_eq!(env.event_type(), "ProductCreated");
        assert_eq!(env.routing_key(), "product.created");
    }

    #[test]
    fn redelivery_bumps_attempt_and_keeps_identity() {
        let env = EventEnvelope::new("ProductDeleted", "product.deleted", json!({"id": 7}));
        let again = env.clone().redelivered().redelivered();

        assert_eq!(again.attempt(), 2);
        assert_eq!(again.message_id(), env.message_id());
        assert_eq!(again.event_type(), env.event_type());
        assert_eq!(again.routing_key(), env.routing_key());
        assert_eq!(again.payload(), env.payload());
    }

    #[test]
    fn missing_attempt_field_defaults_to_zero() {
        let raw = json!({
            "messageId": MessageId::new(),
            "eventType": "ProductDeleted",
            "routingKey": "product.deleted",
            "payload": {"id": 3},
            "publishedAt": "2025-01-01T00:00:00Z"
        });
        let env = EventEnvelope::from_bytes(raw.to_string().as_bytes()).unwrap();
        assert_eq!(env.attempt(), 0);
    }

    #[test]
    fn garbage_bytes_are_a_deserialization_error() {
        let err = EventEnvelope::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, EnvelopeError::Deserialization(_)));
    }

    proptest! {
        #[test]
        fn wire_format_preserves_routing_fields(
            event_type in "[A-Z][A-Za-z]{0,30}",
            routing_key in "[a-z]{1,10}(\\.[a-z]{1,10}){0,3}",
            name in ".{0,40}",
            stock in any::<i32>(),
        ) {
            let env = EventEnvelope::new(
                event_type.clone(),
                routing_key.clone(),
                json!({"name": name, "stock": stock}),
            );
            let decoded = EventEnvelope::from_bytes(&env.to_bytes().unwrap()).unwrap();

            prop_assert_eq!(decoded.event_type(), event_type.as_str());
            prop_assert_eq!(decoded.routing_key(), routing_key.as_str());
            prop_assert_eq!(decoded.payload(), env.payload());
            prop_assert_eq!(decoded, env);
        }
    }
}
