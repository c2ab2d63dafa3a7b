use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::envelope::EnvelopeError;

/// A typed integration event meant for other services.
///
/// Integration events are:
/// - **immutable** facts about a completed business mutation
/// - **routable**: each variant has a stable event type and a topic routing key
/// - **schema-strict**: a payload decodes into exactly one variant, chosen by event type
pub trait IntegrationEvent: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event type tag (e.g. "ProductCreated").
    fn event_type(&self) -> &'static str;

    /// Topic routing key (`<entity>.<verb>`, e.g. "product.created").
    fn routing_key(&self) -> &'static str;

    /// When the mutation happened (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Serialize the variant's fields (without any variant tag).
    fn to_payload(&self) -> Result<JsonValue, EnvelopeError>;

    /// Rebuild the variant registered for `event_type` from its payload.
    fn from_payload(event_type: &str, payload: &JsonValue) -> Result<Self, EnvelopeError>;
}
