use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockrelay_core::{DomainError, DomainResult};
use stockrelay_events::{EnvelopeError, IntegrationEvent};

/// Exchange for the inventory bounded context.
pub const EXCHANGE: &str = "inventory";

/// Event type tags carried in `EventEnvelope::event_type`.
pub mod event_types {
    pub const PRODUCT_CREATED: &str = "ProductCreated";
    pub const PRODUCT_UPDATED: &str = "ProductUpdated";
    pub const PRODUCT_DELETED: &str = "ProductDeleted";

    pub const ALL: [&str; 3] = [PRODUCT_CREATED, PRODUCT_UPDATED, PRODUCT_DELETED];
}

/// Topic routing keys (`<entity>.<verb>`).
pub mod routing_keys {
    pub const PRODUCT_CREATED: &str = "product.created";
    pub const PRODUCT_UPDATED: &str = "product.updated";
    pub const PRODUCT_DELETED: &str = "product.deleted";
}

/// Product identifier as assigned by the inventory database.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub i64);

impl ProductId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Event: ProductCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductCreated {
    pub id: ProductId,
    pub name: String,
    pub description: String,
    /// Price in the smallest currency unit (e.g. cents).
    pub price_cents: u64,
    pub stock: i32,
    pub category: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductUpdated (full replacement of the mutable fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductUpdated {
    pub id: ProductId,
    pub name: String,
    pub description: String,
    pub price_cents: u64,
    pub stock: i32,
    pub category: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductDeleted {
    pub id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductEvent {
    Created(ProductCreated),
    Updated(ProductUpdated),
    Deleted(ProductDeleted),
}

impl ProductEvent {
    pub fn created(event: ProductCreated) -> DomainResult<Self> {
        let event = Self::Created(event);
        event.validate()?;
        Ok(event)
    }

    pub fn updated(event: ProductUpdated) -> DomainResult<Self> {
        let event = Self::Updated(event);
        event.validate()?;
        Ok(event)
    }

    pub fn deleted(id: ProductId, occurred_at: DateTime<Utc>) -> DomainResult<Self> {
        let event = Self::Deleted(ProductDeleted { id, occurred_at });
        event.validate()?;
        Ok(event)
    }

    pub fn product_id(&self) -> ProductId {
        match self {
            ProductEvent::Created(e) => e.id,
            ProductEvent::Updated(e) => e.id,
            ProductEvent::Deleted(e) => e.id,
        }
    }

    /// Field rules shared by producers (before publish) and consumers (after decode).
    pub fn validate(&self) -> DomainResult<()> {
        if self.product_id().0 <= 0 {
            return Err(DomainError::validation("product id must be positive"));
        }
        match self {
            ProductEvent::Created(ProductCreated {
                name, stock, ..
            })
            | ProductEvent::Updated(ProductUpdated {
                name, stock, ..
            }) => {
                if name.trim().is_empty() {
                    return Err(DomainError::validation("product name must not be empty"));
                }
                if *stock < 0 {
                    return Err(DomainError::validation("stock must not be negative"));
                }
                Ok(())
            }
            ProductEvent::Deleted(_) => Ok(()),
        }
    }
}

fn decode<T: DeserializeOwned>(event_type: &str, payload: &JsonValue) -> Result<T, EnvelopeError> {
    T::deserialize(payload).map_err(|e| EnvelopeError::SchemaMismatch {
        event_type: event_type.to_string(),
        reason: e.to_string(),
    })
}

impl IntegrationEvent for ProductEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProductEvent::Created(_) => event_types::PRODUCT_CREATED,
            ProductEvent::Updated(_) => event_types::PRODUCT_UPDATED,
            ProductEvent::Deleted(_) => event_types::PRODUCT_DELETED,
        }
    }

    fn routing_key(&self) -> &'static str {
        match self {
            ProductEvent::Created(_) => routing_keys::PRODUCT_CREATED,
            ProductEvent::Updated(_) => routing_keys::PRODUCT_UPDATED,
            ProductEvent::Deleted(_) => routing_keys::PRODUCT_DELETED,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductEvent::Created(e) => e.occurred_at,
            ProductEvent::Updated(e) => e.occurred_at,
            ProductEvent::Deleted(e) => e.occurred_at,
        }
    }

    fn to_payload(&self) -> Result<JsonValue, EnvelopeError> {
        let value = match self {
            ProductEvent::Created(e) => serde_json::to_value(e),
            ProductEvent::Updated(e) => serde_json::to_value(e),
            ProductEvent::Deleted(e) => serde_json::to_value(e),
        };
        value.map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }

    fn from_payload(event_type: &str, payload: &JsonValue) -> Result<Self, EnvelopeError> {
        let event = match event_type {
            event_types::PRODUCT_CREATED => ProductEvent::Created(decode(event_type, payload)?),
            event_types::PRODUCT_UPDATED => ProductEvent::Updated(decode(event_type, payload)?),
            event_types::PRODUCT_DELETED => ProductEvent::Deleted(decode(event_type, payload)?),
            other => return Err(EnvelopeError::UnknownEventType(other.to_string())),
        };

        event.validate().map_err(|e| EnvelopeError::SchemaMismatch {
            event_type: event_type.to_string(),
            reason: e.to_string(),
        })?;
        Ok(event)
    }
}
