use async_trait::async_trait;
use tracing::info;

use stockrelay_events::{EventEnvelope, HandlerError, HandlerRegistry, Handles};
use stockrelay_products::{ProductEvent, event_types};

/// Logs product changes for downstream notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductNotifier;

#[async_trait]
impl Handles<ProductEvent> for ProductNotifier {
    async fn on_event(&self, event: ProductEvent, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        match &event {
            ProductEvent::Created(created) => info!(
                message_id = %envelope.message_id(),
                product_id = %created.id,
                name = %created.name,
                price_cents = created.price_cents,
                stock = created.stock,
                category = %created.category,
                "product created"
            ),
            ProductEvent::Updated(updated) => info!(
                message_id = %envelope.message_id(),
                product_id = %updated.id,
                name = %updated.name,
                price_cents = updated.price_cents,
                stock = updated.stock,
                "product updated"
            ),
            ProductEvent::Deleted(deleted) => info!(
                message_id = %envelope.message_id(),
                product_id = %deleted.id,
                "product deleted"
            ),
        }
        Ok(())
    }
}

/// One handler per product event type.
pub fn product_handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for event_type in event_types::ALL {
        registry.register_typed::<ProductEvent, _>(event_type, ProductNotifier);
    }
    registry
}
