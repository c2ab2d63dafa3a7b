//! Exchange, queue and binding layout of the pipeline.

use tracing::info;

use stockrelay_events::{Broker, BrokerError, QueueBinding};
use stockrelay_products::{EXCHANGE, routing_keys};

/// Durable queue names, one per event type.
pub mod queues {
    pub const PRODUCT_CREATED: &str = "product-created-queue";
    pub const PRODUCT_UPDATED: &str = "product-updated-queue";
    pub const PRODUCT_DELETED: &str = "product-deleted-queue";

    /// Receives every dead-lettered envelope.
    pub const ERRORS: &str = "inventory-error-queue";
}

pub const ERROR_EXCHANGE: &str = "inventory.errors";

/// One topic exchange per bounded context, one queue per event type, plus an
/// error exchange whose queue (bound with `#`) collects diverted messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: String,
    bindings: Vec<QueueBinding>,
    error_exchange: String,
    error_queue: String,
}

impl Topology {
    pub fn new(exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        Self {
            error_exchange: format!("{exchange}.errors"),
            error_queue: format!("{exchange}-error-queue"),
            exchange,
            bindings: Vec::new(),
        }
    }

    /// The inventory context: `product.{created,updated,deleted}` each to its own queue.
    pub fn inventory() -> Self {
        Self::products(EXCHANGE).with_error_channel(ERROR_EXCHANGE, queues::ERRORS)
    }

    /// Product queues bound to `exchange`; the error channel is named after it.
    pub fn products(exchange: impl Into<String>) -> Self {
        Self::new(exchange)
            .with_queue(queues::PRODUCT_CREATED, routing_keys::PRODUCT_CREATED)
            .with_queue(queues::PRODUCT_UPDATED, routing_keys::PRODUCT_UPDATED)
            .with_queue(queues::PRODUCT_DELETED, routing_keys::PRODUCT_DELETED)
    }

    pub fn with_queue(mut self, queue: impl Into<String>, binding_key: impl Into<String>) -> Self {
        self.bindings
            .push(QueueBinding::new(self.exchange.clone(), queue, binding_key));
        self
    }

    pub fn with_error_channel(
        mut self,
        error_exchange: impl Into<String>,
        error_queue: impl Into<String>,
    ) -> Self {
        self.error_exchange = error_exchange.into();
        self.error_queue = error_queue.into();
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn error_exchange(&self) -> &str {
        &self.error_exchange
    }

    pub fn error_queue(&self) -> &str {
        &self.error_queue
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    /// Consumer queues (the error queue is not one of them).
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.queue.as_str())
    }

    /// Declare exchanges, queues and bindings. Safe to run on every startup.
    pub async fn declare<B: Broker + ?Sized>(&self, broker: &B) -> Result<(), BrokerError> {
        broker.declare_exchange(&self.exchange).await?;
        for binding in &self.bindings {
            broker.bind_queue(binding).await?;
        }

        broker.declare_exchange(&self.error_exchange).await?;
        broker
            .bind_queue(&QueueBinding::new(
                self.error_exchange.clone(),
                self.error_queue.clone(),
                "#",
            ))
            .await?;

        info!(
            exchange = %self.exchange,
            queues = self.bindings.len(),
            error_exchange = %self.error_exchange,
            "topology declared"
        );
        Ok(())
    }
}
