//! Pipeline wiring (public entrypoint used by `main.rs`).
//!
//! - broker: RabbitMQ when `AMQP_URL` is set, in-process otherwise
//! - audit log: Postgres when `DATABASE_URL` is set, in-memory otherwise
//! - topology: declared on every start
//! - one retrying consumer per product queue
//! - dead letters are forwarded to the error exchange only when
//!   `forward_dead_letters` is on; the in-process broker has no reader for it
//! - a guarded publisher on the inventory exchange

use std::sync::Arc;

use tracing::{info, warn};

use stockrelay_events::{Broker, BrokerError, InMemoryBroker};
use stockrelay_infra::{
    AmqpBroker, AmqpConfig, AuditError, AuditLog, ConfigError, ConsumerHandle, ConsumerStats, DeadLetterRouter,
    DeliveryPolicy, EventPublisher, InMemoryAuditLog, PipelineConfig, PostgresAuditLog,
    RetryingConsumer, Topology,
};

use crate::handlers::product_handlers;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("topology declaration failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("audit log unavailable: {0}")]
    Audit(#[from] AuditError),
}

/// Pick the broker transport from configuration.
pub async fn build_broker(config: &PipelineConfig) -> Result<Arc<dyn Broker>, BrokerError> {
    match &config.amqp_url {
        Some(url) => {
            let mut amqp = AmqpConfig::new(url.as_str()).with_prefetch(config.amqp_prefetch);
            if config.forward_dead_letters {
                amqp = amqp.with_dead_letter_exchange(
                    Topology::products(config.exchange.as_str()).error_exchange(),
                );
            }
            let broker = AmqpBroker::connect(amqp).await?;
            info!("broker: amqp");
            Ok(Arc::new(broker))
        }
        None => {
            warn!("AMQP_URL not set; messages live in process memory only");
            Ok(InMemoryBroker::arc())
        }
    }
}

/// Pick the audit backend from configuration.
pub async fn build_audit_log(config: &PipelineConfig) -> Result<Arc<dyn AuditLog>, AuditError> {
    match &config.database_url {
        Some(url) => {
            let log = PostgresAuditLog::connect(url).await?;
            log.ensure_schema().await?;
            info!("audit log: postgres");
            Ok(Arc::new(log))
        }
        None => {
            warn!("DATABASE_URL not set; audit entries are kept in memory only");
            Ok(Arc::new(InMemoryAuditLog::new()))
        }
    }
}

/// A running pipeline: consumers draining the product queues plus the publisher feeding them.
pub struct Pipeline {
    topology: Topology,
    publisher: EventPublisher<Arc<dyn Broker>>,
    audit: Arc<dyn AuditLog>,
    consumers: Vec<ConsumerHandle>,
}

impl Pipeline {
    pub async fn start(
        config: &PipelineConfig,
        broker: Arc<dyn Broker>,
        audit: Arc<dyn AuditLog>,
    ) -> Result<Self, StartupError> {
        let topology = Topology::products(config.exchange.as_str());
        topology.declare(&*broker).await?;

        let handlers = Arc::new(product_handlers());
        let mut dead_letters = DeadLetterRouter::new(broker.clone(), audit.clone());
        if config.forward_dead_letters {
            dead_letters = dead_letters.with_error_exchange(topology.error_exchange());
        }

        let consumers: Vec<ConsumerHandle> = topology
            .queues()
            .map(|queue| {
                RetryingConsumer::new(
                    broker.clone(),
                    handlers.clone(),
                    audit.clone(),
                    dead_letters.clone(),
                    config.consumer_config(queue),
                )
                .spawn()
            })
            .collect();

        let policy = DeliveryPolicy::new(topology.exchange(), config.delivery.clone())?;
        let publisher = EventPublisher::new(broker, topology.exchange(), Arc::new(policy));

        info!(
            exchange = %topology.exchange(),
            consumers = consumers.len(),
            max_retries = config.retry.max_retries,
            forward_dead_letters = config.forward_dead_letters,
            "pipeline started"
        );

        Ok(Self {
            topology,
            publisher,
            audit,
            consumers,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn publisher(&self) -> &EventPublisher<Arc<dyn Broker>> {
        &self.publisher
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    /// Stop every consumer after its in-flight messages settle.
    pub async fn shutdown(self) -> Vec<(String, ConsumerStats)> {
        let mut stats = Vec::with_capacity(self.consumers.len());
        for handle in self.consumers {
            let queue = handle.queue().to_string();
            stats.push((queue, handle.shutdown().await));
        }
        stats
    }
}
