//! Integration events and broker mechanics.
//!
//! - [`EventEnvelope`]: the wire-level unit placed on the broker
//! - [`IntegrationEvent`]: typed events that know their event type and routing key
//! - [`Broker`]: topic-exchange publish/consume abstraction
//! - [`InMemoryBroker`]: broker for tests/dev
//! - [`EventHandler`] / [`HandlerRegistry`]: consumer-side dispatch by event type

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod topic;

pub use bus::{Broker, BrokerError, Delivery, QueueBinding};
pub use envelope::{EnvelopeError, EventEnvelope};
pub use event::IntegrationEvent;
pub use handler::{EventHandler, HandlerError, HandlerRegistry, Handles};
pub use in_memory_bus::InMemoryBroker;
