//! Networked broker implementations.
//!
//! The `Broker` abstraction and the in-process broker live in
//! `stockrelay-events`. This module provides transports backed by a real
//! message broker (e.g. RabbitMQ over AMQP 0.9.1).

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::{ATTEMPT_HEADER, AmqpBroker, AmqpConfig};
