//! Inventory pipeline process: wiring of broker, consumers, audit log and publisher.

pub mod app;
pub mod handlers;
