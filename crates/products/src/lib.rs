//! Product integration contracts published by the inventory service.

pub mod product;

pub use product::{
    EXCHANGE, ProductCreated, ProductDeleted, ProductEvent, ProductId, ProductUpdated, event_types,
    routing_keys,
};
