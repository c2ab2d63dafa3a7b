//! `stockrelay-core`: shared building blocks.
//!
//! Identifiers and the domain error model used by the event contracts and the
//! delivery pipeline. No IO, no async.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::MessageId;
