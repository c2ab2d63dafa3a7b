use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{EnvelopeError, EventEnvelope};
use crate::event::IntegrationEvent;

/// Consumer-side business processing failure.
///
/// Transient failures are retried up to the queue's bound; permanent ones (no
/// handler, payload that can never decode) skip straight to the dead-letter path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    permanent: bool,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<EnvelopeError> for HandlerError {
    fn from(err: EnvelopeError) -> Self {
        Self::permanent(err.to_string())
    }
}

/// Handles raw envelopes of one event type.
///
/// Handlers run under at-least-once delivery: the same envelope may arrive more
/// than once, so processing must be safe to repeat.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Handles one decoded integration event type.
#[async_trait]
pub trait Handles<E: IntegrationEvent>: Send + Sync {
    async fn on_event(&self, event: E, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Adapter: decode the payload as `E`, then call the typed handler.
struct Decoding<E, H> {
    inner: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> EventHandler for Decoding<E, H>
where
    E: IntegrationEvent,
    H: Handles<E>,
{
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let event = envelope.decode::<E>()?;
        self.inner.on_event(event, envelope).await
    }
}

/// Maps an event type tag to its handler.
///
/// Built once at startup; lookups afterwards are read-only.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw envelope handler. A later registration for the same type wins.
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    /// Register a typed handler; payloads are decoded as `E` before dispatch.
    pub fn register_typed<E, H>(&mut self, event_type: impl Into<String>, handler: H)
    where
        E: IntegrationEvent,
        H: Handles<E> + 'static,
    {
        self.register(
            event_type,
            Arc::new(Decoding {
                inner: handler,
                _event: PhantomData,
            }),
        );
    }

    pub fn with(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.register(event_type, handler);
        self
    }

    pub fn resolve(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
