//! Scripted collaborators for tests: a broker whose publish can fail or hang,
//! an audit log that fails on demand, and handlers that fail a set number of
//! times or record how many messages they see at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use stockrelay_core::MessageId;
use stockrelay_events::{
    Broker, BrokerError, Delivery, EventEnvelope, EventHandler, HandlerError, InMemoryBroker,
    QueueBinding,
};

use crate::audit::{
    AuditEntryId, AuditError, AuditLog, AuditLogEntry, AuditOutcome, AuditQuery, AuditRecord,
    InMemoryAuditLog,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Healthy,
    Failing,
    Hanging,
}

/// `InMemoryBroker` with a switchable publish path.
#[derive(Debug, Clone)]
pub struct ScriptedBroker {
    inner: InMemoryBroker,
    mode: Arc<Mutex<PublishMode>>,
    publish_calls: Arc<AtomicUsize>,
}

impl ScriptedBroker {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            mode: Arc::new(Mutex::new(PublishMode::Healthy)),
            publish_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_mode(&self, mode: PublishMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.inner.declare_exchange(exchange).await
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        self.inner.bind_queue(binding).await
    }

    async fn publish(&self, exchange: &str, envelope: &EventEnvelope) -> Result<(), BrokerError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            PublishMode::Healthy => self.inner.publish(exchange, envelope).await,
            PublishMode::Failing => Err(BrokerError::Connection("connection refused".to_string())),
            PublishMode::Hanging => std::future::pending().await,
        }
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.inner.receive(queue).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner.ack(delivery).await
    }

    async fn redeliver(&self, delivery: Delivery, delay: Duration) -> Result<(), BrokerError> {
        self.inner.redeliver(delivery, delay).await
    }
}

/// Audit log whose next `n` appends fail with a storage error.
#[derive(Debug, Default)]
pub struct FlakyAuditLog {
    inner: InMemoryAuditLog,
    fail_next: AtomicUsize,
}

impl FlakyAuditLog {
    pub fn failing_next(n: usize) -> Self {
        Self {
            inner: InMemoryAuditLog::new(),
            fail_next: AtomicUsize::new(n),
        }
    }

    /// Make the next `n` appends fail, from now on.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryAuditLog {
        &self.inner
    }
}

#[async_trait]
impl AuditLog for FlakyAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<AuditEntryId, AuditError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AuditError::Storage("connection reset".to_string()));
        }
        self.inner.append(record).await
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.inner.query(query).await
    }

    async fn count(&self, outcome: AuditOutcome) -> Result<u64, AuditError> {
        self.inner.count(outcome).await
    }

    async fn entries_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.inner.entries_for_message(message_id).await
    }
}

/// Fails its first `failures` calls with a transient error, then succeeds.
#[derive(Debug)]
pub struct ScriptedHandler {
    failures: usize,
    calls: AtomicUsize,
}

impl ScriptedHandler {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for ScriptedHandler {
    async fn handle(&self, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::transient("scripted failure"))
        } else {
            Ok(())
        }
    }
}

/// Sleeps for `delay` per message, recording the product ids it sees (in start
/// order) and the highest number of concurrent calls.
#[derive(Debug, Default)]
pub struct TrackingHandler {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<u64>>,
}

impl TrackingHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for TrackingHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(id) = envelope.payload()["id"].as_u64() {
            self.seen.lock().unwrap().push(id);
        }

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
