use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use stockrelay_events::{Broker, Delivery, HandlerError, HandlerRegistry};

use super::dead_letter::{DeadLetterRouter, DivertError};
use super::retry::RetryPolicy;
use crate::audit::{AuditLog, AuditRecord};

/// Consumer settings for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub queue: String,
    pub retry: RetryPolicy,
    /// Messages handled in parallel; 1 keeps broker order.
    pub concurrency_limit: usize,
    /// Pause after a failed `receive` before trying again.
    pub receive_backoff: Duration,
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            retry: RetryPolicy::default(),
            concurrency_limit: 1,
            receive_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }
}

/// Where one delivery ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Handled, recorded as `Processed`, acknowledged.
    Succeeded,
    /// Handed back to the broker for another attempt.
    Retrying { next_attempt: u32, delay: Duration },
    /// Recorded as `DeadLettered` and removed from the queue.
    DeadLettered { attempts: u32 },
    /// Could not be settled (audit store down); returned to the queue and
    /// settled on a later delivery.
    Unsettled,
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub unsettled: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: &ProcessingOutcome) {
        self.received += 1;
        match outcome {
            ProcessingOutcome::Succeeded => self.succeeded += 1,
            ProcessingOutcome::Retrying { .. } => self.retried += 1,
            ProcessingOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            ProcessingOutcome::Unsettled => self.unsettled += 1,
        }
    }
}

/// Handle to control a running consumer. Dropping it also stops the consumer.
#[must_use = "dropping the handle stops the consumer"]
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop receiving, let in-flight handlers finish, return the final stats.
    pub async fn shutdown(self) -> ConsumerStats {
        let Self {
            queue,
            shutdown,
            join,
            stats,
        } = self;
        let _ = shutdown.send(true);
        if let Err(err) = join.await {
            error!(queue = %queue, error = %err, "consumer task ended abnormally");
        }
        stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Bounded-retry consumer for one queue.
///
/// Per delivery: `Received -> Processing -> {Succeeded, Retrying, DeadLettered}`.
/// The attempt number comes from the envelope (the broker bumps it on every
/// redelivery), so nothing is kept between deliveries.
///
/// - success: audit `Processed`, ack
/// - failure with `attempt < max_retries`: redeliver after the policy delay
/// - failure with `attempt >= max_retries`, or a permanent failure: divert
pub struct RetryingConsumer {
    broker: Arc<dyn Broker>,
    handlers: Arc<HandlerRegistry>,
    audit: Arc<dyn AuditLog>,
    dead_letters: DeadLetterRouter,
    config: ConsumerConfig,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl RetryingConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        handlers: Arc<HandlerRegistry>,
        audit: Arc<dyn AuditLog>,
        dead_letters: DeadLetterRouter,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            handlers,
            audit,
            dead_letters,
            config,
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Process one delivery to a settled state.
    #[instrument(
        skip(self, delivery),
        fields(
            queue = %self.config.queue,
            message_id = %delivery.envelope().message_id(),
            event_type = %delivery.envelope().event_type(),
            attempt = delivery.envelope().attempt()
        )
    )]
    pub async fn process(&self, delivery: Delivery) -> ProcessingOutcome {
        let received_at = Utc::now();
        let outcome = self.process_inner(delivery, received_at).await;
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&outcome);
        outcome
    }

    async fn process_inner(&self, delivery: Delivery, received_at: DateTime<Utc>) -> ProcessingOutcome {
        let attempt = delivery.envelope().attempt();
        let event_type = delivery.envelope().event_type();

        let failure = match self.handlers.resolve(event_type) {
            None => HandlerError::permanent(format!("no handler registered for event type {event_type}")),
            Some(handler) => match handler.handle(delivery.envelope()).await {
                Ok(()) => {
                    let record = AuditRecord::processed(&delivery, attempt.saturating_add(1), received_at);
                    return match self.audit.append(record).await {
                        Ok(entry_id) => {
                            if let Err(err) = self.broker.ack(&delivery).await {
                                error!(error = %err, "ack failed after successful processing");
                            }
                            debug!(audit_entry = %entry_id, "message processed");
                            ProcessingOutcome::Succeeded
                        }
                        // The handler succeeded: never count this against the retry budget.
                        Err(err) => {
                            error!(error = %err, "handled, but the audit record could not be written; returning message to queue");
                            self.return_unsettled(delivery).await
                        }
                    };
                }
                Err(err) => err,
            },
        };

        self.settle_failure(delivery, failure, received_at).await
    }

    async fn settle_failure(
        &self,
        delivery: Delivery,
        failure: HandlerError,
        received_at: DateTime<Utc>,
    ) -> ProcessingOutcome {
        let attempt = delivery.envelope().attempt();
        let retry = &self.config.retry;

        if !failure.is_permanent() && retry.should_retry(attempt) {
            let next_attempt = attempt.saturating_add(1);
            let delay = retry.delay_for_attempt(next_attempt);
            warn!(error = %failure, next_attempt, ?delay, "processing failed; scheduling redelivery");
            return match self.broker.redeliver(delivery, delay).await {
                Ok(()) => ProcessingOutcome::Retrying { next_attempt, delay },
                Err(err) => {
                    error!(error = %err, "redelivery failed; message left to the broker");
                    ProcessingOutcome::Unsettled
                }
            };
        }

        let attempts = attempt.saturating_add(1);
        match self
            .dead_letters
            .divert(&delivery, attempts, failure.message(), received_at)
            .await
        {
            Ok(_) => ProcessingOutcome::DeadLettered { attempts },
            Err(DivertError::Ack(err)) => {
                error!(error = %err, "dead-letter recorded but original not acknowledged");
                ProcessingOutcome::DeadLettered { attempts }
            }
            Err(DivertError::Audit(err)) => {
                error!(error = %err, "dead-letter could not be recorded; returning message to queue");
                self.return_unsettled(delivery).await
            }
        }
    }

    /// Hand the message back after `retry.interval` without settling it.
    async fn return_unsettled(&self, delivery: Delivery) -> ProcessingOutcome {
        if let Err(err) = self.broker.redeliver(delivery, self.config.retry.interval).await {
            error!(error = %err, "redelivery failed; message left to the broker");
        }
        ProcessingOutcome::Unsettled
    }

    /// Run the receive loop on a background task.
    pub fn spawn(self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = self.config.queue.clone();
        let stats = Arc::clone(&self.stats);
        let join = tokio::spawn(self.run(shutdown_rx));

        ConsumerHandle {
            queue,
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let consumer = Arc::new(self);
        let queue = consumer.config.queue.clone();
        let limit = consumer.config.concurrency_limit.max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let mut in_flight = JoinSet::new();

        info!(queue = %queue, concurrency_limit = limit, "consumer started");

        loop {
            // Sender dropped counts as shutdown too.
            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = consumer.broker.receive(&queue) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let consumer = Arc::clone(&consumer);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        consumer.process(delivery).await;
                    });
                }
                Ok(None) => {
                    info!(queue = %queue, "broker closed; consumer stopping");
                    break;
                }
                Err(err) => {
                    error!(queue = %queue, error = %err, "receive failed");
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(consumer.config.receive_backoff) => {}
                    }
                }
            }

            while let Some(done) = in_flight.try_join_next() {
                if let Err(err) = done {
                    error!(queue = %queue, error = %err, "message task panicked");
                }
            }
        }

        while let Some(done) = in_flight.join_next().await {
            if let Err(err) = done {
                error!(queue = %queue, error = %err, "message task panicked");
            }
        }
        info!(queue = %queue, "consumer stopped");
    }
}

impl core::fmt::Debug for RetryingConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryingConsumer")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditOutcome, InMemoryAuditLog};
    use crate::delivery::Topology;
    use crate::test_support::{FlakyAuditLog, ScriptedHandler, TrackingHandler};
    use serde_json::json;
    use stockrelay_events::{EventEnvelope, EventHandler, InMemoryBroker};

    const QUEUE: &str = "product-created-queue";

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        audit: Arc<InMemoryAuditLog>,
        handler: Arc<ScriptedHandler>,
        consumer: RetryingConsumer,
    }

    async fn fixture(failures: usize, retry: RetryPolicy) -> Fixture {
        let broker = InMemoryBroker::arc();
        Topology::inventory().declare(&*broker).await.unwrap();
        let audit = Arc::new(InMemoryAuditLog::new());
        let handler = Arc::new(ScriptedHandler::failing_first(failures));
        let consumer = consumer_with(broker.clone(), audit.clone(), handler.clone(), retry);
        Fixture {
            broker,
            audit,
            handler,
            consumer,
        }
    }

    fn consumer_with(
        broker: Arc<InMemoryBroker>,
        audit: Arc<dyn AuditLog>,
        handler: Arc<ScriptedHandler>,
        retry: RetryPolicy,
    ) -> RetryingConsumer {
        consumer_for(broker, audit, handler, ConsumerConfig::new(QUEUE).with_retry(retry))
    }

    fn consumer_for(
        broker: Arc<InMemoryBroker>,
        audit: Arc<dyn AuditLog>,
        handler: Arc<dyn EventHandler>,
        config: ConsumerConfig,
    ) -> RetryingConsumer {
        let registry = HandlerRegistry::new().with("ProductCreated", handler);
        let router = DeadLetterRouter::new(broker.clone(), audit.clone())
            .with_error_exchange("inventory.errors");
        RetryingConsumer::new(broker, Arc::new(registry), audit, router, config)
    }

    async fn publish(broker: &InMemoryBroker, event_type: &str) -> EventEnvelope {
        publish_id(broker, event_type, 1).await
    }

    async fn publish_id(broker: &InMemoryBroker, event_type: &str, id: u64) -> EventEnvelope {
        let envelope = EventEnvelope::new(event_type, "product.created", json!({"id": id}));
        broker.publish("inventory", &envelope).await.unwrap();
        envelope
    }

    async fn wait_for_entries(audit: &InMemoryAuditLog, n: usize) {
        for _ in 0..200 {
            if audit.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("expected {n} audit entries, found {}", audit.len());
    }

    /// Receive and process deliveries until the queue settles; returns each outcome.
    async fn drive(f: &Fixture) -> Vec<ProcessingOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let delivery = f.broker.receive(QUEUE).await.unwrap().unwrap();
            let outcome = f.consumer.process(delivery).await;
            let settled = !matches!(outcome, ProcessingOutcome::Retrying { .. });
            outcomes.push(outcome);
            if settled {
                return outcomes;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_max_retries_failures() {
        let f = fixture(3, RetryPolicy::fixed(3, Duration::from_secs(2))).await;
        publish(&f.broker, "ProductCreated").await;

        let outcomes = drive(&f).await;

        assert_eq!(
            outcomes,
            vec![
                ProcessingOutcome::Retrying { next_attempt: 1, delay: Duration::from_secs(2) },
                ProcessingOutcome::Retrying { next_attempt: 2, delay: Duration::from_secs(2) },
                ProcessingOutcome::Retrying { next_attempt: 3, delay: Duration::from_secs(2) },
                ProcessingOutcome::Succeeded,
            ]
        );
        assert_eq!(f.handler.calls(), 4);
        assert_eq!(f.audit.count(AuditOutcome::Processed).await.unwrap(), 1);
        assert_eq!(f.audit.count(AuditOutcome::DeadLettered).await.unwrap(), 0);
        assert_eq!(f.audit.entries()[0].record.attempts, 4);
        assert!(f.broker.is_drained(QUEUE));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letters_after_max_retries_plus_one_failures() {
        let f = fixture(usize::MAX, RetryPolicy::fixed(3, Duration::from_secs(2))).await;
        publish(&f.broker, "ProductCreated").await;

        let outcomes = drive(&f).await;

        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[3], ProcessingOutcome::DeadLettered { attempts: 4 });
        assert_eq!(f.handler.calls(), 4);

        let entries = f.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.outcome, AuditOutcome::DeadLettered);
        assert_eq!(entries[0].record.error_detail.as_deref(), Some("scripted failure"));

        // Nothing left to deliver, now or later.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(f.broker.is_drained(QUEUE));
        assert_eq!(f.broker.queue_depth("inventory-error-queue"), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_is_dead_lettered_without_retries() {
        let f = fixture(0, RetryPolicy::fixed(3, Duration::from_secs(2))).await;
        publish(&f.broker, "ProductArchived").await;

        let outcomes = drive(&f).await;

        assert_eq!(outcomes, vec![ProcessingOutcome::DeadLettered { attempts: 1 }]);
        assert_eq!(f.handler.calls(), 0);
        let entry = &f.audit.entries()[0];
        assert!(entry.record.error_detail.as_deref().unwrap().contains("ProductArchived"));
    }

    #[tokio::test(start_paused = true)]
    async fn audit_outage_on_success_does_not_spend_retries() {
        let broker = InMemoryBroker::arc();
        Topology::inventory().declare(&*broker).await.unwrap();
        let audit = Arc::new(FlakyAuditLog::failing_next(1));
        let handler = Arc::new(ScriptedHandler::failing_first(0));
        let consumer = consumer_with(broker.clone(), audit.clone(), handler.clone(), RetryPolicy::no_retry());
        publish(&broker, "ProductCreated").await;

        let first = consumer.process(broker.receive(QUEUE).await.unwrap().unwrap()).await;
        assert_eq!(first, ProcessingOutcome::Unsettled);
        assert!(audit.inner().is_empty());

        let second = consumer.process(broker.receive(QUEUE).await.unwrap().unwrap()).await;
        assert_eq!(second, ProcessingOutcome::Succeeded);
        assert_eq!(handler.calls(), 2);
        assert_eq!(audit.inner().count(AuditOutcome::Processed).await.unwrap(), 1);
        assert_eq!(audit.inner().count(AuditOutcome::DeadLettered).await.unwrap(), 0);
        assert_eq!(broker.queue_depth("inventory-error-queue"), 0);
        assert!(broker.is_drained(QUEUE));
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_last_attempt_survives_an_audit_outage() {
        let broker = InMemoryBroker::arc();
        Topology::inventory().declare(&*broker).await.unwrap();
        let audit = Arc::new(FlakyAuditLog::failing_next(0));
        let handler = Arc::new(ScriptedHandler::failing_first(3));
        let consumer = consumer_with(
            broker.clone(),
            audit.clone(),
            handler.clone(),
            RetryPolicy::fixed(3, Duration::from_secs(2)),
        );
        publish(&broker, "ProductCreated").await;

        for expected in 1..=3 {
            let outcome = consumer.process(broker.receive(QUEUE).await.unwrap().unwrap()).await;
            assert!(matches!(outcome, ProcessingOutcome::Retrying { next_attempt, .. } if next_attempt == expected));
        }

        // Attempt 3 succeeds in the handler, but its audit append fails.
        audit.fail_next(1);
        let last = consumer.process(broker.receive(QUEUE).await.unwrap().unwrap()).await;
        assert_eq!(last, ProcessingOutcome::Unsettled);

        let recorded = consumer.process(broker.receive(QUEUE).await.unwrap().unwrap()).await;
        assert_eq!(recorded, ProcessingOutcome::Succeeded);

        let entries = audit.inner().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.outcome, AuditOutcome::Processed);
        assert_eq!(handler.calls(), 5);
        assert_eq!(broker.queue_depth("inventory-error-queue"), 0);
        assert!(broker.is_drained(QUEUE));
    }

    #[tokio::test(start_paused = true)]
    async fn divert_failure_leaves_message_unsettled_then_dead_letters() {
        let broker = InMemoryBroker::arc();
        Topology::inventory().declare(&*broker).await.unwrap();
        let audit = Arc::new(FlakyAuditLog::failing_next(1));
        let handler = Arc::new(ScriptedHandler::failing_first(usize::MAX));
        let consumer = consumer_with(broker.clone(), audit.clone(), handler, RetryPolicy::no_retry());
        publish(&broker, "ProductCreated").await;

        let first = consumer.process(broker.receive(QUEUE).await.unwrap().unwrap()).await;
        assert_eq!(first, ProcessingOutcome::Unsettled);
        assert!(audit.inner().is_empty());

        let second = consumer.process(broker.receive(QUEUE).await.unwrap().unwrap()).await;
        assert_eq!(second, ProcessingOutcome::DeadLettered { attempts: 2 });
        assert_eq!(audit.inner().len(), 1);
        assert!(broker.is_drained(QUEUE));

        let stats = consumer.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.unsettled, 1);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_consumer_drains_queue_and_shuts_down() {
        let f = fixture(1, RetryPolicy::fixed(2, Duration::from_millis(200))).await;
        let Fixture {
            broker, audit, consumer, ..
        } = f;
        for _ in 0..3 {
            publish(&broker, "ProductCreated").await;
        }

        let handle = consumer.spawn();
        for _ in 0..50 {
            if audit.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let stats = handle.shutdown().await;
        assert_eq!(audit.count(AuditOutcome::Processed).await.unwrap(), 3);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.retried, 1);
        assert!(broker.is_drained(QUEUE));
    }

    #[tokio::test]
    async fn consumer_stops_when_broker_closes() {
        let f = fixture(0, RetryPolicy::default()).await;
        let handle = f.consumer.spawn();
        f.broker.close();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.shutdown().await, ConsumerStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_bounds_in_flight_messages() {
        let broker = InMemoryBroker::arc();
        Topology::inventory().declare(&*broker).await.unwrap();
        let audit = Arc::new(InMemoryAuditLog::new());
        let handler = Arc::new(TrackingHandler::with_delay(Duration::from_secs(1)));
        for id in 0..9 {
            publish_id(&broker, "ProductCreated", id).await;
        }

        let handle = consumer_for(
            broker.clone(),
            audit.clone(),
            handler.clone(),
            ConsumerConfig::new(QUEUE).with_concurrency_limit(3),
        )
        .spawn();
        wait_for_entries(&audit, 9).await;
        let stats = handle.shutdown().await;

        assert_eq!(handler.peak(), 3);
        assert_eq!(handler.seen().len(), 9);
        assert_eq!(stats.succeeded, 9);
        assert!(broker.is_drained(QUEUE));
    }

    #[tokio::test(start_paused = true)]
    async fn limit_of_one_handles_messages_in_publish_order() {
        let broker = InMemoryBroker::arc();
        Topology::inventory().declare(&*broker).await.unwrap();
        let audit = Arc::new(InMemoryAuditLog::new());
        let handler = Arc::new(TrackingHandler::with_delay(Duration::from_millis(10)));
        for id in 0..10 {
            publish_id(&broker, "ProductCreated", id).await;
        }

        let handle = consumer_for(
            broker.clone(),
            audit.clone(),
            handler.clone(),
            ConsumerConfig::new(QUEUE),
        )
        .spawn();
        wait_for_entries(&audit, 10).await;
        handle.shutdown().await;

        assert_eq!(handler.seen(), (0..10).collect::<Vec<u64>>());
        assert_eq!(handler.peak(), 1);
    }
}
