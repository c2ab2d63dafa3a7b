//! In-memory topic broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::bus::{Broker, BrokerError, Delivery, QueueBinding};
use crate::envelope::EventEnvelope;
use crate::topic;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<EventEnvelope>,
    unacked: HashMap<u64, EventEnvelope>,
    /// Redeliveries waiting for their delay to elapse.
    scheduled: usize,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// exchange -> [(binding key, queue)]
    exchanges: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    closed: bool,
}

/// In-memory topic broker.
///
/// - Topic exchanges with `*` / `#` bindings
/// - FIFO queues, unacked deliveries tracked by tag
/// - Delayed redelivery with `attempt + 1`
/// - `close()` wakes every receiver with `None`
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.state.lock().map_err(|_| BrokerError::Poisoned)
    }

    /// Stop the broker: pending receivers (and future ones) get `None`.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            for queue in state.queues.values() {
                queue.notify.notify_waiters();
            }
        }
    }

    /// Messages ready for delivery on `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged or redelivered.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len())
    }

    /// Redeliveries still waiting for their delay.
    pub fn scheduled_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.scheduled)
    }

    /// Nothing ready, in flight or scheduled on `queue`.
    pub fn is_drained(&self, queue: &str) -> bool {
        self.with_queue(queue, |q| q.ready.is_empty() && q.unacked.is_empty() && q.scheduled == 0)
    }

    fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> T {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.queues.get(queue).map(f))
            .unwrap_or_default()
    }
}

fn push_ready(queue: &mut QueueState, envelope: EventEnvelope) {
    queue.ready.push_back(envelope);
    queue.notify.notify_one();
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        state.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let bindings = state
            .exchanges
            .get_mut(&binding.exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(binding.exchange.clone()))?;

        let entry = (binding.binding_key.clone(), binding.queue.clone());
        if !bindings.contains(&entry) {
            bindings.push(entry);
        }
        state.queues.entry(binding.queue.clone()).or_default();
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: &EventEnvelope) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(BrokerError::Connection("broker closed".to_string()));
        }

        let BrokerState {
            exchanges, queues, ..
        } = &mut *state;
        let bindings = exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let mut routed = 0usize;
        for (binding_key, queue_name) in bindings {
            if !topic::matches(binding_key, envelope.routing_key()) {
                continue;
            }
            if let Some(queue) = queues.get_mut(queue_name) {
                push_ready(queue, envelope.clone());
                routed += 1;
            }
        }

        if routed == 0 {
            debug!(
                exchange,
                routing_key = envelope.routing_key(),
                "message unroutable; dropped"
            );
        }
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let notify = {
            let state = self.lock()?;
            let q = state
                .queues
                .get(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
            Arc::clone(&q.notify)
        };

        loop {
            // Registered before the state check, so a publish or close that lands
            // between the check and the wait still wakes this receiver.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock()?;
                if state.closed {
                    return Ok(None);
                }

                let BrokerState {
                    queues, next_tag, ..
                } = &mut *state;
                let q = queues
                    .get_mut(queue)
                    .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

                if let Some(envelope) = q.ready.pop_front() {
                    *next_tag += 1;
                    let tag = *next_tag;
                    q.unacked.insert(tag, envelope.clone());
                    return Ok(Some(Delivery::new(queue, tag, envelope)));
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let q = state
            .queues
            .get_mut(delivery.queue())
            .ok_or_else(|| BrokerError::UnknownQueue(delivery.queue().to_string()))?;

        q.unacked
            .remove(&delivery.tag())
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery {
                queue: delivery.queue().to_string(),
                tag: delivery.tag(),
            })
    }

    async fn redeliver(&self, delivery: Delivery, delay: Duration) -> Result<(), BrokerError> {
        let queue_name = delivery.queue().to_string();
        let tag = delivery.tag();

        let envelope = {
            let mut state = self.lock()?;
            let q = state
                .queues
                .get_mut(&queue_name)
                .ok_or_else(|| BrokerError::UnknownQueue(queue_name.clone()))?;
            let original = q
                .unacked
                .remove(&tag)
                .ok_or_else(|| BrokerError::UnknownDelivery {
                    queue: queue_name.clone(),
                    tag,
                })?;
            let envelope = original.redelivered();

            if delay.is_zero() {
                push_ready(q, envelope);
                return Ok(());
            }
            q.scheduled += 1;
            envelope
        };

        trace!(queue = %queue_name, ?delay, attempt = envelope.attempt(), "redelivery scheduled");

        let shared = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut state) = shared.lock() {
                let closed = state.closed;
                if let Some(q) = state.queues.get_mut(&queue_name) {
                    q.scheduled = q.scheduled.saturating_sub(1);
                    if !closed {
                        push_ready(q, envelope);
                    }
                }
            }
        });

        Ok(())
    }
}
