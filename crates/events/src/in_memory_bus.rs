//! In-memory message bus for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, warn};

use crate::bus::{BusError, ConsumerHandle, MessageBus};
use crate::contracts::{self, TOPOLOGY};
use crate::envelope::{Delivery, Envelope};
use crate::handler::EnvelopeHandler;

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<Delivery>>>;

struct Queue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: SharedReceiver,
}

/// A delivery that was negatively acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub queue: String,
    pub delivery: Delivery,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Default number of publishes and dead letters kept for inspection.
const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct Ledger {
    capacity: usize,
    published: VecDeque<Delivery>,
    acked: HashMap<String, usize>,
    dead_letters: VecDeque<DeadLetter>,
}

impl Ledger {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            published: VecDeque::new(),
            acked: HashMap::new(),
            dead_letters: VecDeque::new(),
        }
    }

    fn record_publish(&mut self, delivery: Delivery) {
        push_bounded(&mut self.published, delivery, self.capacity);
    }

    fn record_ack(&mut self, queue: &str) {
        *self.acked.entry(queue.to_string()).or_default() += 1;
    }

    fn record_dead_letter(&mut self, dead_letter: DeadLetter) {
        push_bounded(&mut self.dead_letters, dead_letter, self.capacity);
    }
}

fn push_bounded<T>(entries: &mut VecDeque<T>, entry: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    if entries.len() == capacity {
        entries.pop_front();
    }
    entries.push_back(entry);
}

/// In-process bus implementing the full topology.
///
/// - Queues exist from construction, so envelopes published before a consumer
///   attaches are kept (like a durable broker queue)
/// - FIFO per queue; consumers of the same queue compete for envelopes
/// - The most recent publishes and dead letters are kept for inspection (up to
///   the ledger capacity); acks are only counted
#[derive(Clone)]
pub struct InMemoryMessageBus {
    queues: Arc<HashMap<&'static str, Queue>>,
    ledger: Arc<Mutex<Ledger>>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` publishes and dead letters; older ones are dropped.
    pub fn with_ledger_capacity(capacity: usize) -> Self {
        let bus = Self::default();
        if let Ok(mut ledger) = bus.ledger.lock() {
            ledger.capacity = capacity;
        }
        bus
    }

    /// Recent publishes, in publish order.
    pub fn published(&self) -> Vec<Delivery> {
        self.ledger
            .lock()
            .map(|l| l.published.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Envelopes published under `routing_key`, in publish order.
    pub fn published_to(&self, routing_key: &str) -> Vec<Envelope> {
        self.published()
            .into_iter()
            .filter(|d| d.routing_key() == routing_key)
            .map(Delivery::into_envelope)
            .collect()
    }

    /// Number of deliveries acknowledged by consumers of `queue`.
    pub fn acked_count(&self, queue: &str) -> usize {
        self.ledger
            .lock()
            .map(|l| l.acked.get(queue).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.ledger
            .lock()
            .map(|l| l.dead_letters.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        let queues = TOPOLOGY
            .iter()
            .map(|binding| {
                let (tx, rx) = mpsc::unbounded_channel();
                (
                    binding.queue,
                    Queue {
                        tx,
                        rx: Arc::new(AsyncMutex::new(rx)),
                    },
                )
            })
            .collect();

        Self {
            queues: Arc::new(queues),
            ledger: Arc::new(Mutex::new(Ledger::new(DEFAULT_LEDGER_CAPACITY))),
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, routing_key: &str, envelope: Envelope) -> Result<(), BusError> {
        let delivery = Delivery::new(routing_key, envelope);

        self.ledger
            .lock()
            .map_err(|_| BusError::Transport("in-memory ledger poisoned".to_string()))?
            .record_publish(delivery.clone());

        for queue in contracts::queues_bound_to(routing_key) {
            if let Some(q) = self.queues.get(queue) {
                // The receiver lives as long as the bus, so this cannot fail.
                let _ = q.tx.send(delivery.clone());
            }
        }

        debug!(routing_key, "published to in-memory bus");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<ConsumerHandle, BusError> {
        let rx = self
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.rx))
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let ledger = Arc::clone(&self.ledger);
        let queue_name = queue.to_string();

        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = stop_rx.changed() => break,
                    next = recv(&rx) => next,
                };
                let Some(delivery) = next else { break };

                match handler.handle(&delivery).await {
                    Ok(()) => {
                        if let Ok(mut l) = ledger.lock() {
                            l.record_ack(&queue_name);
                        }
                    }
                    Err(err) => {
                        warn!(
                            queue = %queue_name,
                            routing_key = delivery.routing_key(),
                            reason = %err,
                            "handler failed; dead-lettering envelope"
                        );
                        if let Ok(mut l) = ledger.lock() {
                            l.record_dead_letter(DeadLetter {
                                queue: queue_name.clone(),
                                delivery,
                                reason: err.reason().to_string(),
                                failed_at: Utc::now(),
                            });
                        }
                    }
                }
            }
        });

        Ok(ConsumerHandle::new(queue, stop_tx, task))
    }
}

async fn recv(rx: &SharedReceiver) -> Option<Delivery> {
    rx.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{queues, routing_keys};
    use crate::handler::{HandlerError, handler_fn};
    use serde_json::json;
    use std::time::Duration;

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn queue_receives_in_publish_order() {
        let bus = InMemoryMessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let handle = bus
            .consume(
                queues::DRIVER_CMD_TRIP_REQUEST,
                handler_fn(move |d: Delivery| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(d.envelope().data()["n"].as_i64().unwrap());
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        for n in 0..5 {
            bus.publish(
                routing_keys::DRIVER_CMD_TRIP_REQUEST,
                Envelope::directed("d1", json!({ "n": n })),
            )
            .await
            .unwrap();
        }

        eventually(|| bus.acked_count(queues::DRIVER_CMD_TRIP_REQUEST) == 5).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn envelopes_published_before_consume_are_kept() {
        let bus = InMemoryMessageBus::new();
        bus.publish(
            routing_keys::TRIP_EVENT_NO_DRIVERS_FOUND,
            Envelope::directed("rider-1", json!(null)),
        )
        .await
        .unwrap();

        let handle = bus
            .consume(
                queues::NOTIFY_DRIVER_NO_DRIVERS_FOUND,
                handler_fn(|_d: Delivery| async { Ok(()) }),
            )
            .await
            .unwrap();

        eventually(|| bus.acked_count(queues::NOTIFY_DRIVER_NO_DRIVERS_FOUND) == 1).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn handler_error_dead_letters_without_requeue() {
        let bus = InMemoryMessageBus::new();
        let handle = bus
            .consume(
                queues::PAYMENT_SUCCESS,
                handler_fn(|_d: Delivery| async { Err(HandlerError::new("boom")) }),
            )
            .await
            .unwrap();

        bus.publish(routing_keys::PAYMENT_EVENT_SUCCESS, Envelope::broadcast(json!({})))
            .await
            .unwrap();

        eventually(|| bus.dead_letters().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].queue, queues::PAYMENT_SUCCESS);
        assert_eq!(dead[0].reason, "boom");
        assert_eq!(bus.acked_count(queues::PAYMENT_SUCCESS), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let bus = InMemoryMessageBus::new();
        let err = bus
            .consume("not-a-queue", handler_fn(|_d: Delivery| async { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownQueue(q) if q == "not-a-queue"));
    }

    #[tokio::test]
    async fn shutdown_stops_delivery() {
        let bus = InMemoryMessageBus::new();
        let handle = bus
            .consume(
                queues::NOTIFY_DRIVER_ASSIGN,
                handler_fn(|_d: Delivery| async { Ok(()) }),
            )
            .await
            .unwrap();
        handle.shutdown().await;

        bus.publish(
            routing_keys::TRIP_EVENT_DRIVER_ASSIGNED,
            Envelope::directed("rider-1", json!({})),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(bus.acked_count(queues::NOTIFY_DRIVER_ASSIGN), 0);
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn ledger_keeps_only_recent_publishes() {
        let bus = InMemoryMessageBus::with_ledger_capacity(2);
        for n in 0..5 {
            bus.publish(
                routing_keys::TRIP_EVENT_DRIVER_ASSIGNED,
                Envelope::directed("rider-1", json!({ "n": n })),
            )
            .await
            .unwrap();
        }

        let kept: Vec<i64> = bus
            .published()
            .iter()
            .map(|d| d.envelope().data()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(kept, vec![3, 4]);
    }
}
