//! Bus queue → live connection delivery.
//!
//! Every replica consumes the notification queues; an envelope whose addressee
//! is connected elsewhere is simply dropped here. Nothing is redelivered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fleetline_events::contracts::queues;
use fleetline_events::{
    BusError, ConsumerHandle, Delivery, EnvelopeHandler, HandlerError, MessageBus, OutboundFrame,
};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionError, ConnectionRegistry};

/// Queues delivered to client connections by the gateway.
pub const GATEWAY_QUEUES: &[&str] = &[
    queues::DRIVER_CMD_TRIP_REQUEST,
    queues::NOTIFY_DRIVER_NO_DRIVERS_FOUND,
    queues::NOTIFY_DRIVER_ASSIGN,
    queues::NOTIFY_PAYMENT_SESSION_CREATED,
    queues::NOTIFY_PAYMENT_SUCCESS,
];

/// Delivery counters of one bridge.
#[derive(Debug, Default)]
pub struct BridgeStats {
    delivered: AtomicU64,
    not_connected: AtomicU64,
    failed: AtomicU64,
    unaddressed: AtomicU64,
}

impl BridgeStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Addressee not connected to this process.
    pub fn not_connected(&self) -> u64 {
        self.not_connected.load(Ordering::Relaxed)
    }

    /// Write to the addressee's connection failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Envelope carried no owner id.
    pub fn unaddressed(&self) -> u64 {
        self.unaddressed.load(Ordering::Relaxed)
    }
}

/// Subscribes one queue and forwards its envelopes to the addressed connection.
pub struct QueueConsumerBridge {
    bus: Arc<dyn MessageBus>,
    handler: Arc<BridgeHandler>,
}

impl QueueConsumerBridge {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: ConnectionRegistry,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            handler: Arc::new(BridgeHandler {
                queue: queue.into(),
                registry,
                stats: Arc::new(BridgeStats::default()),
            }),
        }
    }

    pub fn queue(&self) -> &str {
        &self.handler.queue
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.handler.stats)
    }

    pub async fn start(&self) -> Result<ConsumerHandle, BusError> {
        let handler: Arc<dyn EnvelopeHandler> = self.handler.clone();
        let handle = self.bus.consume(&self.handler.queue, handler).await?;
        info!(queue = %self.handler.queue, "bridge started");
        Ok(handle)
    }
}

/// Start one bridge per gateway queue.
pub async fn start_all(
    bus: &Arc<dyn MessageBus>,
    registry: &ConnectionRegistry,
) -> Result<Vec<ConsumerHandle>, BusError> {
    let mut handles = Vec::with_capacity(GATEWAY_QUEUES.len());
    for queue in GATEWAY_QUEUES {
        let bridge = QueueConsumerBridge::new(Arc::clone(bus), registry.clone(), *queue);
        match bridge.start().await {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                for handle in handles {
                    handle.shutdown().await;
                }
                return Err(err);
            }
        }
    }
    Ok(handles)
}

struct BridgeHandler {
    queue: String,
    registry: ConnectionRegistry,
    stats: Arc<BridgeStats>,
}

#[async_trait]
impl EnvelopeHandler for BridgeHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let routing_key = delivery.routing_key();
        let Some(owner) = delivery.envelope().owner_id() else {
            self.stats.unaddressed.fetch_add(1, Ordering::Relaxed);
            warn!(queue = %self.queue, routing_key, "envelope without owner id dropped");
            return Ok(());
        };

        let frame = OutboundFrame::new(routing_key, delivery.envelope().data().clone());
        match self.registry.send(owner, &frame) {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %self.queue, routing_key, owner, "delivered");
            }
            Err(ConnectionError::NotFound(_)) => {
                self.stats.not_connected.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %self.queue, routing_key, owner, "addressee not connected here");
            }
            Err(ConnectionError::Transport {
                connection_id,
                reason,
                ..
            }) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    queue = %self.queue,
                    routing_key,
                    owner,
                    connection_id = %connection_id,
                    reason = %reason,
                    "delivery failed, dropping stale connection"
                );
                self.registry.remove_connection(owner, connection_id);
            }
        }
        Ok(())
    }
}
