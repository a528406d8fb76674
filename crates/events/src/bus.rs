//! Message publishing/consumption abstraction (mechanics only).
//!
//! This module provides the **message bus pattern** used between services:
//! envelopes are published under a routing key, and named queues bound to
//! routing keys deliver them to registered handlers.
//!
//! ## Delivery model
//!
//! - **Fan-out by binding**: every queue bound to a routing key receives its own
//!   copy of each envelope published under that key.
//! - **Competing consumers**: replicas consuming the same queue share its
//!   envelopes; each envelope is handled by one of them.
//! - **FIFO per queue**: with a single consumer, a queue hands out envelopes in
//!   publish order for each routing key. Nothing is promised across queues.
//! - **Ack / nack**: a handler returning `Ok` acknowledges the envelope. An
//!   error negatively acknowledges it; it is dead-lettered, never requeued.
//! - **No exactly-once**: consumers must tolerate the occasional duplicate
//!   after a crash between handling and acknowledgement.
//!
//! ## Reconnects
//!
//! Transport loss is handled inside the bus implementation (backoff + retry).
//! Callers of `publish` see a `BusError` only when the bounded publish timeout
//! elapses or the broker rejects the write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::envelope::Envelope;
use crate::handler::EnvelopeHandler;

/// Bus-level failure.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker is unreachable or rejected the operation.
    #[error("bus transport error: {0}")]
    Transport(String),

    /// The broker did not confirm within the configured bound.
    #[error("bus operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("envelope serialization failed: {0}")]
    Serialization(String),

    /// The queue is not part of the bus topology.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// The bus has been shut down.
    #[error("bus closed")]
    Closed,
}

/// Domain-agnostic message bus.
///
/// Implementations must be safe to share across tasks; multiple tasks may
/// publish concurrently.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `envelope` under `routing_key`.
    ///
    /// Returns once the broker accepted the write, or fails after a bounded
    /// timeout.
    async fn publish(&self, routing_key: &str, envelope: Envelope) -> Result<(), BusError>;

    /// Start delivering envelopes from `queue` to `handler`.
    ///
    /// Delivery runs on a background task until the returned handle is shut
    /// down. A handler error negatively acknowledges the envelope.
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<ConsumerHandle, BusError>;
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn publish(&self, routing_key: &str, envelope: Envelope) -> Result<(), BusError> {
        (**self).publish(routing_key, envelope).await
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<ConsumerHandle, BusError> {
        (**self).consume(queue, handler).await
    }
}

/// Handle to a running consumer loop.
///
/// Dropping the handle stops the loop just like `shutdown`, without waiting.
/// The loop checks the stop signal between deliveries, so an in-flight handler
/// invocation always runs to completion.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn new(queue: impl Into<String>, stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            queue: queue.into(),
            stop,
            task,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Signal the loop to stop and wait for it to drain.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(queue = %self.queue, error = %err, "consumer task ended abnormally");
        }
    }
}
