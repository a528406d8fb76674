use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::Delivery;

/// Failure reported by an envelope handler.
///
/// Returning it negatively acknowledges the delivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct HandlerError {
    reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Consumer-side seam of the bus.
///
/// Handlers decide what counts as a failure: permanently malformed input
/// should be logged and acknowledged (`Ok`), since redelivering it cannot
/// succeed.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EnvelopeHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.0)(delivery.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EnvelopeHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
