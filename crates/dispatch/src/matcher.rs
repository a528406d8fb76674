//! Trip-request matching.
//!
//! Stateless per request: look up the candidate drivers for the requested
//! package, offer the trip to one of them chosen uniformly at random, or tell
//! the requester nobody is available. A decline comes back later as a new
//! trip event; no memory of earlier offers is kept here.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use fleetline_core::TripRequest;
use fleetline_events::contracts::{queues, routing_keys};
use fleetline_events::{
    BusError, ConsumerHandle, Delivery, Envelope, EnvelopeHandler, HandlerError, MessageBus,
};
use fleetline_infra::presence::{DriverPresenceRegistry, PresenceSource};
use rand::prelude::*;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("failed to publish {routing_key}: {source}")]
    Publish {
        routing_key: &'static str,
        #[source]
        source: BusError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The trip was offered to `driver_id`.
    Offered {
        driver_id: String,
        source: PresenceSource,
    },
    /// No candidate; the requester was notified.
    NoDriversFound,
}

pub struct DispatchMatcher {
    bus: Arc<dyn MessageBus>,
    presence: Arc<DriverPresenceRegistry>,
    rng: Mutex<StdRng>,
}

impl DispatchMatcher {
    pub fn new(bus: Arc<dyn MessageBus>, presence: Arc<DriverPresenceRegistry>) -> Self {
        Self {
            bus,
            presence,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a fixed seed for the candidate pick.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Consume trip events from the `find_available_drivers` queue.
    pub async fn start(self: &Arc<Self>) -> Result<ConsumerHandle, BusError> {
        let handler: Arc<dyn EnvelopeHandler> = Arc::clone(self) as Arc<dyn EnvelopeHandler>;
        self.bus
            .consume(queues::FIND_AVAILABLE_DRIVERS, handler)
            .await
    }

    /// Offer `request` to one available driver, or notify the requester.
    ///
    /// `payload` is forwarded verbatim in the offer.
    #[instrument(
        skip_all,
        fields(requester = %request.requester_id(), package = %request.package_slug())
    )]
    pub async fn handle_trip_request(
        &self,
        request: &TripRequest,
        payload: &JsonValue,
    ) -> Result<MatchOutcome, MatchError> {
        let availability = self.presence.find_available(request.package_slug()).await;
        debug!(
            candidates = availability.drivers.len(),
            source = ?availability.source,
            "candidate drivers"
        );

        let Some(driver_id) = self.pick(&availability.drivers) else {
            self.publish(
                routing_keys::TRIP_EVENT_NO_DRIVERS_FOUND,
                Envelope::directed(request.requester_id(), JsonValue::Null),
            )
            .await?;
            info!("no drivers found");
            return Ok(MatchOutcome::NoDriversFound);
        };

        self.publish(
            routing_keys::DRIVER_CMD_TRIP_REQUEST,
            Envelope::directed(driver_id.as_str(), payload.clone()),
        )
        .await?;
        info!(driver_id = %driver_id, "trip offered");

        Ok(MatchOutcome::Offered {
            driver_id,
            source: availability.source,
        })
    }

    fn pick(&self, candidates: &[String]) -> Option<String> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        candidates.choose(&mut *rng).cloned()
    }

    async fn publish(&self, routing_key: &'static str, envelope: Envelope) -> Result<(), MatchError> {
        self.bus
            .publish(routing_key, envelope)
            .await
            .map_err(|source| MatchError::Publish {
                routing_key,
                source,
            })
    }
}

#[async_trait]
impl EnvelopeHandler for DispatchMatcher {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        match delivery.routing_key() {
            routing_keys::TRIP_EVENT_CREATED | routing_keys::TRIP_EVENT_DRIVER_NOT_INTERESTED => {}
            other => {
                warn!(routing_key = %other, "unexpected trip event, skipped");
                return Ok(());
            }
        }

        let payload = delivery.envelope().data();
        let request = match TripRequest::from_payload(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, routing_key = %delivery.routing_key(), "dropping trip event");
                return Ok(());
            }
        };

        self.handle_trip_request(&request, payload)
            .await
            .map(|_| ())
            .map_err(|err| HandlerError::new(err.to_string()))
    }
}
