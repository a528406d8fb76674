//! Read-only view over a trip-request event payload.
//!
//! The trip document itself is owned by the trip service; the matcher only
//! needs the requester and the selected package, and forwards the original
//! payload untouched in the offer.

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::DomainError;

#[derive(Debug, Deserialize)]
struct TripEventData {
    trip: TripData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TripData {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "userID", alias = "userId")]
    user_id: String,
    selected_fare: FareData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FareData {
    package_slug: String,
}

/// The fields of a trip-request event the dispatch core acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripRequest {
    trip_id: Option<String>,
    requester_id: String,
    package_slug: String,
}

impl TripRequest {
    /// Extract the request view from a `{ "trip": { .. } }` payload.
    pub fn from_payload(payload: &JsonValue) -> Result<Self, DomainError> {
        let data = TripEventData::deserialize(payload)
            .map_err(|e| DomainError::malformed(format!("trip event: {e}")))?;

        if data.trip.user_id.is_empty() {
            return Err(DomainError::validation("trip event has no requester"));
        }
        if data.trip.selected_fare.package_slug.is_empty() {
            return Err(DomainError::validation("trip event has no package slug"));
        }

        Ok(Self {
            trip_id: data.trip.id,
            requester_id: data.trip.user_id,
            package_slug: data.trip.selected_fare.package_slug,
        })
    }

    pub fn trip_id(&self) -> Option<&str> {
        self.trip_id.as_deref()
    }

    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }

    pub fn package_slug(&self) -> &str {
        &self.package_slug
    }
}
