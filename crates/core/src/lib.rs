//! `fleetline-core`: dispatch domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identities, driver profiles and the trip-request view consumed by the
//! matcher.

pub mod driver;
pub mod error;
pub mod id;
pub mod trip;

pub use driver::{DriverProfile, Location};
pub use error::{DomainError, DomainResult};
pub use id::Identity;
pub use trip::TripRequest;
