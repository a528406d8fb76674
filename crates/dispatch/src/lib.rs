//! `fleetline-dispatch`: turns trip requests into directed driver offers.

pub mod matcher;

pub use matcher::{DispatchMatcher, MatchError, MatchOutcome};
