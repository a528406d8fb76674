//! Infrastructure layer: Redis-backed bus, shared presence store, config.

pub mod config;
pub mod event_bus;
pub mod presence;

pub use config::{Config, ConfigError};
pub use presence::{
    Availability, DriverPresenceRegistry, InMemoryPresenceStore, PresenceSettings,
    PresenceSource, PresenceStore, Registration, StoreError,
};
