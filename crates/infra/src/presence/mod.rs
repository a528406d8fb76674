//! Cluster-wide driver presence.
//!
//! Layout in the shared store:
//! - `drivers:online`: set of every online driver id
//! - `drivers:online:<package>`: set of online driver ids per package, with expiry
//! - `driver:data:<id>`: hash holding the driver profile under `data`, with expiry

mod in_memory;
mod profile;
#[cfg(feature = "redis")]
mod redis_store;
mod registry;
mod store;

pub use in_memory::InMemoryPresenceStore;
pub use profile::ProfileGenerator;
#[cfg(feature = "redis")]
pub use redis_store::RedisPresenceStore;
pub use registry::{
    Availability, DriverPresenceRegistry, PresenceSettings, PresenceSource, Registration,
};
pub use store::{PresenceStore, StoreError, StoreResult};

/// Global set of online driver ids.
pub const ONLINE_DRIVERS_KEY: &str = "drivers:online";

/// Prefix of the per-driver profile hash.
pub const DRIVER_DATA_PREFIX: &str = "driver:data:";

/// Hash field holding the serialized profile.
pub const PROFILE_FIELD: &str = "data";

/// Set of online drivers offering `package`.
pub fn package_set_key(package: &str) -> String {
    format!("{ONLINE_DRIVERS_KEY}:{package}")
}

pub fn driver_data_key(driver_id: &str) -> String {
    format!("{DRIVER_DATA_PREFIX}{driver_id}")
}
