//! Driver registration as seen from the driver endpoint.

use async_trait::async_trait;
use fleetline_core::{DomainResult, DriverProfile};
use fleetline_infra::DriverPresenceRegistry;
use tracing::warn;

/// Brings drivers online and offline for the gateway.
#[async_trait]
pub trait DriverDirectory: Send + Sync {
    /// Register a driver. Only invalid input is an error.
    async fn register_driver(&self, driver_id: &str, package_slug: &str)
    -> DomainResult<DriverProfile>;

    /// Take a driver offline. Best-effort.
    async fn unregister_driver(&self, driver_id: &str);

    /// Cluster-wide number of online drivers, as last observed.
    fn online_drivers(&self) -> u64;
}

#[async_trait]
impl DriverDirectory for DriverPresenceRegistry {
    async fn register_driver(
        &self,
        driver_id: &str,
        package_slug: &str,
    ) -> DomainResult<DriverProfile> {
        let registration = self.register(driver_id, package_slug).await?;
        if !registration.confirmed {
            warn!(driver_id, "registration not confirmed cluster-wide");
        }
        Ok(registration.profile)
    }

    async fn unregister_driver(&self, driver_id: &str) {
        self.unregister(driver_id).await;
    }

    fn online_drivers(&self) -> u64 {
        DriverPresenceRegistry::online_drivers(self)
    }
}
