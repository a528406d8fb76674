//! Driver presence registry.
//!
//! Keeps the cluster view (shared store) and this replica's own view (local
//! map) of online drivers:
//!
//! - **Register** writes the global set, the per-package set and the profile
//!   blob. Store failures never fail the call; the returned registration says
//!   whether the cluster write was confirmed.
//! - **Unregister** is best-effort on every step and recovers the package from
//!   the stored profile when this replica does not know the driver.
//! - **Lookup** reads the per-package set and falls back to the local map on
//!   any store error. It never fails and reports which path served it.
//!
//! Every store call is bounded by `PresenceSettings::op_timeout`. Calls for the
//! same driver are serialized; different drivers never contend.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use fleetline_core::{DomainError, DomainResult, DriverProfile, Identity};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, error, info, instrument, warn};

use super::profile::ProfileGenerator;
use super::store::{PresenceStore, StoreError, StoreResult};
use super::{ONLINE_DRIVERS_KEY, PROFILE_FIELD, driver_data_key, package_set_key};
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSettings {
    /// Bound on every individual store call.
    pub op_timeout: Duration,
    /// Expiry of the profile blob.
    pub profile_ttl: Duration,
    /// Expiry of the per-package set; outlives the profile blob.
    pub package_set_ttl: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(2), Duration::from_secs(30 * 60))
    }
}

impl PresenceSettings {
    pub fn with_ttl(op_timeout: Duration, profile_ttl: Duration) -> Self {
        Self {
            op_timeout,
            profile_ttl,
            package_set_ttl: profile_ttl.saturating_add(Duration::from_secs(60)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_ttl(config.store_timeout, config.presence_ttl)
    }
}

/// Which view served a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSource {
    /// The shared store: every replica's drivers.
    Cluster,
    /// This replica's own drivers only (store unreachable).
    LocalFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub drivers: Vec<String>,
    pub source: PresenceSource,
}

impl Availability {
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub profile: DriverProfile,
    /// `false` when any shared-store write failed.
    pub confirmed: bool,
}

pub struct DriverPresenceRegistry {
    store: Arc<dyn PresenceStore>,
    local: RwLock<BTreeMap<String, DriverProfile>>,
    slots: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
    generator: Mutex<ProfileGenerator>,
    online_gauge: AtomicU64,
    settings: PresenceSettings,
}

impl std::fmt::Debug for DriverPresenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverPresenceRegistry")
            .field("settings", &self.settings)
            .field("online", &self.online_drivers())
            .finish_non_exhaustive()
    }
}

impl DriverPresenceRegistry {
    pub fn new(store: Arc<dyn PresenceStore>, settings: PresenceSettings) -> Self {
        Self {
            store,
            local: RwLock::new(BTreeMap::new()),
            slots: Mutex::new(HashMap::new()),
            generator: Mutex::new(ProfileGenerator::from_entropy()),
            online_gauge: AtomicU64::new(0),
            settings,
        }
    }

    pub fn with_generator(mut self, generator: ProfileGenerator) -> Self {
        self.generator = Mutex::new(generator);
        self
    }

    pub fn settings(&self) -> &PresenceSettings {
        &self.settings
    }

    /// Register a driver and return its freshly generated profile.
    ///
    /// Only invalid input fails. Store failures leave the driver registered
    /// locally with `confirmed == false`.
    #[instrument(skip_all, fields(driver_id = %driver_id, package = %package_slug))]
    pub async fn register(
        &self,
        driver_id: &str,
        package_slug: &str,
    ) -> DomainResult<Registration> {
        let driver_id = Identity::parse(driver_id)?;
        if package_slug.trim().is_empty() {
            return Err(DomainError::validation("package slug must not be empty"));
        }

        let slot = self.slot(driver_id.as_str());
        let _guard = slot.lock().await;

        let profile = self
            .generator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generate(driver_id.as_str(), package_slug);

        let previous = self
            .local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.id.clone(), profile.clone());

        let mut left_package = false;
        if let Some(previous) = previous.filter(|p| p.package_slug != profile.package_slug) {
            let key = package_set_key(&previous.package_slug);
            match self
                .call(self.store.remove_from_set(&key, driver_id.as_str()))
                .await
            {
                Ok(()) => left_package = true,
                Err(err) => warn!(error = %err, key = %key, "failed to leave previous package set"),
            }
        }

        let confirmed = self.write_cluster(&profile, left_package).await;
        self.refresh_gauge().await;

        if confirmed {
            info!("driver registered cluster-wide");
        } else {
            warn!("driver registered locally only");
        }
        Ok(Registration { profile, confirmed })
    }

    /// `left_package` is set when this call just took the driver out of its
    /// previous package set.
    async fn write_cluster(&self, profile: &DriverProfile, left_package: bool) -> bool {
        let id = profile.id.as_str();

        let joined_online = match self.call(self.store.add_to_set(ONLINE_DRIVERS_KEY, id)).await {
            Ok(joined) => joined,
            Err(err) => {
                warn!(error = %err, "failed to add driver to online set");
                return false;
            }
        };

        let package_key = package_set_key(&profile.package_slug);
        let mut added = self.call(self.store.add_to_set(&package_key, id)).await;
        if let Err(err) = &added {
            warn!(error = %err, key = %package_key, "package set write failed, retrying once");
            added = self.call(self.store.add_to_set(&package_key, id)).await;
        }
        if let Err(err) = added {
            // Still indexed under a package from an earlier registration: the
            // online membership is backed and must stay.
            if !joined_online && !left_package {
                warn!(error = %err, key = %package_key, "package set write failed, keeping existing membership");
                return false;
            }
            warn!(error = %err, key = %package_key, "package set write failed, rolling back online set");
            if let Err(rollback) = self
                .call(self.store.remove_from_set(ONLINE_DRIVERS_KEY, id))
                .await
            {
                error!(
                    error = %rollback,
                    driver_id = %id,
                    key = %package_key,
                    "consistency gap: driver in online set but not in package set until expiry"
                );
            }
            return false;
        }

        let mut confirmed = true;
        if let Err(err) = self
            .call(self.store.expire(&package_key, self.settings.package_set_ttl))
            .await
        {
            warn!(error = %err, key = %package_key, "failed to refresh package set expiry");
            confirmed = false;
        }

        let data_key = driver_data_key(id);
        match serde_json::to_string(profile) {
            Ok(blob) => {
                if let Err(err) = self
                    .call(self.store.put_field(&data_key, PROFILE_FIELD, &blob))
                    .await
                {
                    warn!(error = %err, "failed to store driver profile");
                    confirmed = false;
                } else if let Err(err) = self
                    .call(self.store.expire(&data_key, self.settings.profile_ttl))
                    .await
                {
                    warn!(error = %err, "failed to set driver profile expiry");
                    confirmed = false;
                }
            }
            Err(err) => {
                warn!(error = %err, "driver profile not serializable");
                confirmed = false;
            }
        }

        confirmed
    }

    /// Take a driver offline. Best-effort; never fails.
    #[instrument(skip_all, fields(driver_id = %driver_id))]
    pub async fn unregister(&self, driver_id: &str) {
        let slot = self.slot(driver_id);
        let _guard = slot.lock().await;

        let local_package = self
            .local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(driver_id)
            .map(|profile| profile.package_slug);

        if let Err(err) = self
            .call(self.store.remove_from_set(ONLINE_DRIVERS_KEY, driver_id))
            .await
        {
            warn!(error = %err, "failed to remove driver from online set");
        }

        let package = match local_package {
            Some(package) => Some(package),
            None => self.stored_package(driver_id).await,
        };
        match package {
            Some(package) => {
                let key = package_set_key(&package);
                if let Err(err) = self.call(self.store.remove_from_set(&key, driver_id)).await {
                    warn!(error = %err, key = %key, "failed to remove driver from package set");
                }
            }
            None => warn!("package unknown, per-package entry left to expire"),
        }

        if let Err(err) = self.call(self.store.delete(&driver_data_key(driver_id))).await {
            warn!(error = %err, "failed to delete driver profile");
        }

        self.refresh_gauge().await;
        info!("driver unregistered");
    }

    async fn stored_package(&self, driver_id: &str) -> Option<String> {
        let blob = match self
            .call(self.store.get_field(&driver_data_key(driver_id), PROFILE_FIELD))
            .await
        {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "failed to read stored driver profile");
                return None;
            }
        };

        match serde_json::from_str::<DriverProfile>(&blob) {
            Ok(profile) => Some(profile.package_slug),
            Err(err) => {
                warn!(error = %err, "stored driver profile is malformed");
                None
            }
        }
    }

    /// Online drivers offering `package_slug`.
    pub async fn find_available(&self, package_slug: &str) -> Availability {
        let key = package_set_key(package_slug);
        match self.call(self.store.set_members(&key)).await {
            Ok(mut drivers) => {
                drivers.sort();
                debug!(package = %package_slug, count = drivers.len(), "drivers found cluster-wide");
                Availability {
                    drivers,
                    source: PresenceSource::Cluster,
                }
            }
            Err(err) => {
                let drivers = self.local_drivers(package_slug);
                warn!(
                    error = %err,
                    package = %package_slug,
                    count = drivers.len(),
                    "presence store unavailable, using local drivers"
                );
                Availability {
                    drivers,
                    source: PresenceSource::LocalFallback,
                }
            }
        }
    }

    /// Drivers registered through this replica offering `package_slug`.
    pub fn local_drivers(&self, package_slug: &str) -> Vec<String> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|profile| profile.package_slug == package_slug)
            .map(|profile| profile.id.clone())
            .collect()
    }

    pub fn local_profile(&self, driver_id: &str) -> Option<DriverProfile> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(driver_id)
            .cloned()
    }

    /// Last known cluster-wide number of online drivers.
    pub fn online_drivers(&self) -> u64 {
        self.online_gauge.load(Ordering::Relaxed)
    }

    /// Resynchronize the online-driver gauge with the store.
    pub async fn refresh_gauge(&self) {
        match self.call(self.store.set_len(ONLINE_DRIVERS_KEY)).await {
            Ok(count) => self.online_gauge.store(count, Ordering::Relaxed),
            Err(err) => debug!(error = %err, "online driver gauge not refreshed"),
        }
    }

    /// Refresh the gauge every `every` until `stop` flips (or its sender drops).
    pub fn spawn_gauge_sync(
        self: &Arc<Self>,
        every: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => registry.refresh_gauge().await,
                }
            }
            debug!("online driver gauge sync stopped");
        })
    }

    async fn call<T>(&self, op: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        timeout(self.settings.op_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.settings.op_timeout))?
    }

    fn slot(&self, driver_id: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(driver_id).and_then(Weak::upgrade) {
            return slot;
        }
        slots.retain(|_, slot| slot.strong_count() > 0);
        let slot = Arc::new(AsyncMutex::new(()));
        slots.insert(driver_id.to_string(), Arc::downgrade(&slot));
        slot
    }
}
