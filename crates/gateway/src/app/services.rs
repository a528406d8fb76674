//! Backing services selected by configuration.
//!
//! `memory` URLs select the in-process bus / presence store (dev and tests);
//! anything else is a Redis URL. Connection failures at startup are fatal.

use std::sync::Arc;

use anyhow::Context;
use fleetline_events::{InMemoryMessageBus, MessageBus};
use fleetline_infra::config::{Backend, Config};
use fleetline_infra::event_bus::{RedisBusOptions, RedisStreamsBus};
use fleetline_infra::presence::{
    DriverPresenceRegistry, InMemoryPresenceStore, PresenceSettings, PresenceStore,
    RedisPresenceStore,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct Services {
    pub bus: Arc<dyn MessageBus>,
    pub presence: Arc<DriverPresenceRegistry>,
}

impl Services {
    /// Fully in-process services.
    pub fn in_memory() -> Self {
        Self {
            bus: Arc::new(InMemoryMessageBus::new()),
            presence: Arc::new(DriverPresenceRegistry::new(
                Arc::new(InMemoryPresenceStore::new()),
                PresenceSettings::default(),
            )),
        }
    }
}

pub async fn build_services(config: &Config) -> anyhow::Result<Services> {
    let bus: Arc<dyn MessageBus> = match &config.bus {
        Backend::InMemory => {
            warn!("using in-memory bus; events stay inside this process");
            Arc::new(InMemoryMessageBus::new())
        }
        Backend::Redis(url) => {
            let options = RedisBusOptions {
                consumer_name: config.consumer_name.clone(),
                publish_timeout: config.publish_timeout,
                ..RedisBusOptions::default()
            };
            let bus = RedisStreamsBus::connect(url, options)
                .await
                .context("failed to connect to the message bus")?;
            Arc::new(bus)
        }
    };

    let store: Arc<dyn PresenceStore> = match &config.presence_store {
        Backend::InMemory => {
            warn!("using in-memory presence store; driver presence is not shared");
            Arc::new(InMemoryPresenceStore::new())
        }
        Backend::Redis(url) => {
            let store = RedisPresenceStore::connect(url, config.store_timeout)
                .await
                .context("failed to connect to the presence store")?;
            Arc::new(store)
        }
    };

    let presence = Arc::new(DriverPresenceRegistry::new(
        store,
        PresenceSettings::from_config(config),
    ));
    presence.refresh_gauge().await;

    info!(consumer = %config.consumer_name, "services ready");
    Ok(Services { bus, presence })
}
