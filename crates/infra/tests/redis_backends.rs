//! Redis-backed bus and presence store against a live server.
//!
//! Skipped unless `FLEETLINE_TEST_REDIS_URL` points at a disposable Redis.

#![cfg(feature = "redis")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetline_events::contracts::{queues, routing_keys};
use fleetline_events::{Delivery, Envelope, HandlerError, MessageBus, handler_fn};
use fleetline_infra::event_bus::{RedisBusOptions, RedisStreamsBus};
use fleetline_infra::presence::{
    DriverPresenceRegistry, PresenceSettings, PresenceSource, RedisPresenceStore,
};
use serde_json::json;
use uuid::Uuid;

fn redis_url() -> Option<String> {
    std::env::var("FLEETLINE_TEST_REDIS_URL").ok()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn bus_delivers_in_publish_order_and_survives_handler_errors() {
    let Some(url) = redis_url() else {
        return;
    };
    let options = RedisBusOptions {
        consumer_name: format!("test-{}", Uuid::now_v7()),
        block: Duration::from_millis(100),
        ..RedisBusOptions::default()
    };
    let bus = RedisStreamsBus::connect(&url, options).await.unwrap();

    // Unique owner so entries left behind by earlier runs are told apart.
    let owner = format!("driver-{}", Uuid::now_v7());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = bus
        .consume(
            queues::DRIVER_CMD_TRIP_REQUEST,
            handler_fn(move |d: Delivery| {
                let sink = Arc::clone(&sink);
                async move {
                    let n = d.envelope().data()["n"].as_i64().unwrap_or(-1);
                    sink.lock().unwrap().push((d.envelope().owner_id().map(str::to_string), n));
                    if n == 2 {
                        return Err(HandlerError::new("refused"));
                    }
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    for n in 0..3 {
        bus.publish(
            routing_keys::DRIVER_CMD_TRIP_REQUEST,
            Envelope::directed(owner.as_str(), json!({ "n": n })),
        )
        .await
        .unwrap();
    }

    let mine = |seen: &Mutex<Vec<(Option<String>, i64)>>| -> Vec<i64> {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| o.as_deref() == Some(owner.as_str()))
            .map(|(_, n)| *n)
            .collect()
    };
    eventually(|| mine(&seen).len() == 3).await;
    handle.shutdown().await;

    assert_eq!(mine(&seen), vec![0, 1, 2]);
}

#[tokio::test]
async fn presence_round_trip_through_redis() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisPresenceStore::connect(&url, Duration::from_secs(2))
        .await
        .unwrap();
    let registry = DriverPresenceRegistry::new(Arc::new(store), PresenceSettings::default());

    let driver = format!("driver-{}", Uuid::now_v7());
    let package = format!("pkg-{}", Uuid::now_v7());

    let registration = registry.register(&driver, &package).await.unwrap();
    assert!(registration.confirmed);

    let found = registry.find_available(&package).await;
    assert_eq!(found.source, PresenceSource::Cluster);
    assert_eq!(found.drivers, vec![driver.clone()]);

    registry.unregister(&driver).await;
    assert!(registry.find_available(&package).await.drivers.is_empty());
}
