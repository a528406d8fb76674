//! Configuration loading and representation.
//!
//! Everything is read from the environment with development defaults; only
//! malformed or out-of-range numeric values are rejected.

use std::time::Duration;

use thiserror::Error;

/// URL value selecting the in-process implementation instead of Redis.
pub const IN_MEMORY: &str = "memory";

/// Longest accepted presence TTL (one week).
pub const MAX_PRESENCE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted timeout or interval, in milliseconds (one hour).
const MAX_WAIT_MS: u64 = 60 * 60 * 1_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Where a backing service lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Redis(String),
    InMemory,
}

impl Backend {
    fn parse(value: String) -> Self {
        if value == IN_MEMORY {
            Self::InMemory
        } else {
            Self::Redis(value)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub http_addr: String,
    pub bus: Backend,
    pub presence_store: Backend,
    pub publish_timeout: Duration,
    pub store_timeout: Duration,
    pub presence_ttl: Duration,
    pub presence_sync_interval: Duration,
    /// How long shutdown waits for open sessions to unregister their drivers.
    pub shutdown_grace: Duration,
    pub consumer_name: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let number = |key: &'static str, default: u64, max: u64| -> Result<u64, ConfigError> {
            match lookup(key) {
                None => Ok(default),
                Some(value) => match value.trim().parse::<u64>() {
                    Ok(n) if n <= max => Ok(n),
                    _ => Err(ConfigError::Invalid { key, value }),
                },
            }
        };

        let consumer_name = lookup("CONSUMER_NAME")
            .unwrap_or_else(|| format!("gateway-{}", uuid::Uuid::now_v7()));

        Ok(Self {
            http_addr: string("HTTP_ADDR", "0.0.0.0:8081"),
            bus: Backend::parse(string("BUS_URL", "redis://127.0.0.1:6379")),
            presence_store: Backend::parse(string("REDIS_URL", "redis://127.0.0.1:6379")),
            publish_timeout: Duration::from_millis(number(
                "BUS_PUBLISH_TIMEOUT_MS",
                3_000,
                MAX_WAIT_MS,
            )?),
            store_timeout: Duration::from_millis(number("STORE_TIMEOUT_MS", 2_000, MAX_WAIT_MS)?),
            presence_ttl: Duration::from_secs(number(
                "PRESENCE_TTL_SECS",
                30 * 60,
                MAX_PRESENCE_TTL_SECS,
            )?),
            presence_sync_interval: Duration::from_secs(number(
                "PRESENCE_SYNC_INTERVAL_SECS",
                10,
                MAX_WAIT_MS / 1_000,
            )?),
            shutdown_grace: Duration::from_secs(number(
                "SHUTDOWN_GRACE_SECS",
                10,
                MAX_WAIT_MS / 1_000,
            )?),
            consumer_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.http_addr, "0.0.0.0:8081");
        assert_eq!(cfg.bus, Backend::Redis("redis://127.0.0.1:6379".into()));
        assert_eq!(cfg.store_timeout, Duration::from_secs(2));
        assert_eq!(cfg.presence_ttl, Duration::from_secs(1800));
        assert_eq!(cfg.presence_sync_interval, Duration::from_secs(10));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(10));
        assert!(cfg.consumer_name.starts_with("gateway-"));
    }

    #[test]
    fn memory_selects_in_process_backends() {
        let cfg = Config::from_lookup(lookup(&[
            ("BUS_URL", "memory"),
            ("REDIS_URL", "memory"),
            ("CONSUMER_NAME", "gw-1"),
        ]))
        .unwrap();
        assert_eq!(cfg.bus, Backend::InMemory);
        assert_eq!(cfg.presence_store, Backend::InMemory);
        assert_eq!(cfg.consumer_name, "gw-1");
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = Config::from_lookup(lookup(&[("STORE_TIMEOUT_MS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "STORE_TIMEOUT_MS",
                value: "soon".into()
            }
        );
    }

    #[test]
    fn oversized_ttl_is_rejected() {
        let err = Config::from_lookup(lookup(&[("PRESENCE_TTL_SECS", "18446744073709551615")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PRESENCE_TTL_SECS", .. }));

        let max = MAX_PRESENCE_TTL_SECS.to_string();
        let cfg = Config::from_lookup(lookup(&[("PRESENCE_TTL_SECS", max.as_str())])).unwrap();
        assert_eq!(cfg.presence_ttl, Duration::from_secs(MAX_PRESENCE_TTL_SECS));
    }
}
