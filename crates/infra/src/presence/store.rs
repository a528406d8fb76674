use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (connection refused, dropped, io).
    #[error("presence store unreachable: {0}")]
    Unreachable(String),

    #[error("presence store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with an error.
    #[error("presence store command failed: {0}")]
    Command(String),

    #[error("presence data could not be (de)serialized: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared key/value store holding driver presence.
///
/// Operations are individually atomic; nothing spans several keys.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    /// Returns `true` when `member` was not in the set before.
    async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn set_len(&self, key: &str) -> StoreResult<u64>;

    async fn put_field(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn get_field(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Set the time-to-live of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}
