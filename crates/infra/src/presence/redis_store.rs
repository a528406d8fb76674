use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use tokio::time::timeout;
use tracing::info;

use super::store::{PresenceStore, StoreError, StoreResult};

/// Presence store backed by a shared Redis.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisPresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPresenceStore").finish_non_exhaustive()
    }
}

fn map_err(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        StoreError::Unreachable(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

impl RedisPresenceStore {
    /// Connect and verify the store answers.
    pub async fn connect(redis_url: impl AsRef<str>, connect_timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_err)?;
        let conn = timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))?
            .map_err(map_err)?;

        let store = Self { conn };
        store.ping().await?;
        info!("connected to redis presence store");
        Ok(store)
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let added: u64 = conn.sadd(key, member).await.map_err(map_err)?;
        Ok(added > 0)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await.map_err(map_err)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(map_err)
    }

    async fn set_len(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        conn.scard(key).await.map_err(map_err)
    }

    async fn put_field(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await.map_err(map_err)
    }

    async fn get_field(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(map_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        conn.pexpire::<_, ()>(key, millis).await.map_err(map_err)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(map_err)
    }
}
