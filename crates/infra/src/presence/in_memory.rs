//! In-memory presence store for tests/dev.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::store::{PresenceStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Faults {
    unreachable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    failing_keys: Mutex<HashSet<String>>,
}

/// Process-local stand-in for the shared presence store.
///
/// Expiry is applied lazily on access. Faults can be injected to exercise the
/// fallback and best-effort paths of the registry.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPresenceStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    faults: Arc<Faults>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unreachable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay every call by `delay` before it runs.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut d) = self.faults.delay.lock() {
            *d = delay;
        }
    }

    /// Make writes to `key` fail with [`StoreError::Command`].
    pub fn fail_writes_to(&self, key: impl Into<String>) {
        if let Ok(mut keys) = self.faults.failing_keys.lock() {
            keys.insert(key.into());
        }
    }

    pub fn clear_write_failures(&self) {
        if let Ok(mut keys) = self.faults.failing_keys.lock() {
            keys.clear();
        }
    }

    /// Remaining time to live of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|e| e.get(key).is_some_and(|entry| entry.is_live(now)))
            .unwrap_or(false)
    }

    async fn gate(&self) -> StoreResult<()> {
        let delay = self.faults.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.faults.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn gate_write(&self, key: &str) -> StoreResult<()> {
        self.gate().await?;
        let failing = self
            .faults
            .failing_keys
            .lock()
            .map(|keys| keys.contains(key))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Command(format!("write to {key} rejected")));
        }
        Ok(())
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Command("in-memory store poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, e| e.is_live(now));
        f(&mut entries)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!("WRONGTYPE operation against key {key}"))
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn ping(&self) -> StoreResult<()> {
        self.gate().await
    }

    async fn add_to_set(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.gate_write(key).await?;
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Set(BTreeSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Set(set) => Ok(set.insert(member.to_string())),
                Value::Hash(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()> {
        self.gate_write(key).await?;
        self.with_entries(|entries| {
            let now_empty = match entries.get_mut(key).map(|e| &mut e.value) {
                None => return Ok(()),
                Some(Value::Set(set)) => {
                    set.remove(member);
                    set.is_empty()
                }
                Some(Value::Hash(_)) => return Err(wrong_type(key)),
            };
            // Empty sets disappear, like in Redis.
            if now_empty {
                entries.remove(key);
            }
            Ok(())
        })
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.gate().await?;
        self.with_entries(|entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(Value::Hash(_)) => Err(wrong_type(key)),
        })
    }

    async fn set_len(&self, key: &str) -> StoreResult<u64> {
        self.gate().await?;
        self.with_entries(|entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Set(set)) => Ok(set.len() as u64),
            Some(Value::Hash(_)) => Err(wrong_type(key)),
        })
    }

    async fn put_field(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.gate_write(key).await?;
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(hash) => {
                    hash.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                Value::Set(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn get_field(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.gate().await?;
        self.with_entries(|entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(Value::Set(_)) => Err(wrong_type(key)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.gate_write(key).await?;
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                // Beyond the clock's range means "never" in practice.
                entry.expires_at = Instant::now().checked_add(ttl);
            }
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.gate_write(key).await?;
        self.with_entries(|entries| {
            entries.remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sets_and_hashes_behave_like_redis() {
        let store = InMemoryPresenceStore::new();

        assert!(store.add_to_set("s", "a").await.unwrap());
        assert!(store.add_to_set("s", "b").await.unwrap());
        assert!(!store.add_to_set("s", "a").await.unwrap());
        assert_eq!(store.set_len("s").await.unwrap(), 2);
        assert_eq!(store.set_members("s").await.unwrap(), vec!["a", "b"]);

        store.remove_from_set("s", "a").await.unwrap();
        store.remove_from_set("s", "b").await.unwrap();
        assert!(!store.contains_key("s"));
        assert_eq!(store.set_len("missing").await.unwrap(), 0);

        store.put_field("h", "data", "{}").await.unwrap();
        assert_eq!(
            store.get_field("h", "data").await.unwrap().as_deref(),
            Some("{}")
        );
        assert!(store.add_to_set("h", "x").await.is_err());

        store.delete("h").await.unwrap();
        assert_eq!(store.get_field("h", "data").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let store = InMemoryPresenceStore::new();
        store.add_to_set("s", "a").await.unwrap();
        store.expire("s", Duration::from_secs(30)).await.unwrap();

        assert!(store.ttl("s").is_some());
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(store.set_members("s").await.unwrap().is_empty());
        assert!(!store.contains_key("s"));
    }

    #[tokio::test]
    async fn huge_ttl_never_expires() {
        let store = InMemoryPresenceStore::new();
        store.add_to_set("s", "a").await.unwrap();
        store.expire("s", Duration::MAX).await.unwrap();

        assert!(store.contains_key("s"));
        assert_eq!(store.ttl("s"), None);
    }

    #[tokio::test]
    async fn unreachable_store_fails_every_call() {
        let store = InMemoryPresenceStore::new();
        store.set_unreachable(true);

        assert!(matches!(store.ping().await, Err(StoreError::Unreachable(_))));
        assert!(matches!(
            store.set_members("s").await,
            Err(StoreError::Unreachable(_))
        ));

        store.set_unreachable(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn failing_key_rejects_writes_only() {
        let store = InMemoryPresenceStore::new();
        store.add_to_set("s", "a").await.unwrap();
        store.fail_writes_to("s");

        assert!(matches!(
            store.add_to_set("s", "b").await,
            Err(StoreError::Command(_))
        ));
        assert_eq!(store.set_members("s").await.unwrap(), vec!["a"]);

        store.clear_write_failures();
        store.add_to_set("s", "b").await.unwrap();
    }
}
