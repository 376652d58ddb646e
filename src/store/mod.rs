// Key-value store with per-key TTL. Backs window counters, the alert cooldown map,
// the backup lease and connectivity bookkeeping.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Store `value` under `key`. `ttl = None` keeps the entry until deleted.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Store only when no live entry exists. Returns whether the value was written.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration)
    -> anyhow::Result<bool>;

    /// Remove the entry (value, counter and fields). Missing keys are not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Atomically increment a counter and refresh its TTL. Returns the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<u64>;

    /// Current counter value; 0 when missing or expired.
    async fn counter(&self, key: &str) -> anyhow::Result<u64>;

    /// Atomically increment one field of a counter map and refresh the map's TTL.
    async fn incr_field(&self, key: &str, field: &str, ttl: Duration) -> anyhow::Result<u64>;

    /// All fields of a counter map in first-insertion order.
    async fn fields(&self, key: &str) -> anyhow::Result<Vec<(String, u64)>>;

    /// Drop expired entries eagerly. Returns how many were removed.
    async fn prune_expired(&self) -> anyhow::Result<u64>;
}

impl dyn KvStore {
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        self.set(key, serde_json::to_vec(value)?, ttl).await
    }
}

fn expires_at(now: u64, ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|t| now.saturating_add(t.as_secs()))
}
