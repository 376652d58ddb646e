// In-process store. Entries expire lazily when touched after their deadline.

use super::{KvStore, expires_at};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

enum Slot {
    Bytes(Vec<u8>),
    Counter(u64),
    Fields(FieldCounts),
}

/// Per-field counters in first-insertion order, indexed by name.
#[derive(Default)]
struct FieldCounts {
    ordered: Vec<(String, u64)>,
    index: HashMap<String, usize>,
}

impl FieldCounts {
    fn incr(&mut self, field: &str) -> u64 {
        if let Some(&i) = self.index.get(field) {
            self.ordered[i].1 += 1;
            return self.ordered[i].1;
        }
        self.index.insert(field.to_string(), self.ordered.len());
        self.ordered.push((field.to_string(), 1));
        1
    }
}

struct Entry {
    slot: Slot,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|t| now < t)
    }
}

pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("memory store lock poisoned: {}", e))
    }

    /// Live entry for `key`, dropping it first if it has expired.
    fn live<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: u64,
    ) -> Option<&'a mut Entry> {
        if map.get(key).is_some_and(|e| !e.is_live(now)) {
            map.remove(key);
        }
        map.get_mut(key)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let now = self.clock.now_unix();
        let mut map = self.lock()?;
        Ok(match Self::live(&mut map, key, now) {
            Some(Entry {
                slot: Slot::Bytes(b),
                ..
            }) => Some(b.clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> anyhow::Result<()> {
        let now = self.clock.now_unix();
        self.lock()?.insert(
            key.to_string(),
            Entry {
                slot: Slot::Bytes(value),
                expires_at: expires_at(now, ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now_unix();
        let mut map = self.lock()?;
        if Self::live(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                slot: Slot::Bytes(value),
                expires_at: expires_at(now, Some(ttl)),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<u64> {
        let now = self.clock.now_unix();
        let mut map = self.lock()?;
        let next = match Self::live(&mut map, key, now) {
            Some(Entry {
                slot: Slot::Counter(n),
                ..
            }) => *n + 1,
            _ => 1,
        };
        map.insert(
            key.to_string(),
            Entry {
                slot: Slot::Counter(next),
                expires_at: expires_at(now, Some(ttl)),
            },
        );
        Ok(next)
    }

    async fn counter(&self, key: &str) -> anyhow::Result<u64> {
        let now = self.clock.now_unix();
        let mut map = self.lock()?;
        Ok(match Self::live(&mut map, key, now) {
            Some(Entry {
                slot: Slot::Counter(n),
                ..
            }) => *n,
            _ => 0,
        })
    }

    async fn incr_field(&self, key: &str, field: &str, ttl: Duration) -> anyhow::Result<u64> {
        let now = self.clock.now_unix();
        let mut map = self.lock()?;
        let deadline = expires_at(now, Some(ttl));
        if let Some(Entry {
            slot: Slot::Fields(fields),
            expires_at,
        }) = Self::live(&mut map, key, now)
        {
            *expires_at = deadline;
            return Ok(fields.incr(field));
        }
        let mut fields = FieldCounts::default();
        fields.incr(field);
        map.insert(
            key.to_string(),
            Entry {
                slot: Slot::Fields(fields),
                expires_at: deadline,
            },
        );
        Ok(1)
    }

    async fn fields(&self, key: &str) -> anyhow::Result<Vec<(String, u64)>> {
        let now = self.clock.now_unix();
        let mut map = self.lock()?;
        Ok(match Self::live(&mut map, key, now) {
            Some(Entry {
                slot: Slot::Fields(f),
                ..
            }) => f.ordered.clone(),
            _ => Vec::new(),
        })
    }

    async fn prune_expired(&self) -> anyhow::Result<u64> {
        let now = self.clock.now_unix();
        let mut map = self.lock()?;
        let before = map.len();
        map.retain(|_, e| e.is_live(now));
        Ok((before - map.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(now: u64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(now));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let (clock, store) = store_at(1_000);
        store
            .set("k", b"v".to_vec(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        clock.advance(9);
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        clock.advance(1);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_restarts_after_expiry() {
        let (clock, store) = store_at(0);
        let ttl = Duration::from_secs(120);
        assert_eq!(store.incr("c", ttl).await.unwrap(), 1);
        assert_eq!(store.incr("c", ttl).await.unwrap(), 2);
        clock.advance(121);
        assert_eq!(store.counter("c").await.unwrap(), 0);
        assert_eq!(store.incr("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fields_keep_first_seen_order() {
        let (_clock, store) = store_at(0);
        let ttl = Duration::from_secs(120);
        store.incr_field("m", "b", ttl).await.unwrap();
        store.incr_field("m", "a", ttl).await.unwrap();
        store.incr_field("m", "b", ttl).await.unwrap();
        assert_eq!(
            store.fields("m").await.unwrap(),
            vec![("b".to_string(), 2), ("a".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn many_distinct_fields_count_independently() {
        let (_clock, store) = store_at(0);
        let ttl = Duration::from_secs(120);
        for round in 0..3 {
            for i in 0..5_000 {
                let n = store
                    .incr_field("ips", &format!("10.0.{}.{}", i / 256, i % 256), ttl)
                    .await
                    .unwrap();
                assert_eq!(n, round + 1);
            }
        }
        let fields = store.fields("ips").await.unwrap();
        assert_eq!(fields.len(), 5_000);
        assert_eq!(fields[0], ("10.0.0.0".to_string(), 3));
        assert_eq!(fields[4_999], ("10.0.19.135".to_string(), 3));
    }

    #[tokio::test]
    async fn set_if_absent_respects_live_entry() {
        let (clock, store) = store_at(0);
        let ttl = Duration::from_secs(600);
        assert!(store.set_if_absent("lock", b"1".to_vec(), ttl).await.unwrap());
        assert!(!store.set_if_absent("lock", b"1".to_vec(), ttl).await.unwrap());
        clock.advance(600);
        assert!(store.set_if_absent("lock", b"1".to_vec(), ttl).await.unwrap());
    }
}
