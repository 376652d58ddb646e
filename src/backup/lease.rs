// Advisory backup lease: a TTL-bounded marker in the store. A crashed holder's lease simply
// expires, after which a later poll may proceed; the collector remains the authority on
// which job is claimed.

use crate::store::KvStore;
use std::sync::Arc;
use std::time::Duration;

pub const BACKUP_LOCK_KEY: &str = "backup_lock";

pub struct BackupLease {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl BackupLease {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Take the lease if no live one exists. Returns whether it was taken.
    pub async fn acquire(&self) -> anyhow::Result<bool> {
        self.store
            .set_if_absent(BACKUP_LOCK_KEY, b"1".to_vec(), self.ttl)
            .await
    }

    /// Idempotent.
    pub async fn release(&self) -> anyhow::Result<()> {
        self.store.delete(BACKUP_LOCK_KEY).await
    }

    pub async fn is_held(&self) -> anyhow::Result<bool> {
        Ok(self.store.get(BACKUP_LOCK_KEY).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn lease_excludes_until_released_or_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let lease = BackupLease::new(
            Arc::new(MemoryStore::with_clock(clock.clone())),
            Duration::from_secs(600),
        );
        assert!(lease.acquire().await.unwrap());
        assert!(!lease.acquire().await.unwrap());
        lease.release().await.unwrap();
        lease.release().await.unwrap();
        assert!(!lease.is_held().await.unwrap());

        assert!(lease.acquire().await.unwrap());
        clock.advance(600);
        assert!(!lease.is_held().await.unwrap());
        assert!(lease.acquire().await.unwrap());
    }
}
