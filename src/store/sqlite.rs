// SQLite-backed store. Survives agent restarts; increments are single upsert statements
// so concurrent writers never lose counts.

use super::{KvStore, expires_at};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

pub struct SqliteStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        Self::connect_with_clock(path, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(path: &str, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        Ok(Self { pool, clock })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_entries (key TEXT PRIMARY KEY, value BLOB NOT NULL, expires_at INTEGER)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_counters (key TEXT PRIMARY KEY, count INTEGER NOT NULL, expires_at INTEGER NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_fields (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                count INTEGER NOT NULL,
                UNIQUE (key, field)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_field_maps (key TEXT PRIMARY KEY, expires_at INTEGER NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_fields_key ON kv_fields(key)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_expired_rows(&self) -> anyhow::Result<u64> {
        let now = self.now();
        let mut tx = self.pool.begin().await?;
        let mut removed = sqlx::query(
            "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        removed += sqlx::query("DELETE FROM kv_counters WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            "DELETE FROM kv_fields WHERE key IN (SELECT key FROM kv_field_maps WHERE expires_at <= ?)",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        removed += sqlx::query("DELETE FROM kv_field_maps WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }

    fn now(&self) -> i64 {
        self.clock.now_unix() as i64
    }
}

fn deadline(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(ttl.as_secs() as i64)
}

#[async_trait]
impl KvStore for SqliteStore {
    /// Reads already ignore expired rows; this only reclaims space.
    #[instrument(skip(self), fields(repo = "kv", operation = "prune_expired"))]
    async fn prune_expired(&self) -> anyhow::Result<u64> {
        self.delete_expired_rows().await
    }

    #[instrument(skip(self), fields(repo = "kv", operation = "get"))]
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT value FROM kv_entries WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(self.now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    #[instrument(skip(self, value), fields(repo = "kv", operation = "set"))]
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> anyhow::Result<()> {
        let expires = expires_at(self.clock.now_unix(), ttl).map(|t| t as i64);
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, value), fields(repo = "kv", operation = "set_if_absent"))]
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let now = self.now();
        // Overwrites only an expired row; a live row leaves rows_affected at 0.
        let result = sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
             WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= ?",
        )
        .bind(key)
        .bind(value)
        .bind(deadline(now, ttl))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(repo = "kv", operation = "delete"))]
    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM kv_entries WHERE key = ?",
            "DELETE FROM kv_counters WHERE key = ?",
            "DELETE FROM kv_fields WHERE key = ?",
            "DELETE FROM kv_field_maps WHERE key = ?",
        ] {
            sqlx::query(sql).bind(key).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "kv", operation = "incr"))]
    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<u64> {
        let now = self.now();
        let row = sqlx::query(
            "INSERT INTO kv_counters (key, count, expires_at) VALUES (?, 1, ?)
             ON CONFLICT(key) DO UPDATE SET
                count = CASE WHEN kv_counters.expires_at <= ? THEN 1 ELSE kv_counters.count + 1 END,
                expires_at = excluded.expires_at
             RETURNING count",
        )
        .bind(key)
        .bind(deadline(now, ttl))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    #[instrument(skip(self), fields(repo = "kv", operation = "counter"))]
    async fn counter(&self, key: &str) -> anyhow::Result<u64> {
        let row = sqlx::query("SELECT count FROM kv_counters WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(self.now())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("count") as u64).unwrap_or(0))
    }

    #[instrument(skip(self), fields(repo = "kv", operation = "incr_field"))]
    async fn incr_field(&self, key: &str, field: &str, ttl: Duration) -> anyhow::Result<u64> {
        let now = self.now();
        let mut tx = self.pool.begin().await?;
        let expired = sqlx::query("DELETE FROM kv_field_maps WHERE key = ? AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if expired > 0 {
            sqlx::query("DELETE FROM kv_fields WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO kv_field_maps (key, expires_at) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(deadline(now, ttl))
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query(
            "INSERT INTO kv_fields (key, field, count) VALUES (?, ?, 1)
             ON CONFLICT(key, field) DO UPDATE SET count = kv_fields.count + 1
             RETURNING count",
        )
        .bind(key)
        .bind(field)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    #[instrument(skip(self), fields(repo = "kv", operation = "fields"))]
    async fn fields(&self, key: &str) -> anyhow::Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT f.field, f.count FROM kv_fields f
            JOIN kv_field_maps m ON m.key = f.key
            WHERE f.key = ? AND m.expires_at > ?
            ORDER BY f.seq ASC
            "#,
        )
        .bind(key)
        .bind(self.now())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>("field"),
                    r.get::<i64, _>("count") as u64,
                )
            })
            .collect())
    }
}
