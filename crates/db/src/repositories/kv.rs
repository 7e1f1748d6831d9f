use std::time::Duration;

use async_trait::async_trait;
use helmsman_core::store::{AtomicStore, StoreError};
use sqlx::Row;

use super::{duration_millis, now_millis, RepositoryError};
use crate::DbPool;

/// `AtomicStore` over the `kv_store` table. Every mutating operation is a
/// single statement, so SQLite's write lock is the only coordination needed.
/// Expiry is wall-clock milliseconds.
pub struct SqlAtomicStore {
    pool: DbPool,
}

impl SqlAtomicStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Deletes rows whose expiry has passed. Expired rows are already
    /// invisible to reads; this only reclaims space.
    pub async fn purge_expired(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_live(&self, key: &str) -> Result<Option<(String, Option<i64>)>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT value, expires_at
            FROM kv_store
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some((row.try_get("value")?, row.try_get("expires_at")?)))
    }
}

#[async_trait]
impl AtomicStore for SqlAtomicStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.fetch_live(key).await?.map(|(value, _)| value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| now_millis().saturating_add(duration_millis(ttl)));
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            WHERE kv_store.expires_at IS NOT NULL AND kv_store.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now.saturating_add(duration_millis(ttl)))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        // A non-integer value is left untouched and comes back unparsable.
        let row = sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, expires_at)
            VALUES (?1, '1', NULL)
            ON CONFLICT(key) DO UPDATE SET
                value = CASE
                    WHEN kv_store.expires_at IS NOT NULL AND kv_store.expires_at <= ?2 THEN '1'
                    WHEN CAST(CAST(kv_store.value AS INTEGER) AS TEXT) = kv_store.value
                        THEN CAST(CAST(kv_store.value AS INTEGER) + 1 AS TEXT)
                    ELSE kv_store.value
                END,
                expires_at = CASE
                    WHEN kv_store.expires_at IS NOT NULL AND kv_store.expires_at <= ?2 THEN NULL
                    ELSE kv_store.expires_at
                END
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let value: String = row.try_get("value").map_err(RepositoryError::from)?;
        value.parse::<i64>().map_err(|_| StoreError::NotAnInteger { key: key.to_owned() })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE kv_store
            SET expires_at = ?
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(now.saturating_add(duration_millis(ttl)))
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let live = self.fetch_live(key).await?.is_some();
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(live)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = now_millis();
        Ok(self.fetch_live(key).await?.and_then(|(_, expires_at)| expires_at).map(|deadline| {
            Duration::from_millis(u64::try_from(deadline.saturating_sub(now)).unwrap_or(0))
        }))
    }
}
