//! Relational-store-backed lock backend (§4.1 "Backend" expansion).
//!
//! Persists leases in the same pool the job store uses, avoiding a second
//! infrastructure dependency. "Set if absent with expiry" is one
//! `INSERT ... ON CONFLICT DO UPDATE ... WHERE` statement; `extend`/`release`
//! are `UPDATE`/`DELETE ... WHERE key = ? AND token = ?`.

use super::LockBackend;
use crate::error::LockError;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;

pub struct SqlLockBackend {
    pool: SqlitePool,
}

impl SqlLockBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates `engine_locks` if it does not already exist. Safe to call
    /// repeatedly (e.g. once per process on startup).
    pub async fn ensure_schema(&self) -> Result<(), LockError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engine_locks (
                key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl LockBackend for SqlLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT expires_at FROM engine_locks WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;

        let is_free = match existing {
            None => true,
            Some((expires_at_str,)) => {
                let held_expiry: chrono::DateTime<Utc> = expires_at_str
                    .parse()
                    .map_err(|e: chrono::ParseError| LockError::Backend(e.to_string()))?;
                held_expiry <= now
            }
        };

        if !is_free {
            tx.rollback()
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO engine_locks (key, token, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET token = excluded.token, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(expires_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(true)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let result = sqlx::query(
            "UPDATE engine_locks SET expires_at = ? WHERE key = ? AND token = ?",
        )
        .bind(expires_at.to_rfc3339())
        .bind(key)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let result = sqlx::query("DELETE FROM engine_locks WHERE key = ? AND token = ?")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT expires_at FROM engine_locks WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(match row {
            None => false,
            Some((expires_at_str,)) => {
                let expires_at: chrono::DateTime<Utc> = expires_at_str
                    .parse()
                    .map_err(|e: chrono::ParseError| LockError::Backend(e.to_string()))?;
                expires_at > Utc::now()
            }
        })
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT token FROM engine_locks WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(row.map(|(token,)| token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockManager;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let backend = SqlLockBackend::new(pool.clone());
        backend.ensure_schema().await.unwrap();
        pool
    }

    #[tokio::test]
    async fn acquire_extend_release_round_trip() {
        let pool = setup().await;
        let backend = SqlLockBackend::new(pool);
        let mgr = LockManager::new("node-a", backend);

        let lock = mgr
            .acquire("import-job:1", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap()
            .expect("lock acquired");
        assert!(mgr.is_locked("import-job:1").await.unwrap());
        assert!(mgr.release(lock).await.unwrap());
        assert!(!mgr.is_locked("import-job:1").await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let pool = setup().await;
        let backend = SqlLockBackend::new(pool);

        assert!(backend
            .try_acquire("k", "tok-a", Duration::from_millis(1))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend
            .try_acquire("k", "tok-b", Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(backend.holder("k").await.unwrap(), Some("tok-b".into()));
    }
}
