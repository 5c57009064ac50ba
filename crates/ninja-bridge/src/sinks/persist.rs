//! Durable key-value storage
//!
//! Only the scheduler's night-mode flag and the pre-sleep LED colors live
//! here, so the schema is a single `kv` table.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;

/// String key-value store surviving restarts
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Value for `key`, if stored
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Every stored pair
    async fn get_all(&self) -> Result<HashMap<String, String>>;

    /// Value for `key`, or `default` when absent
    async fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.to_string()))
    }
}

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.as_ref().display(), "Persistence store opened");
        Ok(store)
    }

    /// Open a private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        debug!(key, value, "Persisted");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        debug!(key, "Deleted persisted key");
        Ok(())
    }

    async fn get_all(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM kv")
            .fetch_all(&self.pool)
            .await?;
        let mut all: HashMap<String, String> = HashMap::with_capacity(rows.len());
        for row in rows {
            all.insert(row.try_get("key")?, row.try_get("value")?);
        }
        Ok(all)
    }
}

/// In-process store, lost on restart
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn get_all(&self) -> Result<HashMap<String, String>> {
        Ok(self.entries.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn PersistenceStore) {
        assert_eq!(store.get("LEDSLEEP").await.unwrap(), None);
        assert_eq!(store.get_or("LEDSLEEP", "awake").await.unwrap(), "awake");

        store.set("LEDSLEEP", "sleeping").await.unwrap();
        store.set("LEDCOLOR_999", "FF0000").await.unwrap();
        store.set("LEDCOLOR_999", "00FF00").await.unwrap();
        assert_eq!(store.get("LEDCOLOR_999").await.unwrap().as_deref(), Some("00FF00"));

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("LEDSLEEP").map(String::as_str), Some("sleeping"));

        store.delete("LEDCOLOR_999").await.unwrap();
        store.delete("LEDCOLOR_999").await.unwrap();
        assert_eq!(store.get("LEDCOLOR_999").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_in_memory() {
        exercise(&SqliteStore::in_memory().await.unwrap()).await;
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let store = SqliteStore::open(&path).await.unwrap();
        store.set("LEDSLEEP", "sleeping").await.unwrap();
        store.close().await;

        let reopened = SqliteStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("LEDSLEEP").await.unwrap().as_deref(),
            Some("sleeping")
        );
    }
}
