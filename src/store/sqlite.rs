// SQLite-backed config store

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::ConfigStore;
use crate::error::RelayError;

/// Key-value store persisted in a single `relay_kv` table
#[derive(Clone)]
pub struct SqliteConfigStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConfigStore {
    /// Open (or create) the state database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS relay_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create relay_kv table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, RelayError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            op(&conn)
        })
        .await
        .map_err(|e| RelayError::ConfigUnavailable(format!("store task failed: {}", e)))?
        .map_err(|e| RelayError::ConfigUnavailable(e.to_string()))
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RelayError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM relay_kv WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), RelayError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO relay_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CACHED_TOKEN, RELAY_ENDPOINT};

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = SqliteConfigStore::open_in_memory().unwrap();
        assert_eq!(store.get(CACHED_TOKEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = SqliteConfigStore::open_in_memory().unwrap();
        store.set(CACHED_TOKEN, "SID1").await.unwrap();
        store.set(CACHED_TOKEN, "SID2").await.unwrap();
        assert_eq!(store.get(CACHED_TOKEN).await.unwrap().as_deref(), Some("SID2"));
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.sqlite3");

        {
            let store = SqliteConfigStore::open(&path).unwrap();
            store
                .set(RELAY_ENDPOINT, "https://collector.test/api/v1/tokens")
                .await
                .unwrap();
        }

        let store = SqliteConfigStore::open(&path).unwrap();
        assert_eq!(
            store.get(RELAY_ENDPOINT).await.unwrap().as_deref(),
            Some("https://collector.test/api/v1/tokens")
        );
    }
}
