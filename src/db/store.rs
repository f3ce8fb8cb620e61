//! SQLite blob store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::publish::StateStore;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

/// Thread-safe key/value blob store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Insert or replace the blob stored under `key`.
    pub fn put_blob(&self, key: &str, data: &[u8]) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO state_blobs (key, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![key, data, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Fetch the blob stored under `key`, if any.
    pub fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        let conn = self.lock()?;
        let data = conn
            .query_row(
                "SELECT data FROM state_blobs WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(data)
    }

    /// When the blob under `key` was last written.
    pub fn blob_updated_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT updated_at FROM state_blobs WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| DbError::Timestamp(format!("{}: {}", s, e)))
        })
        .transpose()
    }
}

#[async_trait]
impl StateStore for Store {
    async fn save_blob(&self, key: &str, blob: Vec<u8>) -> Result<(), DbError> {
        self.put_blob(key, &blob)
    }

    async fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        self.get_blob(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_blob_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        assert!(store.get_blob("targets").unwrap().is_none());
        assert!(store.blob_updated_at("targets").unwrap().is_none());

        store.put_blob("targets", b"[1,2]").unwrap();
        assert_eq!(store.get_blob("targets").unwrap().unwrap(), b"[1,2]");
        assert!(store.blob_updated_at("targets").unwrap().is_some());

        // Overwrite
        store.put_blob("targets", b"[3]").unwrap();
        assert_eq!(store.get_blob("targets").unwrap().unwrap(), b"[3]");
    }

    #[test]
    fn test_reopen_keeps_blobs() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            store.put_blob("probe_params", b"{}").unwrap();
        }
        let store = Store::new(tmp.path()).unwrap();
        assert_eq!(store.get_blob("probe_params").unwrap().unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_state_store_trait() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let state: &dyn StateStore = &store;

        state.save_blob("probe_records", b"[]".to_vec()).await.unwrap();
        let loaded = state.load_blob("probe_records").await.unwrap();
        assert_eq!(loaded.as_deref(), Some(&b"[]"[..]));
    }
}
