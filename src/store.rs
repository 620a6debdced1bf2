use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::queue::{default_database_path, open_database, QueueError};

/// Key of the app's offline document.
pub const APP_DOCUMENT_KEY: &str = "fortune-app-offline-data";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to open store: {0}")]
    Open(#[from] QueueError),
}

/// Cached app data kept for offline reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSnapshot {
    #[serde(default)]
    pub wishes: Vec<Value>,
    #[serde(default)]
    pub fortunes: Vec<Value>,
    #[serde(default)]
    pub user_profile: Option<Value>,
    /// Unix milliseconds of the last complete sync, 0 if never
    #[serde(default)]
    pub last_sync: i64,
}

/// Single-document key/value store sharing the offline database file.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    pub fn new() -> Result<Self, StoreError> {
        Self::with_path(&default_database_path()?)
    }

    pub fn with_path(db_path: &Path) -> Result<Self, StoreError> {
        let conn = open_database(db_path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current snapshot, or an empty one if nothing was saved yet. An
    /// unreadable document is moved to a backup key and treated as empty.
    pub fn load(&self) -> Result<AppSnapshot, StoreError> {
        Self::read(&self.conn())
    }

    fn read(conn: &Connection) -> Result<AppSnapshot, StoreError> {
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM documents WHERE key = ?1",
                params![APP_DOCUMENT_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(json) => match serde_json::from_str(&json) {
                Ok(snapshot) => Ok(snapshot),
                Err(e) => {
                    let backup = format!(
                        "{}.corrupted.{}",
                        APP_DOCUMENT_KEY,
                        Utc::now().timestamp_millis()
                    );
                    tracing::warn!(
                        backup_key = %backup,
                        "Offline document is unreadable, moving it aside: {}",
                        e
                    );
                    conn.execute(
                        "UPDATE documents SET key = ?1 WHERE key = ?2",
                        params![backup, APP_DOCUMENT_KEY],
                    )?;
                    Ok(AppSnapshot::default())
                }
            },
            None => Ok(AppSnapshot::default()),
        }
    }

    /// Read-modify-write under one lock.
    fn update<F>(&self, mutate: F) -> Result<AppSnapshot, StoreError>
    where
        F: FnOnce(&mut AppSnapshot),
    {
        let conn = self.conn();
        let mut snapshot = Self::read(&conn)?;
        mutate(&mut snapshot);

        conn.execute(
            "INSERT INTO documents (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![
                APP_DOCUMENT_KEY,
                serde_json::to_string(&snapshot)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(snapshot)
    }

    pub fn save_wishes(&self, wishes: Vec<Value>) -> Result<(), StoreError> {
        self.update(|s| s.wishes = wishes).map(|_| ())
    }

    pub fn save_fortunes(&self, fortunes: Vec<Value>) -> Result<(), StoreError> {
        self.update(|s| s.fortunes = fortunes).map(|_| ())
    }

    pub fn save_user_profile(&self, profile: Value) -> Result<(), StoreError> {
        self.update(|s| s.user_profile = Some(profile)).map(|_| ())
    }

    pub fn mark_synced(&self, at_millis: i64) -> Result<(), StoreError> {
        self.update(|s| s.last_sync = at_millis).map(|_| ())
    }

    pub fn last_sync(&self) -> Result<i64, StoreError> {
        Ok(self.load()?.last_sync)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM documents WHERE key = ?1",
            params![APP_DOCUMENT_KEY],
        )?;
        Ok(())
    }
}
