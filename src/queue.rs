use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::api::BackendError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown operation kind: {0}")]
    UnknownKind(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("Database corruption detected: {0}")]
    DatabaseCorruption(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown operation kind `{0}`")]
pub struct UnknownKind(pub String);

/// What a drain does when replaying an item of a given kind fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Halt the drain; this and every later item stay queued in order.
    StopOnFailure,
    /// Keep the item queued and move on to the next one.
    SkipAndContinue,
}

/// The kinds of writes that can be deferred while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateWish,
    SaveFortune,
    UpdateProfile,
    ShareFortune,
    ReactToFortune,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::CreateWish,
        OperationKind::SaveFortune,
        OperationKind::UpdateProfile,
        OperationKind::ShareFortune,
        OperationKind::ReactToFortune,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::CreateWish => "create_wish",
            OperationKind::SaveFortune => "save_fortune",
            OperationKind::UpdateProfile => "update_profile",
            OperationKind::ShareFortune => "share_fortune",
            OperationKind::ReactToFortune => "react_to_fortune",
        }
    }

    /// Backend resource the write is replayed against.
    pub fn resource(self) -> &'static str {
        match self {
            OperationKind::CreateWish => "wishes",
            OperationKind::SaveFortune => "fortunes",
            OperationKind::UpdateProfile => "profiles",
            OperationKind::ShareFortune => "shares",
            OperationKind::ReactToFortune => "reactions",
        }
    }

    /// Wishes, fortunes and profile edits build on each other, so they keep
    /// strict order. Social actions are independent of one another.
    pub fn drain_policy(self) -> DrainPolicy {
        match self {
            OperationKind::CreateWish
            | OperationKind::SaveFortune
            | OperationKind::UpdateProfile => DrainPolicy::StopOnFailure,
            OperationKind::ShareFortune | OperationKind::ReactToFortune => {
                DrainPolicy::SkipAndContinue
            }
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "create_wish" | "wish" => Ok(OperationKind::CreateWish),
            "save_fortune" | "fortune" => Ok(OperationKind::SaveFortune),
            "update_profile" | "profile" => Ok(OperationKind::UpdateProfile),
            "share_fortune" | "share" => Ok(OperationKind::ShareFortune),
            "react_to_fortune" | "reaction" | "like" => Ok(OperationKind::ReactToFortune),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// A write deferred until the backend is reachable again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Failed replay attempts so far
    pub attempts: u32,
}

/// Entry of the legacy sync-queue JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    /// Epoch milliseconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total_count: usize,
    pub by_kind: BTreeMap<OperationKind, usize>,
    /// Highest attempt count of any queued item
    pub max_attempts: u32,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Outcome of a single drain pass.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub replayed: usize,
    pub failed: usize,
    /// Items that failed but were passed over (skip-and-continue kinds)
    pub skipped: Vec<String>,
    /// Item that halted the drain (stop-on-failure kinds)
    pub stopped_at: Option<String>,
    pub remaining: usize,
    pub last_error: Option<BackendError>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Durable FIFO of deferred writes, backed by SQLite.
pub struct OfflineQueue {
    conn: Mutex<Connection>,
}

impl OfflineQueue {
    pub fn new() -> Result<Self, QueueError> {
        Self::with_path(&default_database_path()?)
    }

    pub fn with_path(db_path: &Path) -> Result<Self, QueueError> {
        let conn = open_database(db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), QueueError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_attempt TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        if current_version < 1 {
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_sync_queue_kind ON sync_queue(kind)",
                [],
            )?;
            conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;
        }

        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a write to the queue. Local only: never waits on the network.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<String, QueueError> {
        let operation = QueuedOperation {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            created_at: Utc::now(),
            attempts: 0,
        };
        let id = operation.id.clone();
        self.insert(&self.conn(), &operation)?;
        let queue_size = self.len()?;

        tracing::info!(
            operation = "enqueue",
            operation_id = %id,
            kind = %kind,
            queue_size = queue_size,
            "Operation added to offline queue"
        );

        Ok(id)
    }

    fn insert(&self, conn: &Connection, operation: &QueuedOperation) -> Result<(), QueueError> {
        let data = serde_json::to_string(&operation.payload)?;
        conn.execute(
            "INSERT INTO sync_queue (id, kind, data, created_at, attempts) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                operation.id,
                operation.kind.as_str(),
                data,
                operation.created_at.to_rfc3339(),
                operation.attempts
            ],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        let count: usize =
            self.conn()
                .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// All queued operations in FIFO order.
    pub fn peek_all(&self) -> Result<Vec<QueuedOperation>, QueueError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, id, kind, data, created_at, attempts FROM sync_queue ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], row_to_operation)?;

        let mut operations = Vec::new();
        for row in rows {
            operations.push(row?.1);
        }
        Ok(operations)
    }

    fn next_after(&self, cursor: i64) -> Result<Option<(i64, QueuedOperation)>, QueueError> {
        let next = self
            .conn()
            .query_row(
                "SELECT seq, id, kind, data, created_at, attempts FROM sync_queue
                 WHERE seq > ?1 ORDER BY seq ASC LIMIT 1",
                params![cursor],
                row_to_operation,
            )
            .optional()?;
        Ok(next)
    }

    pub fn remove(&self, id: &str) -> Result<bool, QueueError> {
        let rows = self
            .conn()
            .execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;

        tracing::debug!(
            operation = "remove",
            operation_id = %id,
            removed = rows > 0,
            "Operation removed from offline queue"
        );

        Ok(rows > 0)
    }

    fn record_failure(&self, id: &str, error: &str) -> Result<(), QueueError> {
        self.conn().execute(
            "UPDATE sync_queue SET attempts = attempts + 1, last_error = ?1, last_attempt = ?2 WHERE id = ?3",
            params![error, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn clear(&self) -> Result<usize, QueueError> {
        let rows = self.conn().execute("DELETE FROM sync_queue", [])?;
        if rows > 0 {
            tracing::info!(
                operation = "clear",
                entries_removed = rows,
                "Offline queue cleared"
            );
        }
        Ok(rows)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let operations = self.peek_all()?;
        let mut stats = QueueStats {
            total_count: operations.len(),
            ..QueueStats::default()
        };

        for operation in &operations {
            *stats.by_kind.entry(operation.kind).or_insert(0) += 1;
            stats.max_attempts = stats.max_attempts.max(operation.attempts);
        }
        stats.oldest_entry = operations.iter().map(|op| op.created_at).min();
        stats.newest_entry = operations.iter().map(|op| op.created_at).max();

        Ok(stats)
    }

    /// The queue in the legacy `[{type, data, timestamp}]` document layout.
    pub fn export_records(&self) -> Result<Vec<SyncQueueRecord>, QueueError> {
        Ok(self
            .peek_all()?
            .into_iter()
            .map(|op| SyncQueueRecord {
                kind: op.kind.as_str().to_string(),
                data: op.payload,
                timestamp: op.created_at.timestamp_millis(),
            })
            .collect())
    }

    /// Append legacy records in document order. All-or-nothing.
    pub fn import_records(&self, records: &[SyncQueueRecord]) -> Result<usize, QueueError> {
        let mut operations = Vec::with_capacity(records.len());
        for record in records {
            let kind = OperationKind::from_str(&record.kind)
                .map_err(|e| QueueError::UnknownKind(e.0))?;
            let created_at = DateTime::<Utc>::from_timestamp_millis(record.timestamp)
                .ok_or_else(|| QueueError::InvalidTimestamp(record.timestamp.to_string()))?;
            operations.push(QueuedOperation {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                payload: record.data.clone(),
                created_at,
                attempts: 0,
            });
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for operation in &operations {
            self.insert(&tx, operation)?;
        }
        tx.commit()?;

        tracing::info!(
            operation = "import_records",
            imported = operations.len(),
            "Legacy sync queue imported"
        );

        Ok(operations.len())
    }

    /// Replay queued operations in FIFO order.
    ///
    /// Successful items are removed. A failed item stays queued with its
    /// attempt count bumped, and its kind's `DrainPolicy` decides whether the
    /// drain stops there or moves on. The connection lock is never held while
    /// `replay` runs.
    pub async fn drain<F, Fut>(&self, mut replay: F) -> Result<DrainReport, QueueError>
    where
        F: FnMut(QueuedOperation) -> Fut,
        Fut: Future<Output = Result<(), BackendError>>,
    {
        let mut report = DrainReport::default();
        let mut cursor = 0i64;

        while let Some((seq, operation)) = self.next_after(cursor)? {
            cursor = seq;
            let id = operation.id.clone();
            let kind = operation.kind;

            match replay(operation).await {
                Ok(()) => {
                    self.remove(&id)?;
                    report.replayed += 1;
                }
                Err(err) => {
                    self.record_failure(&id, &err.to_string())?;
                    report.failed += 1;
                    report.last_error = Some(err.clone());

                    match kind.drain_policy() {
                        DrainPolicy::StopOnFailure => {
                            tracing::warn!(
                                operation_id = %id,
                                kind = %kind,
                                error = %err,
                                "Replay failed, stopping drain to preserve ordering"
                            );
                            report.stopped_at = Some(id);
                            break;
                        }
                        DrainPolicy::SkipAndContinue => {
                            tracing::warn!(
                                operation_id = %id,
                                kind = %kind,
                                error = %err,
                                "Replay failed, leaving item queued and continuing"
                            );
                            report.skipped.push(id);
                        }
                    }
                }
            }
        }

        report.remaining = self.len()?;
        Ok(report)
    }
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, QueuedOperation)> {
    let seq: i64 = row.get(0)?;
    let id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let data: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let attempts: u32 = row.get(5)?;

    let kind = OperationKind::from_str(&kind).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let payload = serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok((
        seq,
        QueuedOperation {
            id,
            kind,
            payload,
            created_at,
            attempts,
        },
    ))
}

/// `~/.fortune-sync/offline.db`
pub fn default_database_path() -> Result<PathBuf, QueueError> {
    let mut dir = dirs::home_dir().ok_or_else(|| {
        QueueError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine home directory",
        ))
    })?;
    dir.push(".fortune-sync");
    std::fs::create_dir_all(&dir)?;
    dir.push("offline.db");
    Ok(dir)
}

/// Open the offline database, recovering from a corrupted file by moving it
/// aside and starting fresh.
pub(crate) fn open_database(db_path: &Path) -> Result<Connection, QueueError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = match Connection::open(db_path) {
        Ok(conn) => match verify_database_integrity(&conn) {
            Ok(()) => conn,
            Err(e) => {
                tracing::warn!("Offline database failed integrity check: {}", e);
                drop(conn);
                attempt_database_recovery(db_path)?
            }
        },
        Err(e) => {
            tracing::warn!("Failed to open offline database: {}", e);
            attempt_database_recovery(db_path)?
        }
    };

    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn verify_database_integrity(conn: &Connection) -> Result<(), QueueError> {
    let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;

    if result.eq_ignore_ascii_case("ok") {
        Ok(())
    } else {
        Err(QueueError::DatabaseCorruption(format!(
            "Database integrity check failed: {}",
            result
        )))
    }
}

fn attempt_database_recovery(db_path: &Path) -> Result<Connection, QueueError> {
    if db_path.exists() {
        let backup_path = db_path.with_extension("db.backup");
        std::fs::copy(db_path, &backup_path).map_err(|e| {
            QueueError::DatabaseCorruption(format!("Failed to create backup: {}", e))
        })?;
        std::fs::remove_file(db_path).map_err(|e| {
            QueueError::DatabaseCorruption(format!("Failed to remove corrupted database: {}", e))
        })?;
        tracing::warn!(
            backup = %backup_path.display(),
            "Corrupted offline database moved aside"
        );
    }

    Ok(Connection::open(db_path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use tempfile::TempDir;

    fn wish(n: usize) -> serde_json::Value {
        json!({ "text": format!("wish {}", n) })
    }

    fn fill(queue: &OfflineQueue, kind: OperationKind, n: usize) -> Vec<String> {
        (0..n).map(|i| queue.enqueue(kind, wish(i)).unwrap()).collect()
    }

    #[test]
    fn test_enqueue_assigns_unique_ids() {
        let queue = OfflineQueue::in_memory().unwrap();
        let ids = fill(&queue, OperationKind::CreateWish, 3);

        assert_eq!(queue.len().unwrap(), 3);
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);

        let queued = queue.peek_all().unwrap();
        assert_eq!(queued.iter().map(|op| op.id.clone()).collect::<Vec<_>>(), ids);
        assert!(queued.iter().all(|op| op.attempts == 0));
    }

    #[tokio::test]
    async fn test_drain_all_succeed_in_fifo_order() {
        let queue = OfflineQueue::in_memory().unwrap();
        let ids = fill(&queue, OperationKind::SaveFortune, 5);
        let seen = RefCell::new(Vec::new());

        let report = queue
            .drain(|op| {
                seen.borrow_mut().push(op.id.clone());
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(report.replayed, 5);
        assert_eq!(report.failed, 0);
        assert!(report.is_complete());
        assert!(queue.is_empty().unwrap());
        assert_eq!(seen.into_inner(), ids);
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let queue = OfflineQueue::in_memory().unwrap();
        let ids = fill(&queue, OperationKind::CreateWish, 6);
        let failing = ids[2].clone();
        let calls = RefCell::new(0usize);

        let report = queue
            .drain(|op| {
                *calls.borrow_mut() += 1;
                let fail = op.id == failing;
                async move {
                    if fail {
                        Err(BackendError::Network("connection reset".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(*calls.borrow(), 3);
        assert_eq!(report.replayed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.stopped_at.as_deref(), Some(failing.as_str()));
        assert_eq!(report.remaining, 4);

        let left: Vec<String> = queue.peek_all().unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(left, ids[2..].to_vec());
        assert_eq!(queue.peek_all().unwrap()[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_drain_skips_independent_kinds() {
        let queue = OfflineQueue::in_memory().unwrap();
        let share = queue.enqueue(OperationKind::ShareFortune, json!({"fortune_id": 1})).unwrap();
        let reaction = queue
            .enqueue(OperationKind::ReactToFortune, json!({"fortune_id": 1, "emoji": "star"}))
            .unwrap();
        let fortune = queue.enqueue(OperationKind::SaveFortune, json!({"text": "luck"})).unwrap();

        let failing = share.clone();
        let report = queue
            .drain(|op| {
                let fail = op.id == failing;
                async move {
                    if fail {
                        Err(BackendError::Service {
                            status: Some(409),
                            message: "duplicate share".to_string(),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(report.replayed, 2);
        assert_eq!(report.skipped, vec![share.clone()]);
        assert!(report.stopped_at.is_none());
        assert_eq!(report.remaining, 1);

        let left = queue.peek_all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, share);
        assert!(!left.iter().any(|op| op.id == reaction || op.id == fortune));
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline.db");

        let ids = {
            let queue = OfflineQueue::with_path(&path).unwrap();
            fill(&queue, OperationKind::UpdateProfile, 2)
        };

        let reopened = OfflineQueue::with_path(&path).unwrap();
        let left: Vec<String> = reopened.peek_all().unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(left, ids);
    }

    #[test]
    fn test_corrupted_database_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline.db");
        std::fs::write(&path, b"definitely not a sqlite database, just some bytes").unwrap();

        let queue = OfflineQueue::with_path(&path).unwrap();
        assert!(queue.is_empty().unwrap());
        assert!(path.with_extension("db.backup").exists());
    }

    #[test]
    fn test_export_and_import_legacy_records() {
        let queue = OfflineQueue::in_memory().unwrap();
        queue.enqueue(OperationKind::CreateWish, json!({"text": "a"})).unwrap();
        queue.enqueue(OperationKind::ShareFortune, json!({"fortune_id": 7})).unwrap();

        let records = queue.export_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, "create_wish");
        assert_eq!(records[1].data, json!({"fortune_id": 7}));

        let other = OfflineQueue::in_memory().unwrap();
        assert_eq!(other.import_records(&records).unwrap(), 2);
        let imported = other.peek_all().unwrap();
        assert_eq!(imported[0].kind, OperationKind::CreateWish);
        assert_eq!(imported[1].kind, OperationKind::ShareFortune);
        assert_eq!(imported[0].created_at.timestamp_millis(), records[0].timestamp);
    }

    #[test]
    fn test_import_accepts_legacy_aliases_and_rejects_unknown() {
        let queue = OfflineQueue::in_memory().unwrap();
        let document = r#"[
            {"type": "wish", "data": {"text": "x"}, "timestamp": 1700000000000},
            {"type": "like", "data": {"fortune_id": 2}, "timestamp": 1700000000500}
        ]"#;
        let records: Vec<SyncQueueRecord> = serde_json::from_str(document).unwrap();
        assert_eq!(queue.import_records(&records).unwrap(), 2);

        let bad = vec![SyncQueueRecord {
            kind: "horoscope".to_string(),
            data: json!({}),
            timestamp: 0,
        }];
        assert!(matches!(
            queue.import_records(&bad),
            Err(QueueError::UnknownKind(kind)) if kind == "horoscope"
        ));
        assert_eq!(queue.len().unwrap(), 2);
    }

    #[test]
    fn test_stats() {
        let queue = OfflineQueue::in_memory().unwrap();
        assert_eq!(queue.stats().unwrap().total_count, 0);

        fill(&queue, OperationKind::CreateWish, 2);
        fill(&queue, OperationKind::ReactToFortune, 1);

        let stats = queue.stats().unwrap();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.by_kind.get(&OperationKind::CreateWish), Some(&2));
        assert_eq!(stats.by_kind.get(&OperationKind::ReactToFortune), Some(&1));
        assert!(stats.oldest_entry <= stats.newest_entry);
    }

    #[test]
    fn test_remove_and_clear() {
        let queue = OfflineQueue::in_memory().unwrap();
        let ids = fill(&queue, OperationKind::SaveFortune, 3);

        assert!(queue.remove(&ids[1]).unwrap());
        assert!(!queue.remove(&ids[1]).unwrap());
        assert_eq!(queue.len().unwrap(), 2);
        assert_eq!(queue.clear().unwrap(), 2);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_operation_kind_round_trip_names() {
        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::from_str(kind.as_str()), Ok(kind));
        }
        assert_eq!(
            OperationKind::from_str("tarot"),
            Err(UnknownKind("tarot".to_string()))
        );
    }

    #[test]
    fn test_drain_policy_per_kind() {
        assert_eq!(OperationKind::CreateWish.drain_policy(), DrainPolicy::StopOnFailure);
        assert_eq!(OperationKind::UpdateProfile.drain_policy(), DrainPolicy::StopOnFailure);
        assert_eq!(OperationKind::ShareFortune.drain_policy(), DrainPolicy::SkipAndContinue);
        assert_eq!(OperationKind::ReactToFortune.drain_policy(), DrainPolicy::SkipAndContinue);
    }
}
