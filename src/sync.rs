use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

use crate::api::BackendClient;
use crate::notify::{Notice, NotificationSink};
use crate::queue::{OfflineQueue, QueueError};
use crate::store::{LocalStore, StoreError};

/// Error type for reconciliation runs
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Reconciliation already in progress")]
    InProgress,
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Represents the result of a reconciliation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    /// Number of queued writes replayed and removed
    pub synced_count: usize,
    /// Number of replays that failed
    pub failed_count: usize,
    /// Queue length when the run started
    pub total_count: usize,
    /// Items still queued after the run
    pub remaining: usize,
    /// Failed items that were passed over
    pub skipped: Vec<String>,
    /// Item that halted the run, if any
    pub stopped_at: Option<String>,
    /// Last replay error
    pub error: Option<String>,
    pub duration: Duration,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    /// Average replay latency per item in milliseconds
    pub avg_latency_ms: Option<f64>,
}

impl SyncResult {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Performance metrics for reconciliation runs
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    /// Total number of runs performed
    pub total_operations: u64,
    /// Runs that left the queue empty
    pub successful_operations: u64,
    /// Runs that left items behind
    pub failed_operations: u64,
    /// Writes replayed across all runs
    pub items_synced: u64,
    pub average_latency_ms: f64,
    pub success_rate_percent: f64,
    pub total_latency_ms: u64,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Replays the offline queue against the backend once reachability returns.
pub struct SyncReconciler {
    queue: Arc<OfflineQueue>,
    backend: Arc<dyn BackendClient>,
    store: Option<Arc<LocalStore>>,
    sink: NotificationSink,
    running: AtomicBool,
    total_sync_operations: AtomicU64,
    successful_sync_operations: AtomicU64,
    failed_sync_operations: AtomicU64,
    items_synced: AtomicU64,
    total_sync_latency_ms: AtomicU64,
}

impl SyncReconciler {
    pub fn new(
        queue: Arc<OfflineQueue>,
        backend: Arc<dyn BackendClient>,
        sink: NotificationSink,
    ) -> Self {
        Self {
            queue,
            backend,
            store: None,
            sink,
            running: AtomicBool::new(false),
            total_sync_operations: AtomicU64::new(0),
            successful_sync_operations: AtomicU64::new(0),
            failed_sync_operations: AtomicU64::new(0),
            items_synced: AtomicU64::new(0),
            total_sync_latency_ms: AtomicU64::new(0),
        }
    }

    /// Stamp `lastSync` in this store after every complete run.
    pub fn with_store(mut self, store: Arc<LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drain the queue in FIFO order. A second call while one is running
    /// returns `SyncError::InProgress` without touching the queue.
    pub async fn reconcile(&self) -> Result<SyncResult, SyncError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::InProgress);
        }
        let _guard = RunGuard(&self.running);

        let total_count = self.queue.len()?;
        let start = self.log_sync_start(total_count);
        let start_time = SystemTime::now();

        let backend = Arc::clone(&self.backend);
        let report = self
            .queue
            .drain(move |operation| {
                let backend = Arc::clone(&backend);
                async move { backend.replay(&operation).await }
            })
            .await?;

        let duration = start.elapsed();
        let attempted = report.replayed + report.failed;
        let result = SyncResult {
            synced_count: report.replayed,
            failed_count: report.failed,
            total_count,
            remaining: report.remaining,
            skipped: report.skipped,
            stopped_at: report.stopped_at,
            error: report.last_error.map(|e| e.to_string()),
            duration,
            start_time: Some(start_time),
            end_time: Some(SystemTime::now()),
            avg_latency_ms: (attempted > 0)
                .then(|| duration.as_millis() as f64 / attempted as f64),
        };

        if result.is_complete() {
            if let Some(store) = &self.store {
                store.mark_synced(Utc::now().timestamp_millis())?;
            }
        }

        self.record_sync_metrics(&result);
        self.log_sync_completion(&result);

        if result.synced_count > 0 || result.is_complete() {
            self.sink.notify(Notice::SyncCompleted {
                synced: result.synced_count,
                remaining: result.remaining,
            });
        }
        if result.failed_count > 0 {
            self.sink.notify(Notice::Error {
                message: format!(
                    "{} queued change(s) could not be synced: {}",
                    result.remaining,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            });
        }

        Ok(result)
    }

    fn record_sync_metrics(&self, result: &SyncResult) {
        self.total_sync_operations.fetch_add(1, Ordering::Relaxed);

        if result.is_complete() {
            self.successful_sync_operations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_sync_operations.fetch_add(1, Ordering::Relaxed);
        }

        self.items_synced
            .fetch_add(result.synced_count as u64, Ordering::Relaxed);
        self.total_sync_latency_ms
            .fetch_add(result.duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        let total_ops = self.total_sync_operations.load(Ordering::Relaxed);
        let successful_ops = self.successful_sync_operations.load(Ordering::Relaxed);
        let total_latency = self.total_sync_latency_ms.load(Ordering::Relaxed);

        let (average_latency_ms, success_rate_percent) = if total_ops > 0 {
            (
                total_latency as f64 / total_ops as f64,
                (successful_ops as f64 / total_ops as f64) * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        PerformanceMetrics {
            total_operations: total_ops,
            successful_operations: successful_ops,
            failed_operations: self.failed_sync_operations.load(Ordering::Relaxed),
            items_synced: self.items_synced.load(Ordering::Relaxed),
            average_latency_ms,
            success_rate_percent,
            total_latency_ms: total_latency,
        }
    }

    fn log_sync_start(&self, queue_size: usize) -> Instant {
        tracing::info!(
            queue_size = queue_size,
            start_time = ?SystemTime::now(),
            "Reconciliation started"
        );
        Instant::now()
    }

    fn log_sync_completion(&self, result: &SyncResult) {
        tracing::info!(
            sync_id = %uuid::Uuid::new_v4(),
            synced_count = result.synced_count,
            failed_count = result.failed_count,
            skipped_count = result.skipped.len(),
            remaining = result.remaining,
            duration_ms = result.duration.as_millis() as u64,
            avg_latency_ms = result.avg_latency_ms.unwrap_or(0.0),
            success = result.is_complete(),
            "Reconciliation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OperationKind;
    use crate::testing::ScriptedBackend;
    use serde_json::json;
    use std::sync::Mutex;

    fn reconciler(backend: Arc<ScriptedBackend>) -> (SyncReconciler, Arc<LocalStore>) {
        let queue = Arc::new(OfflineQueue::in_memory().unwrap());
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let reconciler = SyncReconciler::new(queue, backend, NotificationSink::new())
            .with_store(Arc::clone(&store));
        (reconciler, store)
    }

    #[tokio::test]
    async fn test_reconcile_replays_in_order_and_stamps_last_sync() {
        let backend = Arc::new(ScriptedBackend::healthy());
        let (reconciler, store) = reconciler(backend.clone());

        let ids: Vec<String> = (0..3)
            .map(|i| {
                reconciler
                    .queue()
                    .enqueue(OperationKind::CreateWish, json!({ "n": i }))
                    .unwrap()
            })
            .collect();

        let result = reconciler.reconcile().await.unwrap();
        assert_eq!(result.synced_count, 3);
        assert_eq!(result.total_count, 3);
        assert!(result.is_complete());
        assert_eq!(backend.replayed(), ids);
        assert!(store.last_sync().unwrap() > 0);

        let metrics = reconciler.metrics();
        assert_eq!(metrics.total_operations, 1);
        assert_eq!(metrics.successful_operations, 1);
        assert_eq!(metrics.items_synced, 3);
        assert_eq!(metrics.success_rate_percent, 100.0);
    }

    #[tokio::test]
    async fn test_partial_run_keeps_last_sync_and_reports_error() {
        let backend = Arc::new(ScriptedBackend::healthy());
        let queue = Arc::new(OfflineQueue::in_memory().unwrap());
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let sink = NotificationSink::new();
        let reconciler = SyncReconciler::new(Arc::clone(&queue), backend.clone(), sink.clone())
            .with_store(Arc::clone(&store));

        let notices = Arc::new(Mutex::new(Vec::new()));
        let notices_clone = Arc::clone(&notices);
        let _sub = sink.subscribe_notices(move |n| notices_clone.lock().unwrap().push(n.clone()));

        let first = queue.enqueue(OperationKind::SaveFortune, json!({})).unwrap();
        let blocked = queue.enqueue(OperationKind::SaveFortune, json!({})).unwrap();
        queue.enqueue(OperationKind::SaveFortune, json!({})).unwrap();
        backend.fail_replay_of(&blocked);

        let result = reconciler.reconcile().await.unwrap();
        assert_eq!(result.synced_count, 1);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.remaining, 2);
        assert_eq!(result.stopped_at.as_deref(), Some(blocked.as_str()));
        assert_eq!(backend.replayed(), vec![first]);
        assert_eq!(store.last_sync().unwrap(), 0);

        let notices = notices.lock().unwrap();
        assert_eq!(notices[0], Notice::SyncCompleted { synced: 1, remaining: 2 });
        assert!(matches!(notices[1], Notice::Error { .. }));
        assert_eq!(reconciler.metrics().failed_operations, 1);
    }

    #[tokio::test]
    async fn test_concurrent_reconcile_is_rejected() {
        let backend = Arc::new(ScriptedBackend::healthy());
        let (reconciler, _store) = reconciler(backend);

        reconciler.running.store(true, Ordering::SeqCst);
        assert!(matches!(reconciler.reconcile().await, Err(SyncError::InProgress)));

        reconciler.running.store(false, Ordering::SeqCst);
        assert!(reconciler.reconcile().await.is_ok());
        assert!(!reconciler.is_running());
    }

    #[tokio::test]
    async fn test_empty_queue_run_is_complete() {
        let backend = Arc::new(ScriptedBackend::healthy());
        let (reconciler, _store) = reconciler(backend);

        let result = reconciler.reconcile().await.unwrap();
        assert_eq!(result.synced_count, 0);
        assert!(result.is_complete());
        assert!(result.avg_latency_ms.is_none());
    }
}
