use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fortune_sync::{
    ConnectionConfig, ConnectionPhase, ConnectionStateMachine, HttpBackend, LocalStore, Notice,
    NotificationSink, OfflineQueue, OperationKind, RetryExecutor, SyncReconciler, WriteOutcome,
};

struct Harness {
    machine: Arc<ConnectionStateMachine>,
    store: Arc<LocalStore>,
    notices: Arc<Mutex<Vec<Notice>>>,
}

fn harness(base_url: String, db_dir: &TempDir) -> Harness {
    let db_path = db_dir.path().join("offline.db");
    let backend = Arc::new(HttpBackend::new(base_url).unwrap());
    let queue = Arc::new(OfflineQueue::with_path(&db_path).unwrap());
    let store = Arc::new(LocalStore::with_path(&db_path).unwrap());
    let sink = NotificationSink::new();
    let reconciler = Arc::new(
        SyncReconciler::new(queue, backend.clone(), sink.clone()).with_store(Arc::clone(&store)),
    );
    let config = ConnectionConfig {
        max_reconnect_attempts: 0,
        ..ConnectionConfig::default()
    };
    let machine = ConnectionStateMachine::new(config, backend, reconciler, sink);

    let notices = Arc::new(Mutex::new(Vec::new()));
    let notices_clone = Arc::clone(&notices);
    let _sub = machine
        .sink()
        .subscribe_notices(move |n| notices_clone.lock().unwrap().push(n.clone()));

    Harness {
        machine,
        store,
        notices,
    }
}

async fn mount_backend(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/profiles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/wishes"))
        .and(header_exists("Idempotency-Key"))
        .respond_with(ResponseTemplate::new(201))
        .expect(2)
        .mount(server)
        .await;
}

async fn posted_bodies(server: &MockServer, resource: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == resource)
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_writes_queued_offline_are_replayed_on_reconnect() {
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let db_dir = TempDir::new().unwrap();
    let h = harness(server.uri(), &db_dir);
    let executor = RetryExecutor::new(Arc::clone(&h.machine));

    h.machine.handle_host_offline();
    assert_eq!(h.machine.phase(), ConnectionPhase::Offline);

    for text in ["first", "second"] {
        let outcome = executor
            .execute_or_enqueue(
                OperationKind::CreateWish,
                json!({ "text": text }),
                || async { Ok::<(), fortune_sync::BackendError>(()) },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Queued(_)));
    }
    assert_eq!(h.machine.queue().len().unwrap(), 2);

    let probe = h.machine.handle_host_online().await.unwrap();
    assert!(probe.success);

    assert_eq!(h.machine.phase(), ConnectionPhase::OnlineHealthy);
    assert!(h.machine.queue().is_empty().unwrap());
    assert!(h.store.last_sync().unwrap() > 0);
    assert_eq!(
        posted_bodies(&server, "/wishes").await,
        vec![json!({"text": "first"}), json!({"text": "second"})]
    );

    let notices = h.notices.lock().unwrap().clone();
    assert_eq!(
        notices,
        vec![
            Notice::Reconnected,
            Notice::SyncCompleted {
                synced: 2,
                remaining: 0
            }
        ]
    );

    server.verify().await;
}

#[tokio::test]
async fn test_queue_survives_restart_and_drains_on_forced_reconnect() {
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let db_dir = TempDir::new().unwrap();

    {
        let queue = OfflineQueue::with_path(&db_dir.path().join("offline.db")).unwrap();
        queue
            .enqueue(OperationKind::CreateWish, json!({"text": "before restart 1"}))
            .unwrap();
        queue
            .enqueue(OperationKind::CreateWish, json!({"text": "before restart 2"}))
            .unwrap();
    }

    let h = harness(server.uri(), &db_dir);
    assert_eq!(h.machine.queue().len().unwrap(), 2);

    let outcome = h.machine.force_reconnect().await.unwrap();
    assert!(outcome.probe.success);
    let sync = outcome.sync.unwrap();
    assert_eq!(sync.synced_count, 2);
    assert!(sync.is_complete());
    assert_eq!(h.machine.state().consecutive_failures, 0);

    server.verify().await;
}

#[tokio::test]
async fn test_unreachable_backend_enters_offline_mode_and_queues() {
    let db_dir = TempDir::new().unwrap();
    let h = harness("http://127.0.0.1:9".to_string(), &db_dir);
    let executor = RetryExecutor::new(Arc::clone(&h.machine));

    for _ in 0..3 {
        let result = h.machine.test_connection().await.unwrap();
        assert!(!result.success);
    }
    assert_eq!(h.machine.phase(), ConnectionPhase::OfflineMode);
    assert_eq!(
        h.notices.lock().unwrap().clone(),
        vec![Notice::OfflineModeEntered {
            consecutive_failures: 3
        }]
    );

    let outcome = executor
        .execute_or_enqueue(
            OperationKind::SaveFortune,
            json!({"card": "The Moon"}),
            || async { Ok::<u32, fortune_sync::BackendError>(1) },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, WriteOutcome::Queued(_)));
    assert_eq!(h.machine.queue().len().unwrap(), 1);
}
