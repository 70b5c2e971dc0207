//! Integration tests for the inbound signal HTTP contract.
//!
//! Each test spins up the axum signal router on a random port and talks to
//! it with reqwest.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use wip_runtime::allocator::ThreadPool;
use wip_runtime::config::{CallbackConfig, PoolConfig, WorkerConfig};
use wip_runtime::process::{NullBackend, NullScript};
use wip_runtime::queue::{ExitStatus, NewTask, RunStatus, WipPool};
use wip_runtime::signal::{CallbackClient, SignalService, SignalType, signal_routes};
use wip_runtime::store::{Database, LibSqlBackend};
use wip_runtime::worker::WorkerDeps;
use wip_runtime::workflow::{CommandState, builtin_registry};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    base: String,
    db: Arc<dyn Database>,
    signals: Arc<SignalService>,
}

/// Start the signal router on a random port.
async fn start_server() -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let base = format!("http://127.0.0.1:{port}");

    let signals = Arc::new(SignalService::new(Arc::clone(&db), base.clone()));
    let app = signal_routes(Arc::clone(&signals));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness { base, db, signals }
}

fn container_payload(pid: &str, start: i64, exit_code: i64) -> Value {
    json!({
        "classId": "container_process",
        "pid": pid,
        "startTime": start,
        "endTime": start + 5,
        "exitCode": exit_code,
    })
}

async fn registered_url(h: &Harness) -> (i64, String) {
    let task_id = h
        .db
        .insert_task(&NewTask::new("remote", "command"))
        .await
        .unwrap();
    let signal = h
        .signals
        .register(task_id, SignalType::Complete)
        .await
        .unwrap();
    (task_id, h.signals.callback_url(&signal))
}

#[tokio::test]
async fn delivery_is_accepted_once_then_reported_duplicate() {
    timeout(TEST_TIMEOUT, async {
        let h = start_server().await;
        let (task_id, url) = registered_url(&h).await;
        let http = reqwest::Client::new();
        let body = container_payload("c-1", 1_700_000_000, 0);

        let first = http.post(&url).json(&body).send().await.unwrap();
        assert_eq!(first.status(), reqwest::StatusCode::ACCEPTED);
        let json: Value = first.json().await.unwrap();
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["signal"]["objectId"], task_id);
        assert_eq!(json["signal"]["pid"], "c-1");

        let again = http.post(&url).json(&body).send().await.unwrap();
        assert_eq!(again.status(), reqwest::StatusCode::OK);
        let json: Value = again.json().await.unwrap();
        assert_eq!(json["status"], "duplicate");

        let consumed = h.signals.consume_pending(task_id).await.unwrap();
        assert_eq!(consumed.len(), 1);
        assert_eq!(
            consumed[0].signal.process_id.as_deref(),
            Some("c-1@1700000000")
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_payloads_are_rejected() {
    timeout(TEST_TIMEOUT, async {
        let h = start_server().await;
        let (task_id, url) = registered_url(&h).await;
        let http = reqwest::Client::new();

        let missing_pid = json!({"classId": "container_process", "startTime": 1});
        let resp = http.post(&url).json(&missing_pid).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let json: Value = resp.json().await.unwrap();
        assert!(json["error"].as_str().unwrap().contains("pid"));

        let unknown_kind = json!({"classId": "carrier_pigeon"});
        let resp = http.post(&url).json(&unknown_kind).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        // Nothing was stored, so a well-formed retry is still accepted.
        assert!(h.signals.consume_pending(task_id).await.unwrap().is_empty());
        let resp = http
            .post(&url)
            .json(&container_payload("c-2", 10, 1))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_envelopes_are_not_found() {
    timeout(TEST_TIMEOUT, async {
        let h = start_server().await;
        let http = reqwest::Client::new();
        let body = container_payload("c-1", 1, 0);

        let unknown = format!("{}/signals/{}", h.base, uuid::Uuid::new_v4());
        let resp = http.post(&unknown).json(&body).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let garbage = format!("{}/signals/not-a-uuid", h.base);
        let resp = http.post(&garbage).json(&body).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let h = start_server().await;
        let resp = reqwest::get(format!("{}/health", h.base)).await.unwrap();
        assert!(resp.status().is_success());
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn delivery_wakes_a_waiting_task() {
    timeout(TEST_TIMEOUT, async {
        let h = start_server().await;
        let pool = WipPool::new(Arc::clone(&h.db));
        let task_id = pool
            .enqueue(NewTask::new("sleeper", "command"))
            .await
            .unwrap();
        let task = pool.get(task_id).await.unwrap();
        assert!(pool.claim(&task, "w1", Duration::from_secs(60)).await.unwrap());
        let wake = chrono::Utc::now() + chrono::Duration::hours(1);
        pool.release(task_id, "w1", RunStatus::Waiting, Some(wake))
            .await
            .unwrap();

        let signal = h
            .signals
            .register(task_id, SignalType::Complete)
            .await
            .unwrap();
        let resp = reqwest::Client::new()
            .post(h.signals.callback_url(&signal))
            .json(&container_payload("c-9", 1, 0))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

        let task = pool.get(task_id).await.unwrap();
        assert!(task.is_awake(chrono::Utc::now()));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn command_task_completes_through_its_callback() {
    timeout(TEST_TIMEOUT, async {
        let h = start_server().await;
        h.db.upsert_server("local", 1).await.unwrap();

        let callback = CallbackClient::new(&CallbackConfig {
            base_url: h.base.clone(),
            allow_http: true,
            ..CallbackConfig::default()
        })
        .unwrap();
        // Never stops on its own; only the callback can complete it.
        let backend = Arc::new(NullBackend::new(NullScript::default()).with_callback(callback));

        let pool = WipPool::new(Arc::clone(&h.db));
        let registry = builtin_registry(backend, Arc::clone(&h.signals), Arc::clone(&h.db));
        let allocator = ThreadPool::new(
            WorkerDeps {
                pool: pool.clone(),
                signals: Arc::clone(&h.signals),
                registry: Arc::new(registry),
                config: WorkerConfig {
                    timeout: Duration::from_secs(5),
                    worker_id: "it-worker".into(),
                },
            },
            PoolConfig::default(),
        );

        let task_id = pool
            .enqueue(CommandState::new("make test").with_poll_secs(3600).into_task("tests"))
            .await
            .unwrap();

        loop {
            allocator.run_once().await.unwrap();
            let task = pool.get(task_id).await.unwrap();
            if task.run_status == RunStatus::Complete {
                assert_eq!(task.exit_status, ExitStatus::Success);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(h.db.running_counts().await.unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}
