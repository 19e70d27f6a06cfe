//! Integration tests for the worker runtime.
//!
//! Each test starts a real [`Worker`] against the in-memory engine, pushes
//! actions through the action stream and inspects the lifecycle events the
//! engine received.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::timeout;

use relay_worker::config::RunnerConfig;
use relay_worker::engine::{DurableEvent, MemoryEngine, ProtocolVersion};
use relay_worker::error::{EngineError, ListenerError};
use relay_worker::listener::HealthStatus;
use relay_worker::{
    Action, ActionEventType, ActionType, Context, Error, FnTask, TaskError, Worker, WorkerConfig,
    WorkerHandle,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig {
        name: "it-worker".to_string(),
        slots: 4,
        durable_slots: 4,
        graceful_shutdown_timeout: Duration::from_secs(1),
        ..WorkerConfig::default()
    };
    config.listener.heartbeat_interval = Duration::from_millis(20);
    config.listener.retry_interval = Duration::from_millis(10);
    config.runner = RunnerConfig {
        cancellation_warning_threshold: Duration::from_millis(20),
        cancellation_grace_period: Duration::from_millis(50),
        force_terminate_blocking: false,
    };
    config.durable.reconnect_backoff = Duration::from_millis(10);
    config.health.enabled = false;
    config
}

fn action(run_id: &str, action_id: &str, action_type: ActionType, payload: Value) -> Action {
    Action {
        tenant_id: "tenant".to_string(),
        worker_id: "worker".to_string(),
        workflow_run_id: format!("wf-{run_id}"),
        job_id: "job".to_string(),
        job_run_id: format!("job-{run_id}"),
        step_id: "step".to_string(),
        step_run_id: run_id.to_string(),
        action_id: action_id.to_string(),
        retry_count: 0,
        action_type,
        action_payload: payload,
        additional_metadata: Value::Null,
        priority: 1,
    }
}

fn start(run_id: &str, action_id: &str) -> Action {
    action(run_id, action_id, ActionType::StartRun, json!({}))
}

fn cancel(run_id: &str) -> Action {
    action(run_id, "", ActionType::CancelRun, json!({}))
}

async fn wait_for_events(engine: &MemoryEngine, run_id: &str, expected: &[ActionEventType]) {
    let ok = engine
        .wait_until(TEST_TIMEOUT, |e| e.event_types_for(run_id) == expected)
        .await;
    assert!(
        ok,
        "run {run_id}: expected {expected:?}, got {:?}",
        engine.event_types_for(run_id)
    );
}

async fn start_worker(engine: &MemoryEngine, tasks: Vec<FnTask>, config: WorkerConfig) -> WorkerHandle {
    let mut worker = Worker::new(config, Arc::new(engine.clone()));
    for task in tasks {
        worker.register(task).unwrap();
    }
    worker.start().await.unwrap()
}

fn echo_task() -> FnTask {
    FnTask::cooperative("echo", |_ctx: Arc<Context>| async { Ok(json!({"x": 1})) })
}

#[tokio::test]
async fn test_cooperative_run_completes() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        let flaky = FnTask::cooperative("flaky", |_ctx: Arc<Context>| async {
            Err(TaskError::new("again"))
        })
        .with_retries(3);
        let handle = start_worker(&engine, vec![echo_task(), flaky], test_config()).await;

        engine.push_action(start("r1", "echo"));
        wait_for_events(
            &engine,
            "r1",
            &[ActionEventType::Started, ActionEventType::Completed],
        )
        .await;

        let completed = engine
            .events()
            .into_iter()
            .find(|e| e.event_type == ActionEventType::Completed)
            .unwrap();
        assert_eq!(completed.payload, json!({"x": 1}));
        assert!(!completed.should_not_retry);

        let registration = &engine.registrations()[0];
        assert_eq!(registration.actions, vec!["echo", "flaky"]);
        assert_eq!(registration.retries["flaky"], 3);
        assert_eq!(registration.retries["echo"], 0);
        assert_eq!(registration.slots, 4);

        handle.shutdown().await.unwrap();
        assert_eq!(engine.unsubscribes().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_blocking_run_ignoring_cancellation_reports_failure() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        let stubborn = FnTask::blocking("stubborn", move |_ctx: Arc<Context>| {
            // Ignores cancellation for up to ten seconds.
            let rx = release_rx.lock().unwrap();
            let _ = rx.recv_timeout(Duration::from_secs(10));
            Ok(json!({"finished": true}))
        });
        let handle = start_worker(&engine, vec![stubborn], test_config()).await;

        engine.push_action(start("r1", "stubborn"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        engine.push_action(cancel("r1"));

        wait_for_events(
            &engine,
            "r1",
            &[ActionEventType::Started, ActionEventType::CancellationFailed],
        )
        .await;
        let failure = engine
            .events()
            .into_iter()
            .find(|e| e.event_type == ActionEventType::CancellationFailed)
            .unwrap();
        assert!(failure.payload["elapsed_ms"].as_u64().unwrap() >= 50);
        assert_eq!(failure.payload["phase"], "thread_still_alive");

        // Still nothing terminal while the thread is stuck.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            engine.event_types_for("r1"),
            vec![ActionEventType::Started, ActionEventType::CancellationFailed]
        );

        // When the thread finally returns, the run is confirmed, never completed.
        release_tx.send(()).unwrap();
        wait_for_events(
            &engine,
            "r1",
            &[
                ActionEventType::Started,
                ActionEventType::CancellationFailed,
                ActionEventType::CancellationConfirmed,
            ],
        )
        .await;

        handle.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_run_returning_within_grace_has_no_failure_event() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        let polite = FnTask::blocking("polite", |ctx: Arc<Context>| {
            if ctx.wait_cancelled(Duration::from_secs(10)) {
                return Err(TaskError::new("stopped"));
            }
            Ok(json!({}))
        });
        let handle = start_worker(&engine, vec![polite], test_config()).await;

        engine.push_action(start("r1", "polite"));
        wait_for_events(&engine, "r1", &[ActionEventType::Started]).await;
        engine.push_action(cancel("r1"));

        wait_for_events(
            &engine,
            "r1",
            &[
                ActionEventType::Started,
                ActionEventType::CancellationConfirmed,
            ],
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.event_types_for("r1").len(), 2);

        handle.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_at_most_one_terminal_event_per_run() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        let tasks = vec![
            echo_task(),
            FnTask::cooperative("fail", |_ctx: Arc<Context>| async {
                Err(TaskError::non_retryable("nope"))
            }),
            FnTask::cooperative("wait", |ctx: Arc<Context>| async move {
                ctx.cancelled().await;
                Ok(json!({}))
            }),
        ];
        let handle = start_worker(&engine, tasks, test_config()).await;

        for i in 0..5 {
            engine.push_action(start(&format!("ok-{i}"), "echo"));
            engine.push_action(start(&format!("bad-{i}"), "fail"));
            engine.push_action(start(&format!("wait-{i}"), "wait"));
            // A duplicate delivery of a live run is ignored.
            engine.push_action(start(&format!("wait-{i}"), "wait"));
            engine.push_action(cancel(&format!("wait-{i}")));
            // A second cancel is a no-op.
            engine.push_action(cancel(&format!("wait-{i}")));
        }

        assert!(
            engine
                .wait_until(TEST_TIMEOUT, |e| {
                    e.events().iter().filter(|ev| ev.event_type.is_terminal()).count() == 15
                })
                .await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..5 {
            for run_id in [format!("ok-{i}"), format!("bad-{i}"), format!("wait-{i}")] {
                let types = engine.event_types_for(&run_id);
                assert_eq!(types.iter().filter(|t| t.is_terminal()).count(), 1, "{run_id}");
                assert_eq!(types[0], ActionEventType::Started, "{run_id}");
            }
            assert_eq!(
                engine.event_types_for(&format!("wait-{i}")),
                vec![
                    ActionEventType::Started,
                    ActionEventType::CancellationConfirmed
                ]
            );
        }

        handle.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_v2_unimplemented_falls_back_to_v1_without_heartbeats() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        engine.disable_v2();
        let handle = start_worker(&engine, vec![echo_task()], test_config()).await;

        engine.push_action(start("r1", "echo"));
        wait_for_events(
            &engine,
            "r1",
            &[ActionEventType::Started, ActionEventType::Completed],
        )
        .await;

        // Several heartbeat intervals pass without a single heartbeat.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.heartbeat_count(), 0);
        assert_eq!(
            engine.listen_calls(),
            vec![ProtocolVersion::V2, ProtocolVersion::V1]
        );
        assert_eq!(handle.health(), HealthStatus::Healthy);
        assert!(!handle.health_snapshot().heartbeat_enabled);

        handle.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_durable_run_resumes_on_event() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        let approval = FnTask::cooperative("approval", |ctx: Arc<Context>| async move {
            let event = ctx.wait_for_event("approved").await?;
            Ok(json!({ "decision": event.data }))
        })
        .durable();
        let handle = start_worker(&engine, vec![approval], test_config()).await;

        engine.push_action(action("d1", "approval", ActionType::StartDurable, json!({})));
        assert!(
            engine
                .wait_until(TEST_TIMEOUT, |e| e.durable_waits().len() == 1)
                .await
        );
        let waits = engine.durable_waits();
        assert_eq!(waits[0].task_id, "d1");
        assert_eq!(waits[0].signal_key, "event:0");

        assert!(
            engine
                .wait_until(TEST_TIMEOUT, |e| e.emit_durable_event(DurableEvent {
                    task_id: "d1".to_string(),
                    signal_key: "event:0".to_string(),
                    data: json!("yes"),
                }))
                .await
        );
        wait_for_events(
            &engine,
            "d1",
            &[ActionEventType::Started, ActionEventType::Completed],
        )
        .await;
        let completed = engine
            .events()
            .into_iter()
            .find(|e| e.event_type == ActionEventType::Completed)
            .unwrap();
        assert_eq!(completed.payload, json!({"decision": "yes"}));

        handle.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_full_durable_pool_evicts_waiting_run() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        let approval = FnTask::cooperative("approval", |ctx: Arc<Context>| async move {
            let event = ctx.wait_for_event("approved").await?;
            Ok(json!({ "decision": event.data }))
        })
        .durable();
        let config = WorkerConfig {
            durable_slots: 1,
            ..test_config()
        };
        let handle = start_worker(&engine, vec![approval], config).await;

        engine.push_action(action("a", "approval", ActionType::StartDurable, json!({})));
        assert!(
            engine
                .wait_until(TEST_TIMEOUT, |e| e.durable_waits().len() == 1)
                .await
        );

        engine.push_action(action("b", "approval", ActionType::StartDurable, json!({})));
        wait_for_events(
            &engine,
            "a",
            &[
                ActionEventType::Started,
                ActionEventType::CancellationConfirmed,
            ],
        )
        .await;
        let evictions = engine.evictions();
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].step_run_id, "a");

        // The admitted run proceeds normally.
        assert!(
            engine
                .wait_until(TEST_TIMEOUT, |e| e.durable_waits().len() == 2)
                .await
        );
        assert!(
            engine
                .wait_until(TEST_TIMEOUT, |e| e.emit_durable_event(DurableEvent {
                    task_id: "b".to_string(),
                    signal_key: "event:0".to_string(),
                    data: json!("ok"),
                }))
                .await
        );
        wait_for_events(
            &engine,
            "b",
            &[ActionEventType::Started, ActionEventType::Completed],
        )
        .await;

        handle.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_graceful_shutdown_drains_then_cancels() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        let tasks = vec![
            FnTask::cooperative("slow", |_ctx: Arc<Context>| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!({"done": true}))
            }),
            FnTask::cooperative("forever", |ctx: Arc<Context>| async move {
                ctx.cancelled().await;
                Err(TaskError::new("interrupted"))
            }),
        ];
        let config = WorkerConfig {
            graceful_shutdown_timeout: Duration::from_millis(200),
            ..test_config()
        };
        let handle = start_worker(&engine, tasks, config).await;

        engine.push_action(start("slow", "slow"));
        engine.push_action(start("forever", "forever"));
        wait_for_events(&engine, "forever", &[ActionEventType::Started]).await;

        handle.shutdown().await.unwrap();

        assert_eq!(
            engine.event_types_for("slow"),
            vec![ActionEventType::Started, ActionEventType::Completed]
        );
        assert_eq!(
            engine.event_types_for("forever"),
            vec![
                ActionEventType::Started,
                ActionEventType::CancellationConfirmed
            ]
        );
        assert_eq!(engine.unsubscribes().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_health_endpoint_reports_status() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        let mut config = test_config();
        config.health.enabled = true;
        config.health.port = 0;
        let handle = start_worker(&engine, vec![echo_task()], config).await;
        let addr = handle.health_addr().unwrap();

        while handle.health() != HealthStatus::Healthy {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let url = format!("http://127.0.0.1:{}/health", addr.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "HEALTHY");
        assert_eq!(body["service"], "it-worker");
        assert_eq!(body["protocol"], "v2");

        handle.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_listener_giving_up_ends_the_worker() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        for _ in 0..10 {
            engine.fail_next_connect(EngineError::unavailable("engine down"));
        }
        let mut config = test_config();
        config.listener.max_retries = 2;
        let mut worker = Worker::new(config, Arc::new(engine.clone()));
        worker.register(echo_task()).unwrap();

        // Returns on its own, without any signal.
        let result = worker.run().await;
        assert!(matches!(
            result,
            Err(Error::Listener(ListenerError::RetriesExhausted { retries: 3, .. }))
        ));
        assert_eq!(engine.unsubscribes().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_listener_failure_is_visible_on_the_handle() {
    timeout(TEST_TIMEOUT, async {
        let engine = MemoryEngine::new();
        for _ in 0..10 {
            engine.fail_next_connect(EngineError::unavailable("engine down"));
        }
        let mut config = test_config();
        config.listener.max_retries = 2;
        let handle = start_worker(&engine, vec![echo_task()], config).await;

        while !handle.listener_failed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.health(), HealthStatus::Unhealthy);
        assert!(handle.shutdown().await.is_err());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_health_port_conflict_fails_before_registering() {
    timeout(TEST_TIMEOUT, async {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let engine = MemoryEngine::new();
        let mut config = test_config();
        config.health.enabled = true;
        config.health.port = port;
        let mut worker = Worker::new(config, Arc::new(engine.clone()));
        worker.register(echo_task()).unwrap();

        let result = worker.start().await;
        assert!(matches!(result, Err(Error::Io(_))));

        // Nothing was left running against the engine.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.registrations().is_empty());
        assert!(engine.listen_calls().is_empty());
    })
    .await
    .expect("test timed out");
}
