//! End-to-end dispatcher tests against a scripted mock executor.
//!
//! The mock is a real HTTP server bound to an ephemeral port, so the whole
//! path -- queue poll, pool claim, state transitions, executor call, result
//! persistence, release -- runs exactly as in production, just faster.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use kiln_core::controller::{Controller, SubmitRequest};
use kiln_core::dispatcher::{Dispatcher, DispatcherConfig};
use kiln_core::dlq::DeadLetterQueue;
use kiln_core::events::EventPublisher;
use kiln_core::executor::ExecutorClient;
use kiln_core::pool::ExecutorPool;
use kiln_core::queue::{QueueName, TaskQueues};
use kiln_core::running::RunningIndex;
use kiln_core::truncate::TruncationConfig;
use kiln_db::models::EvalStatus;
use kiln_db::queries::evaluations as eval_db;
use kiln_db::queries::events as events_db;
use kiln_test_utils::{create_test_db, create_test_redis, drop_test_db};

// ---------------------------------------------------------------------------
// Mock executor
// ---------------------------------------------------------------------------

/// One scripted reply, consumed in order; when the script is empty the mock
/// answers with a successful run.
#[derive(Clone)]
enum Reply {
    /// 200 with the given execution outcome.
    Outcome {
        status: &'static str,
        output: String,
        error: String,
        exit_code: i32,
    },
    /// A bare HTTP status (e.g. 503).
    Http(u16),
    /// Sleep before answering success; used for cancel tests.
    Slow(Duration),
}

struct MockState {
    script: Mutex<VecDeque<Reply>>,
    /// eval_ids in the order requests arrived.
    requests: Mutex<Vec<String>>,
}

#[derive(serde::Deserialize)]
struct MockRequest {
    eval_id: String,
}

async fn mock_execute(
    State(state): State<Arc<MockState>>,
    Json(request): Json<MockRequest>,
) -> axum::response::Response {
    state.requests.lock().unwrap().push(request.eval_id.clone());
    let reply = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Reply::Outcome {
            status: "completed",
            output: "Hello World\n".to_owned(),
            error: String::new(),
            exit_code: 0,
        });

    let (status, output, error, exit_code) = match reply {
        Reply::Http(code) => {
            return StatusCode::from_u16(code).unwrap().into_response();
        }
        Reply::Slow(delay) => {
            tokio::time::sleep(delay).await;
            ("completed", "late\n".to_owned(), String::new(), 0)
        }
        Reply::Outcome {
            status,
            output,
            error,
            exit_code,
        } => (status, output, error, exit_code),
    };

    Json(serde_json::json!({
        "eval_id": request.eval_id,
        "status": status,
        "output": output,
        "error": error,
        "exit_code": exit_code,
        "executor_id": "mock-executor",
        "runtime_ms": 5,
    }))
    .into_response()
}

/// Start the mock executor; returns its base URL and scripted state.
async fn start_mock_executor(script: Vec<Reply>) -> (String, Arc<MockState>) {
    let state = Arc::new(MockState {
        script: Mutex::new(script.into()),
        requests: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/execute", post(mock_execute))
        .route("/health", get(|| async { "ok" }))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), state)
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    pg: sqlx::PgPool,
    db_name: String,
    queues: TaskQueues,
    pool: ExecutorPool,
    dlq: DeadLetterQueue,
    index: RunningIndex,
    controller: Controller,
    dispatcher: Dispatcher,
    blob_dir: tempfile::TempDir,
}

impl Harness {
    async fn new(executor_url: &str) -> Self {
        let (pg, db_name) = create_test_db().await;
        let (conn, redis_url) = create_test_redis().await;

        // BRPOP blocks its connection, so the dispatcher polls on its own.
        let poll_conn = kiln_core::broker::BrokerConfig::new(&redis_url)
            .connect()
            .await
            .unwrap();

        let queues = TaskQueues::new(conn.clone());
        let pool = ExecutorPool::new(conn.clone());
        let dlq = DeadLetterQueue::new(conn.clone());
        let index = RunningIndex::new(conn.clone());
        let publisher = EventPublisher::new(conn.clone(), pg.clone());
        let blob_dir = tempfile::TempDir::new().unwrap();

        pool.initialize(&[executor_url.to_owned()]).await.unwrap();

        let controller = Controller::new(
            pg.clone(),
            conn.clone(),
            queues.clone(),
            publisher.clone(),
            index.clone(),
        );

        let dispatcher = Dispatcher::new(
            pg.clone(),
            conn.clone(),
            TaskQueues::new(poll_conn),
            pool.clone(),
            ExecutorClient::new().unwrap(),
            publisher,
            index.clone(),
            dlq.clone(),
            TruncationConfig::new(1024 * 1024, blob_dir.path()),
            DispatcherConfig {
                queue_poll: Duration::from_millis(300),
                claim_wait_max: 2,
                claim_backoff: Duration::from_millis(100),
            },
        );

        Self {
            pg,
            db_name,
            queues,
            pool,
            dlq,
            index,
            controller,
            dispatcher,
            blob_dir,
        }
    }

    /// Start one worker; returns the token that stops it.
    fn start_worker(&self) -> CancellationToken {
        let shutdown = CancellationToken::new();
        let dispatcher = self.dispatcher.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            dispatcher.run_worker(0, token).await;
        });
        shutdown
    }

    async fn wait_for_status(&self, eval_id: &str, status: EvalStatus, deadline: Duration) {
        let start = tokio::time::Instant::now();
        loop {
            let eval = eval_db::get_evaluation(&self.pg, eval_id)
                .await
                .unwrap()
                .expect("evaluation row should exist");
            if eval.status == status {
                return;
            }
            assert!(
                start.elapsed() < deadline,
                "evaluation {eval_id} stuck in {}, wanted {status}",
                eval.status
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn teardown(self, shutdown: CancellationToken) {
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.pg.close().await;
        drop_test_db(&self.db_name).await;
        drop(self.blob_dir);
    }
}

/// Poll a condition until it holds or the deadline passes.
///
/// Terminal-status persistence, event publication, index cleanup, and pool
/// release happen in sequence, so assertions on the later steps must poll.
async fn eventually<F, Fut>(mut condition: F, deadline: Duration, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if condition().await {
            return;
        }
        assert!(start.elapsed() < deadline, "timed out waiting for: {what}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn submission(code: &str, priority: i32) -> SubmitRequest {
    serde_json::from_value(serde_json::json!({
        "code": code,
        "language": "python",
        "engine": "docker",
        "timeout_secs": 30,
        "priority": priority,
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_world_success() {
    let (url, mock) = start_mock_executor(vec![Reply::Outcome {
        status: "completed",
        output: "Hello\n".to_owned(),
        error: String::new(),
        exit_code: 0,
    }])
    .await;
    let harness = Harness::new(&url).await;

    let outcome = harness
        .controller
        .submit(&submission("print('Hello')", 0))
        .await
        .unwrap();
    assert_eq!(outcome.status, EvalStatus::Queued);
    assert_eq!(outcome.queue, QueueName::Evaluation);

    let shutdown = harness.start_worker();
    harness
        .wait_for_status(&outcome.eval_id, EvalStatus::Completed, Duration::from_secs(10))
        .await;

    let eval = eval_db::get_evaluation(&harness.pg, &outcome.eval_id)
        .await
        .unwrap()
        .unwrap();
    assert!(eval.output.as_deref().unwrap_or("").contains("Hello"));
    assert_eq!(eval.exit_code, Some(0));
    assert!(eval.executor_id.is_none());

    // Event trail is in state-machine order.
    eventually(
        || async {
            events_db::list_events(&harness.pg, &outcome.eval_id)
                .await
                .unwrap()
                .len()
                == 4
        },
        Duration::from_secs(5),
        "full event trail",
    )
    .await;
    let trail = events_db::list_events(&harness.pg, &outcome.eval_id)
        .await
        .unwrap();
    let types: Vec<&str> = trail.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["queued", "provisioning", "running", "completed"]);

    // The running index no longer contains the evaluation.
    eventually(
        || async { harness.index.ids().await.unwrap().is_empty() },
        Duration::from_secs(5),
        "running index cleared",
    )
    .await;
    assert!(harness.index.get(&outcome.eval_id).await.unwrap().is_none());

    // The executor was hit exactly once and is back in the pool.
    assert_eq!(mock.requests.lock().unwrap().len(), 1);
    eventually(
        || async {
            let status = harness.pool.status().await.unwrap();
            status.available == 1 && status.busy == 0
        },
        Duration::from_secs(5),
        "executor released",
    )
    .await;

    harness.teardown(shutdown).await;
}

#[tokio::test]
async fn fast_failing_workload_is_terminal_not_retried() {
    let (url, mock) = start_mock_executor(vec![Reply::Outcome {
        status: "failed",
        output: "before\n".to_owned(),
        error: "ZeroDivisionError: division by zero".to_owned(),
        exit_code: 1,
    }])
    .await;
    let harness = Harness::new(&url).await;

    let outcome = harness
        .controller
        .submit(&submission("print('before'); 1/0", 0))
        .await
        .unwrap();

    let shutdown = harness.start_worker();
    harness
        .wait_for_status(&outcome.eval_id, EvalStatus::Failed, Duration::from_secs(10))
        .await;

    let eval = eval_db::get_evaluation(&harness.pg, &outcome.eval_id)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(eval.exit_code, Some(0));
    // Combined log: stdout preserved, the error in its own channel.
    assert!(eval.output.as_deref().unwrap().contains("before"));
    assert!(eval.error.as_deref().unwrap().contains("ZeroDivisionError"));

    // User code is never re-run: exactly one executor call, empty DLQ.
    assert_eq!(mock.requests.lock().unwrap().len(), 1);
    assert_eq!(harness.dlq.statistics().await.unwrap().queue_size, 0);
    eventually(
        || async { harness.index.ids().await.unwrap().is_empty() },
        Duration::from_secs(5),
        "running index cleared",
    )
    .await;

    harness.teardown(shutdown).await;
}

#[tokio::test]
async fn retry_on_503_then_success() {
    let (url, mock) =
        start_mock_executor(vec![Reply::Http(503), Reply::Http(503)]).await;
    let harness = Harness::new(&url).await;

    let outcome = harness
        .controller
        .submit(&submission("print('retry me')", 0))
        .await
        .unwrap();

    let shutdown = harness.start_worker();
    // Two backoffs (~2s and ~4s, jitter <= 25%) plus dispatch overhead.
    harness
        .wait_for_status(&outcome.eval_id, EvalStatus::Completed, Duration::from_secs(25))
        .await;

    assert_eq!(mock.requests.lock().unwrap().len(), 3, "two retries then success");

    let eval = eval_db::get_evaluation(&harness.pg, &outcome.eval_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(eval.retries, 2);
    assert!(!eval.final_failure);

    harness.teardown(shutdown).await;
}

#[tokio::test]
async fn exhausted_retries_land_in_dlq_and_retry_resubmits() {
    let (url, mock) = start_mock_executor(vec![Reply::Http(500)]).await;
    let harness = Harness::new(&url).await;

    // Seed the record, then enqueue a message already at the retry budget so
    // the next failure dead-letters immediately.
    let outcome = harness
        .controller
        .submit(&submission("print('poison')", 0))
        .await
        .unwrap();
    let (_, mut message) = harness
        .queues
        .pop(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("submitted message");
    message.attempt = 5;
    harness
        .queues
        .push(QueueName::Evaluation, &message)
        .await
        .unwrap();

    let shutdown = harness.start_worker();
    harness
        .wait_for_status(&outcome.eval_id, EvalStatus::Failed, Duration::from_secs(10))
        .await;

    let eval = eval_db::get_evaluation(&harness.pg, &outcome.eval_id)
        .await
        .unwrap()
        .unwrap();
    assert!(eval.final_failure);

    let parked = harness
        .dlq
        .get(&message.task_id)
        .await
        .unwrap()
        .expect("task parked in DLQ");
    assert_eq!(parked.retry_count, 5);
    assert_eq!(parked.eval_id, outcome.eval_id);

    // Operator retry: DLQ empties and a fresh attempt reaches the executor.
    let before = mock.requests.lock().unwrap().len();
    assert!(harness.dlq.retry(&message.task_id, &harness.queues).await.unwrap());
    assert_eq!(harness.dlq.statistics().await.unwrap().queue_size, 0);

    let start = tokio::time::Instant::now();
    while mock.requests.lock().unwrap().len() == before {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "resubmitted task never reached the executor"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    harness.teardown(shutdown).await;
}

#[tokio::test]
async fn high_priority_dispatches_first() {
    let (url, mock) = start_mock_executor(vec![]).await;
    let harness = Harness::new(&url).await;

    // Enqueue two normal tasks, then an urgent one, then another normal --
    // all before any worker runs.
    let normal_1 = harness
        .controller
        .submit(&submission("print('n1')", 250))
        .await
        .unwrap();
    let normal_2 = harness
        .controller
        .submit(&submission("print('n2')", 250))
        .await
        .unwrap();
    let urgent = harness
        .controller
        .submit(&submission("print('urgent')", 1000))
        .await
        .unwrap();
    let normal_3 = harness
        .controller
        .submit(&submission("print('n3')", 250))
        .await
        .unwrap();
    assert_eq!(urgent.queue, QueueName::HighPriority);

    let shutdown = harness.start_worker();
    for id in [&normal_1.eval_id, &normal_2.eval_id, &urgent.eval_id, &normal_3.eval_id] {
        harness
            .wait_for_status(id, EvalStatus::Completed, Duration::from_secs(20))
            .await;
    }

    let order = mock.requests.lock().unwrap().clone();
    assert_eq!(order[0], urgent.eval_id, "urgent task must dispatch first");
    let urgent_pos = order.iter().position(|id| id == &urgent.eval_id).unwrap();
    let n3_pos = order.iter().position(|id| id == &normal_3.eval_id).unwrap();
    assert!(urgent_pos < n3_pos);

    harness.teardown(shutdown).await;
}

#[tokio::test]
async fn soft_cancel_of_queued_evaluation_skips_dispatch() {
    let (url, mock) = start_mock_executor(vec![]).await;
    let harness = Harness::new(&url).await;

    let outcome = harness
        .controller
        .submit(&submission("print('never')", 0))
        .await
        .unwrap();

    let cancel = harness
        .controller
        .cancel(&outcome.eval_id, false)
        .await
        .unwrap()
        .expect("evaluation exists");
    assert!(cancel.cancelled);
    assert_eq!(cancel.previous_status, EvalStatus::Queued);

    // A second cancel is an idempotent no-op.
    let again = harness
        .controller
        .cancel(&outcome.eval_id, false)
        .await
        .unwrap()
        .unwrap();
    assert!(!again.cancelled);
    assert!(again.message.contains("already cancelled"));

    // The worker drains the stale message without touching the executor.
    let shutdown = harness.start_worker();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(mock.requests.lock().unwrap().is_empty());

    let eval = eval_db::get_evaluation(&harness.pg, &outcome.eval_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(eval.status, EvalStatus::Cancelled);

    harness.teardown(shutdown).await;
}

#[tokio::test]
async fn forced_cancel_interrupts_running_evaluation() {
    let (url, _mock) = start_mock_executor(vec![Reply::Slow(Duration::from_secs(20))]).await;
    let harness = Harness::new(&url).await;

    let outcome = harness
        .controller
        .submit(&submission("import time; time.sleep(60)", 0))
        .await
        .unwrap();

    let shutdown = harness.start_worker();
    harness
        .wait_for_status(&outcome.eval_id, EvalStatus::Running, Duration::from_secs(10))
        .await;

    // Soft cancel is refused while running.
    let soft = harness
        .controller
        .cancel(&outcome.eval_id, false)
        .await
        .unwrap()
        .unwrap();
    assert!(!soft.cancelled);
    assert!(soft.message.contains("force"));

    let forced = harness
        .controller
        .cancel(&outcome.eval_id, true)
        .await
        .unwrap()
        .unwrap();
    assert!(forced.cancelled);

    harness
        .wait_for_status(&outcome.eval_id, EvalStatus::Cancelled, Duration::from_secs(10))
        .await;

    // The dispatcher's watchdog released the executor without waiting for
    // the 20-second mock call to finish.
    let start = tokio::time::Instant::now();
    loop {
        let status = harness.pool.status().await.unwrap();
        if status.available == 1 && status.busy == 0 {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "executor was not released after forced cancel"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(harness.index.ids().await.unwrap().is_empty());

    harness.teardown(shutdown).await;
}

#[tokio::test]
async fn oversized_output_is_truncated_and_spilled() {
    let big_output = "x".repeat(2 * 1024 * 1024);
    let (url, _mock) = start_mock_executor(vec![Reply::Outcome {
        status: "completed",
        output: big_output,
        error: String::new(),
        exit_code: 0,
    }])
    .await;
    let harness = Harness::new(&url).await;

    let outcome = harness
        .controller
        .submit(&submission("print('x' * 2_000_000)", 0))
        .await
        .unwrap();

    let shutdown = harness.start_worker();
    harness
        .wait_for_status(&outcome.eval_id, EvalStatus::Completed, Duration::from_secs(10))
        .await;

    let eval = eval_db::get_evaluation(&harness.pg, &outcome.eval_id)
        .await
        .unwrap()
        .unwrap();
    assert!(eval.output_truncated);
    assert_eq!(eval.output.as_ref().unwrap().len(), 1024 * 1024);
    assert_eq!(eval.output_size, Some(2 * 1024 * 1024));
    assert!(
        eval.output_location
            .as_deref()
            .unwrap()
            .starts_with("file://")
    );
    assert!(!eval.error_truncated);

    harness.teardown(shutdown).await;
}

#[tokio::test]
async fn cancel_unknown_evaluation_is_not_found() {
    let (url, _mock) = start_mock_executor(vec![]).await;
    let harness = Harness::new(&url).await;

    let result = harness.controller.cancel("eval_missing", false).await.unwrap();
    assert!(result.is_none());

    let shutdown = CancellationToken::new();
    harness.teardown(shutdown).await;
}

#[tokio::test]
async fn timeout_outcome_is_recorded() {
    let (url, _mock) = start_mock_executor(vec![Reply::Outcome {
        status: "timeout",
        output: "partial\n".to_owned(),
        error: "Execution exceeded 30s timeout".to_owned(),
        exit_code: -1,
    }])
    .await;
    let harness = Harness::new(&url).await;

    let outcome = harness
        .controller
        .submit(&submission("while True: pass", 0))
        .await
        .unwrap();

    let shutdown = harness.start_worker();
    harness
        .wait_for_status(&outcome.eval_id, EvalStatus::Timeout, Duration::from_secs(10))
        .await;

    let eval = eval_db::get_evaluation(&harness.pg, &outcome.eval_id)
        .await
        .unwrap()
        .unwrap();
    // Partial logs are captured even on timeout.
    assert!(eval.output.as_deref().unwrap().contains("partial"));
    eventually(
        || async { harness.index.ids().await.unwrap().is_empty() },
        Duration::from_secs(5),
        "running index cleared",
    )
    .await;

    harness.teardown(shutdown).await;
}

#[tokio::test]
async fn list_reports_live_status_per_row() {
    let (url, _mock) = start_mock_executor(vec![]).await;
    let harness = Harness::new(&url).await;

    let done = harness
        .controller
        .submit(&submission("print('done')", 0))
        .await
        .unwrap();
    let shutdown = harness.start_worker();
    harness
        .wait_for_status(&done.eval_id, EvalStatus::Completed, Duration::from_secs(10))
        .await;

    // Stop the worker so the second submission stays queued.
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let waiting = harness
        .controller
        .submit(&submission("print('waiting')", 0))
        .await
        .unwrap();

    let (rows, total) = harness
        .controller
        .list(&eval_db::EvaluationFilter::default())
        .await
        .unwrap();
    assert_eq!(total, 2);
    let by_id = |id: &str| rows.iter().find(|e| e.id == id).unwrap();
    assert_eq!(by_id(&done.eval_id).status, EvalStatus::Completed);
    assert_eq!(by_id(&waiting.eval_id).status, EvalStatus::Queued);

    harness.teardown(CancellationToken::new()).await;
}
