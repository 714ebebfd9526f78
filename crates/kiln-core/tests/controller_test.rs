//! Integration tests for the lifecycle controller's submission, retrieval,
//! and cancel semantics, without a dispatcher in the loop.

use std::time::Duration;

use chrono::Utc;

use kiln_core::controller::{Controller, SubmitError, SubmitRequest};
use kiln_core::events::EventPublisher;
use kiln_core::queue::{QueueName, TaskQueues};
use kiln_core::running::{RunningEntry, RunningIndex};
use kiln_db::models::EvalStatus;
use kiln_db::queries::evaluations as eval_db;
use kiln_test_utils::{create_test_db, create_test_redis, drop_test_db};

struct Rig {
    pg: sqlx::PgPool,
    db_name: String,
    queues: TaskQueues,
    index: RunningIndex,
    controller: Controller,
}

impl Rig {
    async fn new() -> Self {
        let (pg, db_name) = create_test_db().await;
        let (conn, _url) = create_test_redis().await;

        let queues = TaskQueues::new(conn.clone());
        let index = RunningIndex::new(conn.clone());
        let publisher = EventPublisher::new(conn.clone(), pg.clone());
        let controller = Controller::new(
            pg.clone(),
            conn,
            queues.clone(),
            publisher,
            index.clone(),
        );

        Self {
            pg,
            db_name,
            queues,
            index,
            controller,
        }
    }

    async fn teardown(self) {
        self.pg.close().await;
        drop_test_db(&self.db_name).await;
    }
}

fn request(code: &str, timeout_secs: u32, priority: i32) -> SubmitRequest {
    serde_json::from_value(serde_json::json!({
        "code": code,
        "timeout_secs": timeout_secs,
        "priority": priority,
    }))
    .unwrap()
}

#[tokio::test]
async fn submit_validation_rejects_bad_input() {
    let rig = Rig::new().await;

    let err = rig.controller.submit(&request("", 30, 0)).await.unwrap_err();
    assert!(matches!(err, SubmitError::EmptyCode));

    let err = rig
        .controller
        .submit(&request("print(1)", 0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::InvalidTimeout));

    // Nothing was persisted or enqueued.
    let (rows, total) = rig
        .controller
        .list(&eval_db::EvaluationFilter::default())
        .await
        .unwrap();
    assert!(rows.is_empty());
    assert_eq!(total, 0);
    assert_eq!(rig.queues.depth(QueueName::Evaluation).await.unwrap(), 0);

    rig.teardown().await;
}

#[tokio::test]
async fn submit_routes_by_priority_including_legacy_values() {
    let rig = Rig::new().await;

    // Legacy -1/0/1 normalize to 150/250/350.
    let low = rig.controller.submit(&request("print(1)", 30, -1)).await.unwrap();
    assert_eq!(low.queue, QueueName::LowPriority);

    let normal = rig.controller.submit(&request("print(1)", 30, 1)).await.unwrap();
    assert_eq!(normal.queue, QueueName::Evaluation);

    let high = rig
        .controller
        .submit(&request("print(1)", 30, 1500))
        .await
        .unwrap();
    assert_eq!(high.queue, QueueName::HighPriority);

    // The persisted rows carry the normalized priority.
    let row = eval_db::get_evaluation(&rig.pg, &low.eval_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.priority, 150);

    // Queue bodies landed where the outcome said.
    assert_eq!(rig.queues.depth(QueueName::LowPriority).await.unwrap(), 1);
    assert_eq!(rig.queues.depth(QueueName::Evaluation).await.unwrap(), 1);
    assert_eq!(rig.queues.depth(QueueName::HighPriority).await.unwrap(), 1);

    // And the enqueued message matches the record.
    let (queue, msg) = rig
        .queues
        .pop(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("high-priority message first");
    assert_eq!(queue, QueueName::HighPriority);
    assert_eq!(msg.eval_id, high.eval_id);
    assert_eq!(msg.priority, 1500);
    assert_eq!(msg.attempt, 0);

    rig.teardown().await;
}

#[tokio::test]
async fn get_joins_running_info_only_while_non_terminal() {
    let rig = Rig::new().await;

    let outcome = rig.controller.submit(&request("print(1)", 45, 0)).await.unwrap();
    let eval_id = outcome.eval_id.clone();

    // Queued: no running info.
    let detail = rig.controller.get(&eval_id).await.unwrap().unwrap();
    assert_eq!(detail.evaluation.status, EvalStatus::Queued);
    assert!(detail.running.is_none());

    // Walk the record into running and plant an index entry, as the
    // dispatcher would.
    eval_db::transition_status(&rig.pg, &eval_id, EvalStatus::Queued, EvalStatus::Provisioning)
        .await
        .unwrap();
    eval_db::transition_status(
        &rig.pg,
        &eval_id,
        EvalStatus::Provisioning,
        EvalStatus::Running,
    )
    .await
    .unwrap();
    rig.index
        .mark_running(&RunningEntry {
            eval_id: eval_id.clone(),
            executor_id: "http://executor-1:8083".to_owned(),
            container_id: None,
            started_at: Utc::now(),
            timeout_secs: 45,
        })
        .await
        .unwrap();

    let detail = rig.controller.get(&eval_id).await.unwrap().unwrap();
    assert_eq!(detail.evaluation.status, EvalStatus::Running);
    let running = detail.running.expect("running info should be joined");
    assert_eq!(running.executor_id, "http://executor-1:8083");
    assert_eq!(running.timeout_secs, 45);

    // Terminal: running info is no longer reported even if the index entry
    // lingers.
    eval_db::record_result(
        &rig.pg,
        &eval_id,
        EvalStatus::Running,
        EvalStatus::Completed,
        &eval_db::EvalResult::default(),
    )
    .await
    .unwrap();
    let detail = rig.controller.get(&eval_id).await.unwrap().unwrap();
    assert_eq!(detail.evaluation.status, EvalStatus::Completed);
    assert!(detail.running.is_none());

    rig.teardown().await;
}

#[tokio::test]
async fn cancel_outcomes_by_state() {
    let rig = Rig::new().await;

    // Unknown id.
    assert!(rig.controller.cancel("eval_ghost", false).await.unwrap().is_none());

    // Queued: soft cancel applies.
    let outcome = rig.controller.submit(&request("print(1)", 30, 0)).await.unwrap();
    let cancel = rig
        .controller
        .cancel(&outcome.eval_id, false)
        .await
        .unwrap()
        .unwrap();
    assert!(cancel.cancelled);
    assert_eq!(cancel.previous_status, EvalStatus::Queued);

    // Second cancel: idempotent informational no-op.
    let again = rig
        .controller
        .cancel(&outcome.eval_id, false)
        .await
        .unwrap()
        .unwrap();
    assert!(!again.cancelled);
    assert_eq!(again.previous_status, EvalStatus::Cancelled);

    // Running without force: refused with guidance.
    let outcome = rig.controller.submit(&request("print(2)", 30, 0)).await.unwrap();
    eval_db::transition_status(
        &rig.pg,
        &outcome.eval_id,
        EvalStatus::Queued,
        EvalStatus::Provisioning,
    )
    .await
    .unwrap();
    eval_db::transition_status(
        &rig.pg,
        &outcome.eval_id,
        EvalStatus::Provisioning,
        EvalStatus::Running,
    )
    .await
    .unwrap();

    let soft = rig
        .controller
        .cancel(&outcome.eval_id, false)
        .await
        .unwrap()
        .unwrap();
    assert!(!soft.cancelled);
    assert_eq!(soft.previous_status, EvalStatus::Running);
    assert!(soft.message.contains("force=true"));

    // Running with force: the record is terminal immediately.
    let forced = rig
        .controller
        .cancel(&outcome.eval_id, true)
        .await
        .unwrap()
        .unwrap();
    assert!(forced.cancelled);

    let row = eval_db::get_evaluation(&rig.pg, &outcome.eval_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, EvalStatus::Cancelled);
    assert!(row.completed_at.is_some());

    rig.teardown().await;
}

#[tokio::test]
async fn list_running_cross_checks_durable_store() {
    let rig = Rig::new().await;

    // A genuine running evaluation.
    let live = rig.controller.submit(&request("print(1)", 30, 0)).await.unwrap();
    eval_db::transition_status(&rig.pg, &live.eval_id, EvalStatus::Queued, EvalStatus::Provisioning)
        .await
        .unwrap();
    eval_db::transition_status(
        &rig.pg,
        &live.eval_id,
        EvalStatus::Provisioning,
        EvalStatus::Running,
    )
    .await
    .unwrap();
    rig.index
        .mark_running(&RunningEntry {
            eval_id: live.eval_id.clone(),
            executor_id: "http://executor-1:8083".to_owned(),
            container_id: None,
            started_at: Utc::now(),
            timeout_secs: 30,
        })
        .await
        .unwrap();

    // A stale index entry with no durable record behind it.
    rig.index
        .mark_running(&RunningEntry {
            eval_id: "eval_ghost".to_owned(),
            executor_id: "http://executor-2:8083".to_owned(),
            container_id: None,
            started_at: Utc::now(),
            timeout_secs: 30,
        })
        .await
        .unwrap();

    let running = rig.controller.list_running().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].eval_id, live.eval_id);

    rig.teardown().await;
}
