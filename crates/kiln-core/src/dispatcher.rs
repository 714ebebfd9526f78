//! Task dispatcher: drains the priority queues and drives each evaluation
//! through its state machine.
//!
//! One call to [`Dispatcher::handle_message`] owns a single evaluation
//! attempt end to end: claim an executor, walk the record through
//! provisioning and running, invoke the executor, persist the outcome, and
//! always release the claim. The handler reports what happened as a
//! [`Disposition`] value; the worker loop -- not the handler -- interprets
//! requeue and dead-letter dispositions. Errors never propagate out of a
//! single task: a dispatcher survives every poison message.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use kiln_db::models::EvalStatus;
use kiln_db::queries::evaluations as eval_db;

use crate::dlq::{DeadLetterQueue, DeadLetterTask};
use crate::events::{EvalEvent, EventPublisher};
use crate::executor::{ExecuteRequest, ExecutorClient, ExecutorError, ExecutionStatus};
use crate::pool::ExecutorPool;
use crate::queue::{QueueMessage, QueueName, TaskQueues};
use crate::retry::{self, Classification};
use crate::running::{RunningEntry, RunningIndex};
use crate::state::EvalStateMachine;
use crate::truncate::{self, TruncationConfig};

/// Slack added to twice the evaluation timeout when computing the lease.
const LEASE_SLACK_SECS: u64 = 30;

/// How often the in-flight executor wait checks the cancel flag.
const CANCEL_POLL: Duration = Duration::from_secs(1);

/// TTL on cancel flags so abandoned flags cannot linger forever.
const CANCEL_FLAG_TTL_SECS: u64 = 3600;

/// Lease duration for an executor claim: the executor call is bounded by
/// `timeout + margin`, so twice the timeout plus slack covers the full
/// attempt with room for result handling.
pub fn lease_ttl_secs(timeout_secs: u32) -> u64 {
    2 * timeout_secs as u64 + LEASE_SLACK_SECS
}

// ---------------------------------------------------------------------------
// Cancel flag
// ---------------------------------------------------------------------------

/// Redis key of the forced-cancel flag for an evaluation.
pub fn cancel_flag_key(eval_id: &str) -> String {
    format!("eval:{eval_id}:cancel")
}

/// Raise the cancel flag; the dispatcher polls it during the executor wait.
pub async fn request_cancel(conn: &ConnectionManager, eval_id: &str) -> Result<()> {
    let mut conn = conn.clone();
    let _: () = conn
        .set_ex(cancel_flag_key(eval_id), "1", CANCEL_FLAG_TTL_SECS)
        .await?;
    Ok(())
}

/// Whether a cancel has been requested for this evaluation.
pub async fn cancel_requested(conn: &ConnectionManager, eval_id: &str) -> Result<bool> {
    let mut conn = conn.clone();
    let exists: bool = conn.exists(cancel_flag_key(eval_id)).await?;
    Ok(exists)
}

/// Lower the cancel flag.
pub async fn clear_cancel_flag(conn: &ConnectionManager, eval_id: &str) -> Result<()> {
    let mut conn = conn.clone();
    let _: () = conn.del(cancel_flag_key(eval_id)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispositions
// ---------------------------------------------------------------------------

/// What a single handling attempt did with its message.
///
/// Terminal dispositions (`Completed`, `Failed`, `TimedOut`, `Cancelled`,
/// `Skipped`) are fully settled by the handler. `RequeueAfter` and
/// `DeadLetter` carry the work the loop still has to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Executor ran the code to completion; result persisted.
    Completed,
    /// Executor ran the code and it failed; result persisted. Not a retry
    /// trigger -- user code is never re-run automatically.
    Failed,
    /// The workload exceeded its timeout; partial output persisted.
    TimedOut,
    /// The evaluation was cancelled while in flight.
    Cancelled,
    /// Nothing to do (already terminal, cancelled before dispatch, or the
    /// record disappeared).
    Skipped { reason: String },
    /// Transient failure: return to `queued` and redeliver after the delay.
    RequeueAfter { delay: Duration, reason: String },
    /// Retries exhausted or a terminal dispatch error: park in the DLQ and
    /// fail the evaluation.
    DeadLetter {
        exception_class: String,
        exception_message: String,
    },
}

/// Classify an executor call failure into a disposition, given the attempt
/// counter of the message being handled.
pub fn classify_executor_error(error: &ExecutorError, attempt: u32) -> Disposition {
    let (classification, policy, reason, class) = match error {
        ExecutorError::Status { status } => (
            retry::classify_status(*status),
            retry::policy_for_status(*status),
            format!("HTTP {status}"),
            "ExecutorStatus",
        ),
        ExecutorError::Transport(message) => (
            retry::classify_message(message),
            retry::DEFAULT,
            format!("transport error: {message}"),
            "ExecutorTransport",
        ),
        ExecutorError::Malformed(message) => (
            Classification::Terminal,
            retry::DEFAULT,
            format!("malformed response: {message}"),
            "ExecutorMalformed",
        ),
    };

    match classification {
        Classification::Retryable if !policy.exhausted(attempt) => Disposition::RequeueAfter {
            delay: policy.delay(attempt),
            reason,
        },
        _ => Disposition::DeadLetter {
            exception_class: class.to_owned(),
            exception_message: reason,
        },
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Worker-loop tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Queue poll timeout; bounds shutdown latency.
    pub queue_poll: Duration,
    /// Consecutive claim misses tolerated before the attempt is charged and
    /// the message requeued.
    pub claim_wait_max: u32,
    /// Sleep between claim misses.
    pub claim_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_poll: Duration::from_secs(2),
            claim_wait_max: 5,
            claim_backoff: Duration::from_secs(2),
        }
    }
}

/// A dispatcher worker. Clone one per concurrency slot; all clones share
/// the underlying connections.
#[derive(Clone)]
pub struct Dispatcher {
    pg: PgPool,
    conn: ConnectionManager,
    queues: TaskQueues,
    pool: ExecutorPool,
    executor: ExecutorClient,
    publisher: EventPublisher,
    index: RunningIndex,
    dlq: DeadLetterQueue,
    truncation: TruncationConfig,
    config: DispatcherConfig,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pg: PgPool,
        conn: ConnectionManager,
        queues: TaskQueues,
        pool: ExecutorPool,
        executor: ExecutorClient,
        publisher: EventPublisher,
        index: RunningIndex,
        dlq: DeadLetterQueue,
        truncation: TruncationConfig,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            pg,
            conn,
            queues,
            pool,
            executor,
            publisher,
            index,
            dlq,
            truncation,
            config,
        }
    }

    /// Run the worker loop until shutdown.
    ///
    /// Polls the queues in strict priority order; an in-flight task finishes
    /// before the loop observes the cancellation, so shutdown drains
    /// naturally up to the evaluation timeout.
    pub async fn run_worker(&self, worker_id: usize, shutdown: CancellationToken) {
        tracing::info!(worker_id, "dispatcher worker started");

        while !shutdown.is_cancelled() {
            let popped = tokio::select! {
                result = self.queues.pop(self.config.queue_poll) => result,
                _ = shutdown.cancelled() => break,
            };

            let (queue, message) = match popped {
                Ok(Some(popped)) => popped,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "queue poll failed; backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let disposition = self.handle_message(queue, &message).await;
            self.settle(queue, message, disposition).await;
        }

        tracing::info!(worker_id, "dispatcher worker stopped");
    }

    /// Interpret the handler's disposition: schedule requeues, park
    /// dead-letters, log the rest.
    async fn settle(&self, queue: QueueName, message: QueueMessage, disposition: Disposition) {
        match disposition {
            Disposition::Completed
            | Disposition::Failed
            | Disposition::TimedOut
            | Disposition::Cancelled => {
                tracing::info!(
                    eval_id = %message.eval_id,
                    disposition = ?disposition,
                    "evaluation settled"
                );
            }
            Disposition::Skipped { reason } => {
                tracing::info!(eval_id = %message.eval_id, reason = %reason, "message skipped");
            }
            Disposition::RequeueAfter { delay, reason } => {
                let mut next = message.clone();
                next.attempt += 1;

                tracing::warn!(
                    "{}",
                    retry::retry_message(
                        "evaluate_code",
                        &message.eval_id,
                        message.attempt,
                        retry::DEFAULT.max_retries,
                        delay,
                        &reason,
                    )
                );

                if let Err(e) = eval_db::increment_retries(&self.pg, &message.eval_id).await {
                    tracing::warn!(eval_id = %message.eval_id, error = %e, "failed to bump retry counter");
                }
                self.queues.requeue_after(queue, next, delay);
            }
            Disposition::DeadLetter {
                exception_class,
                exception_message,
            } => {
                self.dead_letter(queue, &message, &exception_class, &exception_message)
                    .await;
            }
        }
    }

    /// Park a message in the DLQ and fail the evaluation.
    ///
    /// The storage update is best-effort: the DLQ entry must carry the trail
    /// even when the primary update fails.
    async fn dead_letter(
        &self,
        queue: QueueName,
        message: &QueueMessage,
        exception_class: &str,
        exception_message: &str,
    ) {
        let now = Utc::now();
        let code_preview: String = message.code.chars().take(100).collect();
        let task = DeadLetterTask {
            task_id: message.task_id.clone(),
            task_name: "evaluate_code".to_owned(),
            eval_id: message.eval_id.clone(),
            queue,
            message: message.clone(),
            exception_class: exception_class.to_owned(),
            exception_message: exception_message.to_owned(),
            retry_count: message.attempt,
            first_failure_time: now,
            last_failure_time: now,
            metadata: serde_json::json!({
                "code_preview": code_preview,
                "language": message.language,
            }),
        };

        if let Err(e) = self.dlq.add(&task).await {
            tracing::error!(eval_id = %message.eval_id, error = %e, "failed to add task to DLQ");
        }

        if let Err(e) = eval_db::mark_final_failure(
            &self.pg,
            &message.eval_id,
            exception_message,
            message.attempt as i32,
        )
        .await
        {
            tracing::warn!(
                eval_id = %message.eval_id,
                error = %e,
                "best-effort final-failure update did not apply"
            );
        }

        self.publish(EvalEvent::Failed {
            eval_id: message.eval_id.clone(),
            timestamp: Utc::now(),
            error: exception_message.to_owned(),
        })
        .await;

        if let Err(e) = self.index.clear(&message.eval_id).await {
            tracing::warn!(eval_id = %message.eval_id, error = %e, "failed to clear running entry");
        }
    }

    /// Handle one dequeued message end to end.
    pub async fn handle_message(&self, queue: QueueName, message: &QueueMessage) -> Disposition {
        let eval_id = &message.eval_id;

        // A soft cancel (or a terminal record) may have landed while the
        // message sat in the queue. A `failed` record is the one exception:
        // the only way a message exists for one is operator resubmission
        // from the DLQ, which re-opens the record for a fresh lifecycle.
        match eval_db::get_evaluation(&self.pg, eval_id).await {
            Ok(Some(eval)) if eval.status == EvalStatus::Failed => {
                match eval_db::reopen_failed(&self.pg, eval_id).await {
                    Ok(rows) if rows > 0 => {
                        tracing::info!(eval_id = %eval_id, "re-opened failed evaluation for resubmission");
                    }
                    Ok(_) => {
                        return Disposition::Skipped {
                            reason: "evaluation left failed state before re-open".to_owned(),
                        };
                    }
                    Err(e) => {
                        return Disposition::RequeueAfter {
                            delay: retry::DEFAULT.delay(message.attempt),
                            reason: format!("re-open failed: {e}"),
                        };
                    }
                }
            }
            Ok(Some(eval)) if eval.status.is_terminal() => {
                let _ = clear_cancel_flag(&self.conn, eval_id).await;
                return Disposition::Skipped {
                    reason: format!("evaluation already {}", eval.status),
                };
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                return Disposition::Skipped {
                    reason: "evaluation record not found".to_owned(),
                };
            }
            Err(e) => {
                return Disposition::RequeueAfter {
                    delay: retry::DEFAULT.delay(message.attempt),
                    reason: format!("storage read failed: {e}"),
                };
            }
        }

        // Claim an executor, waiting briefly through capacity blips.
        let lease = lease_ttl_secs(message.timeout_secs);
        let executor_url = match self.claim_with_backoff(eval_id, lease).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                // Capacity exhaustion charges the attempt so a persistently
                // starved task eventually dead-letters through the policy.
                return if retry::DEFAULT.exhausted(message.attempt) {
                    Disposition::DeadLetter {
                        exception_class: "NoCapacity".to_owned(),
                        exception_message: "no executor available".to_owned(),
                    }
                } else {
                    Disposition::RequeueAfter {
                        delay: retry::DEFAULT.delay(message.attempt),
                        reason: "no executor available".to_owned(),
                    }
                };
            }
            Err(e) => {
                return Disposition::RequeueAfter {
                    delay: retry::DEFAULT.delay(message.attempt),
                    reason: format!("pool claim failed: {e}"),
                };
            }
        };

        // queued -> provisioning. Losing the race means a concurrent cancel
        // won; hand the executor straight back.
        match EvalStateMachine::try_transition(
            &self.pg,
            eval_id,
            EvalStatus::Queued,
            EvalStatus::Provisioning,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.release(&executor_url).await;
                return Disposition::Skipped {
                    reason: "evaluation left queued state before dispatch".to_owned(),
                };
            }
            Err(e) => {
                self.release(&executor_url).await;
                return Disposition::RequeueAfter {
                    delay: retry::DEFAULT.delay(message.attempt),
                    reason: format!("provisioning transition failed: {e}"),
                };
            }
        }

        if let Err(e) = eval_db::set_executor(&self.pg, eval_id, &executor_url, None).await {
            tracing::warn!(eval_id = %eval_id, error = %e, "failed to record executor assignment");
        }

        self.publish(EvalEvent::Provisioning {
            eval_id: eval_id.clone(),
            timestamp: Utc::now(),
            executor_url: executor_url.clone(),
        })
        .await;

        // Soft-cancel window: the claim is held but user code has not
        // started.
        if cancel_requested(&self.conn, eval_id).await.unwrap_or(false) {
            return self
                .settle_cancel(eval_id, &executor_url, EvalStatus::Provisioning)
                .await;
        }

        // provisioning -> running. Losing this race means a cancel landed
        // between the provisioning event and here.
        match EvalStateMachine::try_transition(
            &self.pg,
            eval_id,
            EvalStatus::Provisioning,
            EvalStatus::Running,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                let _ = clear_cancel_flag(&self.conn, eval_id).await;
                self.release(&executor_url).await;
                return Disposition::Skipped {
                    reason: "evaluation left provisioning state before start".to_owned(),
                };
            }
            Err(e) => {
                self.release(&executor_url).await;
                return Disposition::RequeueAfter {
                    delay: retry::DEFAULT.delay(message.attempt),
                    reason: format!("running transition failed: {e}"),
                };
            }
        }

        let started_at = Utc::now();
        let entry = RunningEntry {
            eval_id: eval_id.clone(),
            executor_id: executor_url.clone(),
            container_id: None,
            started_at,
            timeout_secs: message.timeout_secs,
        };
        if let Err(e) = self.index.mark_running(&entry).await {
            tracing::warn!(eval_id = %eval_id, error = %e, "failed to write running entry");
        }

        self.publish(EvalEvent::Running {
            eval_id: eval_id.clone(),
            timestamp: started_at,
            executor_id: executor_url.clone(),
            container_id: None,
            timeout_secs: message.timeout_secs,
        })
        .await;

        // Invoke the executor, racing the forced-cancel watchdog. Dropping
        // the in-flight call is the bounded watchdog: we never wait for an
        // executor to acknowledge a stop.
        let request = ExecuteRequest {
            eval_id: eval_id.clone(),
            code: message.code.clone(),
            language: message.language.clone(),
            timeout_secs: message.timeout_secs,
        };

        let call_result = tokio::select! {
            result = self.executor.execute(&executor_url, &request) => Some(result),
            _ = self.wait_for_cancel(eval_id) => None,
        };

        let disposition = match call_result {
            None => {
                return self
                    .settle_cancel(eval_id, &executor_url, EvalStatus::Running)
                    .await;
            }
            Some(Ok(response)) => self.settle_result(message, response).await,
            Some(Err(error)) => {
                tracing::warn!(eval_id = %eval_id, error = %error, "executor call failed");
                let disposition = classify_executor_error(&error, message.attempt);
                if matches!(disposition, Disposition::RequeueAfter { .. }) {
                    // Back to queued; the settle step schedules redelivery.
                    if let Err(e) = EvalStateMachine::try_transition(
                        &self.pg,
                        eval_id,
                        EvalStatus::Running,
                        EvalStatus::Queued,
                    )
                    .await
                    {
                        tracing::warn!(eval_id = %eval_id, error = %e, "failed to return evaluation to queued");
                    }
                }
                if let Err(e) = self.index.clear(eval_id).await {
                    tracing::warn!(eval_id = %eval_id, error = %e, "failed to clear running entry");
                }
                disposition
            }
        };

        self.release(&executor_url).await;
        disposition
    }

    /// Persist an executor response and publish the matching terminal event.
    async fn settle_result(
        &self,
        message: &QueueMessage,
        response: crate::executor::ExecuteResponse,
    ) -> Disposition {
        let eval_id = &message.eval_id;

        let output = truncate::cap_stream(&self.truncation, eval_id, "output", &response.output);
        let error = truncate::cap_stream(&self.truncation, eval_id, "error", &response.error);

        let result = eval_db::EvalResult {
            output: Some(output.preview),
            error: Some(error.preview),
            output_truncated: output.truncated,
            error_truncated: error.truncated,
            output_size: Some(output.size),
            error_size: Some(error.size),
            output_location: output.location,
            error_location: error.location,
            exit_code: Some(response.exit_code),
            runtime_ms: response.runtime_ms,
        };

        let (to, disposition) = match response.status {
            ExecutionStatus::Completed => (EvalStatus::Completed, Disposition::Completed),
            ExecutionStatus::Failed => (EvalStatus::Failed, Disposition::Failed),
            ExecutionStatus::Timeout => (EvalStatus::Timeout, Disposition::TimedOut),
        };

        match eval_db::record_result(&self.pg, eval_id, EvalStatus::Running, to, &result).await {
            Ok(1) => {}
            Ok(_) => {
                tracing::warn!(
                    eval_id = %eval_id,
                    "result not recorded: evaluation left running state concurrently"
                );
            }
            Err(e) => {
                tracing::error!(eval_id = %eval_id, error = %e, "failed to record result");
            }
        }

        let timestamp = Utc::now();
        let event = match response.status {
            ExecutionStatus::Completed => EvalEvent::Completed {
                eval_id: eval_id.clone(),
                timestamp,
                exit_code: Some(response.exit_code),
                runtime_ms: response.runtime_ms,
            },
            ExecutionStatus::Failed => EvalEvent::Failed {
                eval_id: eval_id.clone(),
                timestamp,
                error: response.error.clone(),
            },
            ExecutionStatus::Timeout => EvalEvent::Timeout {
                eval_id: eval_id.clone(),
                timestamp,
                timeout_secs: message.timeout_secs,
            },
        };
        self.publish(event).await;

        if let Err(e) = self.index.clear(eval_id).await {
            tracing::warn!(eval_id = %eval_id, error = %e, "failed to clear running entry");
        }

        disposition
    }

    /// Finish a cancel observed while holding an executor claim.
    async fn settle_cancel(
        &self,
        eval_id: &str,
        executor_url: &str,
        from: EvalStatus,
    ) -> Disposition {
        match EvalStateMachine::try_transition(&self.pg, eval_id, from, EvalStatus::Cancelled).await
        {
            Ok(true) => {
                self.publish(EvalEvent::Cancelled {
                    eval_id: eval_id.to_owned(),
                    timestamp: Utc::now(),
                    previous_status: from.to_string(),
                })
                .await;
            }
            Ok(false) => {
                tracing::info!(eval_id = %eval_id, "cancel lost the race to another transition");
            }
            Err(e) => {
                tracing::warn!(eval_id = %eval_id, error = %e, "cancel transition failed");
            }
        }

        let _ = clear_cancel_flag(&self.conn, eval_id).await;
        if let Err(e) = self.index.clear(eval_id).await {
            tracing::warn!(eval_id = %eval_id, error = %e, "failed to clear running entry");
        }
        self.release(executor_url).await;

        Disposition::Cancelled
    }

    /// Claim an executor, tolerating up to `claim_wait_max` consecutive
    /// misses with a fixed backoff in between.
    async fn claim_with_backoff(&self, eval_id: &str, lease: u64) -> Result<Option<String>> {
        for miss in 0..self.config.claim_wait_max {
            if let Some(url) = self.pool.claim(eval_id, lease).await? {
                return Ok(Some(url));
            }
            tracing::debug!(eval_id = %eval_id, miss, "no executor available; backing off");
            tokio::time::sleep(self.config.claim_backoff).await;
        }
        Ok(self.pool.claim(eval_id, lease).await?)
    }

    /// Poll the cancel flag until it is raised.
    async fn wait_for_cancel(&self, eval_id: &str) {
        loop {
            if cancel_requested(&self.conn, eval_id).await.unwrap_or(false) {
                return;
            }
            tokio::time::sleep(CANCEL_POLL).await;
        }
    }

    /// Release an executor; idempotent, failures are logged and swallowed.
    async fn release(&self, executor_url: &str) {
        if let Err(e) = self.pool.release(executor_url).await {
            tracing::error!(url = %executor_url, error = %e, "failed to release executor");
        }
    }

    /// Publish an event; failures are logged, never propagated.
    async fn publish(&self, event: EvalEvent) {
        if let Err(e) = self.publisher.publish(&event).await {
            tracing::warn!(
                eval_id = %event.eval_id(),
                error = %e,
                "failed to publish lifecycle event"
            );
        }
    }
}
