//! Evaluation lifecycle controller: the operations the HTTP façade exposes
//! upward.
//!
//! Owns the Evaluation record from submission to finalization. Submission
//! validates, persists a `queued` row, and enqueues; retrieval joins the
//! durable record with the running index; cancellation walks the state
//! machine with the same optimistic transitions the dispatcher uses, so the
//! two can race safely.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::RngCore;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

use kiln_db::models::{EvalStatus, Evaluation};
use kiln_db::queries::evaluations as eval_db;

use crate::dispatcher;
use crate::events::{EvalEvent, EventPublisher};
use crate::priority;
use crate::queue::{QueueMessage, QueueName, TaskQueues};
use crate::running::{RunningEntry, RunningIndex};
use crate::state::EvalStateMachine;

/// A submission from the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
    #[serde(default)]
    pub priority: i32,
}

fn default_language() -> String {
    "python".to_owned()
}

fn default_engine() -> String {
    "docker".to_owned()
}

fn default_timeout() -> u32 {
    30
}

/// Submission outcome returned to the caller immediately.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub eval_id: String,
    pub status: EvalStatus,
    pub queue: QueueName,
    pub queue_position: i64,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    /// Policy-violating input; surfaces as 4xx, never retried or parked.
    #[error("code must not be empty")]
    EmptyCode,
    #[error("timeout must be at least 1 second")]
    InvalidTimeout,
    /// Downstream capacity problem; surfaces as 503.
    #[error("failed to enqueue evaluation: {0:#}")]
    Enqueue(anyhow::Error),
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

/// Current record plus ephemeral running info when applicable.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationDetail {
    #[serde(flatten)]
    pub evaluation: Evaluation,
    pub running: Option<RunningEntry>,
}

/// Structured cancel outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub eval_id: String,
    pub previous_status: EvalStatus,
    pub cancelled: bool,
    pub message: String,
}

/// The lifecycle controller.
#[derive(Clone)]
pub struct Controller {
    pg: PgPool,
    conn: ConnectionManager,
    queues: TaskQueues,
    publisher: EventPublisher,
    index: RunningIndex,
}

impl Controller {
    pub fn new(
        pg: PgPool,
        conn: ConnectionManager,
        queues: TaskQueues,
        publisher: EventPublisher,
        index: RunningIndex,
    ) -> Self {
        Self {
            pg,
            conn,
            queues,
            publisher,
            index,
        }
    }

    /// Validate, persist, and enqueue a submission. Returns immediately;
    /// the dispatcher picks the message up asynchronously.
    pub async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome, SubmitError> {
        if request.code.trim().is_empty() {
            return Err(SubmitError::EmptyCode);
        }
        if request.timeout_secs < 1 {
            return Err(SubmitError::InvalidTimeout);
        }

        let priority = priority::normalize_priority(request.priority);
        let queue = priority::queue_for_priority(priority);
        let eval_id = generate_eval_id();

        let new = eval_db::NewEvaluation {
            id: &eval_id,
            code: &request.code,
            language: &request.language,
            engine: &request.engine,
            timeout_secs: request.timeout_secs as i32,
            priority,
        };
        eval_db::insert_evaluation(&self.pg, &new)
            .await
            .map_err(SubmitError::Storage)?;

        let message = QueueMessage {
            task_id: QueueMessage::task_id_for(&eval_id),
            eval_id: eval_id.clone(),
            code: request.code.clone(),
            language: request.language.clone(),
            engine: request.engine.clone(),
            timeout_secs: request.timeout_secs,
            priority,
            attempt: 0,
        };

        if let Err(e) = self.queues.push(queue, &message).await {
            // The row exists but nothing will ever dispatch it; fail it so
            // the caller's 503 matches what `get` will report.
            let _ = eval_db::mark_final_failure(&self.pg, &eval_id, "enqueue failed", 0).await;
            return Err(SubmitError::Enqueue(e));
        }

        let queue_position = self.queues.depth(queue).await.unwrap_or(0);

        if let Err(e) = self
            .publisher
            .publish(&EvalEvent::Queued {
                eval_id: eval_id.clone(),
                timestamp: Utc::now(),
                queue: queue.as_str().to_owned(),
                priority,
            })
            .await
        {
            tracing::warn!(eval_id = %eval_id, error = %e, "failed to publish queued event");
        }

        tracing::info!(
            eval_id = %eval_id,
            queue = %queue,
            priority,
            "evaluation submitted"
        );

        Ok(SubmitOutcome {
            eval_id,
            status: EvalStatus::Queued,
            queue,
            queue_position,
        })
    }

    /// Fetch an evaluation with its running info. `Ok(None)` is a definite
    /// not-found, distinct from storage errors.
    pub async fn get(&self, eval_id: &str) -> Result<Option<EvaluationDetail>> {
        let Some(evaluation) = eval_db::get_evaluation(&self.pg, eval_id).await? else {
            return Ok(None);
        };

        let running = if matches!(
            evaluation.status,
            EvalStatus::Provisioning | EvalStatus::Running
        ) {
            self.index.get(eval_id).await.unwrap_or(None)
        } else {
            None
        };

        Ok(Some(EvaluationDetail {
            evaluation,
            running,
        }))
    }

    /// Cancel an evaluation.
    ///
    /// `queued` and `provisioning` accept a soft cancel. `running` requires
    /// `force`: the record is transitioned directly (so the cancel holds
    /// even if the dispatcher died) and the cancel flag makes a live
    /// dispatcher abandon its executor wait. Terminal states are an
    /// idempotent no-op.
    pub async fn cancel(&self, eval_id: &str, force: bool) -> Result<Option<CancelOutcome>> {
        let Some(evaluation) = eval_db::get_evaluation(&self.pg, eval_id).await? else {
            return Ok(None);
        };
        let previous_status = evaluation.status;

        let outcome = match previous_status {
            status if status.is_terminal() => CancelOutcome {
                eval_id: eval_id.to_owned(),
                previous_status,
                cancelled: false,
                message: format!("evaluation already {status}"),
            },
            EvalStatus::Queued | EvalStatus::Provisioning => {
                // Raise the flag first so a dispatcher mid-claim observes it
                // even if our transition loses the race.
                dispatcher::request_cancel(&self.conn, eval_id)
                    .await
                    .context("failed to set cancel flag")?;

                let applied = EvalStateMachine::try_transition(
                    &self.pg,
                    eval_id,
                    previous_status,
                    EvalStatus::Cancelled,
                )
                .await?;

                if applied {
                    self.publish_cancelled(eval_id, previous_status).await;
                    let _ = self.index.clear(eval_id).await;
                    CancelOutcome {
                        eval_id: eval_id.to_owned(),
                        previous_status,
                        cancelled: true,
                        message: format!("evaluation cancelled (was {previous_status})"),
                    }
                } else {
                    CancelOutcome {
                        eval_id: eval_id.to_owned(),
                        previous_status,
                        cancelled: false,
                        message: "evaluation changed state during cancel; retry".to_owned(),
                    }
                }
            }
            EvalStatus::Running if !force => CancelOutcome {
                eval_id: eval_id.to_owned(),
                previous_status,
                cancelled: false,
                message: "evaluation is running; use force=true to terminate".to_owned(),
            },
            EvalStatus::Running => {
                dispatcher::request_cancel(&self.conn, eval_id)
                    .await
                    .context("failed to set cancel flag")?;

                let applied = EvalStateMachine::try_transition(
                    &self.pg,
                    eval_id,
                    EvalStatus::Running,
                    EvalStatus::Cancelled,
                )
                .await?;

                if applied {
                    self.publish_cancelled(eval_id, previous_status).await;
                    let _ = self.index.clear(eval_id).await;
                }

                CancelOutcome {
                    eval_id: eval_id.to_owned(),
                    previous_status,
                    cancelled: applied,
                    message: if applied {
                        "evaluation terminated (was running)".to_owned()
                    } else {
                        "evaluation finished before the forced cancel applied".to_owned()
                    },
                }
            }
            _ => unreachable!("all non-terminal statuses are matched above"),
        };

        Ok(Some(outcome))
    }

    /// Paginated listing straight off the durable store. Every row carries
    /// its live status.
    pub async fn list(
        &self,
        filter: &eval_db::EvaluationFilter,
    ) -> Result<(Vec<Evaluation>, i64)> {
        let evaluations = eval_db::list_evaluations(&self.pg, filter).await?;
        let total = eval_db::count_evaluations(&self.pg, filter).await?;
        Ok((evaluations, total))
    }

    /// Currently-running evaluations, cross-checked against the durable
    /// store.
    pub async fn list_running(&self) -> Result<Vec<RunningEntry>> {
        self.index.list_verified(&self.pg).await
    }

    async fn publish_cancelled(&self, eval_id: &str, previous_status: EvalStatus) {
        let event = EvalEvent::Cancelled {
            eval_id: eval_id.to_owned(),
            timestamp: Utc::now(),
            previous_status: previous_status.to_string(),
        };
        if let Err(e) = self.publisher.publish(&event).await {
            tracing::warn!(eval_id = %eval_id, error = %e, "failed to publish cancelled event");
        }
    }
}

/// Generate a printable, time-ordered evaluation id:
/// `eval_<yyyymmdd>_<hhmmss>_<8 hex>`.
pub fn generate_eval_id() -> String {
    let now = Utc::now();
    let mut suffix = [0u8; 4];
    rand::rng().fill_bytes(&mut suffix);
    format!(
        "eval_{}_{}",
        now.format("%Y%m%d_%H%M%S"),
        hex::encode(suffix)
    )
}
