//! Dead-letter queue for tasks that exhausted their retries.
//!
//! The queue body is a Redis list in failure order; a per-task metadata hash
//! (30-day TTL) serves listings and filtering without deserializing bodies.
//! The divergence is deliberate: an expired metadata key degrades filtering,
//! while the body stays until an operator retries or purges it.
//!
//! Lookups by id are O(n) scans over the queue body. Acceptable while the
//! DLQ stays small; a secondary task_id -> payload index is the upgrade path
//! if it grows.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use crate::queue::{QueueMessage, QueueName, TaskQueues};

/// Queue body list.
pub const DLQ_KEY: &str = "dlq:tasks";
/// Prefix of per-task metadata hashes.
pub const DLQ_META_PREFIX: &str = "dlq:tasks:meta:";

/// Default metadata retention.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Rows sampled for statistics.
const STATISTICS_SAMPLE: i64 = 1000;

/// Monitor alarm threshold on total queue size.
pub const ALARM_QUEUE_SIZE: i64 = 100;
/// Monitor alarm threshold on a single exception class.
pub const ALARM_EXCEPTION_COUNT: i64 = 10;

/// A task parked in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterTask {
    pub task_id: String,
    pub task_name: String,
    pub eval_id: String,
    /// Queue the task was consumed from; retries resubmit here.
    pub queue: QueueName,
    /// The original message, kept verbatim for resubmission.
    pub message: QueueMessage,
    pub exception_class: String,
    pub exception_message: String,
    pub retry_count: u32,
    pub first_failure_time: DateTime<Utc>,
    pub last_failure_time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Listing row assembled from metadata (or the body when filtering is not
/// needed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqTaskSummary {
    pub task_id: String,
    pub eval_id: String,
    pub task_name: String,
    pub exception_class: String,
    pub retry_count: u32,
    pub added_at: String,
}

/// Aggregate DLQ statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DlqStatistics {
    pub queue_size: i64,
    pub exception_breakdown: HashMap<String, i64>,
    pub task_breakdown: HashMap<String, i64>,
    pub sample_size: i64,
}

/// Handle to the dead-letter queue.
#[derive(Clone)]
pub struct DeadLetterQueue {
    conn: ConnectionManager,
    retention_days: i64,
}

impl DeadLetterQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    fn meta_key(task_id: &str) -> String {
        format!("{DLQ_META_PREFIX}{task_id}")
    }

    /// Park a task. Idempotent per task id: a second add for the same id
    /// refreshes the metadata but never duplicates the queue body.
    ///
    /// Returns `true` when a new body was appended.
    pub async fn add(&self, task: &DeadLetterTask) -> Result<bool> {
        let mut conn = self.conn.clone();
        let meta_key = Self::meta_key(&task.task_id);

        let already_parked: bool = conn
            .exists(&meta_key)
            .await
            .context("failed to check DLQ metadata")?;

        if !already_parked {
            let payload = serde_json::to_string(task).context("failed to serialize DLQ task")?;
            let _: () = conn
                .rpush(DLQ_KEY, payload)
                .await
                .context("failed to append to DLQ")?;
        }

        let meta: Vec<(&str, String)> = vec![
            ("eval_id", task.eval_id.clone()),
            ("task_name", task.task_name.clone()),
            ("exception_class", task.exception_class.clone()),
            ("retry_count", task.retry_count.to_string()),
            ("added_at", task.last_failure_time.to_rfc3339()),
        ];
        let _: () = conn
            .hset_multiple(&meta_key, &meta)
            .await
            .context("failed to write DLQ metadata")?;
        let _: () = conn
            .expire(&meta_key, self.retention_days * 24 * 60 * 60)
            .await
            .context("failed to set DLQ metadata TTL")?;

        if already_parked {
            tracing::debug!(task_id = %task.task_id, "DLQ add was idempotent (already parked)");
        } else {
            tracing::warn!(
                task_id = %task.task_id,
                eval_id = %task.eval_id,
                retries = task.retry_count,
                exception = %task.exception_class,
                "task added to dead-letter queue"
            );
        }

        Ok(!already_parked)
    }

    /// Fetch a parked task by id. Linear scan over the queue body.
    pub async fn get(&self, task_id: &str) -> Result<Option<DeadLetterTask>> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(DLQ_KEY).await.context("failed to read DLQ length")?;

        for i in 0..len {
            let raw: Option<String> = conn.lindex(DLQ_KEY, i as isize).await?;
            let Some(raw) = raw else { break };
            match serde_json::from_str::<DeadLetterTask>(&raw) {
                Ok(task) if task.task_id == task_id => return Ok(Some(task)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(index = i, error = %e, "skipping malformed DLQ entry");
                }
            }
        }

        Ok(None)
    }

    /// List parked tasks.
    ///
    /// Without a filter this pages over the queue body in insertion order.
    /// With `eval_id` it scans the metadata hashes instead, so results for
    /// entries whose metadata expired are not returned by the filtered path.
    pub async fn list(
        &self,
        limit: usize,
        offset: usize,
        eval_id: Option<&str>,
    ) -> Result<Vec<DlqTaskSummary>> {
        let mut conn = self.conn.clone();

        if let Some(eval_id) = eval_id {
            let mut summaries = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(format!("{DLQ_META_PREFIX}*"))
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await
                    .context("failed to scan DLQ metadata")?;

                for key in keys {
                    let meta: HashMap<String, String> = conn.hgetall(&key).await?;
                    if meta.get("eval_id").map(String::as_str) != Some(eval_id) {
                        continue;
                    }
                    let task_id = key.trim_start_matches(DLQ_META_PREFIX).to_owned();
                    summaries.push(summary_from_meta(task_id, &meta));
                    if summaries.len() >= limit {
                        return Ok(summaries);
                    }
                }

                if next == 0 {
                    break;
                }
                cursor = next;
            }
            return Ok(summaries);
        }

        let start = offset as isize;
        let end = (offset + limit) as isize - 1;
        let raws: Vec<String> = conn
            .lrange(DLQ_KEY, start, end)
            .await
            .context("failed to page DLQ")?;

        let mut summaries = Vec::with_capacity(raws.len());
        for raw in raws {
            match serde_json::from_str::<DeadLetterTask>(&raw) {
                Ok(task) => summaries.push(DlqTaskSummary {
                    task_id: task.task_id,
                    eval_id: task.eval_id,
                    task_name: task.task_name,
                    exception_class: task.exception_class,
                    retry_count: task.retry_count,
                    added_at: task.last_failure_time.to_rfc3339(),
                }),
                Err(e) => tracing::warn!(error = %e, "skipping malformed DLQ entry"),
            }
        }

        Ok(summaries)
    }

    /// Retry a parked task: remove it from the DLQ and resubmit the original
    /// message to its queue with a fresh attempt budget.
    ///
    /// Returns `false` when the task is not parked.
    pub async fn retry(&self, task_id: &str, queues: &TaskQueues) -> Result<bool> {
        let Some(task) = self.get(task_id).await? else {
            tracing::warn!(task_id = %task_id, "DLQ retry: task not found");
            return Ok(false);
        };

        self.remove_body_and_meta(&task).await?;

        let mut message = task.message.clone();
        message.attempt = 0;
        queues
            .push(task.queue, &message)
            .await
            .with_context(|| format!("failed to resubmit DLQ task {task_id}"))?;

        tracing::info!(task_id = %task_id, queue = %task.queue, "task resubmitted from DLQ");
        Ok(true)
    }

    /// Permanently remove a parked task. Returns `false` when not found.
    pub async fn remove(&self, task_id: &str) -> Result<bool> {
        let Some(task) = self.get(task_id).await? else {
            return Ok(false);
        };
        self.remove_body_and_meta(&task).await?;
        tracing::info!(task_id = %task_id, "task removed from DLQ");
        Ok(true)
    }

    async fn remove_body_and_meta(&self, task: &DeadLetterTask) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(task)?;
        let _: i64 = conn
            .lrem(DLQ_KEY, 1, payload)
            .await
            .context("failed to remove DLQ body")?;
        let _: () = conn
            .del(Self::meta_key(&task.task_id))
            .await
            .context("failed to remove DLQ metadata")?;
        Ok(())
    }

    /// Aggregate statistics over (a sample of) the queue.
    pub async fn statistics(&self) -> Result<DlqStatistics> {
        let mut conn = self.conn.clone();
        let queue_size: i64 = conn.llen(DLQ_KEY).await.context("failed to read DLQ length")?;

        let sample_size = queue_size.min(STATISTICS_SAMPLE);
        let raws: Vec<String> = conn.lrange(DLQ_KEY, 0, (sample_size - 1) as isize).await?;

        let mut exception_breakdown: HashMap<String, i64> = HashMap::new();
        let mut task_breakdown: HashMap<String, i64> = HashMap::new();
        for raw in &raws {
            match serde_json::from_str::<DeadLetterTask>(raw) {
                Ok(task) => {
                    *exception_breakdown.entry(task.exception_class).or_insert(0) += 1;
                    *task_breakdown.entry(task.task_name).or_insert(0) += 1;
                }
                Err(_) => {
                    *exception_breakdown.entry("Unknown".to_owned()).or_insert(0) += 1;
                }
            }
        }

        Ok(DlqStatistics {
            queue_size,
            exception_breakdown,
            task_breakdown,
            sample_size,
        })
    }

    /// Periodic monitor pass: compute statistics and warn when thresholds
    /// are exceeded.
    pub async fn monitor(&self) -> Result<DlqStatistics> {
        let stats = self.statistics().await?;

        if stats.queue_size > ALARM_QUEUE_SIZE {
            tracing::warn!(
                queue_size = stats.queue_size,
                "DLQ size exceeds threshold; investigation needed"
            );
        }
        for (exception, count) in &stats.exception_breakdown {
            if *count > ALARM_EXCEPTION_COUNT {
                tracing::warn!(
                    exception = %exception,
                    count,
                    "high frequency of one exception class in DLQ"
                );
            }
        }

        Ok(stats)
    }
}

fn summary_from_meta(task_id: String, meta: &HashMap<String, String>) -> DlqTaskSummary {
    DlqTaskSummary {
        task_id,
        eval_id: meta.get("eval_id").cloned().unwrap_or_default(),
        task_name: meta.get("task_name").cloned().unwrap_or_default(),
        exception_class: meta.get("exception_class").cloned().unwrap_or_default(),
        retry_count: meta
            .get("retry_count")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        added_at: meta.get("added_at").cloned().unwrap_or_default(),
    }
}
