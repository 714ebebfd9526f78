//! Priority task queues on Redis lists.
//!
//! Redis has no native priority queues, so kiln keeps one list per priority
//! band and the dispatcher polls them with a single multi-key `BRPOP` in
//! descending priority order. `BRPOP` pops from the first non-empty key in
//! argument order, which yields strict priority on every poll: no message
//! leaves `evaluation` or `low_priority` while `high_priority` is non-empty.
//! Within a queue, `LPUSH` + `BRPOP` is FIFO.
//!
//! Known limitation: strict ordering holds per poll, not across an entire
//! burst -- a high-priority message enqueued after a lower one was already
//! popped does not preempt the in-flight dispatch.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

/// Prefix for stable task ids derived from eval ids.
pub const TASK_ID_PREFIX: &str = "task";

/// The priority queues, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    HighPriority,
    Evaluation,
    LowPriority,
}

impl QueueName {
    /// All queues in strict descending priority order. This ordering is
    /// load-bearing: it is the key order handed to `BRPOP`.
    pub const ALL: [QueueName; 3] = [
        QueueName::HighPriority,
        QueueName::Evaluation,
        QueueName::LowPriority,
    ];

    /// Logical queue name, as used in configuration and the API.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HighPriority => "high_priority",
            Self::Evaluation => "evaluation",
            Self::LowPriority => "low_priority",
        }
    }

    /// Redis key backing this queue.
    pub fn key(self) -> String {
        format!("queue:{}", self.as_str())
    }

    /// Parse a logical queue name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high_priority" => Some(Self::HighPriority),
            "evaluation" => Some(Self::Evaluation),
            "low_priority" => Some(Self::LowPriority),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of dispatchable work.
///
/// `task_id` is stable across retries and DLQ resubmission so that
/// cancellation and dead-letter bookkeeping can always find the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub task_id: String,
    pub eval_id: String,
    pub code: String,
    pub language: String,
    pub engine: String,
    pub timeout_secs: u32,
    pub priority: i32,
    /// Zero-based dispatch attempt counter, bumped on each retryable failure.
    #[serde(default)]
    pub attempt: u32,
}

impl QueueMessage {
    /// Derive the stable task id for an evaluation.
    pub fn task_id_for(eval_id: &str) -> String {
        format!("{TASK_ID_PREFIX}-{eval_id}")
    }
}

/// Handle to the task queues.
///
/// Clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct TaskQueues {
    conn: ConnectionManager,
}

impl TaskQueues {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Enqueue a message at the head of its queue (FIFO with [`Self::pop`]).
    pub async fn push(&self, queue: QueueName, message: &QueueMessage) -> Result<()> {
        let payload = serde_json::to_string(message).context("failed to serialize queue message")?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(queue.key(), payload)
            .await
            .with_context(|| format!("failed to push onto {queue}"))?;
        Ok(())
    }

    /// Block until a message is available on any queue, honoring strict
    /// priority: `BRPOP` scans the keys in the order given and pops from the
    /// first non-empty list.
    ///
    /// Returns `None` on timeout, so callers can check for shutdown between
    /// polls. The timeout should stay short (1-5 s).
    ///
    /// `BRPOP` blocks the whole connection server-side, so a consumer loop
    /// must run on a [`TaskQueues`] built from its own dedicated connection,
    /// never the one shared with publishers and the pool.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<(QueueName, QueueMessage)>> {
        let keys: Vec<String> = QueueName::ALL.iter().map(|q| q.key()).collect();
        let mut conn = self.conn.clone();

        let popped: Option<(String, String)> = conn
            .brpop(&keys, timeout.as_secs_f64())
            .await
            .context("failed to poll task queues")?;

        let Some((key, payload)) = popped else {
            return Ok(None);
        };

        let queue = QueueName::ALL
            .into_iter()
            .find(|q| q.key() == key)
            .with_context(|| format!("BRPOP returned unknown queue key {key}"))?;

        let message: QueueMessage = serde_json::from_str(&payload)
            .with_context(|| format!("malformed message on {queue}"))?;

        Ok(Some((queue, message)))
    }

    /// Re-enqueue a message after a delay without blocking the caller.
    ///
    /// The countdown runs on a spawned task; the message lands at the head
    /// of its queue once the delay elapses.
    pub fn requeue_after(&self, queue: QueueName, message: QueueMessage, delay: Duration) {
        let queues = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queues.push(queue, &message).await {
                tracing::error!(
                    eval_id = %message.eval_id,
                    queue = %queue,
                    error = %e,
                    "failed to requeue message after countdown"
                );
            }
        });
    }

    /// Number of messages waiting on one queue.
    pub async fn depth(&self, queue: QueueName) -> Result<i64> {
        let mut conn = self.conn.clone();
        let len: i64 = conn
            .llen(queue.key())
            .await
            .with_context(|| format!("failed to read depth of {queue}"))?;
        Ok(len)
    }

    /// Depth of every queue, highest priority first.
    pub async fn depths(&self) -> Result<Vec<(QueueName, i64)>> {
        let mut out = Vec::with_capacity(QueueName::ALL.len());
        for queue in QueueName::ALL {
            out.push((queue, self.depth(queue).await?));
        }
        Ok(out)
    }
}
