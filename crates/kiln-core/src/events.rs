//! Lifecycle event fan-out.
//!
//! Every status change is published as JSON on a per-status Redis channel
//! (`evaluation:<status>`) and appended, best-effort, to the durable event
//! trail. Consumers must treat events as at-most-once delivery hints and
//! reconcile against the durable store; the running-index listener and the
//! periodic reconciler both do.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use kiln_db::queries::events as events_db;

/// Channel name prefix; the full channel is `evaluation:<status>`.
pub const CHANNEL_PREFIX: &str = "evaluation";

/// A lifecycle event, tagged by the status it announces.
///
/// The serialized form carries `status` as the tag plus the fields of the
/// variant, so every payload is `{eval_id, timestamp, status, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvalEvent {
    Queued {
        eval_id: String,
        timestamp: DateTime<Utc>,
        queue: String,
        priority: i32,
    },
    Provisioning {
        eval_id: String,
        timestamp: DateTime<Utc>,
        executor_url: String,
    },
    Running {
        eval_id: String,
        timestamp: DateTime<Utc>,
        executor_id: String,
        container_id: Option<String>,
        timeout_secs: u32,
    },
    Completed {
        eval_id: String,
        timestamp: DateTime<Utc>,
        exit_code: Option<i32>,
        runtime_ms: Option<i64>,
    },
    Failed {
        eval_id: String,
        timestamp: DateTime<Utc>,
        error: String,
    },
    Cancelled {
        eval_id: String,
        timestamp: DateTime<Utc>,
        previous_status: String,
    },
    Timeout {
        eval_id: String,
        timestamp: DateTime<Utc>,
        timeout_secs: u32,
    },
}

impl EvalEvent {
    /// The status tag this event announces.
    pub fn status_str(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Provisioning { .. } => "provisioning",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Whether this event announces a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. } | Self::Timeout { .. }
        )
    }

    /// The channel this event is published on.
    pub fn channel(&self) -> String {
        format!("{CHANNEL_PREFIX}:{}", self.status_str())
    }

    pub fn eval_id(&self) -> &str {
        match self {
            Self::Queued { eval_id, .. }
            | Self::Provisioning { eval_id, .. }
            | Self::Running { eval_id, .. }
            | Self::Completed { eval_id, .. }
            | Self::Failed { eval_id, .. }
            | Self::Cancelled { eval_id, .. }
            | Self::Timeout { eval_id, .. } => eval_id,
        }
    }
}

/// All lifecycle channels, for subscribers that want the full stream.
pub fn all_channels() -> Vec<String> {
    [
        "queued",
        "provisioning",
        "running",
        "completed",
        "failed",
        "cancelled",
        "timeout",
    ]
    .iter()
    .map(|s| format!("{CHANNEL_PREFIX}:{s}"))
    .collect()
}

/// Publishes lifecycle events to the broker and mirrors them into the
/// durable event trail.
#[derive(Clone)]
pub struct EventPublisher {
    conn: ConnectionManager,
    pg: PgPool,
}

impl EventPublisher {
    pub fn new(conn: ConnectionManager, pg: PgPool) -> Self {
        Self { conn, pg }
    }

    /// Publish an event.
    ///
    /// The broker publish is required; the durable-trail append is
    /// best-effort so that a storage hiccup cannot break the pipeline.
    pub async fn publish(&self, event: &EvalEvent) -> Result<()> {
        let payload = serde_json::to_string(event).context("failed to serialize event")?;
        let channel = event.channel();

        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(&channel, &payload)
            .await
            .with_context(|| format!("failed to publish event on {channel}"))?;

        tracing::debug!(
            eval_id = %event.eval_id(),
            channel = %channel,
            "published lifecycle event"
        );

        let trail = events_db::NewEvaluationEvent {
            eval_id: event.eval_id(),
            event_type: event.status_str(),
            message: None,
            payload: serde_json::to_value(event).unwrap_or_default(),
        };
        if let Err(e) = events_db::insert_event(&self.pg, &trail).await {
            tracing::warn!(
                eval_id = %event.eval_id(),
                error = %e,
                "failed to append event to durable trail (best-effort)"
            );
        }

        Ok(())
    }
}
