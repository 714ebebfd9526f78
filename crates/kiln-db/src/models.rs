use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of an evaluation.
///
/// Transitions are restricted to the edges enforced by
/// `kiln_core::state::EvalStateMachine`:
///
/// ```text
/// queued       -> provisioning | cancelled
/// provisioning -> running | cancelled | failed
/// running      -> completed | failed | cancelled | timeout
/// ```
///
/// `completed`, `failed`, `cancelled`, and `timeout` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Queued,
    Provisioning,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl EvalStatus {
    /// Whether this status is absorbing: once reached, the record is never
    /// mutated again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for EvalStatus {
    type Err = EvalStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "provisioning" => Ok(Self::Provisioning),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(EvalStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EvalStatus`] string.
#[derive(Debug, Clone)]
pub struct EvalStatusParseError(pub String);

impl fmt::Display for EvalStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid evaluation status: {:?}", self.0)
    }
}

impl std::error::Error for EvalStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// An evaluation -- one user-submitted code run.
///
/// `output` and `error` hold at most the preview cap (default 1 MiB); when a
/// stream exceeds the cap the full body is spilled to the blob store, the
/// `*_location` column points at it, and `*_truncated` is set.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Evaluation {
    pub id: String,
    pub code: String,
    pub language: String,
    pub engine: String,
    pub timeout_secs: i32,
    pub priority: i32,
    pub status: EvalStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub output_truncated: bool,
    pub error_truncated: bool,
    pub output_size: Option<i64>,
    pub error_size: Option<i64>,
    pub output_location: Option<String>,
    pub error_location: Option<String>,
    pub exit_code: Option<i32>,
    pub executor_id: Option<String>,
    pub container_id: Option<String>,
    pub runtime_ms: Option<i64>,
    pub retries: i32,
    pub final_failure: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One entry in an evaluation's event trail.
///
/// Mirrors the pub/sub lifecycle events so the history survives broker
/// restarts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EvaluationEvent {
    pub id: i64,
    pub eval_id: String,
    pub event_type: String,
    pub message: Option<String>,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate counts returned by the statistics query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationStatistics {
    pub total: i64,
    pub queued: i64,
    pub provisioning: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub timeout: i64,
    pub avg_runtime_ms: Option<f64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_status_display_roundtrip() {
        let variants = [
            EvalStatus::Queued,
            EvalStatus::Provisioning,
            EvalStatus::Running,
            EvalStatus::Completed,
            EvalStatus::Failed,
            EvalStatus::Cancelled,
            EvalStatus::Timeout,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: EvalStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn eval_status_invalid() {
        let result = "exploded".parse::<EvalStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(EvalStatus::Completed.is_terminal());
        assert!(EvalStatus::Failed.is_terminal());
        assert!(EvalStatus::Cancelled.is_terminal());
        assert!(EvalStatus::Timeout.is_terminal());
        assert!(!EvalStatus::Queued.is_terminal());
        assert!(!EvalStatus::Provisioning.is_terminal());
        assert!(!EvalStatus::Running.is_terminal());
    }

    #[test]
    fn eval_status_serde_is_snake_case() {
        let json = serde_json::to_string(&EvalStatus::Provisioning).unwrap();
        assert_eq!(json, "\"provisioning\"");
    }
}
