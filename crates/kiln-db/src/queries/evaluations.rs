//! Database query functions for the `evaluations` table.
//!
//! Status changes go through [`transition_status`] / [`record_result`], which
//! use optimistic locking (`WHERE status = $from`) so that concurrent
//! dispatchers can never move a row backwards out of a terminal state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{EvalStatus, Evaluation, EvaluationStatistics};

/// Fields required to create a new evaluation row.
#[derive(Debug, Clone)]
pub struct NewEvaluation<'a> {
    pub id: &'a str,
    pub code: &'a str,
    pub language: &'a str,
    pub engine: &'a str,
    pub timeout_secs: i32,
    pub priority: i32,
}

/// Terminal result payload written by [`record_result`].
#[derive(Debug, Clone, Default)]
pub struct EvalResult {
    pub output: Option<String>,
    pub error: Option<String>,
    pub output_truncated: bool,
    pub error_truncated: bool,
    pub output_size: Option<i64>,
    pub error_size: Option<i64>,
    pub output_location: Option<String>,
    pub error_location: Option<String>,
    pub exit_code: Option<i32>,
    pub runtime_ms: Option<i64>,
}

/// Filtering, pagination, and sort parameters for [`list_evaluations`].
#[derive(Debug, Clone)]
pub struct EvaluationFilter {
    pub status: Option<EvalStatus>,
    pub language: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl Default for EvaluationFilter {
    fn default() -> Self {
        Self {
            status: None,
            language: None,
            limit: 100,
            offset: 0,
            sort_by: SortBy::CreatedAt,
            sort_order: SortOrder::Desc,
        }
    }
}

/// Whitelisted sort columns. The column name is interpolated into the SQL,
/// so it must never come from user input directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    CreatedAt,
    CompletedAt,
    Status,
    Priority,
    RuntimeMs,
}

impl SortBy {
    fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::CompletedAt => "completed_at",
            Self::Status => "status",
            Self::Priority => "priority",
            Self::RuntimeMs => "runtime_ms",
        }
    }

    /// Parse a user-supplied sort field, falling back to `created_at`.
    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "completed_at" => Self::CompletedAt,
            "status" => Self::Status,
            "priority" => Self::Priority,
            "runtime_ms" => Self::RuntimeMs,
            _ => Self::CreatedAt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "asc" => Self::Asc,
            _ => Self::Desc,
        }
    }
}

/// Insert a new evaluation row in `queued` status. Returns the inserted row
/// with server-generated defaults.
pub async fn insert_evaluation(pool: &PgPool, new: &NewEvaluation<'_>) -> Result<Evaluation> {
    let eval = sqlx::query_as::<_, Evaluation>(
        "INSERT INTO evaluations (id, code, language, engine, timeout_secs, priority) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.code)
    .bind(new.language)
    .bind(new.engine)
    .bind(new.timeout_secs)
    .bind(new.priority)
    .fetch_one(pool)
    .await
    .context("failed to insert evaluation")?;

    Ok(eval)
}

/// Fetch a single evaluation by ID.
pub async fn get_evaluation(pool: &PgPool, id: &str) -> Result<Option<Evaluation>> {
    let eval = sqlx::query_as::<_, Evaluation>("SELECT * FROM evaluations WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch evaluation")?;

    Ok(eval)
}

/// List evaluations with filtering, pagination, and sorting.
///
/// The returned rows carry their live status straight from the table; the
/// listing never substitutes a placeholder.
pub async fn list_evaluations(pool: &PgPool, filter: &EvaluationFilter) -> Result<Vec<Evaluation>> {
    let query = format!(
        "SELECT * FROM evaluations \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR language = $2) \
         ORDER BY {} {} \
         LIMIT $3 OFFSET $4",
        filter.sort_by.column(),
        filter.sort_order.keyword(),
    );

    let evals = sqlx::query_as::<_, Evaluation>(&query)
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.language.as_deref())
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(pool)
        .await
        .context("failed to list evaluations")?;

    Ok(evals)
}

/// Count evaluations matching the filter (ignoring pagination).
pub async fn count_evaluations(pool: &PgPool, filter: &EvaluationFilter) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM evaluations \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR language = $2)",
    )
    .bind(filter.status.map(|s| s.to_string()))
    .bind(filter.language.as_deref())
    .fetch_one(pool)
    .await
    .context("failed to count evaluations")?;

    Ok(row.0)
}

/// Atomically transition an evaluation from one status to another.
///
/// Uses optimistic locking: the UPDATE only applies while the current status
/// still equals `from`. Returns the number of rows affected (0 means the
/// status did not match or the row does not exist).
///
/// Timestamps: `started_at` is stamped on entry to `running`; `completed_at`
/// on entry to any terminal status. `executor_id` is cleared on terminal
/// transitions -- it is only meaningful in {provisioning, running}.
pub async fn transition_status(
    pool: &PgPool,
    id: &str,
    from: EvalStatus,
    to: EvalStatus,
) -> Result<u64> {
    let started_at: Option<DateTime<Utc>> = (to == EvalStatus::Running).then(Utc::now);
    let completed_at: Option<DateTime<Utc>> = to.is_terminal().then(Utc::now);

    let result = sqlx::query(
        "UPDATE evaluations \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at), \
             executor_id = CASE WHEN $4 THEN NULL ELSE executor_id END \
         WHERE id = $5 AND status = $6",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(to.is_terminal())
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition evaluation status")?;

    Ok(result.rows_affected())
}

/// Record which executor is handling the evaluation.
///
/// Only applies while the row is in `provisioning` or `running`.
pub async fn set_executor(
    pool: &PgPool,
    id: &str,
    executor_id: &str,
    container_id: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE evaluations \
         SET executor_id = $1, container_id = COALESCE($2, container_id) \
         WHERE id = $3 AND status IN ('provisioning', 'running')",
    )
    .bind(executor_id)
    .bind(container_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set executor on evaluation")?;

    Ok(result.rows_affected())
}

/// Transition to a terminal status and write the result payload in one
/// statement, still guarded by the optimistic `from` check.
pub async fn record_result(
    pool: &PgPool,
    id: &str,
    from: EvalStatus,
    to: EvalStatus,
    result: &EvalResult,
) -> Result<u64> {
    anyhow::ensure!(to.is_terminal(), "record_result requires a terminal status");

    let rows = sqlx::query(
        "UPDATE evaluations \
         SET status = $1, \
             output = $2, error = $3, \
             output_truncated = $4, error_truncated = $5, \
             output_size = $6, error_size = $7, \
             output_location = $8, error_location = $9, \
             exit_code = $10, runtime_ms = $11, \
             executor_id = NULL, \
             completed_at = now() \
         WHERE id = $12 AND status = $13",
    )
    .bind(to)
    .bind(result.output.as_deref())
    .bind(result.error.as_deref())
    .bind(result.output_truncated)
    .bind(result.error_truncated)
    .bind(result.output_size)
    .bind(result.error_size)
    .bind(result.output_location.as_deref())
    .bind(result.error_location.as_deref())
    .bind(result.exit_code)
    .bind(result.runtime_ms)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to record evaluation result")?;

    Ok(rows.rows_affected())
}

/// Re-open a failed evaluation for a fresh run.
///
/// This is the operator-override edge used when a task is resubmitted from
/// the dead-letter queue: the terminal `failed` status is the only one that
/// may be re-opened, and only back to `queued`. All result fields are
/// cleared so the new lifecycle starts from a clean record.
pub async fn reopen_failed(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE evaluations \
         SET status = 'queued', final_failure = FALSE, \
             output = NULL, error = NULL, \
             output_truncated = FALSE, error_truncated = FALSE, \
             output_size = NULL, error_size = NULL, \
             output_location = NULL, error_location = NULL, \
             exit_code = NULL, runtime_ms = NULL, \
             executor_id = NULL, container_id = NULL, \
             started_at = NULL, completed_at = NULL \
         WHERE id = $1 AND status = 'failed'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to re-open failed evaluation")?;

    Ok(result.rows_affected())
}

/// Bump the retry counter after a failed dispatch attempt.
pub async fn increment_retries(pool: &PgPool, id: &str) -> Result<()> {
    sqlx::query("UPDATE evaluations SET retries = retries + 1 WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to increment retries")?;

    Ok(())
}

/// Best-effort final-failure marker used by the dead-letter path.
///
/// Unlike [`record_result`] this does not pin the prior status: by the time
/// retries are exhausted the row may be in `queued` (after a requeue) or
/// `provisioning`, and the DLQ trail must still be written.
pub async fn mark_final_failure(pool: &PgPool, id: &str, error: &str, retries: i32) -> Result<u64> {
    let rows = sqlx::query(
        "UPDATE evaluations \
         SET status = 'failed', error = $1, retries = $2, final_failure = TRUE, \
             executor_id = NULL, completed_at = now() \
         WHERE id = $3 AND status NOT IN ('completed', 'failed', 'cancelled', 'timeout')",
    )
    .bind(error)
    .bind(retries)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark final failure")?;

    Ok(rows.rows_affected())
}

/// Aggregate statistics across all evaluations.
pub async fn statistics(pool: &PgPool) -> Result<EvaluationStatistics> {
    let row: (i64, i64, i64, i64, i64, i64, i64, i64, Option<f64>) = sqlx::query_as(
        "SELECT COUNT(*), \
                COUNT(*) FILTER (WHERE status = 'queued'), \
                COUNT(*) FILTER (WHERE status = 'provisioning'), \
                COUNT(*) FILTER (WHERE status = 'running'), \
                COUNT(*) FILTER (WHERE status = 'completed'), \
                COUNT(*) FILTER (WHERE status = 'failed'), \
                COUNT(*) FILTER (WHERE status = 'cancelled'), \
                COUNT(*) FILTER (WHERE status = 'timeout'), \
                CAST(AVG(runtime_ms) FILTER (WHERE status = 'completed') AS double precision) \
         FROM evaluations",
    )
    .fetch_one(pool)
    .await
    .context("failed to compute evaluation statistics")?;

    Ok(EvaluationStatistics {
        total: row.0,
        queued: row.1,
        provisioning: row.2,
        running: row.3,
        completed: row.4,
        failed: row.5,
        cancelled: row.6,
        timeout: row.7,
        avg_runtime_ms: row.8,
    })
}

/// Delete terminal evaluations older than the given number of days.
///
/// With `dry_run` the matching rows are only counted.
pub async fn cleanup_old(pool: &PgPool, older_than_days: i32, dry_run: bool) -> Result<i64> {
    if dry_run {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM evaluations \
             WHERE status IN ('completed', 'failed', 'cancelled', 'timeout') \
               AND created_at < now() - make_interval(days => $1)",
        )
        .bind(older_than_days)
        .fetch_one(pool)
        .await
        .context("failed to count old evaluations")?;
        return Ok(row.0);
    }

    let result = sqlx::query(
        "DELETE FROM evaluations \
         WHERE status IN ('completed', 'failed', 'cancelled', 'timeout') \
           AND created_at < now() - make_interval(days => $1)",
    )
    .bind(older_than_days)
    .execute(pool)
    .await
    .context("failed to delete old evaluations")?;

    Ok(result.rows_affected() as i64)
}
