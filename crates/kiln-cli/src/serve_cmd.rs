//! The kiln HTTP API: submission, retrieval, cancellation, listings, DLQ
//! administration, and platform status.

use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use kiln_core::controller::{Controller, SubmitError, SubmitRequest};
use kiln_core::dlq::DeadLetterQueue;
use kiln_core::pool::ExecutorPool;
use kiln_core::queue::TaskQueues;
use kiln_db::models::EvalStatus;
use kiln_db::queries::evaluations::{self as eval_db, EvaluationFilter, SortBy, SortOrder};
use kiln_db::queries::events as events_db;

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pg: PgPool,
    pub conn: ConnectionManager,
    pub controller: Controller,
    pub queues: TaskQueues,
    pub pool: ExecutorPool,
    pub dlq: DeadLetterQueue,
}

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/eval", post(submit_eval))
        .route("/api/eval/{id}", get(get_eval).delete(cancel_eval))
        .route("/api/eval/{id}/events", get(get_eval_events))
        .route("/api/eval/{id}/running", get(get_eval_running))
        .route("/api/evaluations", get(list_evaluations))
        .route("/api/evaluations/running", get(list_running))
        .route("/api/dlq/tasks", get(list_dlq_tasks))
        .route("/api/dlq/statistics", get(dlq_statistics))
        .route("/api/dlq/tasks/retry-batch", post(retry_dlq_batch))
        .route(
            "/api/dlq/tasks/{id}",
            get(get_dlq_task).delete(remove_dlq_task),
        )
        .route("/api/dlq/tasks/{id}/retry", post(retry_dlq_task))
        .route("/api/statistics", get(statistics))
        .route("/api/cleanup", post(cleanup))
        .route("/api/queues", get(queue_status))
        .route("/api/pool", get(pool_status))
        .route("/api/pool/recover", post(pool_recover))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("kiln api listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("kiln api shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Platform handlers
// ---------------------------------------------------------------------------

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "kiln",
        "endpoints": {
            "evaluate": "/api/eval",
            "evaluations": "/api/evaluations",
            "dlq": "/api/dlq/tasks",
            "statistics": "/api/statistics",
            "queues": "/api/queues",
            "pool": "/api/pool",
            "health": "/health",
        },
    }))
}

async fn health(State(state): State<AppState>) -> axum::response::Response {
    let mut conn = state.conn.clone();
    let broker_ok = redis::cmd("PING")
        .query_async::<String>(&mut conn)
        .await
        .is_ok();
    let db_ok = sqlx::query("SELECT 1").execute(&state.pg).await.is_ok();

    let healthy = broker_ok && db_ok;
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "services": { "broker": broker_ok, "database": db_ok },
        "timestamp": chrono::Utc::now(),
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Evaluation handlers
// ---------------------------------------------------------------------------

async fn submit_eval(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<axum::response::Response, AppError> {
    match state.controller.submit(&request).await {
        Ok(outcome) => Ok(Json(outcome).into_response()),
        Err(e @ (SubmitError::EmptyCode | SubmitError::InvalidTimeout)) => {
            Err(AppError::bad_request(e.to_string()))
        }
        Err(e @ SubmitError::Enqueue(_)) => Err(AppError::unavailable(e.to_string())),
        Err(SubmitError::Storage(e)) => Err(AppError::internal(e)),
    }
}

async fn get_eval(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let detail = state
        .controller
        .get(&id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("evaluation {id} not found")))?;

    Ok(Json(detail).into_response())
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    #[serde(default)]
    force: bool,
}

async fn cancel_eval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CancelParams>,
) -> Result<axum::response::Response, AppError> {
    let outcome = state
        .controller
        .cancel(&id, params.force)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("evaluation {id} not found")))?;

    Ok(Json(outcome).into_response())
}

async fn get_eval_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    eval_db::get_evaluation(&state.pg, &id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("evaluation {id} not found")))?;

    let events = events_db::list_events(&state.pg, &id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(events).into_response())
}

async fn get_eval_running(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let detail = state
        .controller
        .get(&id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("evaluation {id} not found")))?;

    let running = detail
        .running
        .ok_or_else(|| AppError::not_found(format!("evaluation {id} is not running")))?;
    Ok(Json(running).into_response())
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    language: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_sort_by")]
    sort_by: String,
    #[serde(default = "default_sort_order")]
    sort_order: String,
}

fn default_limit() -> i64 {
    100
}

fn default_sort_by() -> String {
    "created_at".to_owned()
}

fn default_sort_order() -> String {
    "desc".to_owned()
}

#[derive(Debug, Serialize)]
struct ListResponse {
    evaluations: Vec<kiln_db::models::Evaluation>,
    total: i64,
    limit: i64,
    offset: i64,
}

async fn list_evaluations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<axum::response::Response, AppError> {
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            s.parse::<EvalStatus>()
                .map_err(|e| AppError::bad_request(e.to_string()))?,
        ),
    };

    let filter = EvaluationFilter {
        status,
        language: params.language.filter(|l| !l.is_empty()),
        limit: params.limit.clamp(1, 1000),
        offset: params.offset.max(0),
        sort_by: SortBy::parse_or_default(&params.sort_by),
        sort_order: SortOrder::parse_or_default(&params.sort_order),
    };

    let (evaluations, total) = state
        .controller
        .list(&filter)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(ListResponse {
        evaluations,
        total,
        limit: filter.limit,
        offset: filter.offset,
    })
    .into_response())
}

async fn list_running(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let running = state
        .controller
        .list_running()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(running).into_response())
}

// ---------------------------------------------------------------------------
// DLQ handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DlqListParams {
    #[serde(default = "default_dlq_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    eval_id: Option<String>,
}

fn default_dlq_limit() -> usize {
    100
}

async fn list_dlq_tasks(
    State(state): State<AppState>,
    Query(params): Query<DlqListParams>,
) -> Result<axum::response::Response, AppError> {
    let tasks = state
        .dlq
        .list(
            params.limit.clamp(1, 1000),
            params.offset,
            params.eval_id.as_deref(),
        )
        .await
        .map_err(AppError::internal)?;
    Ok(Json(tasks).into_response())
}

async fn dlq_statistics(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let stats = state.dlq.statistics().await.map_err(AppError::internal)?;
    Ok(Json(stats).into_response())
}

async fn get_dlq_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let task = state
        .dlq
        .get(&id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found in DLQ")))?;
    Ok(Json(task).into_response())
}

async fn retry_dlq_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let retried = state
        .dlq
        .retry(&id, &state.queues)
        .await
        .map_err(AppError::internal)?;

    if !retried {
        return Err(AppError::not_found(format!("task {id} not found in DLQ")));
    }
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": format!("task {id} resubmitted from DLQ"),
        "task_id": id,
    }))
    .into_response())
}

async fn remove_dlq_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let removed = state.dlq.remove(&id).await.map_err(AppError::internal)?;
    if !removed {
        return Err(AppError::not_found(format!("task {id} not found in DLQ")));
    }
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": format!("task {id} removed from DLQ"),
    }))
    .into_response())
}

#[derive(Debug, Serialize)]
struct RetryBatchResponse {
    total: usize,
    succeeded: Vec<String>,
    failed: Vec<String>,
}

async fn retry_dlq_batch(
    State(state): State<AppState>,
    Json(task_ids): Json<Vec<String>>,
) -> Result<axum::response::Response, AppError> {
    if task_ids.is_empty() {
        return Err(AppError::bad_request("no task IDs provided"));
    }
    if task_ids.len() > 100 {
        return Err(AppError::bad_request(
            "maximum 100 tasks can be retried at once",
        ));
    }

    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for task_id in &task_ids {
        match state.dlq.retry(task_id, &state.queues).await {
            Ok(true) => succeeded.push(task_id.clone()),
            Ok(false) => failed.push(task_id.clone()),
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "batch retry failed");
                failed.push(task_id.clone());
            }
        }
    }

    Ok(Json(RetryBatchResponse {
        total: task_ids.len(),
        succeeded,
        failed,
    })
    .into_response())
}

// ---------------------------------------------------------------------------
// Maintenance handlers
// ---------------------------------------------------------------------------

async fn statistics(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let stats = eval_db::statistics(&state.pg)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(stats).into_response())
}

#[derive(Debug, Deserialize)]
struct CleanupParams {
    #[serde(default = "default_older_than_days")]
    older_than_days: i32,
    #[serde(default = "default_dry_run")]
    dry_run: bool,
}

fn default_older_than_days() -> i32 {
    30
}

fn default_dry_run() -> bool {
    true
}

async fn cleanup(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> Result<axum::response::Response, AppError> {
    if params.older_than_days < 1 {
        return Err(AppError::bad_request("older_than_days must be at least 1"));
    }
    let affected = eval_db::cleanup_old(&state.pg, params.older_than_days, params.dry_run)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(serde_json::json!({
        "older_than_days": params.older_than_days,
        "dry_run": params.dry_run,
        "affected": affected,
    }))
    .into_response())
}

async fn queue_status(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let depths = state.queues.depths().await.map_err(AppError::internal)?;
    let body: serde_json::Map<String, serde_json::Value> = depths
        .into_iter()
        .map(|(queue, depth)| (queue.as_str().to_owned(), depth.into()))
        .collect();
    Ok(Json(body).into_response())
}

async fn pool_status(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let status = state.pool.status().await.map_err(AppError::internal)?;
    Ok(Json(status).into_response())
}

async fn pool_recover(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let urls = kiln_core::config::KilnConfig::from_env().executor_urls();
    let recovered = state
        .pool
        .recover_stale(&urls)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "recovered": recovered })).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
