//! Typed client for the executor service.
//!
//! Executors run untrusted code inside an isolation sandbox and expose two
//! endpoints: `POST /execute` and `GET /health`. The execute call is the
//! only long-poll in the pipeline; its deadline is the evaluation timeout
//! plus a small margin so a wedged executor cannot hold a dispatcher slot
//! forever.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Extra headroom on top of the evaluation timeout for the execute call:
/// container startup plus result marshalling.
pub const EXECUTE_MARGIN: Duration = Duration::from_secs(10);

/// Outcome reported by the executor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Timeout,
}

/// Body of `POST /execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub eval_id: String,
    pub code: String,
    pub language: String,
    pub timeout_secs: u32,
}

/// Response of `POST /execute`.
///
/// `output` carries stdout and stderr merged, in stream order. `error` is
/// the executor's own error channel (sandbox failures, timeout notices).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub eval_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
    pub executor_id: String,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub runtime_ms: Option<i64>,
}

fn default_exit_code() -> i32 {
    -1
}

/// Errors from the executor call, split along the retry taxonomy: transport
/// problems and HTTP statuses classify through `retry`, payload problems are
/// always terminal.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor answered with a non-2xx status.
    #[error("executor returned HTTP {status}")]
    Status { status: u16 },
    /// Connect/read failure or deadline exceeded.
    #[error("executor transport error: {0}")]
    Transport(String),
    /// The executor answered 2xx but the body did not parse.
    #[error("malformed executor response: {0}")]
    Malformed(String),
}

/// HTTP client for executor services.
#[derive(Clone)]
pub struct ExecutorClient {
    client: reqwest::Client,
}

impl ExecutorClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Per-request deadlines are set at the call site; the builder only
        // bounds connection establishment.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }

    /// Run an evaluation on the given executor.
    ///
    /// The whole call is bounded by `timeout_secs + EXECUTE_MARGIN`.
    pub async fn execute(
        &self,
        executor_url: &str,
        request: &ExecuteRequest,
    ) -> Result<ExecuteResponse, ExecutorError> {
        let deadline = Duration::from_secs(request.timeout_secs as u64) + EXECUTE_MARGIN;

        let response = self
            .client
            .post(format!("{executor_url}/execute"))
            .timeout(deadline)
            .json(request)
            .send()
            .await
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Status {
                status: status.as_u16(),
            });
        }

        response
            .json::<ExecuteResponse>()
            .await
            .map_err(|e| ExecutorError::Malformed(e.to_string()))
    }
}
