//! Retry policies: exponential backoff with jitter, and error
//! classification.
//!
//! The dispatcher never drives retries through exceptions; it classifies a
//! failure, asks the policy for a delay, and returns a requeue disposition.

use std::time::Duration;

use rand::Rng;

/// Multiplicative jitter bound: up to 25% is added to the computed delay.
pub const JITTER_MAX: f64 = 0.25;

/// A named backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub name: &'static str,
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub exponential_base: f64,
    pub max_delay_secs: f64,
    pub jitter: bool,
}

/// Default policy: 5 attempts, 2 s base, doubling, capped at 5 minutes.
pub const DEFAULT: RetryPolicy = RetryPolicy {
    name: "default",
    max_retries: 5,
    base_delay_secs: 2.0,
    exponential_base: 2.0,
    max_delay_secs: 300.0,
    jitter: true,
};

/// Aggressive policy for rate-limited dependencies: more attempts, gentler
/// growth, higher cap.
pub const AGGRESSIVE: RetryPolicy = RetryPolicy {
    name: "aggressive",
    max_retries: 10,
    base_delay_secs: 1.0,
    exponential_base: 1.5,
    max_delay_secs: 600.0,
    jitter: true,
};

/// Conservative policy: few attempts, no jitter, tight cap.
pub const CONSERVATIVE: RetryPolicy = RetryPolicy {
    name: "conservative",
    max_retries: 3,
    base_delay_secs: 5.0,
    exponential_base: 2.0,
    max_delay_secs: 60.0,
    jitter: false,
};

impl RetryPolicy {
    /// Look up a policy by name, falling back to the default.
    pub fn by_name(name: &str) -> RetryPolicy {
        match name {
            "aggressive" => AGGRESSIVE,
            "conservative" => CONSERVATIVE,
            _ => DEFAULT,
        }
    }

    /// Delay before the next attempt, `attempt` being zero-based.
    ///
    /// `min(base * exponent^attempt, cap)`, then up to [`JITTER_MAX`] of the
    /// capped value added on top when jitter is enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.base_delay_secs * self.exponential_base.powi(attempt as i32);
        let mut secs = raw.min(self.max_delay_secs);

        if self.jitter {
            let jitter: f64 = rand::rng().random_range(0.0..JITTER_MAX);
            secs += secs * jitter;
        }

        Duration::from_secs_f64(secs)
    }

    /// Whether the attempt budget is spent.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }
}

/// Classification of a dispatch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Transient: requeue with backoff.
    Retryable,
    /// Permanent: no retry, straight to the dead-letter path.
    Terminal,
}

/// Classify an HTTP status from a dependency.
///
/// 408, 429, and all 5xx are retryable; the well-known 4xx family is
/// terminal; anything else unknown is treated as terminal.
pub fn classify_status(status: u16) -> Classification {
    match status {
        408 | 429 => Classification::Retryable,
        500..=599 => Classification::Retryable,
        400 | 401 | 403 | 404 | 405 | 406 | 409 | 410 | 422 => Classification::Terminal,
        _ => Classification::Terminal,
    }
}

/// Pick the policy for a retryable HTTP status. Rate limiting gets the
/// aggressive policy; everything else the default.
pub fn policy_for_status(status: u16) -> RetryPolicy {
    if status == 429 { AGGRESSIVE } else { DEFAULT }
}

/// Classify a transport-level error by its message.
///
/// Connection resets, refusals, and timeouts are retryable regardless of
/// the error type that carried them.
pub fn classify_message(message: &str) -> Classification {
    let lower = message.to_lowercase();
    if ["connection", "timeout", "timed out", "refused"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        Classification::Retryable
    } else {
        Classification::Terminal
    }
}

/// Consistent log line for a scheduled retry.
pub fn retry_message(
    task_name: &str,
    eval_id: &str,
    attempt: u32,
    max_retries: u32,
    delay: Duration,
    reason: &str,
) -> String {
    format!(
        "task {task_name} for evaluation {eval_id} failed: {reason}. \
         Retry {}/{max_retries} in {:.2}s",
        attempt + 1,
        delay.as_secs_f64(),
    )
}
