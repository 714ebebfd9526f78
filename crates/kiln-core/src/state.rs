//! Evaluation state machine transitions.
//!
//! Validates and executes status transitions against the durable store,
//! enforcing the allowed edge set and optimistic locking. Timestamps and
//! executor-id clearing are handled by the query layer.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use kiln_db::models::EvalStatus;
use kiln_db::queries::evaluations as db;

/// The evaluation state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// queued       -> provisioning
/// queued       -> cancelled          (soft cancel)
/// provisioning -> running
/// provisioning -> queued             (requeue with backoff)
/// provisioning -> cancelled          (soft cancel)
/// provisioning -> failed             (dispatch error, retries exhausted)
/// running      -> completed
/// running      -> failed
/// running      -> timeout
/// running      -> cancelled          (forced cancel only)
/// running      -> queued             (requeue after transport error)
/// ```
///
/// Terminal statuses are absorbing; no edge leaves them. The requeue edges
/// exist because retries are not surfaced as separate statuses -- a retried
/// evaluation simply returns to `queued` until a definitive outcome.
pub struct EvalStateMachine;

impl EvalStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in the
    /// state graph.
    pub fn is_valid_transition(from: EvalStatus, to: EvalStatus) -> bool {
        matches!(
            (from, to),
            (EvalStatus::Queued, EvalStatus::Provisioning)
                | (EvalStatus::Queued, EvalStatus::Cancelled)
                | (EvalStatus::Provisioning, EvalStatus::Running)
                | (EvalStatus::Provisioning, EvalStatus::Queued)
                | (EvalStatus::Provisioning, EvalStatus::Cancelled)
                | (EvalStatus::Provisioning, EvalStatus::Failed)
                | (EvalStatus::Running, EvalStatus::Completed)
                | (EvalStatus::Running, EvalStatus::Failed)
                | (EvalStatus::Running, EvalStatus::Timeout)
                | (EvalStatus::Running, EvalStatus::Cancelled)
                | (EvalStatus::Running, EvalStatus::Queued)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Returns an error if the transition is not a valid edge, the current
    /// status in the database does not match `from` (optimistic lock
    /// failure), or the evaluation does not exist.
    pub async fn transition(
        pool: &PgPool,
        eval_id: &str,
        from: EvalStatus,
        to: EvalStatus,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for evaluation {eval_id}");
        }

        let rows = db::transition_status(pool, eval_id, from, to)
            .await
            .with_context(|| {
                format!("failed to transition evaluation {eval_id} from {from} to {to}")
            })?;

        if rows == 0 {
            // Either the evaluation does not exist or the status moved.
            let eval = db::get_evaluation(pool, eval_id).await?;
            match eval {
                None => bail!("evaluation {eval_id} not found"),
                Some(e) => bail!(
                    "optimistic lock failed: evaluation {eval_id} has status {}, expected {from}",
                    e.status
                ),
            }
        }

        Ok(())
    }

    /// Attempt a transition, reporting whether it applied.
    ///
    /// Unlike [`Self::transition`] a lost optimistic-lock race is not an
    /// error; callers use this when racing other actors (cancel vs.
    /// dispatch) and decide what to do from the boolean.
    pub async fn try_transition(
        pool: &PgPool,
        eval_id: &str,
        from: EvalStatus,
        to: EvalStatus,
    ) -> Result<bool> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for evaluation {eval_id}");
        }

        let rows = db::transition_status(pool, eval_id, from, to)
            .await
            .with_context(|| {
                format!("failed to transition evaluation {eval_id} from {from} to {to}")
            })?;

        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        let all = [
            EvalStatus::Queued,
            EvalStatus::Provisioning,
            EvalStatus::Running,
            EvalStatus::Completed,
            EvalStatus::Failed,
            EvalStatus::Cancelled,
            EvalStatus::Timeout,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in &all {
                assert!(
                    !EvalStateMachine::is_valid_transition(*from, *to),
                    "terminal {from} must not transition to {to}"
                );
            }
        }
    }

    #[test]
    fn happy_path_edges() {
        assert!(EvalStateMachine::is_valid_transition(
            EvalStatus::Queued,
            EvalStatus::Provisioning
        ));
        assert!(EvalStateMachine::is_valid_transition(
            EvalStatus::Provisioning,
            EvalStatus::Running
        ));
        assert!(EvalStateMachine::is_valid_transition(
            EvalStatus::Running,
            EvalStatus::Completed
        ));
    }

    #[test]
    fn cancel_edges() {
        assert!(EvalStateMachine::is_valid_transition(
            EvalStatus::Queued,
            EvalStatus::Cancelled
        ));
        assert!(EvalStateMachine::is_valid_transition(
            EvalStatus::Provisioning,
            EvalStatus::Cancelled
        ));
        assert!(EvalStateMachine::is_valid_transition(
            EvalStatus::Running,
            EvalStatus::Cancelled
        ));
    }

    #[test]
    fn requeue_edges() {
        assert!(EvalStateMachine::is_valid_transition(
            EvalStatus::Provisioning,
            EvalStatus::Queued
        ));
        assert!(EvalStateMachine::is_valid_transition(
            EvalStatus::Running,
            EvalStatus::Queued
        ));
    }

    #[test]
    fn no_skipping_forward() {
        assert!(!EvalStateMachine::is_valid_transition(
            EvalStatus::Queued,
            EvalStatus::Running
        ));
        assert!(!EvalStateMachine::is_valid_transition(
            EvalStatus::Queued,
            EvalStatus::Completed
        ));
        assert!(!EvalStateMachine::is_valid_transition(
            EvalStatus::Provisioning,
            EvalStatus::Completed
        ));
        // Timeout only makes sense for running workloads.
        assert!(!EvalStateMachine::is_valid_transition(
            EvalStatus::Queued,
            EvalStatus::Timeout
        ));
        assert!(!EvalStateMachine::is_valid_transition(
            EvalStatus::Provisioning,
            EvalStatus::Timeout
        ));
    }
}
