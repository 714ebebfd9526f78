//! Database query functions for the `evaluation_events` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::EvaluationEvent;

/// Fields required to append an event to an evaluation's trail.
#[derive(Debug, Clone)]
pub struct NewEvaluationEvent<'a> {
    pub eval_id: &'a str,
    pub event_type: &'a str,
    pub message: Option<&'a str>,
    pub payload: serde_json::Value,
}

/// Append an event row. The trail is insert-only.
pub async fn insert_event(pool: &PgPool, new: &NewEvaluationEvent<'_>) -> Result<EvaluationEvent> {
    let event = sqlx::query_as::<_, EvaluationEvent>(
        "INSERT INTO evaluation_events (eval_id, event_type, message, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.eval_id)
    .bind(new.event_type)
    .bind(new.message)
    .bind(&new.payload)
    .fetch_one(pool)
    .await
    .context("failed to insert evaluation event")?;

    Ok(event)
}

/// List the full event trail for an evaluation, in insertion order.
pub async fn list_events(pool: &PgPool, eval_id: &str) -> Result<Vec<EvaluationEvent>> {
    let events = sqlx::query_as::<_, EvaluationEvent>(
        "SELECT * FROM evaluation_events WHERE eval_id = $1 ORDER BY id ASC",
    )
    .bind(eval_id)
    .fetch_all(pool)
    .await
    .context("failed to list evaluation events")?;

    Ok(events)
}
