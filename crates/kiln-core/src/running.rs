//! Running-state index: an ephemeral mirror of currently-executing
//! evaluations for O(1) enumeration.
//!
//! The index is advisory; the durable store is authoritative. It is written
//! by the dispatcher when an evaluation starts, cleared by the event
//! listener on terminal events, and additionally swept by a periodic
//! reconciler. Readers cross-check every id against the durable store and
//! lazily drop stale entries, so a missed event can only ever cause a
//! bounded-time overcount, never a wrong answer.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use kiln_db::queries::evaluations as eval_db;

use crate::events::{self, EvalEvent};

/// Set of running eval ids.
pub const RUNNING_SET_KEY: &str = "running_evaluations";

/// Backoff before re-subscribing after a pub/sub stream failure.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// Per-evaluation hash key.
pub fn running_key(eval_id: &str) -> String {
    format!("eval:{eval_id}:running")
}

/// One running evaluation as mirrored in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningEntry {
    pub eval_id: String,
    pub executor_id: String,
    pub container_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub timeout_secs: u32,
}

/// Handle to the running-state index.
#[derive(Clone)]
pub struct RunningIndex {
    conn: ConnectionManager,
}

impl RunningIndex {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Record an evaluation as running: write the hash and add the id to the
    /// enumeration set. Idempotent.
    pub async fn mark_running(&self, entry: &RunningEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = running_key(&entry.eval_id);

        let fields: Vec<(&str, String)> = vec![
            ("executor_id", entry.executor_id.clone()),
            (
                "container_id",
                entry.container_id.clone().unwrap_or_default(),
            ),
            ("started_at", entry.started_at.to_rfc3339()),
            ("timeout_secs", entry.timeout_secs.to_string()),
        ];
        let _: () = conn
            .hset_multiple(&key, &fields)
            .await
            .context("failed to write running entry")?;
        let _: () = conn
            .sadd(RUNNING_SET_KEY, &entry.eval_id)
            .await
            .context("failed to add to running set")?;

        Ok(())
    }

    /// Remove an evaluation from the index. Idempotent.
    pub async fn clear(&self, eval_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(running_key(eval_id))
            .await
            .context("failed to delete running entry")?;
        let _: () = conn
            .srem(RUNNING_SET_KEY, eval_id)
            .await
            .context("failed to remove from running set")?;
        Ok(())
    }

    /// Fetch the running entry for one evaluation, if present.
    pub async fn get(&self, eval_id: &str) -> Result<Option<RunningEntry>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(running_key(eval_id))
            .await
            .context("failed to read running entry")?;

        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(entry_from_fields(eval_id, &fields)))
    }

    /// All ids currently in the set, unverified.
    pub async fn ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(RUNNING_SET_KEY)
            .await
            .context("failed to read running set")?;
        Ok(ids)
    }

    /// List running evaluations, cross-checked against the durable store.
    ///
    /// Ids whose durable record is terminal (or missing) are stale: they are
    /// removed from the index and omitted from the result.
    pub async fn list_verified(&self, pg: &PgPool) -> Result<Vec<RunningEntry>> {
        let mut verified = Vec::new();
        for eval_id in self.ids().await? {
            match eval_db::get_evaluation(pg, &eval_id).await? {
                Some(eval) if !eval.status.is_terminal() => {
                    if let Some(entry) = self.get(&eval_id).await? {
                        verified.push(entry);
                    }
                }
                _ => {
                    tracing::debug!(eval_id = %eval_id, "lazily removing stale running entry");
                    self.clear(&eval_id).await?;
                }
            }
        }
        Ok(verified)
    }

    /// Reconciliation pass: drop every id whose durable status is terminal
    /// or whose record is gone. Returns the number of entries removed.
    ///
    /// Drift is expected (missed events, crashed listeners) and is removed
    /// silently; this is not an error condition.
    pub async fn reconcile(&self, pg: &PgPool) -> Result<usize> {
        let mut removed = 0;
        for eval_id in self.ids().await? {
            let stale = match eval_db::get_evaluation(pg, &eval_id).await? {
                Some(eval) => eval.status.is_terminal(),
                None => true,
            };
            if stale {
                self.clear(&eval_id).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "reconciled running index against durable store");
        }
        Ok(removed)
    }
}

fn entry_from_fields(eval_id: &str, fields: &HashMap<String, String>) -> RunningEntry {
    RunningEntry {
        eval_id: eval_id.to_owned(),
        executor_id: fields.get("executor_id").cloned().unwrap_or_default(),
        container_id: fields
            .get("container_id")
            .filter(|s| !s.is_empty())
            .cloned(),
        started_at: fields
            .get("started_at")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(Utc::now),
        timeout_secs: fields
            .get("timeout_secs")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    }
}

/// Consume lifecycle events and keep the index consistent.
///
/// Stateless and idempotent: a `running` event writes the entry, any
/// terminal event clears it. Events for unknown ids are harmless. The
/// subscription is re-established with a backoff when the stream drops.
pub async fn run_listener(
    client: redis::Client,
    index: RunningIndex,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match listen_once(&client, &index, &shutdown).await {
            Ok(()) => return, // clean shutdown
            Err(e) => {
                tracing::error!(error = %e, "running-index listener failed; resubscribing");
                tokio::select! {
                    _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

async fn listen_once(
    client: &redis::Client,
    index: &RunningIndex,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("failed to open pub/sub connection")?;
    for channel in events::all_channels() {
        pubsub
            .subscribe(&channel)
            .await
            .with_context(|| format!("failed to subscribe to {channel}"))?;
    }

    tracing::info!("running-index listener subscribed");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            message = stream.next() => {
                let Some(message) = message else {
                    anyhow::bail!("pub/sub stream ended");
                };
                let payload: String = message
                    .get_payload()
                    .context("failed to read event payload")?;
                let event: EvalEvent = match serde_json::from_str(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring malformed lifecycle event");
                        continue;
                    }
                };
                handle_event(index, &event).await;
            }
            _ = shutdown.cancelled() => {
                tracing::info!("running-index listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_event(index: &RunningIndex, event: &EvalEvent) {
    let result = match event {
        EvalEvent::Running {
            eval_id,
            timestamp,
            executor_id,
            container_id,
            timeout_secs,
        } => {
            index
                .mark_running(&RunningEntry {
                    eval_id: eval_id.clone(),
                    executor_id: executor_id.clone(),
                    container_id: container_id.clone(),
                    started_at: *timestamp,
                    timeout_secs: *timeout_secs,
                })
                .await
        }
        event if event.is_terminal() => index.clear(event.eval_id()).await,
        _ => Ok(()),
    };

    if let Err(e) = result {
        tracing::warn!(
            eval_id = %event.eval_id(),
            error = %e,
            "failed to apply lifecycle event to running index"
        );
    }
}

/// Periodically reconcile the index against the durable store.
pub async fn run_reconciler(
    index: RunningIndex,
    pg: PgPool,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = index.reconcile(&pg).await {
                    tracing::warn!(error = %e, "running-index reconciliation failed");
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("running-index reconciler shutting down");
                return;
            }
        }
    }
}
