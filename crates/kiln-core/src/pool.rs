//! Executor pool registry: atomic allocation and release of executors.
//!
//! Multiple dispatcher processes share the pool, so no in-process lock can
//! protect it; every mutation happens through Redis atomic primitives. The
//! available pool is a list of JSON entries, busy executors are per-URL
//! marker keys whose TTL doubles as the lease: a dispatcher that crashes
//! without releasing cannot occupy a worker past its lease expiry.

use anyhow::{Context, Result};
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

/// List of available executors.
pub const AVAILABLE_KEY: &str = "executors:available";
/// Prefix of per-URL busy markers; value is the claiming eval id.
pub const BUSY_PREFIX: &str = "executor:busy:";
/// Prefix of per-URL release-metrics rings.
pub const METRICS_PREFIX: &str = "executor:metrics:";

/// Release attempts kept per executor for double-release analysis.
const METRICS_RING_LEN: isize = 100;
/// Metrics ring retention.
const METRICS_TTL_SECS: i64 = 86_400;

/// Idempotent release: delete the busy marker, then push the executor back
/// only if it is not already in the available list. Returns
/// `{was_busy, added_to_pool, status}`.
const RELEASE_SCRIPT: &str = r#"
-- KEYS[1] = available list, KEYS[2] = busy marker
-- ARGV[1] = executor entry JSON
local was_busy = redis.call('del', KEYS[2])

local available = redis.call('lrange', KEYS[1], 0, -1)
local url = cjson.decode(ARGV[1])["url"]
for i, item in ipairs(available) do
    if cjson.decode(item)["url"] == url then
        return {was_busy, 0, "already_in_pool"}
    end
end

if was_busy == 1 then
    redis.call('lpush', KEYS[1], ARGV[1])
    return {was_busy, 1, "released"}
end
return {was_busy, 0, "not_busy"}
"#;

/// Entry stored in the available list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolEntry {
    url: String,
    /// Unix seconds when the entry was (re)added.
    added_at: f64,
}

/// Outcome of a release operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// The executor was busy and has been returned to the pool.
    Released,
    /// The executor was already in the available list; nothing was added.
    AlreadyInPool,
    /// No busy marker existed (duplicate release or expired lease).
    NotBusy,
}

impl ReleaseStatus {
    fn from_script(s: &str) -> Option<Self> {
        match s {
            "released" => Some(Self::Released),
            "already_in_pool" => Some(Self::AlreadyInPool),
            "not_busy" => Some(Self::NotBusy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::AlreadyInPool => "already_in_pool",
            Self::NotBusy => "not_busy",
        }
    }
}

/// A busy executor as reported by [`ExecutorPool::status`].
#[derive(Debug, Clone, Serialize)]
pub struct BusyExecutor {
    pub url: String,
    pub eval_id: Option<String>,
    /// Remaining lease in seconds (-1 when the key has no TTL).
    pub ttl_seconds: i64,
}

/// Pool counts plus per-busy-executor detail.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub available: i64,
    pub busy: i64,
    pub total: i64,
    pub busy_executors: Vec<BusyExecutor>,
}

/// One recorded release attempt, kept in the metrics ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReleaseMetric {
    timestamp: f64,
    was_busy: i64,
    added_to_pool: i64,
    status: String,
}

/// Handle to the executor pool.
#[derive(Clone)]
pub struct ExecutorPool {
    conn: ConnectionManager,
}

impl ExecutorPool {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Atomically replace the available list with the given executors and
    /// clear any busy markers for them.
    pub async fn initialize(&self, executor_urls: &[String]) -> Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn
            .del(AVAILABLE_KEY)
            .await
            .context("failed to clear available list")?;

        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        for url in executor_urls {
            let entry = PoolEntry {
                url: url.clone(),
                added_at: now,
            };
            let payload = serde_json::to_string(&entry)?;
            let _: () = conn
                .lpush(AVAILABLE_KEY, payload)
                .await
                .context("failed to add executor to pool")?;
            let _: () = conn
                .del(format!("{BUSY_PREFIX}{url}"))
                .await
                .context("failed to clear busy marker")?;
        }

        tracing::info!(count = executor_urls.len(), "initialized executor pool");
        Ok(())
    }

    /// Atomically claim an available executor for `eval_id`.
    ///
    /// The busy marker expires after `lease_ttl_secs`, returning the lease
    /// automatically if the claimant dies. Returns `None` when the pool is
    /// empty. If the busy marker cannot be written after the pop, the entry
    /// is pushed back so the executor is not lost.
    pub async fn claim(&self, eval_id: &str, lease_ttl_secs: u64) -> Result<Option<String>> {
        let mut conn = self.conn.clone();

        let popped: Option<String> = conn
            .rpop(AVAILABLE_KEY, None)
            .await
            .context("failed to pop from available list")?;

        let Some(raw) = popped else {
            return Ok(None);
        };

        let entry: PoolEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(error = %e, "malformed pool entry, returning it to the list");
                let _: () = conn.lpush(AVAILABLE_KEY, raw).await?;
                return Ok(None);
            }
        };

        let busy_key = format!("{BUSY_PREFIX}{}", entry.url);
        match conn.set_ex::<_, _, ()>(&busy_key, eval_id, lease_ttl_secs).await {
            Ok(()) => {
                tracing::info!(url = %entry.url, eval_id = %eval_id, "executor claimed");
                Ok(Some(entry.url))
            }
            Err(e) => {
                tracing::error!(url = %entry.url, error = %e, "failed to mark executor busy");
                let _: () = conn.lpush(AVAILABLE_KEY, raw).await?;
                Ok(None)
            }
        }
    }

    /// Return an executor to the available pool.
    ///
    /// Idempotent and atomic: the server-side script deletes the busy
    /// marker, checks for a duplicate entry, and only then pushes back.
    /// Duplicate releases can never put the same URL in the list twice.
    pub async fn release(&self, executor_url: &str) -> Result<ReleaseStatus> {
        let mut conn = self.conn.clone();

        let busy_key = format!("{BUSY_PREFIX}{executor_url}");
        let entry = PoolEntry {
            url: executor_url.to_owned(),
            added_at: Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        let payload = serde_json::to_string(&entry)?;

        let (was_busy, added_to_pool, status_str): (i64, i64, String) =
            redis::Script::new(RELEASE_SCRIPT)
                .key(AVAILABLE_KEY)
                .key(&busy_key)
                .arg(&payload)
                .invoke_async(&mut conn)
                .await
                .with_context(|| format!("release script failed for {executor_url}"))?;

        let status = ReleaseStatus::from_script(&status_str)
            .with_context(|| format!("release script returned unknown status {status_str:?}"))?;

        match status {
            ReleaseStatus::Released => {
                tracing::info!(url = %executor_url, "executor released back to pool");
            }
            ReleaseStatus::AlreadyInPool => {
                tracing::info!(url = %executor_url, "executor already in pool (idempotent release)");
            }
            ReleaseStatus::NotBusy => {
                tracing::debug!(url = %executor_url, "executor was not busy (possible duplicate release)");
            }
        }

        self.track_release_metrics(executor_url, was_busy, added_to_pool, status)
            .await;

        Ok(status)
    }

    /// Current pool status: counts plus eval id and residual lease per busy
    /// executor.
    pub async fn status(&self) -> Result<PoolStatus> {
        let mut conn = self.conn.clone();

        let available: i64 = conn
            .llen(AVAILABLE_KEY)
            .await
            .context("failed to read available count")?;

        let busy_keys = scan_keys(&mut conn, &format!("{BUSY_PREFIX}*")).await?;

        let mut busy_executors = Vec::with_capacity(busy_keys.len());
        for key in &busy_keys {
            let url = key.trim_start_matches(BUSY_PREFIX).to_owned();
            let eval_id: Option<String> = conn.get(key).await?;
            let ttl_seconds: i64 = conn.ttl(key).await?;
            busy_executors.push(BusyExecutor {
                url,
                eval_id,
                ttl_seconds,
            });
        }

        let busy = busy_executors.len() as i64;
        Ok(PoolStatus {
            available,
            busy,
            total: available + busy,
            busy_executors,
        })
    }

    /// Reconcile against a known executor set: any URL that is neither
    /// available nor busy has leaked (e.g. lost between a pop and a failed
    /// claim) and is re-added. Returns the number of executors recovered.
    ///
    /// Expired busy markers need no handling here -- Redis TTL expiry already
    /// returns those leases.
    pub async fn recover_stale(&self, known_urls: &[String]) -> Result<usize> {
        let mut conn = self.conn.clone();

        let available_raw: Vec<String> = conn
            .lrange(AVAILABLE_KEY, 0, -1)
            .await
            .context("failed to read available list")?;
        let available: Vec<String> = available_raw
            .iter()
            .filter_map(|raw| serde_json::from_str::<PoolEntry>(raw).ok())
            .map(|e| e.url)
            .collect();

        let mut recovered = 0;
        for url in known_urls {
            if available.iter().any(|u| u == url) {
                continue;
            }
            let busy: bool = conn.exists(format!("{BUSY_PREFIX}{url}")).await?;
            if busy {
                continue;
            }
            let entry = PoolEntry {
                url: url.clone(),
                added_at: Utc::now().timestamp_millis() as f64 / 1000.0,
            };
            let _: () = conn.lpush(AVAILABLE_KEY, serde_json::to_string(&entry)?).await?;
            tracing::warn!(url = %url, "recovered leaked executor into pool");
            recovered += 1;
        }

        tracing::info!(recovered, "executor recovery check completed");
        Ok(recovered)
    }

    /// Record a release attempt in the per-URL metrics ring and warn when
    /// two releases land within one second (double-release detection).
    async fn track_release_metrics(
        &self,
        executor_url: &str,
        was_busy: i64,
        added_to_pool: i64,
        status: ReleaseStatus,
    ) {
        let mut conn = self.conn.clone();
        let metrics_key = format!("{METRICS_PREFIX}{executor_url}");

        let metric = ReleaseMetric {
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            was_busy,
            added_to_pool,
            status: status.as_str().to_owned(),
        };

        let record = async {
            let payload = serde_json::to_string(&metric)?;
            let _: () = conn.lpush(&metrics_key, payload).await?;
            let _: () = conn.ltrim(&metrics_key, 0, METRICS_RING_LEN - 1).await?;
            let _: () = conn.expire(&metrics_key, METRICS_TTL_SECS).await?;

            let recent: Vec<String> = conn.lrange(&metrics_key, 0, 1).await?;
            if recent.len() >= 2 {
                let newest: ReleaseMetric = serde_json::from_str(&recent[0])?;
                let previous: ReleaseMetric = serde_json::from_str(&recent[1])?;
                let gap = newest.timestamp - previous.timestamp;
                if gap < 1.0 {
                    tracing::warn!(
                        url = %executor_url,
                        gap_secs = format!("{gap:.3}"),
                        "possible double release detected: 2 releases within 1s"
                    );
                }
            }
            anyhow::Ok(())
        };

        // Metrics are observability only; a failure here must not fail the
        // release.
        if let Err(e) = record.await {
            tracing::debug!(url = %executor_url, error = %e, "failed to record release metrics");
        }
    }
}

/// Collect all keys matching a pattern with a cursor SCAN loop.
async fn scan_keys(conn: &mut ConnectionManager, pattern: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(conn)
            .await
            .context("SCAN failed")?;
        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(keys)
}
