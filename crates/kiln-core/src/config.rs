//! Pipeline configuration, environment-driven.
//!
//! Everything tunable reads from `KILN_*` environment variables with
//! conservative defaults, so a bare `kiln worker` runs against a local
//! docker-compose stack unchanged.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::truncate::{DEFAULT_PREVIEW_CAP, TruncationConfig};

/// Settings shared by the dispatcher fleet, the API server, and the admin
/// commands.
#[derive(Debug, Clone)]
pub struct KilnConfig {
    /// Executor replica naming: `{base}-{i}:{port}`.
    pub executor_base_url: String,
    pub executor_count: u32,
    pub executor_port: u16,
    /// Executor URLs excluded from health-based selection.
    pub health_exclude: Vec<String>,

    /// Dispatcher workers per process.
    pub worker_concurrency: usize,
    /// Queue poll timeout; bounds how fast workers notice shutdown.
    pub queue_poll: Duration,
    /// Consecutive no-capacity claim misses before an attempt is charged.
    pub claim_wait_max: u32,
    /// Sleep between claim misses.
    pub claim_backoff: Duration,

    /// Inline output cap; larger streams spill to the blob store.
    pub preview_cap_bytes: usize,
    pub blob_dir: PathBuf,

    pub dlq_retention_days: i64,
    pub dlq_monitor_interval: Duration,
    pub reconcile_interval: Duration,

    /// Pod reaper settings.
    pub reaper_namespace: String,
    pub reaper_watch_all: bool,
    pub reaper_grace_period_secs: u32,
    pub reaper_preserve_debug: bool,
}

impl KilnConfig {
    pub fn from_env() -> Self {
        Self {
            executor_base_url: env_or("KILN_EXECUTOR_BASE_URL", "http://executor"),
            executor_count: env_parse("KILN_EXECUTOR_COUNT", 2),
            executor_port: env_parse("KILN_EXECUTOR_PORT", 8083),
            health_exclude: env_list("KILN_HEALTH_EXCLUDE"),
            worker_concurrency: env_parse("KILN_WORKER_CONCURRENCY", 4),
            queue_poll: Duration::from_secs(env_parse("KILN_QUEUE_POLL_SECS", 2)),
            claim_wait_max: env_parse("KILN_CLAIM_WAIT_MAX", 5),
            claim_backoff: Duration::from_secs(env_parse("KILN_CLAIM_BACKOFF_SECS", 2)),
            preview_cap_bytes: env_parse("KILN_PREVIEW_CAP_BYTES", DEFAULT_PREVIEW_CAP),
            blob_dir: PathBuf::from(env_or("KILN_BLOB_DIR", "/var/tmp/kiln/blobs")),
            dlq_retention_days: env_parse("KILN_DLQ_RETENTION_DAYS", 30),
            dlq_monitor_interval: Duration::from_secs(env_parse(
                "KILN_DLQ_MONITOR_INTERVAL_SECS",
                1800,
            )),
            reconcile_interval: Duration::from_secs(env_parse("KILN_RECONCILE_INTERVAL_SECS", 60)),
            reaper_namespace: env_or("KILN_REAPER_NAMESPACE", "kiln"),
            reaper_watch_all: env_parse("KILN_REAPER_WATCH_ALL", false),
            reaper_grace_period_secs: env_parse("KILN_REAPER_GRACE_PERIOD", 0),
            reaper_preserve_debug: env_parse("KILN_REAPER_PRESERVE_DEBUG", true),
        }
    }

    /// The full executor URL set per the replica-naming convention, with the
    /// health-exclude list applied.
    pub fn executor_urls(&self) -> Vec<String> {
        crate::router::ExecutorRouter::discover(
            &self.executor_base_url,
            self.executor_count,
            self.executor_port,
            &self.health_exclude,
        )
    }

    pub fn truncation(&self) -> TruncationConfig {
        TruncationConfig::new(self.preview_cap_bytes, self.blob_dir.clone())
    }
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // Key chosen to not exist.
        assert_eq!(env_parse("KILN_TEST_DOES_NOT_EXIST", 7u32), 7);
    }

    #[test]
    fn env_list_splits_and_trims() {
        unsafe {
            env::set_var(
                "KILN_TEST_HEALTH_EXCLUDE_LIST",
                "http://executor-1:8083, http://executor-2:8083 ,",
            )
        };
        let list = env_list("KILN_TEST_HEALTH_EXCLUDE_LIST");
        assert_eq!(
            list,
            vec!["http://executor-1:8083", "http://executor-2:8083"]
        );
        unsafe { env::remove_var("KILN_TEST_HEALTH_EXCLUDE_LIST") };
    }

    #[test]
    fn executor_urls_use_discovery() {
        let config = KilnConfig {
            executor_base_url: "http://executor".into(),
            executor_count: 2,
            executor_port: 8083,
            health_exclude: vec![],
            worker_concurrency: 4,
            queue_poll: Duration::from_secs(2),
            claim_wait_max: 5,
            claim_backoff: Duration::from_secs(2),
            preview_cap_bytes: DEFAULT_PREVIEW_CAP,
            blob_dir: PathBuf::from("/tmp/blobs"),
            dlq_retention_days: 30,
            dlq_monitor_interval: Duration::from_secs(1800),
            reconcile_interval: Duration::from_secs(60),
            reaper_namespace: "kiln".into(),
            reaper_watch_all: false,
            reaper_grace_period_secs: 0,
            reaper_preserve_debug: true,
        };
        assert_eq!(
            config.executor_urls(),
            vec!["http://executor-1:8083", "http://executor-2:8083"]
        );
    }
}
