//! Executor routing: discovery and randomized health-checked selection.
//!
//! Executors are discovered from a count + base-URL convention
//! (`{base}-{i}:{port}`), matching how the deployment names its replicas.
//! Selection shuffles the set for load distribution and returns the first
//! executor whose health probe answers 2xx within the probe timeout.

use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;

/// Health probe timeout.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no healthy executor available")]
    NoHealthyExecutor,
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Routes work to healthy executor services.
#[derive(Clone)]
pub struct ExecutorRouter {
    executor_urls: Vec<String>,
    client: reqwest::Client,
}

impl ExecutorRouter {
    /// Build a router over an explicit executor set.
    pub fn new(executor_urls: Vec<String>) -> Result<Self, RouterError> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()?;
        tracing::info!(count = executor_urls.len(), "initialized executor router");
        Ok(Self {
            executor_urls,
            client,
        })
    }

    /// Discover executor URLs from the replica-naming convention.
    ///
    /// Replicas are numbered from 1: `{base}-1:{port}` .. `{base}-N:{port}`.
    /// URLs in `exclude` are dropped (operator escape hatch for a known-bad
    /// replica).
    pub fn discover(base_url: &str, count: u32, port: u16, exclude: &[String]) -> Vec<String> {
        let urls: Vec<String> = (1..=count)
            .map(|i| format!("{base_url}-{i}:{port}"))
            .filter(|url| !exclude.contains(url))
            .collect();
        tracing::info!(?urls, "discovered executors");
        urls
    }

    /// The configured executor set.
    pub fn executor_urls(&self) -> &[String] {
        &self.executor_urls
    }

    /// Probe one executor's health endpoint.
    pub async fn check_health(&self, executor_url: &str) -> bool {
        match self.client.get(format!("{executor_url}/health")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %executor_url, error = %e, "health check failed");
                false
            }
        }
    }

    /// Pick a healthy executor using randomized selection.
    ///
    /// Shuffles the set, probes in order, and returns the first healthy URL.
    pub async fn get_healthy(&self) -> Result<String, RouterError> {
        let mut candidates = self.executor_urls.clone();
        candidates.shuffle(&mut rand::rng());

        for url in candidates {
            if self.check_health(&url).await {
                tracing::debug!(url = %url, "selected healthy executor");
                return Ok(url);
            }
        }

        tracing::error!("no healthy executors available");
        Err(RouterError::NoHealthyExecutor)
    }

    /// Health of every configured executor, for status reporting.
    pub async fn health_report(&self) -> Vec<(String, bool)> {
        let mut report = Vec::with_capacity(self.executor_urls.len());
        for url in &self.executor_urls {
            let healthy = self.check_health(url).await;
            report.push((url.clone(), healthy));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_follows_naming_convention() {
        let urls = ExecutorRouter::discover("http://executor", 3, 8083, &[]);
        assert_eq!(
            urls,
            vec![
                "http://executor-1:8083",
                "http://executor-2:8083",
                "http://executor-3:8083",
            ]
        );
    }

    #[test]
    fn discovery_honors_exclude_list() {
        let exclude = vec!["http://executor-2:8083".to_string()];
        let urls = ExecutorRouter::discover("http://executor", 3, 8083, &exclude);
        assert_eq!(
            urls,
            vec!["http://executor-1:8083", "http://executor-3:8083"]
        );
    }

    #[test]
    fn discovery_zero_count_is_empty() {
        assert!(ExecutorRouter::discover("http://executor", 0, 8083, &[]).is_empty());
    }

    #[tokio::test]
    async fn empty_set_has_no_healthy_executor() {
        let router = ExecutorRouter::new(vec![]).unwrap();
        let err = router.get_healthy().await.unwrap_err();
        assert!(matches!(err, RouterError::NoHealthyExecutor));
    }
}
