//! Redis broker connection handling.
//!
//! A single [`ConnectionManager`] is built at startup and cloned into every
//! component that needs broker access. The manager multiplexes one
//! connection and reconnects on failure, so clones are cheap.

use std::env;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

/// Broker configuration.
///
/// Reads from the `KILN_REDIS_URL` environment variable, falling back to
/// `redis://localhost:6379/0` when unset.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Full Redis connection URL.
    pub redis_url: String,
}

impl BrokerConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "redis://localhost:6379/0";

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        let redis_url =
            env::var("KILN_REDIS_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self { redis_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
        }
    }

    /// Open a managed connection to the broker.
    pub async fn connect(&self) -> Result<ConnectionManager> {
        let client = redis::Client::open(self.redis_url.as_str())
            .with_context(|| format!("invalid redis URL {}", self.redis_url))?;
        let manager = client
            .get_connection_manager()
            .await
            .with_context(|| format!("failed to connect to redis at {}", self.redis_url))?;
        Ok(manager)
    }

    /// Open a raw client, needed for pub/sub subscriptions which require a
    /// dedicated connection.
    pub fn client(&self) -> Result<redis::Client> {
        redis::Client::open(self.redis_url.as_str())
            .with_context(|| format!("invalid redis URL {}", self.redis_url))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_new() {
        let cfg = BrokerConfig::new("redis://broker:6380/2");
        assert_eq!(cfg.redis_url, "redis://broker:6380/2");
    }

    #[test]
    fn default_url_constant() {
        assert_eq!(BrokerConfig::DEFAULT_URL, "redis://localhost:6379/0");
    }
}
