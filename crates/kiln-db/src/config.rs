//! Connection settings for the durable store.
//!
//! Follows the same convention as the broker config in `kiln-core`: one
//! `KILN_*` environment variable per knob, a localhost default suited to
//! the docker-compose stack, and explicit constructors for tests and CLI
//! flags.

use std::env;

/// Default pool size when `KILN_DB_POOL_SIZE` is unset. The API server and
/// each worker process hold their own small pool.
const DEFAULT_POOL_SIZE: u32 = 5;

/// Connection settings for the evaluations database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL, including the database name.
    pub database_url: String,
    /// Upper bound on pooled connections.
    pub max_connections: u32,
}

impl DbConfig {
    /// Connection URL used when `KILN_DATABASE_URL` is unset.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/kiln";

    /// Read the configuration from `KILN_DATABASE_URL` and
    /// `KILN_DB_POOL_SIZE`.
    pub fn from_env() -> Self {
        let database_url =
            env::var("KILN_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let max_connections = env::var("KILN_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);
        Self {
            database_url,
            max_connections,
        }
    }

    /// Point at an explicit URL with the default pool size.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_POOL_SIZE,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Split the URL into the server part and the database name:
    /// `postgresql://host:5432/kiln` becomes
    /// `("postgresql://host:5432", "kiln")`.
    ///
    /// Returns `None` when the URL carries no database segment, so callers
    /// that need to address the server itself (database creation, teardown)
    /// fail loudly instead of mangling the URL.
    pub fn split_database(&self) -> Option<(&str, &str)> {
        let (server, name) = self.database_url.rsplit_once('/')?;
        if name.is_empty() || server.ends_with('/') || !server.contains("://") {
            return None;
        }
        Some((server, name))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_server_and_database() {
        let cfg = DbConfig::new("postgresql://db.internal:5432/kiln_prod");
        assert_eq!(
            cfg.split_database(),
            Some(("postgresql://db.internal:5432", "kiln_prod"))
        );
    }

    #[test]
    fn split_rejects_url_without_database_segment() {
        // The last '/' here belongs to the scheme separator.
        let cfg = DbConfig::new("postgresql://localhost:5432");
        assert_eq!(cfg.split_database(), None);

        let cfg = DbConfig::new("postgresql://localhost:5432/");
        assert_eq!(cfg.split_database(), None);
    }

    #[test]
    fn pool_size_builder() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_URL).with_max_connections(1);
        assert_eq!(cfg.max_connections, 1);
        assert_eq!(DbConfig::new(DbConfig::DEFAULT_URL).max_connections, 5);
    }

    #[test]
    fn default_url_points_at_localhost() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_URL);
        let (server, name) = cfg.split_database().expect("default URL must split");
        assert_eq!(server, "postgresql://localhost:5432");
        assert_eq!(name, "kiln");
    }
}
