//! Pool construction and schema management for the durable store.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

use crate::config::DbConfig;

/// How long to wait for a pooled connection before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// PostgreSQL error code for "database already exists".
const DUPLICATE_DATABASE: &str = "42P04";

/// Open a connection pool sized per the config.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))
}

/// Create the configured database when it does not exist yet.
///
/// Issues `CREATE DATABASE` through the server's `postgres` maintenance
/// database and treats the duplicate-database error as success, so two
/// processes racing through `kiln db-init` both converge. Returns `true`
/// when this call actually created the database.
pub async fn create_database_if_missing(config: &DbConfig) -> Result<bool> {
    let (server, name) = config
        .split_database()
        .with_context(|| format!("cannot derive database name from {}", config.database_url))?;

    // CREATE DATABASE cannot take a bound parameter; refuse anything that
    // is not a plain identifier before interpolating.
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("database name {name:?} contains invalid characters");
    }

    let admin = DbConfig::new(format!("{server}/postgres")).with_max_connections(1);
    let admin_pool = connect(&admin).await?;

    let statement = format!("CREATE DATABASE {name}");
    let created = match admin_pool.execute(statement.as_str()).await {
        Ok(_) => {
            tracing::info!(db = name, "database created");
            true
        }
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(DUPLICATE_DATABASE) => {
            tracing::debug!(db = name, "database already exists");
            false
        }
        Err(e) => {
            admin_pool.close().await;
            return Err(anyhow::Error::from(e))
                .with_context(|| format!("failed to create database {name}"));
        }
    };

    admin_pool.close().await;
    Ok(created)
}

/// Apply the schema migrations shipped with this crate.
///
/// The migrator is built at runtime from the `migrations/` directory, so no
/// live database is needed at compile time.
pub async fn apply_migrations(pool: &PgPool) -> Result<()> {
    let dir = migrations_dir();
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;

    migrator
        .run(pool)
        .await
        .context("failed to apply schema migrations")?;

    tracing::info!(known = migrator.iter().count(), "schema migrations applied");
    Ok(())
}

/// Migrations directory inside the `kiln-db` source tree, resolved at
/// compile time. Installed binaries must ship a copy of the directory and
/// run the migrator against that instead.
fn migrations_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

/// Row counts of the kiln tables, for the `kiln db-init` summary.
///
/// The schema is ours, so the tables are named outright instead of being
/// discovered through catalog introspection.
pub async fn row_counts(pool: &PgPool) -> Result<Vec<(&'static str, i64)>> {
    let mut counts = Vec::with_capacity(2);
    for table in ["evaluations", "evaluation_events"] {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        counts.push((table, count));
    }
    Ok(counts)
}
