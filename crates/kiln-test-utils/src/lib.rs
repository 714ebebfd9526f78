//! Shared test infrastructure: a PostgreSQL server and a Redis server,
//! started once per test binary, with per-test isolation on top.
//!
//! Set `KILN_TEST_PG_URL` / `KILN_TEST_REDIS_URL` to point the tests at
//! externally managed instances (CI); otherwise containers are started on
//! demand via testcontainers and kept alive for the life of the process.
//!
//! Per-test isolation differs per backend: PostgreSQL tests each get a
//! freshly-created database (provisioned through `kiln-db`'s own
//! primitives, so database creation and migration run the same code paths
//! production uses), while Redis tests cycle through the server's 16
//! logical databases, flushing on acquisition.

use std::sync::atomic::{AtomicUsize, Ordering};

use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use uuid::Uuid;

use kiln_db::config::DbConfig;
use kiln_db::pool;

/// A backing server: its URL plus the container handle kept alive when this
/// process started one itself (external instances have no handle).
struct Backing<I: testcontainers::Image> {
    url: String,
    _container: Option<ContainerAsync<I>>,
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

static PG: OnceCell<Backing<Postgres>> = OnceCell::const_new();

/// Server-root URL of the shared PostgreSQL (no database segment).
pub async fn pg_url() -> &'static str {
    let backing = PG
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("KILN_TEST_PG_URL") {
                return Backing {
                    url,
                    _container: None,
                };
            }

            let container = Postgres::default()
                .with_tag("17")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("failed to get host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get mapped port");

            Backing {
                url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: Some(container),
            }
        })
        .await;
    &backing.url
}

/// Create a migrated, uniquely-named database on the shared server.
///
/// Returns the pool and the database name; pass the name to
/// [`drop_test_db`] when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let server = pg_url().await;
    let name = format!("kiln_test_{}", Uuid::new_v4().simple());
    let config = DbConfig::new(format!("{server}/{name}"));

    pool::create_database_if_missing(&config)
        .await
        .expect("failed to create test database");
    let pg = pool::connect(&config)
        .await
        .expect("failed to connect to test database");
    pool::apply_migrations(&pg)
        .await
        .expect("migrations should apply cleanly");

    (pg, name)
}

/// Drop a test database, kicking out any session still attached.
///
/// Best-effort: a database that is already gone (or a server that has shut
/// down mid-teardown) is not an error.
pub async fn drop_test_db(name: &str) {
    let server = pg_url().await;
    let admin = DbConfig::new(format!("{server}/postgres")).with_max_connections(1);
    let Ok(admin_pool) = pool::connect(&admin).await else {
        return;
    };

    // WITH (FORCE) terminates lingering sessions (PostgreSQL 13+), so no
    // separate pg_terminate_backend pass is needed.
    let statement = format!("DROP DATABASE IF EXISTS {name} WITH (FORCE)");
    let _ = admin_pool.execute(statement.as_str()).await;
    admin_pool.close().await;
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

static REDIS: OnceCell<Backing<Redis>> = OnceCell::const_new();

/// Next logical database index to hand out. Redis ships with 16 logical
/// databases; tests within one binary cycle through them, flushing on
/// acquisition. Keep the number of concurrently-running broker tests per
/// binary at or below 16.
static NEXT_REDIS_DB: AtomicUsize = AtomicUsize::new(0);

/// Base URL for the shared Redis (no logical database index appended).
pub async fn redis_base_url() -> &'static str {
    let backing = REDIS
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("KILN_TEST_REDIS_URL") {
                return Backing {
                    url,
                    _container: None,
                };
            }

            let container = Redis::default()
                .with_tag("7")
                .start()
                .await
                .expect("failed to start Redis container");
            let host = container.get_host().await.expect("failed to get host");
            let port = container
                .get_host_port_ipv4(6379)
                .await
                .expect("failed to get mapped port");

            Backing {
                url: format!("redis://{host}:{port}"),
                _container: Some(container),
            }
        })
        .await;
    &backing.url
}

/// Acquire an isolated Redis logical database for one test.
///
/// Returns `(connection_manager, url)`. The database is flushed before being
/// handed out, so tests start from an empty keyspace.
pub async fn create_test_redis() -> (redis::aio::ConnectionManager, String) {
    let base_url = redis_base_url().await;
    let db_index = NEXT_REDIS_DB.fetch_add(1, Ordering::SeqCst) % 16;
    let url = format!("{base_url}/{db_index}");

    let client = redis::Client::open(url.as_str()).expect("failed to build redis client");
    let mut conn = client
        .get_connection_manager()
        .await
        .expect("failed to connect to redis container");

    let _: () = redis::cmd("FLUSHDB")
        .query_async(&mut conn)
        .await
        .expect("failed to flush test redis database");

    (conn, url)
}
