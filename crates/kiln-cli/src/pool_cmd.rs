//! The `kiln pool` admin commands.

use anyhow::Result;

use kiln_core::broker::BrokerConfig;
use kiln_core::config::KilnConfig;
use kiln_core::pool::ExecutorPool;
use kiln_core::router::ExecutorRouter;

/// Initialize the executor pool from the configured executor set.
pub async fn run_pool_init(broker: &BrokerConfig, config: &KilnConfig) -> Result<()> {
    let conn = broker.connect().await?;
    let pool = ExecutorPool::new(conn);
    let urls = config.executor_urls();

    pool.initialize(&urls).await?;

    println!("Executor pool initialized with {} executors:", urls.len());
    for url in &urls {
        println!("  {url}");
    }
    Ok(())
}

/// Print pool status: available/busy counts plus per-busy detail.
pub async fn run_pool_status(broker: &BrokerConfig) -> Result<()> {
    let conn = broker.connect().await?;
    let pool = ExecutorPool::new(conn);

    let status = pool.status().await?;
    println!(
        "Pool: {} available, {} busy, {} total",
        status.available, status.busy, status.total
    );
    for busy in &status.busy_executors {
        println!(
            "  {} -> {} (lease {}s remaining)",
            busy.url,
            busy.eval_id.as_deref().unwrap_or("?"),
            busy.ttl_seconds
        );
    }
    Ok(())
}

/// Reconcile the pool against the configured executor set.
pub async fn run_pool_recover(broker: &BrokerConfig, config: &KilnConfig) -> Result<()> {
    let conn = broker.connect().await?;
    let pool = ExecutorPool::new(conn);

    let recovered = pool.recover_stale(&config.executor_urls()).await?;
    println!("Recovered {recovered} leaked executors.");
    Ok(())
}

/// Probe every configured executor's health endpoint.
pub async fn run_pool_health(config: &KilnConfig) -> Result<()> {
    let router = ExecutorRouter::new(config.executor_urls())?;
    for (url, healthy) in router.health_report().await {
        println!("  {url}: {}", if healthy { "healthy" } else { "UNHEALTHY" });
    }
    Ok(())
}
