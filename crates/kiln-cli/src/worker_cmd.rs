//! The `kiln worker` command: runs the dispatcher fleet plus the background
//! maintenance tasks (running-index listener, reconciler, DLQ monitor).

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use kiln_core::broker::BrokerConfig;
use kiln_core::config::KilnConfig;
use kiln_core::dispatcher::{Dispatcher, DispatcherConfig};
use kiln_core::dlq::DeadLetterQueue;
use kiln_core::events::EventPublisher;
use kiln_core::executor::ExecutorClient;
use kiln_core::pool::ExecutorPool;
use kiln_core::queue::TaskQueues;
use kiln_core::running::{self, RunningIndex};

/// Run dispatcher workers until ctrl-c.
///
/// Shutdown is cooperative: the token stops queue polling, in-flight
/// evaluations run to their own timeout, and the join below drains them.
pub async fn run_worker(
    pg: PgPool,
    broker: &BrokerConfig,
    config: &KilnConfig,
    init_pool: bool,
) -> Result<()> {
    let conn = broker.connect().await?;

    let pool = ExecutorPool::new(conn.clone());
    let index = RunningIndex::new(conn.clone());
    let publisher = EventPublisher::new(conn.clone(), pg.clone());
    let dlq = DeadLetterQueue::new(conn.clone()).with_retention_days(config.dlq_retention_days);

    if init_pool {
        pool.initialize(&config.executor_urls()).await?;
    }

    let dispatcher_config = DispatcherConfig {
        queue_poll: config.queue_poll,
        claim_wait_max: config.claim_wait_max,
        claim_backoff: config.claim_backoff,
    };

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    for worker_id in 0..config.worker_concurrency {
        // Each worker polls with BRPOP, which blocks its connection
        // server-side, so every worker gets a dedicated one.
        let poll_conn = broker.connect().await?;
        let dispatcher = Dispatcher::new(
            pg.clone(),
            conn.clone(),
            TaskQueues::new(poll_conn),
            pool.clone(),
            ExecutorClient::new()?,
            publisher.clone(),
            index.clone(),
            dlq.clone(),
            config.truncation(),
            dispatcher_config.clone(),
        );
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.run_worker(worker_id, token).await;
        }));
    }

    // Event listener keeping the running index consistent.
    handles.push(tokio::spawn(running::run_listener(
        broker.client()?,
        index.clone(),
        shutdown.clone(),
    )));

    // Periodic reconciler: the listener's backstop.
    handles.push(tokio::spawn(running::run_reconciler(
        index,
        pg.clone(),
        config.reconcile_interval,
        shutdown.clone(),
    )));

    // Reconcile the index once on boot so restarts clear stale entries
    // immediately rather than waiting an interval.
    {
        let index = RunningIndex::new(conn.clone());
        if let Err(e) = index.reconcile(&pg).await {
            tracing::warn!(error = %e, "boot-time index reconciliation failed");
        }
    }

    // DLQ monitor.
    {
        let dlq = dlq.clone();
        let interval = config.dlq_monitor_interval;
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = dlq.monitor().await {
                            tracing::warn!(error = %e, "DLQ monitor pass failed");
                        }
                    }
                    _ = token.cancelled() => return,
                }
            }
        }));
    }

    tracing::info!(
        workers = config.worker_concurrency,
        "kiln worker fleet running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; draining in-flight evaluations");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("kiln worker fleet stopped");
    Ok(())
}
