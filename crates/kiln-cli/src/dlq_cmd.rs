//! The `kiln dlq` admin commands.

use anyhow::Result;

use kiln_core::broker::BrokerConfig;
use kiln_core::dlq::DeadLetterQueue;
use kiln_core::queue::TaskQueues;

/// List parked tasks.
pub async fn run_dlq_list(
    broker: &BrokerConfig,
    limit: usize,
    offset: usize,
    eval_id: Option<&str>,
) -> Result<()> {
    let conn = broker.connect().await?;
    let dlq = DeadLetterQueue::new(conn);

    let tasks = dlq.list(limit, offset, eval_id).await?;
    if tasks.is_empty() {
        println!("Dead-letter queue is empty.");
        return Ok(());
    }

    for task in &tasks {
        println!(
            "{}  eval={}  retries={}  {}  ({})",
            task.task_id, task.eval_id, task.retry_count, task.exception_class, task.added_at
        );
    }
    Ok(())
}

/// Print DLQ statistics.
pub async fn run_dlq_stats(broker: &BrokerConfig) -> Result<()> {
    let conn = broker.connect().await?;
    let dlq = DeadLetterQueue::new(conn);

    let stats = dlq.statistics().await?;
    println!("Queue size: {}", stats.queue_size);
    if !stats.exception_breakdown.is_empty() {
        println!("By exception:");
        for (exception, count) in &stats.exception_breakdown {
            println!("  {exception}: {count}");
        }
    }
    if !stats.task_breakdown.is_empty() {
        println!("By task:");
        for (task, count) in &stats.task_breakdown {
            println!("  {task}: {count}");
        }
    }
    Ok(())
}

/// Show one parked task in full.
pub async fn run_dlq_show(broker: &BrokerConfig, task_id: &str) -> Result<()> {
    let conn = broker.connect().await?;
    let dlq = DeadLetterQueue::new(conn);

    match dlq.get(task_id).await? {
        Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
        None => println!("Task {task_id} not found in DLQ."),
    }
    Ok(())
}

/// Resubmit a parked task to its original queue.
pub async fn run_dlq_retry(broker: &BrokerConfig, task_id: &str) -> Result<()> {
    let conn = broker.connect().await?;
    let dlq = DeadLetterQueue::new(conn.clone());
    let queues = TaskQueues::new(conn);

    if dlq.retry(task_id, &queues).await? {
        println!("Task {task_id} resubmitted.");
    } else {
        println!("Task {task_id} not found in DLQ.");
    }
    Ok(())
}

/// Permanently remove a parked task.
pub async fn run_dlq_remove(broker: &BrokerConfig, task_id: &str) -> Result<()> {
    let conn = broker.connect().await?;
    let dlq = DeadLetterQueue::new(conn);

    if dlq.remove(task_id).await? {
        println!("Task {task_id} removed.");
    } else {
        println!("Task {task_id} not found in DLQ.");
    }
    Ok(())
}
