//! Integration tests for the executor pool registry.
//!
//! Each test gets an isolated Redis logical database from the shared
//! container.

use std::time::Duration;

use kiln_core::pool::{ExecutorPool, ReleaseStatus};
use kiln_test_utils::create_test_redis;

fn urls(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("http://executor-{i}:8083")).collect()
}

#[tokio::test]
async fn claim_release_claim_roundtrip() {
    let (conn, _url) = create_test_redis().await;
    let pool = ExecutorPool::new(conn);

    pool.initialize(&urls(1)).await.unwrap();

    let claimed = pool.claim("eval_1", 60).await.unwrap();
    assert_eq!(claimed.as_deref(), Some("http://executor-1:8083"));

    // While claimed, no other claimant sees the URL.
    let second = pool.claim("eval_2", 60).await.unwrap();
    assert!(second.is_none());

    let status = pool.release("http://executor-1:8083").await.unwrap();
    assert_eq!(status, ReleaseStatus::Released);

    let reclaimed = pool.claim("eval_3", 60).await.unwrap();
    assert_eq!(reclaimed.as_deref(), Some("http://executor-1:8083"));
}

#[tokio::test]
async fn every_executor_is_available_xor_busy() {
    let (conn, _url) = create_test_redis().await;
    let pool = ExecutorPool::new(conn);

    pool.initialize(&urls(3)).await.unwrap();

    let status = pool.status().await.unwrap();
    assert_eq!(status.available, 3);
    assert_eq!(status.busy, 0);
    assert_eq!(status.total, 3);

    let claimed = pool.claim("eval_1", 60).await.unwrap().unwrap();

    let status = pool.status().await.unwrap();
    assert_eq!(status.available, 2);
    assert_eq!(status.busy, 1);
    assert_eq!(status.total, 3, "conservation of workers");
    assert_eq!(status.busy_executors.len(), 1);
    assert_eq!(status.busy_executors[0].url, claimed);
    assert_eq!(status.busy_executors[0].eval_id.as_deref(), Some("eval_1"));
    assert!(status.busy_executors[0].ttl_seconds > 0);
    assert!(status.busy_executors[0].ttl_seconds <= 60);
}

#[tokio::test]
async fn double_release_never_duplicates() {
    let (conn, _url) = create_test_redis().await;
    let pool = ExecutorPool::new(conn);

    pool.initialize(&urls(1)).await.unwrap();
    let url = pool.claim("eval_1", 60).await.unwrap().unwrap();

    let first = pool.release(&url).await.unwrap();
    assert_eq!(first, ReleaseStatus::Released);

    // Duplicate release: the marker is gone and the URL is already queued.
    let second = pool.release(&url).await.unwrap();
    assert_eq!(second, ReleaseStatus::AlreadyInPool);

    let status = pool.status().await.unwrap();
    assert_eq!(status.available, 1, "exactly one entry after double release");
    assert_eq!(status.busy, 0);

    // And a release for a URL that was never claimed is a no-op too.
    pool.initialize(&urls(1)).await.unwrap();
    let claimed = pool.claim("eval_2", 60).await.unwrap().unwrap();
    pool.release(&claimed).await.unwrap();
    pool.release(&claimed).await.unwrap();
    pool.release(&claimed).await.unwrap();
    let status = pool.status().await.unwrap();
    assert_eq!(status.available, 1);
}

#[tokio::test]
async fn release_without_claim_reports_not_busy() {
    let (conn, _url) = create_test_redis().await;
    let pool = ExecutorPool::new(conn);

    // Pool never initialized with this URL and it was never claimed.
    let status = pool.release("http://executor-9:8083").await.unwrap();
    assert_eq!(status, ReleaseStatus::NotBusy);

    let pool_status = pool.status().await.unwrap();
    assert_eq!(pool_status.available, 0, "not-busy release adds nothing");
}

#[tokio::test]
async fn claim_from_empty_pool_returns_none() {
    let (conn, _url) = create_test_redis().await;
    let pool = ExecutorPool::new(conn);

    pool.initialize(&[]).await.unwrap();
    assert!(pool.claim("eval_1", 60).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_lease_is_recoverable() {
    let (conn, _url) = create_test_redis().await;
    let pool = ExecutorPool::new(conn);
    let known = urls(1);

    pool.initialize(&known).await.unwrap();

    // Claim with a 1-second lease and simulate a crashed dispatcher: no
    // release ever happens.
    let url = pool.claim("eval_crash", 1).await.unwrap().unwrap();
    assert!(pool.claim("eval_other", 60).await.unwrap().is_none());

    // Wait for the busy marker to expire.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let status = pool.status().await.unwrap();
    assert_eq!(status.busy, 0, "lease must expire on its own");

    // The reconciliation pass returns the executor to the pool.
    let recovered = pool.recover_stale(&known).await.unwrap();
    assert_eq!(recovered, 1);

    let reclaimed = pool.claim("eval_new", 60).await.unwrap();
    assert_eq!(reclaimed.as_deref(), Some(url.as_str()));
}

#[tokio::test]
async fn recover_stale_leaves_healthy_state_alone() {
    let (conn, _url) = create_test_redis().await;
    let pool = ExecutorPool::new(conn);
    let known = urls(2);

    pool.initialize(&known).await.unwrap();
    pool.claim("eval_1", 60).await.unwrap().unwrap();

    // One busy, one available: nothing has leaked.
    let recovered = pool.recover_stale(&known).await.unwrap();
    assert_eq!(recovered, 0);

    let status = pool.status().await.unwrap();
    assert_eq!(status.total, 2);
}

#[tokio::test]
async fn initialize_resets_previous_state() {
    let (conn, _url) = create_test_redis().await;
    let pool = ExecutorPool::new(conn);

    pool.initialize(&urls(2)).await.unwrap();
    pool.claim("eval_1", 60).await.unwrap().unwrap();

    // Re-initialize: busy markers cleared, fresh available list.
    pool.initialize(&urls(2)).await.unwrap();
    let status = pool.status().await.unwrap();
    assert_eq!(status.available, 2);
    assert_eq!(status.busy, 0);
}
