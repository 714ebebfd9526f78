//! Integration tests for health-checked executor selection, against real
//! HTTP listeners.

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;

use kiln_core::router::{ExecutorRouter, RouterError};

/// Start a health endpoint answering with the given status.
async fn start_health_server(status: StatusCode) -> String {
    let app = Router::new().route("/health", get(move || async move { status }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn healthy_executor_is_selected() {
    let healthy = start_health_server(StatusCode::OK).await;
    let router = ExecutorRouter::new(vec![healthy.clone()]).unwrap();

    let selected = router.get_healthy().await.unwrap();
    assert_eq!(selected, healthy);
}

#[tokio::test]
async fn unhealthy_executors_are_skipped() {
    let sick = start_health_server(StatusCode::SERVICE_UNAVAILABLE).await;
    let healthy = start_health_server(StatusCode::OK).await;

    // Whatever the shuffle order, only the healthy one can be returned.
    let router = ExecutorRouter::new(vec![sick.clone(), healthy.clone()]).unwrap();
    for _ in 0..5 {
        let selected = router.get_healthy().await.unwrap();
        assert_eq!(selected, healthy);
    }
}

#[tokio::test]
async fn unreachable_executor_fails_selection() {
    // Nothing listens on this port (bound then dropped).
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let router = ExecutorRouter::new(vec![dead]).unwrap();
    let err = router.get_healthy().await.unwrap_err();
    assert!(matches!(err, RouterError::NoHealthyExecutor));
}

#[tokio::test]
async fn health_report_covers_every_executor() {
    let healthy = start_health_server(StatusCode::OK).await;
    let sick = start_health_server(StatusCode::INTERNAL_SERVER_ERROR).await;

    let router = ExecutorRouter::new(vec![healthy.clone(), sick.clone()]).unwrap();
    let report = router.health_report().await;

    assert_eq!(report.len(), 2);
    assert_eq!(report[0], (healthy, true));
    assert_eq!(report[1], (sick, false));
}
