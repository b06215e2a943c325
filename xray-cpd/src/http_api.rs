//! HTTP API for metrics and health endpoints.
//!
//! Provides:
//! - `/metrics` - Prometheus metrics export
//! - `/health` - Basic daemon health check
//! - `/ready` - Readiness probe (no contended locks blocking every host)

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use serde_json::json;

use crate::queue::JobQueue;

lazy_static::lazy_static! {
    static ref JOBS_ENQUEUED_TOTAL: IntCounter = IntCounter::new(
        "xray_cp_jobs_enqueued_total",
        "Total number of install/repair jobs enqueued"
    )
    .unwrap();
    static ref JOBS_ACTIVE: IntGauge = IntGauge::new(
        "xray_cp_jobs_active",
        "Number of jobs currently being processed"
    )
    .unwrap();
}

/// Register this module's metrics with the default Prometheus registry.
/// Safe to call more than once; duplicate registration is ignored.
pub fn register_metrics() {
    let _ = prometheus::register(Box::new(JOBS_ENQUEUED_TOTAL.clone()));
    let _ = prometheus::register(Box::new(JOBS_ACTIVE.clone()));
}

pub fn record_job_enqueued() {
    JOBS_ENQUEUED_TOTAL.inc();
}

pub fn job_started() {
    JOBS_ACTIVE.inc();
}

pub fn job_finished() {
    JOBS_ACTIVE.dec();
}

fn encode_metrics() -> Result<Vec<u8>, prometheus::Error> {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub queue: Arc<JobQueue>,
    pub version: &'static str,
    pub started_at: Instant,
    pub pid: u32,
}

pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(Arc::new(state))
}

async fn metrics_handler() -> impl IntoResponse {
    match encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

/// `/health`: returns 200 OK if the daemon process is running at all.
async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();

    Json(json!({
        "status": "healthy",
        "version": state.version,
        "pid": state.pid,
        "uptime_seconds": uptime_secs,
    }))
}

/// `/ready`: the daemon has no structural reason it cannot accept new jobs.
/// Unlike a worker-pool readiness probe, this control plane has no fixed
/// capacity to exhaust — it reports ready as soon as the dispatch loop is up.
async fn ready_handler(State(_state): State<Arc<HttpState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ready" })))
}

pub async fn start_server(
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("Starting HTTP server for observability on port {}", port);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockStore;
    use crate::log_sink::InstallLogSink;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn make_test_state() -> HttpState {
        let lock_store = Arc::new(LockStore::new());
        let dir = tempfile::tempdir().unwrap();
        let log_sink = Arc::new(InstallLogSink::new(dir.path()));
        let (queue, _rx) = JobQueue::new(
            lock_store,
            log_sink,
            Duration::from_secs(900),
            Duration::from_secs(86400),
            Duration::from_secs(3600),
            Duration::from_secs(86400),
            500,
        );
        HttpState {
            queue: Arc::new(queue),
            version: "0.1.0-test",
            started_at: Instant::now(),
            pid: 12345,
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_version_and_pid() {
        let state = make_test_state().await;
        let router = create_router(state);

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["version"], "0.1.0-test");
        assert_eq!(json["pid"], 12345);
    }

    #[tokio::test]
    async fn ready_endpoint_reports_ready() {
        let state = make_test_state().await;
        let router = create_router(state);

        let response = router
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ready");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        register_metrics();
        record_job_enqueued();

        let state = make_test_state().await;
        let router = create_router(state);

        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("xray_cp_jobs_enqueued_total"));
    }
}
