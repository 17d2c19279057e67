//! Prometheus metrics exposed on the worker's minimal status surface
//! (§6.5): `GET /health` and `GET /metrics`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder, TEXT_FORMAT};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// All Prometheus metrics for the relay worker. Cheap to clone — registry
/// and collectors are themselves `Arc`-backed internally.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    pub process_start_time_seconds: Gauge,
    pub relay_inflight_uploads: Gauge,
    pub relay_paused_total: IntCounter,
    pub relay_paused_seconds_total: Gauge,
    pub relay_bytes_transferred_total: IntCounter,
    pub relay_progress_writes_total: IntCounter,
    pub relay_part_retries_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry.register(Box::new(process_start_time_seconds.clone())).unwrap();

        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        let relay_inflight_uploads = Gauge::new(
            "relay_inflight_uploads",
            "Number of part uploads currently in flight",
        )
        .unwrap();
        registry.register(Box::new(relay_inflight_uploads.clone())).unwrap();

        let relay_paused_total = IntCounter::new(
            "relay_paused_total",
            "Number of times the reader was paused for backpressure",
        )
        .unwrap();
        registry.register(Box::new(relay_paused_total.clone())).unwrap();

        let relay_paused_seconds_total = Gauge::new(
            "relay_paused_seconds_total",
            "Cumulative time the reader has spent paused for backpressure",
        )
        .unwrap();
        registry
            .register(Box::new(relay_paused_seconds_total.clone()))
            .unwrap();

        let relay_bytes_transferred_total = IntCounter::new(
            "relay_bytes_transferred_total",
            "Total bytes read from the source across the worker's lifetime",
        )
        .unwrap();
        registry
            .register(Box::new(relay_bytes_transferred_total.clone()))
            .unwrap();

        let relay_progress_writes_total = IntCounter::new(
            "relay_progress_writes_total",
            "Total throttled writes issued to the progress store",
        )
        .unwrap();
        registry
            .register(Box::new(relay_progress_writes_total.clone()))
            .unwrap();

        let relay_part_retries_total = IntCounter::new(
            "relay_part_retries_total",
            "Total part-upload retry attempts at the Scheduler layer",
        )
        .unwrap();
        registry.register(Box::new(relay_part_retries_total.clone())).unwrap();

        Metrics {
            registry,
            process_start_time_seconds,
            relay_inflight_uploads,
            relay_paused_total,
            relay_paused_seconds_total,
            relay_bytes_transferred_total,
            relay_progress_writes_total,
            relay_part_retries_total,
        }
    }
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response();
    }
    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}

/// The worker's status surface: `GET /health`, `GET /metrics`.
pub fn status_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_panicking() {
        let metrics = Metrics::new();
        let families = metrics.registry.gather();
        assert!(!families.is_empty());
    }

    #[tokio::test]
    async fn health_handler_reports_ok_status() {
        let axum::Json(body) = health_handler().await;
        assert_eq!(body["status"], "ok");
    }
}
