//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness check (always 200 if process is running)
//!   GET /readyz   - Readiness check (200 if the blob store is reachable)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

use odrive_cache::DrainController;
use odrive_events::{AuditSink, EventSink};

pub type Labels = Vec<(String, String)>;

/// Counters the request handlers update.
pub struct ServerMetrics {
    pub requests: Family<Labels, Counter>,
    pub upload_bytes: Counter,
    pub download_bytes: Counter,
    pub drain_pending: Gauge,
    pub audit_dropped: Gauge,
    pub events_dropped: Gauge,
}

impl ServerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let m = Self {
            requests: Family::default(),
            upload_bytes: Counter::default(),
            download_bytes: Counter::default(),
            drain_pending: Gauge::default(),
            audit_dropped: Gauge::default(),
            events_dropped: Gauge::default(),
        };
        registry.register(
            "odrive_requests",
            "Object API requests by action and result",
            m.requests.clone(),
        );
        registry.register(
            "odrive_upload_bytes",
            "Plaintext bytes accepted by uploads",
            m.upload_bytes.clone(),
        );
        registry.register(
            "odrive_download_bytes",
            "Plaintext bytes served by downloads",
            m.download_bytes.clone(),
        );
        registry.register(
            "odrive_drain_pending",
            "Ciphertext files waiting for write-back",
            m.drain_pending.clone(),
        );
        registry.register(
            "odrive_audit_dropped",
            "Audit records dropped on queue overflow",
            m.audit_dropped.clone(),
        );
        registry.register(
            "odrive_events_dropped",
            "Action events dropped on queue overflow",
            m.events_dropped.clone(),
        );
        m
    }

    pub fn request(&self, action: &str, result: &str) {
        self.requests
            .get_or_create(&vec![
                ("action".to_string(), action.to_string()),
                ("result".to_string(), result.to_string()),
            ])
            .inc();
    }
}

/// Shared health state updated by the daemon
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub metrics: Arc<ServerMetrics>,
    /// Absent for the null backend, which has nothing to check.
    pub operator: Option<opendal::Operator>,
    pub drain: Arc<DrainController>,
    pub audit: Arc<AuditSink>,
    pub events: Arc<EventSink>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9100")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

fn as_gauge(v: impl TryInto<i64>) -> i64 {
    v.try_into().unwrap_or(i64::MAX)
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    state.metrics.drain_pending.set(as_gauge(state.drain.pending()));
    state.metrics.audit_dropped.set(as_gauge(state.audit.dropped()));
    state.metrics.events_dropped.set(as_gauge(state.events.dropped()));

    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness check: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check: returns 200 if the blob store is reachable, 503 otherwise.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match &state.operator {
        Some(op) => match odrive_storage::check_health(op).await {
            Ok(()) => (StatusCode::OK, "ready"),
            Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage unreachable"),
        },
        None => (StatusCode::OK, "ready (local cache only)"),
    }
}
