//! Logging initialization and the operator HTTP endpoint.
//!
//! Logging goes through `tracing-subscriber` with an `EnvFilter` (`RUST_LOG`
//! wins over the configured filter) and either human-readable or JSON output.
//! The optional HTTP endpoint serves Prometheus metrics, liveness and
//! readiness probes, and the latest consensus snapshot.

use crate::status::StatusHandle;
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Configuration for telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported by the status endpoint and attached to the startup log line.
    pub service_name: String,
    pub log_format: LogFormat,
    /// Filter directives used when `RUST_LOG` is not set.
    pub log_filter: String,
    /// Enable the metrics/status HTTP endpoint.
    pub prometheus_enabled: bool,
    pub prometheus_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "pbft-node".to_string(),
            log_format: LogFormat::Text,
            log_filter: "info,pbft=debug".to_string(),
            prometheus_enabled: false,
            prometheus_port: 9090,
        }
    }
}

/// Initialize logging and, if enabled, the HTTP endpoint.
///
/// Must be called from inside a tokio runtime when the endpoint is enabled.
pub fn init_telemetry(
    config: &TelemetryConfig,
    status: StatusHandle,
) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter)?,
    };

    let (text_layer, json_layer) = match config.log_format {
        LogFormat::Text => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_ids(true),
            ),
        ),
    };

    let subscriber = Registry::default()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer);

    tracing::subscriber::set_global_default(subscriber)?;

    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        format = ?config.log_format,
        "Telemetry initialized"
    );

    let ready_flag = Arc::new(AtomicBool::new(false));
    let server_handle = config.prometheus_enabled.then(|| {
        start_metrics_server(config.prometheus_port, ready_flag.clone(), status)
    });

    Ok(TelemetryGuard {
        server_handle,
        ready_flag,
    })
}

/// Keeps the HTTP endpoint alive. Dropping it stops the server.
pub struct TelemetryGuard {
    server_handle: Option<tokio::task::JoinHandle<()>>,
    ready_flag: Arc<AtomicBool>,
}

impl TelemetryGuard {
    /// Mark the node as ready (for readiness probe).
    ///
    /// Call this once the runner is consuming events.
    pub fn set_ready(&self, ready: bool) {
        self.ready_flag.store(ready, Ordering::SeqCst);
    }

    pub fn shutdown(mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HTTP Server
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct EndpointState {
    ready: Arc<AtomicBool>,
    status: StatusHandle,
}

/// Routes:
/// - `GET /metrics` - Prometheus metrics in text format
/// - `GET /health` - Liveness probe (always returns 200 if server is running)
/// - `GET /ready` - Readiness probe (returns 200 if node is ready, 503 otherwise)
/// - `GET /status` - Latest consensus snapshot (503 before the runner starts)
fn router(ready: Arc<AtomicBool>, status: StatusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(EndpointState { ready, status })
}

fn start_metrics_server(
    port: u16,
    ready: Arc<AtomicBool>,
    status: StatusHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(ready, status);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!(port, "Starting metrics server on http://{}", addr);

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = ?e, port, "Failed to bind metrics server");
                return;
            }
        };

        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "Metrics server error");
        }
    })
}

async fn metrics_handler() -> axum::response::Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = ?e, "Failed to encode metrics");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            axum::http::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )],
        buffer,
    )
        .into_response()
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(HealthResponse { status: "ok" })
}

async fn ready_handler(State(state): State<EndpointState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (
            axum::http::StatusCode::OK,
            axum::Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(ReadyResponse {
                status: "not_ready",
                ready: false,
            }),
        )
    }
}

async fn status_handler(State(state): State<EndpointState>) -> axum::response::Response {
    match state.status.response() {
        Some(response) => axum::Json(response).into_response(),
        None => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "consensus not started",
        )
            .into_response(),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    async fn get_json(
        app: Router,
        uri: &str,
    ) -> (axum::http::StatusCode, Option<serde_json::Value>) {
        let request = axum::http::Request::builder()
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).ok())
    }

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "pbft-node");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(!config.prometheus_enabled);
        assert_eq!(config.prometheus_port, 9090);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(Arc::new(AtomicBool::new(false)), StatusHandle::new());
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body.unwrap()["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_endpoint_follows_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let app = router(ready.clone(), StatusHandle::new());

        let (status, body) = get_json(app.clone(), "/ready").await;
        assert_eq!(status, axum::http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.unwrap()["status"], "not_ready");

        ready.store(true, Ordering::SeqCst);
        let (status, body) = get_json(app, "/ready").await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body.unwrap()["ready"], true);
    }

    #[tokio::test]
    async fn test_status_unavailable_before_start() {
        let app = router(Arc::new(AtomicBool::new(false)), StatusHandle::new());
        let (status, _) = get_json(app, "/status").await;
        assert_eq!(status, axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        crate::metrics::record_view_changes(1);
        let app = router(Arc::new(AtomicBool::new(false)), StatusHandle::new());
        let request = axum::http::Request::builder()
            .uri("/metrics")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("pbft_view_changes_total"));
    }
}
