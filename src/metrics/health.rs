//! Health check endpoints and Prometheus metrics server

use crate::metrics::collector::MetricsCollector;
use crate::service::health::{HealthCheck, HealthStatus, ServiceProbe};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const SERVICE_NAME: &str = "ranked-ladder";

/// Health server configuration
#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Shared state for the health server
#[derive(Clone)]
pub struct HealthServerState {
    pub metrics_collector: Arc<MetricsCollector>,
    pub probe: Option<ServiceProbe>,
}

/// HTTP server for health probes, statistics and Prometheus scraping
pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthServer {
    pub fn new(config: HealthServerConfig, metrics_collector: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            state: HealthServerState {
                metrics_collector,
                probe: None,
            },
            shutdown_tx,
        }
    }

    /// Attach the probe used to answer health and stats requests
    pub fn with_probe(mut self, probe: ServiceProbe) -> Self {
        self.state.probe = Some(probe);
        self
    }

    /// Serve until [`HealthServer::stop`] is called
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid health server address")?;

        let app = self.create_router();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind health server to {}", addr))?;

        info!("Health server listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Health server shutdown signal received");
            })
            .await?;

        info!("Health server stopped");
        Ok(())
    }

    fn create_router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/alive", get(alive_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .with_state(self.state.clone())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping health server...");

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal to health server: {}", e);
        }
        Ok(())
    }
}

fn status_code(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn not_initialized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "status": "unhealthy",
            "service": SERVICE_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "error": "Service not initialized"
        })),
    )
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/ready", "/alive", "/metrics", "/stats"]
    }))
}

async fn health_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Health check requested");

    let Some(probe) = &state.probe else {
        return not_initialized();
    };
    let health = HealthCheck::check(probe).await;
    let status = match health.status {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Unhealthy => "unhealthy",
    };

    (
        status_code(health.status),
        Json(json!({
            "status": status,
            "service": health.service,
            "version": health.version,
            "checks": health.checks
        })),
    )
}

async fn ready_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Readiness check requested");

    match &state.probe {
        Some(probe) => match HealthCheck::readiness_check(probe).await {
            HealthStatus::Healthy => (StatusCode::OK, "Ready"),
            HealthStatus::Degraded => (StatusCode::OK, "Degraded but ready"),
            HealthStatus::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "Not ready"),
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized"),
    }
}

async fn alive_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Liveness check requested");

    match &state.probe {
        Some(probe) => match HealthCheck::liveness_check(probe).await {
            HealthStatus::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "Not alive"),
            _ => (StatusCode::OK, "Alive"),
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized"),
    }
}

async fn metrics_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Metrics endpoint requested");

    match encode_metrics(&state.metrics_collector) {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            output,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics".to_string(),
            )
                .into_response()
        }
    }
}

async fn stats_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Stats endpoint requested");

    let Some(probe) = &state.probe else {
        return not_initialized();
    };
    let health = HealthCheck::check(probe).await;
    let stats = &health.stats;

    (
        StatusCode::OK,
        Json(json!({
            "service": {
                "name": health.service,
                "version": health.version,
                "status": health.status,
                "uptime_seconds": health.uptime_seconds
            },
            "queues": {
                "waiting": stats.total_waiting,
                "by_platform": stats.players_waiting
            },
            "matches": {
                "pending": stats.pending_matches,
                "confirming": stats.confirming_matches,
                "proposed": stats.matches_proposed,
                "completed": stats.matches_completed,
                "cancelled": stats.matches_cancelled,
                "timed_out": stats.matches_timed_out,
                "unresolved_expiries": stats.unresolved_expiries
            },
            "players": {
                "registered": stats.registered_players
            },
            "commands": {
                "processed": stats.commands_processed,
                "rejected": stats.commands_rejected
            },
            "rating_period": stats.rating_period,
            "components": health.checks,
            "timestamp": health.timestamp
        })),
    )
}

/// Render every registered metric in the Prometheus text format
pub fn encode_metrics(metrics_collector: &MetricsCollector) -> Result<String> {
    let metric_families = metrics_collector.registry().gather();
    TextEncoder::new()
        .encode_to_string(&metric_families)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::LadderStats;
    use axum::{body::Body, http::Request};
    use tokio::sync::{watch, RwLock};
    use tower::ServiceExt;

    fn server() -> HealthServer {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        HealthServer::new(HealthServerConfig::default(), collector)
    }

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_root_endpoint() {
        let app = server().create_router();
        assert_eq!(get_status(app, "/").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        collector.record_match_proposed();
        collector.update_health_status(2);

        let app = HealthServer::new(HealthServerConfig::default(), collector).create_router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));
    }

    #[tokio::test]
    async fn test_endpoints_without_probe() {
        let app = server().create_router();

        for uri in ["/health", "/ready", "/alive", "/stats"] {
            assert_eq!(
                get_status(app.clone(), uri).await,
                StatusCode::SERVICE_UNAVAILABLE,
                "{}",
                uri
            );
        }
    }

    #[tokio::test]
    async fn test_endpoints_with_running_probe() {
        let (_stats_tx, stats_rx) = watch::channel(LadderStats::default());
        let probe = ServiceProbe::new(SERVICE_NAME, Arc::new(RwLock::new(true)), stats_rx);
        let app = server().with_probe(probe).create_router();

        for uri in ["/health", "/ready", "/alive", "/stats"] {
            assert_eq!(get_status(app.clone(), uri).await, StatusCode::OK, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_404_handling() {
        let app = server().create_router();
        assert_eq!(get_status(app, "/nonexistent").await, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_encoded_metrics_use_service_prefix() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_match_proposed();

        let text = encode_metrics(&collector).unwrap();
        assert!(text.contains("ranked_ladder_matches_proposed_total"));
    }
}
