//! Health checks for the ladder service
//!
//! Readiness and liveness are derived from a [`ServiceProbe`]: the running
//! flag owned by the application, the stats channel published by the event
//! loop and, when one is configured, the broker connection.

use crate::amqp::AmqpConnection;
use crate::service::ladder::LadderStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock};

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value exported through the service metrics
    pub fn as_gauge(self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// Everything a health check needs to look at
#[derive(Clone)]
pub struct ServiceProbe {
    name: String,
    started_at: DateTime<Utc>,
    running: Arc<RwLock<bool>>,
    stats: watch::Receiver<LadderStats>,
    amqp: Option<Arc<AmqpConnection>>,
}

impl ServiceProbe {
    pub fn new(
        name: impl Into<String>,
        running: Arc<RwLock<bool>>,
        stats: watch::Receiver<LadderStats>,
    ) -> Self {
        Self {
            name: name.into(),
            started_at: Utc::now(),
            running,
            stats,
            amqp: None,
        }
    }

    pub fn with_amqp(mut self, connection: Arc<AmqpConnection>) -> Self {
        self.amqp = Some(connection);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// False once the event loop has dropped its end of the stats channel
    pub fn event_loop_alive(&self) -> bool {
        self.stats.has_changed().is_ok()
    }

    pub fn stats(&self) -> LadderStats {
        self.stats.borrow().clone()
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub checks: Vec<ComponentCheck>,
    pub stats: LadderStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Optional error message if not healthy
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl ComponentCheck {
    fn timed(name: &str, start: Instant, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(probe: &ServiceProbe) -> Self {
        let checks = vec![
            Self::check_service_running(probe).await,
            Self::check_event_loop(probe),
            Self::check_pending_matches(probe),
            Self::check_amqp(probe),
        ];
        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthCheck {
            status,
            service: probe.name().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            uptime_seconds: probe.uptime_seconds(),
            checks,
            stats: probe.stats(),
        }
    }

    /// The process is up and its event loop is still turning
    pub async fn liveness_check(probe: &ServiceProbe) -> HealthStatus {
        if probe.is_running().await && probe.event_loop_alive() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// The service can take commands
    pub async fn readiness_check(probe: &ServiceProbe) -> HealthStatus {
        match Self::liveness_check(probe).await {
            HealthStatus::Healthy => Self::check_amqp(probe).status,
            status => status,
        }
    }

    async fn check_service_running(probe: &ServiceProbe) -> ComponentCheck {
        let start = Instant::now();
        if probe.is_running().await {
            ComponentCheck::timed("service_running", start, HealthStatus::Healthy, None)
        } else {
            ComponentCheck::timed(
                "service_running",
                start,
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        }
    }

    fn check_event_loop(probe: &ServiceProbe) -> ComponentCheck {
        let start = Instant::now();
        if probe.event_loop_alive() {
            ComponentCheck::timed("event_loop", start, HealthStatus::Healthy, None)
        } else {
            ComponentCheck::timed(
                "event_loop",
                start,
                HealthStatus::Unhealthy,
                Some("Event loop has stopped".to_string()),
            )
        }
    }

    fn check_pending_matches(probe: &ServiceProbe) -> ComponentCheck {
        let start = Instant::now();
        let unresolved = probe.stats().unresolved_expiries;
        if unresolved == 0 {
            ComponentCheck::timed("pending_matches", start, HealthStatus::Healthy, None)
        } else {
            ComponentCheck::timed(
                "pending_matches",
                start,
                HealthStatus::Degraded,
                Some(format!(
                    "{} expired matches are waiting to be resolved",
                    unresolved
                )),
            )
        }
    }

    fn check_amqp(probe: &ServiceProbe) -> ComponentCheck {
        let start = Instant::now();
        match &probe.amqp {
            Some(connection) if connection.is_alive() => {
                ComponentCheck::timed("amqp_connection", start, HealthStatus::Healthy, None)
            }
            Some(_) => ComponentCheck::timed(
                "amqp_connection",
                start,
                HealthStatus::Unhealthy,
                Some("Broker connection is closed".to_string()),
            ),
            None => ComponentCheck::timed(
                "amqp_connection",
                start,
                HealthStatus::Healthy,
                Some("No broker configured".to_string()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(running: bool) -> (ServiceProbe, watch::Sender<LadderStats>) {
        let (stats_tx, stats_rx) = watch::channel(LadderStats::default());
        let probe = ServiceProbe::new("ranked-ladder", Arc::new(RwLock::new(running)), stats_rx);
        (probe, stats_tx)
    }

    #[tokio::test]
    async fn test_healthy_service() {
        let (probe, _stats_tx) = probe(true);

        let health = HealthCheck::check(&probe).await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.checks.len(), 4);
        assert_eq!(
            HealthCheck::readiness_check(&probe).await,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_unresolved_expiries_degrade() {
        let (probe, stats_tx) = probe(true);
        stats_tx.send_replace(LadderStats {
            unresolved_expiries: 2,
            ..LadderStats::default()
        });

        let health = HealthCheck::check(&probe).await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.stats.unresolved_expiries, 2);
        assert_eq!(
            HealthCheck::liveness_check(&probe).await,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_stopped_event_loop_is_unhealthy() {
        let (probe, stats_tx) = probe(true);
        drop(stats_tx);

        assert!(!probe.event_loop_alive());
        assert_eq!(
            HealthCheck::liveness_check(&probe).await,
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthCheck::check(&probe).await.status,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_not_running_is_unhealthy() {
        let (probe, _stats_tx) = probe(false);
        assert_eq!(
            HealthCheck::readiness_check(&probe).await,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_status_gauge_values() {
        assert_eq!(HealthStatus::Healthy.as_gauge(), 2);
        assert_eq!(HealthStatus::Degraded.as_gauge(), 1);
        assert_eq!(HealthStatus::Unhealthy.as_gauge(), 0);
        assert!(HealthStatus::Unhealthy > HealthStatus::Degraded);
    }
}
