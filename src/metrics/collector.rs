//! Metrics collection using Prometheus
//!
//! Every metric is registered on a private registry under the
//! `ranked_ladder_` prefix and exposed by the health server.

use crate::service::LadderStats;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the ladder service
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    service_metrics: ServiceMetrics,
    ladder_metrics: LadderMetrics,
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// AMQP deliveries and publishes by operation and status
    pub amqp_messages_total: IntCounterVec,

    pub amqp_errors_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    pub component_health: IntGaugeVec,
}

/// Ladder state and outcomes
#[derive(Clone)]
pub struct LadderMetrics {
    /// Commands handled by command and outcome (accepted, rejected, failed)
    pub commands_total: IntCounterVec,

    /// Events emitted by kind
    pub events_total: IntCounterVec,

    /// Players waiting in each platform pool
    pub players_waiting: IntGaugeVec,

    pub pending_matches: IntGauge,

    /// Pending matches with a reported score awaiting confirmation
    pub confirming_matches: IntGauge,

    pub matches_proposed_total: IntCounter,

    /// Pending matches that left the pending state, by how
    pub matches_finished_total: IntCounterVec,

    /// Expiry resolutions that failed and were left for the next sweep
    pub pending_resolution_failures_total: IntCounter,

    pub rating_periods_applied_total: IntCounter,

    pub players_decayed_total: IntCounter,

    pub registered_players: IntGauge,
}

/// Timing metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    pub command_duration: HistogramVec,

    pub job_duration: HistogramVec,

    pub rating_calculation_duration: Histogram,

    pub amqp_operation_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with a fresh registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let ladder_metrics = LadderMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            ladder_metrics,
            performance_metrics,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn ladder(&self) -> &LadderMetrics {
        &self.ladder_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Refresh the gauges from a stats snapshot
    pub fn update_from_stats(&self, stats: &LadderStats) {
        for (platform, waiting) in &stats.players_waiting {
            self.ladder_metrics
                .players_waiting
                .with_label_values(&[platform.as_str()])
                .set(*waiting as i64);
        }
        self.ladder_metrics
            .pending_matches
            .set(stats.pending_matches as i64);
        self.ladder_metrics
            .confirming_matches
            .set(stats.confirming_matches as i64);
        self.ladder_metrics
            .registered_players
            .set(stats.registered_players as i64);
    }

    /// Record a handled command
    pub fn record_command(&self, command: &str, outcome: &str, duration: Duration) {
        self.ladder_metrics
            .commands_total
            .with_label_values(&[command, outcome])
            .inc();
        self.performance_metrics
            .command_duration
            .with_label_values(&[command])
            .observe(duration.as_secs_f64());
    }

    pub fn record_event(&self, kind: &str) {
        self.ladder_metrics
            .events_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn record_job(&self, job: &str, duration: Duration) {
        self.performance_metrics
            .job_duration
            .with_label_values(&[job])
            .observe(duration.as_secs_f64());
    }

    pub fn record_match_proposed(&self) {
        self.ladder_metrics.matches_proposed_total.inc();
    }

    /// `resolution` is one of completed, cancelled, timed_out
    pub fn record_match_finished(&self, resolution: &str) {
        self.ladder_metrics
            .matches_finished_total
            .with_label_values(&[resolution])
            .inc();
    }

    pub fn record_pending_failure(&self) {
        self.ladder_metrics.pending_resolution_failures_total.inc();
    }

    pub fn record_rating_period(&self, players_decayed: usize) {
        self.ladder_metrics.rating_periods_applied_total.inc();
        self.ladder_metrics
            .players_decayed_total
            .inc_by(players_decayed as u64);
    }

    pub fn record_rating_calculation(&self, duration: Duration) {
        self.performance_metrics
            .rating_calculation_duration
            .observe(duration.as_secs_f64());
    }

    /// Record AMQP operation
    pub fn record_amqp_operation(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.service_metrics
            .amqp_messages_total
            .with_label_values(&[operation, status])
            .inc();

        if !success {
            self.service_metrics
                .amqp_errors_total
                .with_label_values(&[operation])
                .inc();
        }

        self.performance_metrics
            .amqp_operation_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    pub fn update_component_health(&self, component: &str, healthy: bool) {
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(if healthy { 1 } else { 0 });
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("ranked_ladder_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let amqp_messages_total = IntCounterVec::new(
            Opts::new(
                "ranked_ladder_amqp_messages_total",
                "Total AMQP messages consumed and published",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_messages_total.clone()))?;

        let amqp_errors_total = IntCounterVec::new(
            Opts::new("ranked_ladder_amqp_errors_total", "Total AMQP errors"),
            &["operation"],
        )?;
        registry.register(Box::new(amqp_errors_total.clone()))?;

        let health_status = IntGauge::new(
            "ranked_ladder_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("ranked_ladder_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            amqp_messages_total,
            amqp_errors_total,
            health_status,
            component_health,
        })
    }
}

impl LadderMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let commands_total = IntCounterVec::new(
            Opts::new("ranked_ladder_commands_total", "Commands handled"),
            &["command", "outcome"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let events_total = IntCounterVec::new(
            Opts::new("ranked_ladder_events_total", "Events emitted"),
            &["kind"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let players_waiting = IntGaugeVec::new(
            Opts::new(
                "ranked_ladder_players_waiting",
                "Players currently waiting in a platform pool",
            ),
            &["platform"],
        )?;
        registry.register(Box::new(players_waiting.clone()))?;

        let pending_matches =
            IntGauge::new("ranked_ladder_pending_matches", "Matches awaiting a result")?;
        registry.register(Box::new(pending_matches.clone()))?;

        let confirming_matches = IntGauge::new(
            "ranked_ladder_confirming_matches",
            "Matches with a reported score awaiting confirmation",
        )?;
        registry.register(Box::new(confirming_matches.clone()))?;

        let matches_proposed_total =
            IntCounter::new("ranked_ladder_matches_proposed_total", "Matches proposed")?;
        registry.register(Box::new(matches_proposed_total.clone()))?;

        let matches_finished_total = IntCounterVec::new(
            Opts::new(
                "ranked_ladder_matches_finished_total",
                "Pending matches resolved",
            ),
            &["resolution"],
        )?;
        registry.register(Box::new(matches_finished_total.clone()))?;

        let pending_resolution_failures_total = IntCounter::new(
            "ranked_ladder_pending_resolution_failures_total",
            "Expired pending matches whose resolution failed",
        )?;
        registry.register(Box::new(pending_resolution_failures_total.clone()))?;

        let rating_periods_applied_total = IntCounter::new(
            "ranked_ladder_rating_periods_applied_total",
            "Rating period decay sweeps applied",
        )?;
        registry.register(Box::new(rating_periods_applied_total.clone()))?;

        let players_decayed_total = IntCounter::new(
            "ranked_ladder_players_decayed_total",
            "Player ratings widened by rating period decay",
        )?;
        registry.register(Box::new(players_decayed_total.clone()))?;

        let registered_players = IntGauge::new(
            "ranked_ladder_registered_players",
            "Players known to the ladder",
        )?;
        registry.register(Box::new(registered_players.clone()))?;

        Ok(Self {
            commands_total,
            events_total,
            players_waiting,
            pending_matches,
            confirming_matches,
            matches_proposed_total,
            matches_finished_total,
            pending_resolution_failures_total,
            rating_periods_applied_total,
            players_decayed_total,
            registered_players,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let command_duration = HistogramVec::new(
            HistogramOpts::new(
                "ranked_ladder_command_duration_seconds",
                "Command handling time",
            )
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["command"],
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        let job_duration = HistogramVec::new(
            HistogramOpts::new("ranked_ladder_job_duration_seconds", "Timer job run time")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["job"],
        )?;
        registry.register(Box::new(job_duration.clone()))?;

        let rating_calculation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ranked_ladder_rating_calculation_duration_seconds",
                "Glicko-2 update time",
            )
            .buckets(vec![0.00001, 0.0001, 0.001, 0.005, 0.01]),
        )?;
        registry.register(Box::new(rating_calculation_duration.clone()))?;

        let amqp_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ranked_ladder_amqp_operation_duration_seconds",
                "AMQP operation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_operation_duration.clone()))?;

        Ok(Self {
            command_duration,
            job_duration,
            rating_calculation_duration,
            amqp_operation_duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    fn render(collector: &MetricsCollector) -> String {
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&collector.registry().gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_collectors_are_independent() {
        // Each collector owns its registry, so two can coexist
        let first = MetricsCollector::new().expect("Failed to create metrics collector");
        let second = MetricsCollector::new().expect("Failed to create metrics collector");
        first.record_match_proposed();
        assert_eq!(first.ladder().matches_proposed_total.get(), 1);
        assert_eq!(second.ladder().matches_proposed_total.get(), 0);
    }

    #[test]
    fn test_command_recording() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_command("join_queue", "accepted", Duration::from_millis(2));
        collector.record_command("join_queue", "rejected", Duration::from_millis(1));
        collector.record_command("join_queue", "accepted", Duration::from_millis(3));

        let commands = &collector.ladder().commands_total;
        assert_eq!(commands.with_label_values(&["join_queue", "accepted"]).get(), 2);
        assert_eq!(commands.with_label_values(&["join_queue", "rejected"]).get(), 1);
        assert!(render(&collector).contains("ranked_ladder_command_duration_seconds"));
    }

    #[test]
    fn test_update_from_stats() {
        let collector = MetricsCollector::new().unwrap();
        let stats = LadderStats {
            players_waiting: vec![("pc".to_string(), 4), ("switch".to_string(), 1)],
            pending_matches: 3,
            confirming_matches: 1,
            registered_players: 12,
            ..Default::default()
        };
        collector.update_from_stats(&stats);

        let ladder = collector.ladder();
        assert_eq!(ladder.players_waiting.with_label_values(&["pc"]).get(), 4);
        assert_eq!(ladder.pending_matches.get(), 3);
        assert_eq!(ladder.confirming_matches.get(), 1);
        assert_eq!(ladder.registered_players.get(), 12);
    }

    #[test]
    fn test_rating_period_and_failures() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_rating_period(40);
        collector.record_pending_failure();
        collector.record_match_finished("timed_out");

        assert_eq!(collector.ladder().players_decayed_total.get(), 40);
        assert_eq!(collector.ladder().pending_resolution_failures_total.get(), 1);
        assert_eq!(
            collector
                .ladder()
                .matches_finished_total
                .with_label_values(&["timed_out"])
                .get(),
            1
        );
    }

    #[test]
    fn test_metrics_timer() {
        let collector = MetricsCollector::new().unwrap();
        let timer = collector.start_timer();
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed() >= Duration::from_millis(10));
        assert!(timer.stop() >= Duration::from_millis(10));
    }
}
