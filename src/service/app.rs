//! Main application state and service coordination
//!
//! [`AppState`] wires storage, the rating provider, the ladder event loop,
//! the job scheduler, the AMQP consumer/publisher pair and the health server,
//! and tears them down again in order.

use crate::amqp::{
    AmqpConfig, AmqpConnection, AmqpEventPublisher, EventPublisher, LadderCommandConsumer,
    PublisherConfig,
};
use crate::config::AppConfig;
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::rating::{Glicko2RatingProvider, RatingProvider};
use crate::scheduler::{Cadence, JobKind, JobScheduler};
use crate::service::health::{HealthCheck, HealthStatus, ServiceProbe};
use crate::service::ladder::{LadderService, LadderStats};
use crate::service::runtime::{spawn_event_loop, spawn_publisher, LadderHandle};
use crate::storage::{LadderStorage, SqliteStorage};
use crate::utils::current_timestamp;
use amqprs::channel::QueueDeclareArguments;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

const HEALTH_METRICS_INTERVAL: Duration = Duration::from_secs(15);

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,
    storage: Arc<dyn LadderStorage>,
    provider: Arc<dyn RatingProvider>,
    publisher: Arc<dyn EventPublisher>,
    amqp_connection: Option<Arc<AmqpConnection>>,
    metrics_service: Option<Arc<MetricsService>>,
    metrics_collector: Arc<MetricsCollector>,

    handle: Option<LadderHandle>,
    stats: Option<watch::Receiver<LadderStats>>,
    event_loop: Option<JoinHandle<anyhow::Result<()>>>,
    publisher_task: Option<JoinHandle<()>>,
    command_consumer: Option<LadderCommandConsumer>,
    background_tasks: Vec<JoinHandle<()>>,
    scheduler_shutdown: broadcast::Sender<()>,

    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Open the data file and connect to the broker
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing ranked ladder service");
        info!(
            "Configuration: service={}, amqp_url={}, data_file={}",
            config.service.name,
            config.amqp.url,
            config.storage.data_file.display()
        );

        let storage = SqliteStorage::open(&config.storage.data_file).map_err(|e| {
            ServiceError::Initialization {
                message: format!(
                    "Failed to open data file {}: {:#}",
                    config.storage.data_file.display(),
                    e
                ),
            }
        })?;

        let metrics_collector = Self::initialize_metrics()?;
        let amqp_connection = Self::initialize_amqp(&config).await?;
        let publisher = Self::initialize_publisher(
            &config,
            &amqp_connection,
            metrics_collector.clone(),
        )
        .await?;

        let mut state = Self::with_components(config, Arc::new(storage), publisher)?;
        state.metrics_collector = metrics_collector;
        state.amqp_connection = Some(amqp_connection);
        Ok(state)
    }

    /// Assemble the service around the given storage and publisher, without a
    /// broker connection
    pub fn with_components(
        config: AppConfig,
        storage: Arc<dyn LadderStorage>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self, ServiceError> {
        let provider = Glicko2RatingProvider::new(&config.rating).map_err(|e| {
            ServiceError::Configuration {
                message: format!("Invalid rating settings: {:#}", e),
            }
        })?;
        let (scheduler_shutdown, _) = broadcast::channel(1);

        Ok(Self {
            config,
            storage,
            provider: Arc::new(provider),
            publisher,
            amqp_connection: None,
            metrics_service: None,
            metrics_collector: Self::initialize_metrics()?,
            handle: None,
            stats: None,
            event_loop: None,
            publisher_task: None,
            command_consumer: None,
            background_tasks: Vec::new(),
            scheduler_shutdown,
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Restore state, start the event loop and every background task
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting ranked ladder service");

        let mut service = LadderService::new(
            &self.config,
            self.storage.clone(),
            self.provider.clone(),
        )
        .with_metrics(self.metrics_collector.clone());

        let startup_events =
            service
                .startup(current_timestamp())
                .map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to restore ladder state: {:#}", e),
                })?;

        let runtime = spawn_event_loop(
            service,
            startup_events,
            self.config.service.command_queue_capacity,
        );
        info!("✅ Ladder event loop started");

        self.publisher_task = Some(spawn_publisher(runtime.events, self.publisher.clone()));
        self.handle = Some(runtime.handle.clone());
        self.stats = Some(runtime.stats.clone());
        self.event_loop = Some(runtime.task);

        *self.is_running.write().await = true;

        self.start_scheduler(runtime.handle.clone());
        self.start_metrics_service(runtime.stats.clone()).await;
        self.start_background_tasks(runtime.stats);

        if self.amqp_connection.is_some() {
            self.start_amqp_consumption(runtime.handle).await?;
        } else {
            info!("No broker configured - commands are only accepted through the ladder handle");
        }

        info!("✅ Ranked ladder service started successfully");
        Ok(())
    }

    /// Resolves when the event loop stops on its own; an error means it hit a
    /// fatal failure
    pub async fn event_loop_stopped(&mut self) -> anyhow::Result<()> {
        let result = match self.event_loop.as_mut() {
            Some(task) => task.await,
            None => return Ok(()),
        };
        self.event_loop = None;

        match result {
            Ok(outcome) => outcome,
            Err(e) => Err(anyhow::anyhow!("Ladder event loop panicked: {}", e)),
        }
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of ranked ladder service");
        *self.is_running.write().await = false;

        if let Some(consumer) = self.command_consumer.take() {
            match consumer.stop_consuming().await {
                Ok(()) => info!("✅ AMQP command consumption stopped"),
                Err(e) => warn!("Failed to stop AMQP consumer: {}", e),
            }
        }

        let _ = self.scheduler_shutdown.send(());

        let shutdown_timeout = self.config.shutdown_timeout();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.shutdown().await {
                debug!("Event loop already stopped: {}", e);
            }
        }
        if let Some(task) = self.event_loop.take() {
            match timeout(shutdown_timeout, task).await {
                Ok(Ok(Ok(()))) => info!("✅ Ladder event loop drained"),
                Ok(Ok(Err(e))) => error!("Ladder event loop stopped with error: {:#}", e),
                Ok(Err(e)) => error!("Ladder event loop panicked: {}", e),
                Err(_) => warn!("⚠️  Event loop did not drain within {:?}", shutdown_timeout),
            }
        }

        if let Some(task) = self.publisher_task.take() {
            let abort = task.abort_handle();
            if timeout(shutdown_timeout, task).await.is_err() {
                warn!("⚠️  Publisher did not flush within {:?}", shutdown_timeout);
                abort.abort();
            } else {
                info!("✅ Outbound events flushed");
            }
        }

        if let Some(metrics_service) = &self.metrics_service {
            match metrics_service.stop().await {
                Ok(()) => info!("✅ Metrics service stopped"),
                Err(e) => warn!("Failed to stop metrics service: {}", e),
            }
        }

        self.stop_background_tasks().await;

        if let Some(connection) = self.amqp_connection.take() {
            match Arc::try_unwrap(connection) {
                Ok(connection) => {
                    if let Err(e) = connection.close().await {
                        warn!("Failed to close AMQP connection: {}", e);
                    }
                }
                Err(_) => debug!("AMQP connection still shared, leaving it to drop"),
            }
        }

        if let Some(stats) = &self.stats {
            info!("Final ladder statistics: {:?}", *stats.borrow());
        }
        info!("✅ Ranked ladder service shutdown completed");
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Handle for submitting commands and jobs, available once started
    pub fn handle(&self) -> Option<LadderHandle> {
        self.handle.clone()
    }

    /// Latest published ladder statistics
    pub fn stats(&self) -> Option<LadderStats> {
        self.stats.as_ref().map(|stats| stats.borrow().clone())
    }

    /// Probe for health checks, available once started
    pub fn probe(&self) -> Option<ServiceProbe> {
        let stats = self.stats.clone()?;
        let probe = ServiceProbe::new(
            self.config.service.name.clone(),
            self.is_running.clone(),
            stats,
        );
        Some(match &self.amqp_connection {
            Some(connection) => probe.with_amqp(connection.clone()),
            None => probe,
        })
    }

    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    fn initialize_metrics() -> Result<Arc<MetricsCollector>, ServiceError> {
        MetricsCollector::new()
            .map(Arc::new)
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            })
    }

    async fn initialize_amqp(config: &AppConfig) -> Result<Arc<AmqpConnection>, ServiceError> {
        info!("Connecting to AMQP broker: {}", config.amqp.url);

        let amqp_config =
            AmqpConfig::from_settings(&config.amqp).map_err(|e| ServiceError::Configuration {
                message: format!("Failed to parse AMQP URL: {}", e),
            })?;

        let connection =
            AmqpConnection::new(amqp_config)
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to connect to AMQP: {}", e),
                })?;

        Ok(Arc::new(connection))
    }

    async fn initialize_publisher(
        config: &AppConfig,
        connection: &AmqpConnection,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Result<Arc<dyn EventPublisher>, ServiceError> {
        let channel = connection
            .open_channel()
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open publisher channel: {}", e),
            })?;

        let publisher_config = PublisherConfig {
            exchange: config.amqp.exchange_name.clone(),
            max_retries: config.amqp.max_retry_attempts,
            retry_delay_ms: config.amqp.retry_delay_ms,
            ..PublisherConfig::default()
        };
        let publisher = AmqpEventPublisher::new(channel, publisher_config)
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to initialize event publisher: {}", e),
            })?
            .with_metrics(metrics_collector);

        Ok(Arc::new(publisher))
    }

    fn start_scheduler(&mut self, handle: LadderHandle) {
        let settings = &self.config.rating_period;
        let scheduler = JobScheduler::new()
            .add(
                JobKind::MatchmakingTick,
                Cadence::Every(self.config.matchmaking_interval()),
            )
            .add(
                JobKind::PendingSweep,
                Cadence::Every(self.config.sweep_interval()),
            )
            .add(
                JobKind::RatingPeriod,
                Cadence::Aligned {
                    start: settings.start,
                    length_seconds: settings.length_seconds,
                },
            );

        info!(
            "Starting job scheduler: matchmaking every {:?}, pending sweep every {:?}, rating period every {}s",
            self.config.matchmaking_interval(),
            self.config.sweep_interval(),
            settings.length_seconds
        );
        let task = scheduler.spawn(handle.sender(), self.scheduler_shutdown.subscribe());
        self.background_tasks.push(task);
    }

    async fn start_metrics_service(&mut self, stats: watch::Receiver<LadderStats>) {
        let health_config = HealthServerConfig {
            port: self.config.service.health_port,
            host: "0.0.0.0".to_string(),
        };
        let probe = ServiceProbe::new(
            self.config.service.name.clone(),
            self.is_running.clone(),
            stats,
        );
        let probe = match &self.amqp_connection {
            Some(connection) => probe.with_amqp(connection.clone()),
            None => probe,
        };

        let health_server = Arc::new(
            HealthServer::new(health_config, self.metrics_collector.clone()).with_probe(probe),
        );
        let metrics_service = Arc::new(MetricsService::new(
            self.metrics_collector.clone(),
            health_server,
        ));

        let task = {
            let metrics_service = metrics_service.clone();
            tokio::spawn(async move {
                if let Err(e) = metrics_service.start().await {
                    error!("Metrics service failed: {:#}", e);
                }
            })
        };
        self.background_tasks.push(task);
        self.metrics_service = Some(metrics_service);

        info!(
            "✅ Metrics service started on port {}",
            self.config.service.health_port
        );
    }

    fn start_background_tasks(&mut self, stats: watch::Receiver<LadderStats>) {
        // Gauges follow every stats update from the event loop.
        let gauges_task = {
            let metrics_collector = self.metrics_collector.clone();
            let mut stats = stats.clone();
            tokio::spawn(async move {
                while stats.changed().await.is_ok() {
                    let snapshot = stats.borrow_and_update().clone();
                    metrics_collector.update_from_stats(&snapshot);
                }
                debug!("Stats channel closed, gauge updates stopped");
            })
        };

        let health_task = {
            let metrics_collector = self.metrics_collector.clone();
            let probe = ServiceProbe::new(
                self.config.service.name.clone(),
                self.is_running.clone(),
                stats,
            );
            let is_running = self.is_running.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(HEALTH_METRICS_INTERVAL);
                while *is_running.read().await {
                    interval.tick().await;

                    let health = HealthCheck::check(&probe).await;
                    metrics_collector
                        .service()
                        .uptime_seconds
                        .set(health.uptime_seconds);
                    metrics_collector.update_health_status(health.status.as_gauge());
                    for check in &health.checks {
                        metrics_collector.update_component_health(
                            &check.name,
                            check.status != HealthStatus::Unhealthy,
                        );
                    }
                    if health.status != HealthStatus::Healthy {
                        warn!("Health check: {}", health.status);
                    }
                }
            })
        };

        self.background_tasks.push(gauges_task);
        self.background_tasks.push(health_task);
        info!("{} background tasks running", self.background_tasks.len());
    }

    async fn start_amqp_consumption(&mut self, handle: LadderHandle) -> Result<(), ServiceError> {
        let Some(connection) = &self.amqp_connection else {
            return Ok(());
        };
        let queue_name = self.config.amqp.queue_name.clone();

        let channel = connection
            .open_channel()
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open consumer channel: {}", e),
            })?;

        let queue_declare_args = QueueDeclareArguments::new(&queue_name)
            .durable(true)
            .auto_delete(false)
            .finish();
        channel
            .queue_declare(queue_declare_args)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to declare queue {}: {}", queue_name, e),
            })?;
        info!("Queue '{}' declared", queue_name);

        let consumer = LadderCommandConsumer::new(Arc::new(handle), channel)
            .with_metrics(self.metrics_collector.clone());
        consumer
            .start_consuming(&queue_name)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to start consuming commands: {}", e),
            })?;

        self.command_consumer = Some(consumer);
        info!("✅ Listening for ladder commands on '{}'", queue_name);
        Ok(())
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            return;
        }

        info!("Stopping {} background tasks...", task_count);
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        info!("✅ All {} background tasks stopped", task_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::MockEventPublisher;
    use crate::service::LadderCommand;
    use crate::storage::InMemoryStorage;

    fn app() -> (AppState, Arc<MockEventPublisher>) {
        let publisher = Arc::new(MockEventPublisher::new());
        let mut config = AppConfig::default();
        config.service.health_port = 18931;
        let app = AppState::with_components(
            config,
            Arc::new(InMemoryStorage::new()),
            publisher.clone(),
        )
        .unwrap();
        (app, publisher)
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (mut app, publisher) = app();
        assert!(app.handle().is_none());

        app.start().await.unwrap();
        assert!(app.is_running().await);

        let handle = app.handle().unwrap();
        handle
            .execute(LadderCommand::Register {
                player_id: "alice".to_string(),
                platform: "pc".to_string(),
            })
            .await
            .unwrap();
        let events = handle
            .execute(LadderCommand::JoinQueue {
                player_id: "mallory".to_string(),
                platform: "pc".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "command_rejected");

        app.shutdown().await.unwrap();
        assert!(!app.is_running().await);
        assert_eq!(
            publisher.published_routing_keys(),
            vec!["ladder.command.rejected"]
        );
    }

    #[tokio::test]
    async fn test_probe_requires_start() {
        let (mut app, _publisher) = app();
        assert!(app.probe().is_none());

        app.start().await.unwrap();
        let probe = app.probe().unwrap();
        assert_eq!(
            HealthCheck::liveness_check(&probe).await,
            HealthStatus::Healthy
        );

        app.shutdown().await.unwrap();
        assert_eq!(
            HealthCheck::liveness_check(&probe).await,
            HealthStatus::Unhealthy
        );
    }
}
