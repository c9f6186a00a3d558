//! AMQP event publisher for outbound events

use crate::amqp::messages::{MessageEnvelope, MessageUtils};
use crate::error::{LadderError, Result};
use crate::metrics::MetricsCollector;
use crate::types::LadderEvent;
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Sink for ladder events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &LadderEvent) -> Result<()>;
}

/// Configuration for event publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_deduplication: bool,
    /// Number of recent event ids remembered for deduplication
    pub dedup_window: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange: "ladder.events".to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
            enable_deduplication: true,
            dedup_window: 1024,
        }
    }
}

/// Bounded set of recently published ids, oldest evicted first
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String, capacity: usize) {
        if capacity == 0 || !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Publishes events to a topic exchange, keyed by [`LadderEvent::routing_key`]
pub struct AmqpEventPublisher {
    channel: Channel,
    config: PublisherConfig,
    recent: Mutex<RecentIds>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl AmqpEventPublisher {
    /// Create a new event publisher and declare its exchange
    pub async fn new(channel: Channel, config: PublisherConfig) -> Result<Self> {
        let publisher = Self {
            channel,
            config,
            recent: Mutex::new(RecentIds::default()),
            metrics: None,
        };

        publisher.setup_exchange().await?;
        Ok(publisher)
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn setup_exchange(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(&self.config.exchange, "topic");
        self.channel
            .exchange_declare(args)
            .await
            .map_err(|e| LadderError::AmqpConnectionFailed {
                message: format!(
                    "Failed to declare events exchange {}: {}",
                    self.config.exchange, e
                ),
            })?;

        info!("Declared events exchange: {}", self.config.exchange);
        Ok(())
    }

    fn already_published(&self, id: &str) -> Result<bool> {
        let recent = self.recent.lock().map_err(|_| LadderError::InternalError {
            message: "Failed to acquire published messages lock".to_string(),
        })?;
        Ok(recent.contains(id))
    }

    fn remember(&self, id: String) -> Result<()> {
        let mut recent = self.recent.lock().map_err(|_| LadderError::InternalError {
            message: "Failed to acquire published messages lock".to_string(),
        })?;
        recent.insert(id, self.config.dedup_window);
        Ok(())
    }

    async fn publish_with_retry(&self, envelope: &MessageEnvelope<LadderEvent>) -> Result<()> {
        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(envelope).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish event {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(LadderError::NotificationFailed {
                            message: format!("{}: {}", envelope.routing_key, e),
                        }
                        .into());
                    }

                    warn!(
                        "Publish attempt {} failed for event {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    async fn try_publish(&self, envelope: &MessageEnvelope<LadderEvent>) -> Result<()> {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(&self.config.exchange, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| LadderError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;

        Ok(())
    }
}

#[async_trait]
impl EventPublisher for AmqpEventPublisher {
    async fn publish(&self, event: &LadderEvent) -> Result<()> {
        let event_id = MessageUtils::event_id(event)?;
        if self.config.enable_deduplication && self.already_published(&event_id)? {
            debug!("Event {} already published, skipping", event_id);
            return Ok(());
        }

        let envelope = MessageEnvelope::new(event.clone(), event.routing_key())
            .with_correlation_id(event_id.clone());
        let start_time = Instant::now();
        let result = self.publish_with_retry(&envelope).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_amqp_operation("publish", result.is_ok(), start_time.elapsed());
        }
        result?;

        if self.config.enable_deduplication {
            self.remember(event_id)?;
        }
        debug!(
            "Published {} to {} as {}",
            event.kind(),
            self.config.exchange,
            envelope.routing_key
        );
        Ok(())
    }
}

/// Event publisher that keeps everything in memory, for tests and dry runs
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    published_events: Mutex<Vec<LadderEvent>>,
    fail: bool,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher whose every publish fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn published_events(&self) -> Vec<LadderEvent> {
        self.published_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn published_routing_keys(&self) -> Vec<String> {
        self.published_events()
            .iter()
            .map(|event| event.routing_key().to_string())
            .collect()
    }

    pub fn clear_events(&self) {
        if let Ok(mut events) = self.published_events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish(&self, event: &LadderEvent) -> Result<()> {
        if self.fail {
            return Err(LadderError::NotificationFailed {
                message: format!("{} not delivered", event.routing_key()),
            }
            .into());
        }
        if let Ok(mut events) = self.published_events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}
