//! AMQP consumer for front-end commands
//!
//! Deliveries are decoded into [`LadderCommand`]s and handed to a
//! [`CommandHandler`], normally the event loop handle. A delivery is acked once
//! the command has been queued, rejected without requeue when it cannot be
//! decoded, and nacked with requeue when the ladder is not accepting commands.

use crate::amqp::messages::MessageUtils;
use crate::error::{LadderError, Result};
use crate::metrics::MetricsCollector;
use crate::service::{LadderCommand, LadderHandle};
use amqprs::{
    channel::{
        BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, BasicNackArguments,
        BasicRejectArguments, Channel,
    },
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Receiver of decoded front-end commands
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle_command(&self, command: LadderCommand) -> Result<()>;
}

#[async_trait]
impl CommandHandler for LadderHandle {
    async fn handle_command(&self, command: LadderCommand) -> Result<()> {
        self.submit(command).await
    }
}

/// What to do with a delivery after processing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack,
    /// Poison message, dropped
    Reject,
    /// The ladder could not take the command, try again later
    Requeue,
}

/// Decode a delivery body and forward it to the handler
pub async fn process_delivery(handler: &dyn CommandHandler, content: &[u8]) -> DeliveryOutcome {
    let command = match MessageUtils::decode_command(content) {
        Ok(command) => command,
        Err(e) => {
            error!(
                "Dropping undecodable command ({} bytes): {}",
                content.len(),
                e
            );
            return DeliveryOutcome::Reject;
        }
    };

    let name = command.name();
    debug!(
        "Command parsed - type: '{}', player_id: {:?}",
        name,
        command.player_id()
    );

    match handler.handle_command(command).await {
        Ok(()) => DeliveryOutcome::Ack,
        Err(e) => {
            warn!("Could not hand {} command to the ladder: {}", name, e);
            DeliveryOutcome::Requeue
        }
    }
}

/// Consumer for the front-end command queue
pub struct LadderCommandConsumer {
    handler: Arc<dyn CommandHandler>,
    channel: Channel,
    consumer_tag: String,
    metrics: Option<Arc<MetricsCollector>>,
}

impl LadderCommandConsumer {
    pub fn new(handler: Arc<dyn CommandHandler>, channel: Channel) -> Self {
        let consumer_tag = format!("ladder-consumer-{}", uuid::Uuid::new_v4());

        Self {
            handler,
            channel,
            consumer_tag,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Start consuming messages from the queue
    pub async fn start_consuming(&self, queue_name: &str) -> Result<()> {
        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag);
        let consumer = CommandConsumer {
            handler: self.handler.clone(),
            metrics: self.metrics.clone(),
        };

        self.channel
            .basic_consume(consumer, args)
            .await
            .map_err(|e| LadderError::AmqpConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!("Started consuming commands from queue: {}", queue_name);
        Ok(())
    }

    /// Stop consuming messages
    pub async fn stop_consuming(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);

        self.channel
            .basic_cancel(args)
            .await
            .map_err(|e| LadderError::AmqpConnectionFailed {
                message: format!("Failed to stop consuming: {}", e),
            })?;

        info!("Stopped consuming commands");
        Ok(())
    }
}

struct CommandConsumer {
    handler: Arc<dyn CommandHandler>,
    metrics: Option<Arc<MetricsCollector>>,
}

#[async_trait]
impl AsyncConsumer for CommandConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        let start_time = Instant::now();

        debug!(
            "AMQP message received - delivery_tag: {}, routing_key: '{}', size: {} bytes",
            delivery_tag,
            deliver.routing_key(),
            content.len()
        );

        let outcome = process_delivery(self.handler.as_ref(), &content).await;
        let settled = match outcome {
            DeliveryOutcome::Ack => channel
                .basic_ack(BasicAckArguments::new(delivery_tag, false))
                .await,
            DeliveryOutcome::Reject => channel
                .basic_reject(BasicRejectArguments::new(delivery_tag, false))
                .await,
            DeliveryOutcome::Requeue => channel
                .basic_nack(BasicNackArguments::new(delivery_tag, false, true))
                .await,
        };

        if let Err(e) = &settled {
            error!(
                "Failed to settle delivery {} as {:?}: {}",
                delivery_tag, outcome, e
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_amqp_operation(
                "consume",
                outcome == DeliveryOutcome::Ack && settled.is_ok(),
                start_time.elapsed(),
            );
        }
    }
}

/// Command handler that records what it receives, for tests
pub struct MockCommandHandler {
    pub received_commands: Arc<tokio::sync::Mutex<Vec<LadderCommand>>>,
    fail: bool,
}

impl Default for MockCommandHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCommandHandler {
    pub fn new() -> Self {
        Self {
            received_commands: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            fail: false,
        }
    }

    /// A handler that refuses every command, like a stopped event loop
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl CommandHandler for MockCommandHandler {
    async fn handle_command(&self, command: LadderCommand) -> Result<()> {
        if self.fail {
            return Err(LadderError::InternalError {
                message: "Ladder event loop is not running".to_string(),
            }
            .into());
        }
        self.received_commands.lock().await.push(command);
        Ok(())
    }
}
