//! Ladder CLI
//!
//! Publishes single commands to the ladder's command queue and watches the
//! events exchange, for manual testing against a running broker.
//!
//! Usage:
//!   ladder-cli register --player alice --platform pc
//!   ladder-cli join --player alice --platform pc
//!   ladder-cli report --player alice --own 7 --opponent 3
//!   ladder-cli watch --duration 60

use std::time::Duration;

use amqprs::channel::{
    BasicConsumeArguments, BasicPublishArguments, Channel, ExchangeDeclareArguments,
    QueueBindArguments, QueueDeclareArguments,
};
use amqprs::consumer::AsyncConsumer;
use amqprs::{BasicProperties, Deliver};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use ranked_ladder::amqp::{AmqpConfig, AmqpConnection, MessageEnvelope, MessageUtils};
use ranked_ladder::config::AmqpSettings;
use ranked_ladder::{LadderCommand, LadderEvent};

#[derive(Parser)]
#[command(name = "ladder-cli")]
#[command(about = "Send commands to a running ranked ladder and watch its events")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// AMQP URL for the broker
    #[arg(long)]
    amqp_url: Option<String>,

    /// Command queue name
    #[arg(long, default_value = "ladder.commands")]
    queue: String,

    /// Events exchange name
    #[arg(long, default_value = "ladder.events")]
    exchange: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a player on a platform
    Register {
        #[arg(short, long)]
        player: String,
        #[arg(short = 'f', long)]
        platform: String,
    },
    /// Remove a player from a platform
    Unregister {
        #[arg(short, long)]
        player: String,
        #[arg(short = 'f', long)]
        platform: String,
    },
    /// Join a platform's matchmaking pool
    Join {
        #[arg(short, long)]
        player: String,
        #[arg(short = 'f', long)]
        platform: String,
    },
    /// Leave a platform's matchmaking pool
    Leave {
        #[arg(short, long)]
        player: String,
        #[arg(short = 'f', long)]
        platform: String,
    },
    /// Acknowledge a proposed match
    Ack {
        #[arg(short, long)]
        player: String,
    },
    /// Report the score of the current match
    Report {
        #[arg(short, long)]
        player: String,
        #[arg(long)]
        own: u32,
        #[arg(long)]
        opponent: u32,
    },
    /// Confirm the opponent's reported score
    Confirm {
        #[arg(short, long)]
        player: String,
    },
    /// Ask to cancel the current match
    Cancel {
        #[arg(short, long)]
        player: String,
    },
    /// Set or clear a display name
    Name {
        #[arg(short, long)]
        player: String,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Request the leaderboard
    Leaderboard {
        #[arg(short, long)]
        player: Option<String>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print events from the ladder for a while
    Watch {
        /// Duration to watch in seconds
        #[arg(short, long, default_value = "30")]
        duration: u64,
        /// Routing key pattern to bind with
        #[arg(short, long, default_value = "ladder.#")]
        pattern: String,
    },
}

impl Commands {
    fn into_ladder_command(self) -> Option<LadderCommand> {
        let command = match self {
            Commands::Register { player, platform } => LadderCommand::Register {
                player_id: player,
                platform,
            },
            Commands::Unregister { player, platform } => LadderCommand::Unregister {
                player_id: player,
                platform,
            },
            Commands::Join { player, platform } => LadderCommand::JoinQueue {
                player_id: player,
                platform,
            },
            Commands::Leave { player, platform } => LadderCommand::LeaveQueue {
                player_id: player,
                platform,
            },
            Commands::Ack { player } => LadderCommand::Acknowledge { player_id: player },
            Commands::Report {
                player,
                own,
                opponent,
            } => LadderCommand::ReportScore {
                player_id: player,
                own_score: own,
                opponent_score: opponent,
            },
            Commands::Confirm { player } => LadderCommand::ConfirmScore { player_id: player },
            Commands::Cancel { player } => LadderCommand::RequestCancel { player_id: player },
            Commands::Name { player, name } => LadderCommand::UpdateDisplayName {
                player_id: player,
                display_name: name,
            },
            Commands::Leaderboard { player, limit } => LadderCommand::RequestLeaderboard {
                player_id: player,
                limit,
            },
            Commands::Watch { .. } => return None,
        };
        Some(command)
    }
}

async fn publish_command(channel: &Channel, queue: &str, command: &LadderCommand) -> Result<()> {
    let args = QueueDeclareArguments::new(queue)
        .durable(true)
        .auto_delete(false)
        .finish();
    channel
        .queue_declare(args)
        .await
        .context("Failed to declare command queue")?;

    let payload = MessageUtils::encode_command(command)?;
    let mut properties = BasicProperties::default();
    properties
        .with_content_type("application/json")
        .with_delivery_mode(2);

    channel
        .basic_publish(properties, payload, BasicPublishArguments::new("", queue))
        .await
        .context("Failed to publish command")?;
    Ok(())
}

struct EventPrinter;

#[async_trait]
impl AsyncConsumer for EventPrinter {
    async fn consume(
        &mut self,
        _channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        match serde_json::from_slice::<MessageEnvelope<LadderEvent>>(&content) {
            Ok(envelope) => match serde_json::to_string_pretty(&envelope.payload) {
                Ok(json) => println!("📨 {}\n{}", deliver.routing_key(), json),
                Err(e) => eprintln!("❌ Failed to render event: {}", e),
            },
            Err(e) => eprintln!(
                "❌ Unreadable event on {}: {}",
                deliver.routing_key(),
                e
            ),
        }
    }
}

/// Watching only prints, so deliveries are acknowledged by the broker
fn watch_consume_args(queue_name: &str) -> BasicConsumeArguments {
    BasicConsumeArguments::new(queue_name, "ladder-cli")
        .manual_ack(false)
        .finish()
}

async fn watch_events(
    channel: &Channel,
    exchange: &str,
    pattern: &str,
    duration: Duration,
) -> Result<()> {
    channel
        .exchange_declare(ExchangeDeclareArguments::new(exchange, "topic"))
        .await
        .context("Failed to declare events exchange")?;

    let queue_name = format!("ladder-cli-{}", uuid::Uuid::new_v4());
    let args = QueueDeclareArguments::new(&queue_name)
        .exclusive(true)
        .auto_delete(true)
        .finish();
    channel
        .queue_declare(args)
        .await
        .context("Failed to declare watch queue")?;
    channel
        .queue_bind(QueueBindArguments::new(&queue_name, exchange, pattern))
        .await
        .context("Failed to bind watch queue")?;

    channel
        .basic_consume(EventPrinter, watch_consume_args(&queue_name))
        .await
        .context("Failed to start consuming events")?;

    println!(
        "🔍 Watching '{}' on {} for {} seconds...",
        pattern,
        exchange,
        duration.as_secs()
    );
    tokio::time::sleep(duration).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let url = cli
        .amqp_url
        .clone()
        .unwrap_or_else(|| AmqpSettings::default().url);

    println!("🔌 Connecting to broker at: {}", url);
    let mut config = AmqpConfig::parse_url(&url)?;
    config.max_retries = 0;

    let connection = match AmqpConnection::new(config).await {
        Ok(connection) => connection,
        Err(e) => {
            eprintln!("❌ Failed to connect: {:#}", e);
            std::process::exit(1);
        }
    };
    let channel = connection.open_channel().await?;

    match cli.command {
        Commands::Watch { duration, pattern } => {
            watch_events(
                &channel,
                &cli.exchange,
                &pattern,
                Duration::from_secs(duration),
            )
            .await?;
        }
        other => {
            if let Some(command) = other.into_ladder_command() {
                publish_command(&channel, &cli.queue, &command).await?;
                println!("✅ Sent {} to '{}'", command.name(), cli.queue);
                println!("💡 Use 'watch' to see the ladder's response");
            }
        }
    }

    if let Err(e) = channel.close().await {
        eprintln!("⚠️  Failed to close channel: {}", e);
    }
    connection.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_consumer_uses_automatic_acks() {
        let args = watch_consume_args("ladder-cli-test");
        assert!(args.no_ack);
        assert_eq!(args.queue, "ladder-cli-test");
        assert_eq!(args.consumer_tag, "ladder-cli");
    }
}
