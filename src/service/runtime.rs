//! Event loop runtime
//!
//! All commands and timer jobs go through one bounded queue and are handled
//! one at a time by the task that owns the [`LadderService`]. Resulting events
//! are handed to a separate publisher task over an unbounded outbox, so a slow
//! broker never stalls the ladder.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::commands::LadderCommand;
use super::ladder::{LadderService, LadderStats};
use crate::amqp::EventPublisher;
use crate::error::{is_fatal, LadderError, Result};
use crate::scheduler::JobKind;
use crate::types::LadderEvent;
use crate::utils::current_timestamp;

/// Reply to a command submitted with [`LadderHandle::execute`]
pub type CommandReply = std::result::Result<Vec<LadderEvent>, String>;

/// Work item for the event loop
#[derive(Debug)]
pub enum LoopMessage {
    Command {
        command: LadderCommand,
        reply: Option<oneshot::Sender<CommandReply>>,
    },
    Job(JobKind),
    Shutdown,
}

impl From<JobKind> for LoopMessage {
    fn from(job: JobKind) -> Self {
        LoopMessage::Job(job)
    }
}

/// Cloneable sender side of the event loop
#[derive(Clone)]
pub struct LadderHandle {
    sender: mpsc::Sender<LoopMessage>,
}

impl LadderHandle {
    async fn send(&self, message: LoopMessage) -> Result<()> {
        self.sender.send(message).await.map_err(|_| {
            LadderError::InternalError {
                message: "Ladder event loop has stopped".to_string(),
            }
            .into()
        })
    }

    /// Queue a command without waiting for its outcome
    pub async fn submit(&self, command: LadderCommand) -> Result<()> {
        self.send(LoopMessage::Command {
            command,
            reply: None,
        })
        .await
    }

    /// Queue a command and wait for the events it produced
    pub async fn execute(&self, command: LadderCommand) -> Result<Vec<LadderEvent>> {
        let (reply, receiver) = oneshot::channel();
        self.send(LoopMessage::Command {
            command,
            reply: Some(reply),
        })
        .await?;

        let outcome = receiver.await.map_err(|_| LadderError::InternalError {
            message: "Ladder event loop dropped the reply".to_string(),
        })?;
        outcome.map_err(|message| LadderError::InternalError { message }.into())
    }

    pub async fn run_job(&self, job: JobKind) -> Result<()> {
        self.send(LoopMessage::Job(job)).await
    }

    /// Ask the event loop to stop after the messages already queued
    pub async fn shutdown(&self) -> Result<()> {
        self.send(LoopMessage::Shutdown).await
    }

    /// Raw sender, for the job scheduler
    pub fn sender(&self) -> mpsc::Sender<LoopMessage> {
        self.sender.clone()
    }
}

/// Everything produced by [`spawn_event_loop`]
pub struct LadderRuntime {
    pub handle: LadderHandle,
    /// Events in the order they were produced
    pub events: mpsc::UnboundedReceiver<LadderEvent>,
    pub stats: watch::Receiver<LadderStats>,
    /// Resolves when the loop stops; an error means a fatal failure
    pub task: JoinHandle<Result<()>>,
}

/// Start the event loop task that owns `service`
pub fn spawn_event_loop(
    service: LadderService,
    startup_events: Vec<LadderEvent>,
    capacity: usize,
) -> LadderRuntime {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let (outbox, events) = mpsc::unbounded_channel();
    let (stats_tx, stats) = watch::channel(service.stats());

    for event in startup_events {
        let _ = outbox.send(event);
    }

    let task = tokio::spawn(run_event_loop(service, receiver, outbox, stats_tx));

    LadderRuntime {
        handle: LadderHandle { sender },
        events,
        stats,
        task,
    }
}

async fn run_event_loop(
    mut service: LadderService,
    mut receiver: mpsc::Receiver<LoopMessage>,
    outbox: mpsc::UnboundedSender<LadderEvent>,
    stats: watch::Sender<LadderStats>,
) -> Result<()> {
    info!("Ladder event loop started");

    while let Some(message) = receiver.recv().await {
        let now = current_timestamp();
        let events = match message {
            LoopMessage::Command { command, reply } => {
                debug!("Handling {} command", command.name());
                let result = service.handle_command(command, now);
                let fatal = result.as_ref().err().filter(|e| is_fatal(e)).is_some();
                if let Some(reply) = reply {
                    let _ = reply.send(match &result {
                        Ok(events) => Ok(events.clone()),
                        Err(e) => Err(format!("{:#}", e)),
                    });
                }
                match result {
                    Ok(events) => events,
                    Err(e) if fatal => {
                        error!("Fatal error while handling a command, stopping: {:#}", e);
                        return Err(e);
                    }
                    Err(_) => Vec::new(),
                }
            }
            LoopMessage::Job(job) => match service.run_job(job, now) {
                Ok(events) => events,
                Err(e) => {
                    error!("Fatal error in job {}, stopping: {:#}", job.name(), e);
                    return Err(e);
                }
            },
            LoopMessage::Shutdown => {
                info!("Ladder event loop shutting down");
                break;
            }
        };

        for event in events {
            if outbox.send(event).is_err() {
                warn!("Event outbox closed, dropping events");
                break;
            }
        }
        stats.send_replace(service.stats());
    }

    info!("Ladder event loop stopped");
    Ok(())
}

/// Forward events from the outbox to `publisher` until the outbox closes.
///
/// Publishing is best effort: a failed publish is logged and the next event
/// is sent regardless.
pub fn spawn_publisher(
    mut events: mpsc::UnboundedReceiver<LadderEvent>,
    publisher: Arc<dyn EventPublisher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Err(e) = publisher.publish(&event).await {
                error!("Failed to publish {} event: {:#}", event.kind(), e);
            }
        }
        info!("Event publisher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::MockEventPublisher;
    use crate::config::AppConfig;
    use crate::rating::MockRatingProvider;
    use crate::storage::InMemoryStorage;
    use std::time::Duration;

    fn runtime() -> LadderRuntime {
        let service = LadderService::new(
            &AppConfig::default(),
            Arc::new(InMemoryStorage::new()),
            Arc::new(MockRatingProvider::new(20.0)),
        );
        spawn_event_loop(service, Vec::new(), 16)
    }

    fn register(player: &str) -> LadderCommand {
        LadderCommand::Register {
            player_id: player.to_string(),
            platform: "pc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_commands_are_serialized_through_the_loop() {
        let runtime = runtime();
        let handle = runtime.handle.clone();

        assert!(handle.execute(register("alice")).await.unwrap().is_empty());
        let events = handle.execute(register("alice")).await.unwrap();
        assert_eq!(events[0].kind(), "command_rejected");

        let mut stats = runtime.stats.clone();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(2),
            stats.wait_for(|stats| stats.commands_processed == 2),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(snapshot.commands_rejected, 1);
        assert_eq!(snapshot.registered_players, 1);

        handle.shutdown().await.unwrap();
        runtime.task.await.unwrap().unwrap();
        assert!(handle.submit(register("bob")).await.is_err());
    }

    #[tokio::test]
    async fn test_jobs_feed_the_outbox() {
        let mut runtime = runtime();
        let handle = runtime.handle.clone();
        for player in ["alice", "bob"] {
            handle.execute(register(player)).await.unwrap();
            handle
                .execute(LadderCommand::JoinQueue {
                    player_id: player.to_string(),
                    platform: "pc".to_string(),
                })
                .await
                .unwrap();
        }

        handle.run_job(JobKind::MatchmakingTick).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), runtime.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), "match_proposed");
    }

    #[tokio::test]
    async fn test_publisher_relays_every_event() {
        let (outbox, events) = mpsc::unbounded_channel();
        let publisher = Arc::new(MockEventPublisher::new());
        let task = spawn_publisher(events, publisher.clone());

        for player in ["alice", "bob"] {
            outbox
                .send(LadderEvent::CommandRejected(crate::types::CommandRejected {
                    player_id: player.to_string(),
                    command: "join_queue".to_string(),
                    reason: "Invalid platform: wii".to_string(),
                    timestamp: current_timestamp(),
                }))
                .unwrap();
        }
        drop(outbox);
        task.await.unwrap();

        assert_eq!(
            publisher.published_routing_keys(),
            vec!["ladder.command.rejected", "ladder.command.rejected"]
        );
    }
}
