//! AMQP message definitions and serialization

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{LadderError, Result};
use crate::service::LadderCommand;
use crate::types::LadderEvent;

/// Routing key used when publishing commands to the command queue
pub const COMMAND_ROUTING_KEY: &str = "ladder.command";

/// Message envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a new message envelope with a random correlation id
    pub fn new(payload: T, routing_key: impl Into<String>) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            routing_key: routing_key.into(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            LadderError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            LadderError::InvalidMessage {
                reason: format!("Failed to deserialize message: {}", e),
            }
            .into()
        })
    }
}

/// Message serialization and validation utilities
pub struct MessageUtils;

impl MessageUtils {
    /// Decode a command delivery, enveloped or bare
    pub fn decode_command(bytes: &[u8]) -> Result<LadderCommand> {
        let command = match MessageEnvelope::<LadderCommand>::from_bytes(bytes) {
            Ok(envelope) => envelope.payload,
            Err(_) => serde_json::from_slice(bytes).map_err(|e| LadderError::InvalidMessage {
                reason: format!("Failed to deserialize command: {}", e),
            })?,
        };
        Self::validate_command(&command)?;
        Ok(command)
    }

    pub fn encode_command(command: &LadderCommand) -> Result<Vec<u8>> {
        Self::validate_command(command)?;
        MessageEnvelope::new(command.clone(), COMMAND_ROUTING_KEY).to_bytes()
    }

    /// Reject commands with blank identifiers before they reach the ladder
    pub fn validate_command(command: &LadderCommand) -> Result<()> {
        let blank = |value: &str| value.trim().is_empty();

        if command.player_id().is_some_and(|player_id| blank(player_id)) {
            return Err(LadderError::InvalidMessage {
                reason: format!("{} command has an empty player id", command.name()),
            }
            .into());
        }

        let platform = match command {
            LadderCommand::Register { platform, .. }
            | LadderCommand::Unregister { platform, .. }
            | LadderCommand::UpdateUsername { platform, .. }
            | LadderCommand::JoinQueue { platform, .. }
            | LadderCommand::LeaveQueue { platform, .. } => Some(platform),
            _ => None,
        };
        if platform.is_some_and(|platform| blank(platform)) {
            return Err(LadderError::InvalidMessage {
                reason: format!("{} command has an empty platform", command.name()),
            }
            .into());
        }
        Ok(())
    }

    /// Stable id of an event, used as message id and for deduplication
    pub fn event_id(event: &LadderEvent) -> Result<String> {
        let bytes = serde_json::to_vec(event).map_err(|e| LadderError::InternalError {
            message: format!("Failed to serialize {} event: {}", event.kind(), e),
        })?;
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        Ok(format!("{}-{:016x}", event.kind(), hasher.finish()))
    }
}
