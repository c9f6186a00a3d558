//! Front-end commands accepted by the ladder

use serde::{Deserialize, Serialize};

use crate::types::{PlatformKey, PlayerId};

/// One request from the chat front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LadderCommand {
    Register {
        player_id: PlayerId,
        platform: PlatformKey,
    },
    Unregister {
        player_id: PlayerId,
        platform: PlatformKey,
    },
    UpdateDisplayName {
        player_id: PlayerId,
        display_name: Option<String>,
    },
    UpdateUsername {
        player_id: PlayerId,
        platform: PlatformKey,
        username: Option<String>,
    },
    JoinQueue {
        player_id: PlayerId,
        platform: PlatformKey,
    },
    LeaveQueue {
        player_id: PlayerId,
        platform: PlatformKey,
    },
    /// Reaction-style "I'm here" on a proposed match
    Acknowledge {
        player_id: PlayerId,
    },
    /// Scores from the reporter's point of view
    ReportScore {
        player_id: PlayerId,
        own_score: u32,
        opponent_score: u32,
    },
    ConfirmScore {
        player_id: PlayerId,
    },
    RequestCancel {
        player_id: PlayerId,
    },
    RequestLeaderboard {
        #[serde(default)]
        player_id: Option<PlayerId>,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl LadderCommand {
    /// Acting player, if the command has one
    pub fn player_id(&self) -> Option<&PlayerId> {
        match self {
            LadderCommand::Register { player_id, .. }
            | LadderCommand::Unregister { player_id, .. }
            | LadderCommand::UpdateDisplayName { player_id, .. }
            | LadderCommand::UpdateUsername { player_id, .. }
            | LadderCommand::JoinQueue { player_id, .. }
            | LadderCommand::LeaveQueue { player_id, .. }
            | LadderCommand::Acknowledge { player_id }
            | LadderCommand::ReportScore { player_id, .. }
            | LadderCommand::ConfirmScore { player_id }
            | LadderCommand::RequestCancel { player_id } => Some(player_id),
            LadderCommand::RequestLeaderboard { player_id, .. } => player_id.as_ref(),
        }
    }

    /// Label used in logs, metrics and rejections
    pub fn name(&self) -> &'static str {
        match self {
            LadderCommand::Register { .. } => "register",
            LadderCommand::Unregister { .. } => "unregister",
            LadderCommand::UpdateDisplayName { .. } => "update_display_name",
            LadderCommand::UpdateUsername { .. } => "update_username",
            LadderCommand::JoinQueue { .. } => "join_queue",
            LadderCommand::LeaveQueue { .. } => "leave_queue",
            LadderCommand::Acknowledge { .. } => "acknowledge",
            LadderCommand::ReportScore { .. } => "report_score",
            LadderCommand::ConfirmScore { .. } => "confirm_score",
            LadderCommand::RequestCancel { .. } => "request_cancel",
            LadderCommand::RequestLeaderboard { .. } => "request_leaderboard",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let command: LadderCommand = serde_json::from_str(
            r#"{"type":"report_score","player_id":"alice","own_score":7,"opponent_score":3}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            LadderCommand::ReportScore {
                player_id: "alice".to_string(),
                own_score: 7,
                opponent_score: 3,
            }
        );
        assert_eq!(command.name(), "report_score");
    }

    #[test]
    fn test_leaderboard_fields_optional() {
        let command: LadderCommand =
            serde_json::from_str(r#"{"type":"request_leaderboard"}"#).unwrap();
        assert_eq!(command.player_id(), None);
        assert_eq!(
            command,
            LadderCommand::RequestLeaderboard {
                player_id: None,
                limit: None
            }
        );
    }
}
