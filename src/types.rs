//! Common types used throughout the ladder service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skillratings::glicko2::Glicko2Rating;
use uuid::Uuid;

/// Opaque stable identifier of a player
pub type PlayerId = String;

/// Identifier shared by a pending match and the match record it becomes
pub type MatchId = Uuid;

/// Configured platform key, e.g. "pc"
pub type PlatformKey = String;

/// Glicko-2 rating triple on the external (1500-centred) scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    /// Skill estimate
    pub mu: f64,
    /// Uncertainty (rating deviation)
    pub phi: f64,
    /// Volatility
    pub sigma: f64,
}

impl Default for Rating {
    fn default() -> Self {
        Self {
            mu: 1500.0,
            phi: 350.0,
            sigma: 0.06,
        }
    }
}

impl Rating {
    pub fn new(mu: f64, phi: f64, sigma: f64) -> Self {
        Self { mu, phi, sigma }
    }

    /// Lower end of the 95% confidence interval
    pub fn low(&self) -> f64 {
        self.mu - 2.0 * self.phi
    }

    /// Upper end of the 95% confidence interval
    pub fn high(&self) -> f64 {
        self.mu + 2.0 * self.phi
    }

    pub fn is_finite(&self) -> bool {
        self.mu.is_finite() && self.phi.is_finite() && self.sigma.is_finite()
    }
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.0} ± {:.0}", self.mu, 2.0 * self.phi)
    }
}

impl From<Glicko2Rating> for Rating {
    fn from(rating: Glicko2Rating) -> Self {
        Self {
            mu: rating.rating,
            phi: rating.deviation,
            sigma: rating.volatility,
        }
    }
}

impl From<Rating> for Glicko2Rating {
    fn from(rating: Rating) -> Self {
        Self {
            rating: rating.mu,
            deviation: rating.phi,
            volatility: rating.sigma,
        }
    }
}

/// One of the two seats of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    First,
    Second,
}

impl Side {
    /// Bit used in the confirmation, cancel and acknowledgement masks
    pub fn bit(self) -> u8 {
        match self {
            Side::First => 1,
            Side::Second => 2,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Side::First => 0,
            Side::Second => 1,
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::First => Side::Second,
            Side::Second => Side::First,
        }
    }
}

/// Mask value once both sides have set their bit
pub const BOTH_SIDES: u8 = 3;

/// How a match left the pending state with rating consequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MatchResolution {
    /// Scores were reported and confirmed (or the confirmation window ran out)
    Played,
    /// One side never acknowledged and takes a loss by default
    NoShow { absent: Side },
    /// Neither side acknowledged, both take a loss against the other
    DoubleNoShow,
}

/// Rating change information for a player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingChange {
    pub player_id: PlayerId,
    pub old_rating: Rating,
    pub new_rating: Rating,
}

impl RatingChange {
    pub fn mu_delta(&self) -> f64 {
        self.new_rating.mu - self.old_rating.mu
    }
}

/// Event emitted when two players have been paired
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchProposed {
    pub match_id: MatchId,
    pub platform: PlatformKey,
    pub players: [PlayerId; 2],
    pub goal: u32,
    pub expires_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Event asking the front end to withdraw a player's queued interest marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInterestCleared {
    pub player_id: PlayerId,
    pub platform: PlatformKey,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a score is reported, starting or restarting confirmation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReported {
    pub match_id: MatchId,
    pub players: [PlayerId; 2],
    pub reported_by: PlayerId,
    pub scores: [u32; 2],
    pub confirm_by: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequested {
    pub match_id: MatchId,
    pub requested_by: PlayerId,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted once a match is finalized and ratings are applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCompleted {
    pub match_id: MatchId,
    pub platform: PlatformKey,
    pub players: [PlayerId; 2],
    pub scores: [u32; 2],
    pub winner: PlayerId,
    pub rating_changes: Vec<RatingChange>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCancelled {
    pub match_id: MatchId,
    pub players: [PlayerId; 2],
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a match expired without a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchTimedOut {
    pub match_id: MatchId,
    pub players: [PlayerId; 2],
    pub acknowledged: Vec<PlayerId>,
    pub rating_changes: Vec<RatingChange>,
    pub timestamp: DateTime<Utc>,
}

/// Event asking the front end to swap a player's rank badge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankChanged {
    pub player_id: PlayerId,
    pub old_rank: String,
    pub new_rank: String,
    pub old_role_id: Option<String>,
    pub new_role_id: Option<String>,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingPeriodApplied {
    pub period: i64,
    pub periods_elapsed: i64,
    pub players_updated: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub position: usize,
    pub player_id: PlayerId,
    pub display_name: Option<String>,
    pub rating: Rating,
    pub display: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaderboard {
    pub requested_by: Option<PlayerId>,
    pub entries: Vec<LeaderboardEntry>,
    pub timestamp: DateTime<Utc>,
}

/// Event carrying the reason a front-end command was refused
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRejected {
    pub player_id: PlayerId,
    pub command: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Union type for all outbound events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LadderEvent {
    MatchProposed(MatchProposed),
    QueueInterestCleared(QueueInterestCleared),
    ScoreReported(ScoreReported),
    CancelRequested(CancelRequested),
    MatchCompleted(MatchCompleted),
    MatchCancelled(MatchCancelled),
    MatchTimedOut(MatchTimedOut),
    RankChanged(RankChanged),
    RatingPeriodApplied(RatingPeriodApplied),
    Leaderboard(Leaderboard),
    CommandRejected(CommandRejected),
}

impl LadderEvent {
    /// Routing key on the events exchange
    pub fn routing_key(&self) -> &'static str {
        match self {
            LadderEvent::MatchProposed(_) => "ladder.match.proposed",
            LadderEvent::QueueInterestCleared(_) => "ladder.queue.cleared",
            LadderEvent::ScoreReported(_) => "ladder.match.score_reported",
            LadderEvent::CancelRequested(_) => "ladder.match.cancel_requested",
            LadderEvent::MatchCompleted(_) => "ladder.match.completed",
            LadderEvent::MatchCancelled(_) => "ladder.match.cancelled",
            LadderEvent::MatchTimedOut(_) => "ladder.match.timed_out",
            LadderEvent::RankChanged(_) => "ladder.player.rank_changed",
            LadderEvent::RatingPeriodApplied(_) => "ladder.rating_period.applied",
            LadderEvent::Leaderboard(_) => "ladder.leaderboard",
            LadderEvent::CommandRejected(_) => "ladder.command.rejected",
        }
    }

    /// Short name used in logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            LadderEvent::MatchProposed(_) => "match_proposed",
            LadderEvent::QueueInterestCleared(_) => "queue_interest_cleared",
            LadderEvent::ScoreReported(_) => "score_reported",
            LadderEvent::CancelRequested(_) => "cancel_requested",
            LadderEvent::MatchCompleted(_) => "match_completed",
            LadderEvent::MatchCancelled(_) => "match_cancelled",
            LadderEvent::MatchTimedOut(_) => "match_timed_out",
            LadderEvent::RankChanged(_) => "rank_changed",
            LadderEvent::RatingPeriodApplied(_) => "rating_period_applied",
            LadderEvent::Leaderboard(_) => "leaderboard",
            LadderEvent::CommandRejected(_) => "command_rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_interval() {
        let rating = Rating::new(1500.0, 100.0, 0.06);
        assert_eq!(rating.low(), 1300.0);
        assert_eq!(rating.high(), 1700.0);
        assert_eq!(rating.to_string(), "1500 ± 200");
    }

    #[test]
    fn test_side_bits() {
        assert_eq!(Side::First.bit() | Side::Second.bit(), BOTH_SIDES);
        assert_eq!(Side::First.other(), Side::Second);
        assert_eq!(Side::Second.index(), 1);
    }

    #[test]
    fn test_glicko2_conversion() {
        let rating = Rating::new(1620.0, 80.0, 0.059);
        let converted: Glicko2Rating = rating.into();
        assert_eq!(converted.rating, 1620.0);
        assert_eq!(converted.deviation, 80.0);
        assert_eq!(Rating::from(converted), rating);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = LadderEvent::CommandRejected(CommandRejected {
            player_id: "alice".to_string(),
            command: "join_queue".to_string(),
            reason: "Invalid platform: wii".to_string(),
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "CommandRejected");
        assert_eq!(event.routing_key(), "ladder.command.rejected");
    }
}
