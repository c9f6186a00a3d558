//! Typed rows of the ladder tables

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{MatchId, MatchResolution, PlatformKey, PlayerId, Rating};

/// Row of the `players` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub player_id: PlayerId,
    pub rating: Rating,
    pub platforms: BTreeSet<PlatformKey>,
    pub display_name: Option<String>,
    pub usernames: BTreeMap<PlatformKey, String>,
    pub match_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlayerRecord {
    /// Create a new player with no platforms yet
    pub fn new(player_id: PlayerId, rating: Rating, now: DateTime<Utc>) -> Self {
        Self {
            player_id,
            rating,
            platforms: BTreeSet::new(),
            display_name: None,
            usernames: BTreeMap::new(),
            match_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A player with no registered platform is inactive and unranked
    pub fn is_active(&self) -> bool {
        !self.platforms.is_empty()
    }

    pub fn is_registered_on(&self, platform: &str) -> bool {
        self.platforms.contains(platform)
    }
}

/// Row of the append-only `matches` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: MatchId,
    pub platform: PlatformKey,
    pub player1: PlayerId,
    pub player2: PlayerId,
    pub score1: Option<u32>,
    pub score2: Option<u32>,
    pub resolution: MatchResolution,
    pub player1_before: Rating,
    pub player1_after: Rating,
    pub player2_before: Rating,
    pub player2_after: Rating,
    pub proposed_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Row of the `pending_matches` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMatchRecord {
    pub match_id: MatchId,
    pub platform: PlatformKey,
    pub player1: PlayerId,
    pub player2: PlayerId,
    pub goal: u32,
    pub proposed_at: DateTime<Utc>,
    pub score1: Option<u32>,
    pub score2: Option<u32>,
    pub confirmations: u8,
    pub cancel_requests: u8,
    pub acknowledgements: u8,
    pub confirming_since: Option<DateTime<Utc>>,
}

/// The rating period scheduler's persisted progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingPeriodCheckpoint {
    pub period_start: DateTime<Utc>,
    pub period_length_seconds: u64,
    pub last_processed_period: i64,
    /// Decay sweep interrupted part way; finished before any new one starts
    #[serde(default)]
    pub sweep: Option<DecaySweep>,
}

/// Progress of a decay sweep, stored with each page it writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecaySweep {
    /// Period the checkpoint moves to when the sweep finishes
    pub target_period: i64,
    pub periods: i64,
    /// Last player id whose page was written
    pub after: Option<PlayerId>,
}
