//! Pool-local view of a queued player

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use super::ribbon::Interval;
use crate::storage::PlayerRecord;
use crate::types::{PlatformKey, PlayerId, Rating};

/// A player waiting in one or more platform pools
#[derive(Debug, Clone, PartialEq)]
pub struct WaitingPlayer {
    pub player_id: PlayerId,
    /// Rating snapshot taken when the player first joined a pool
    pub rating: Rating,
    pub low: f64,
    pub high: f64,
    /// Pools the player is currently queued in
    pub platforms: BTreeSet<PlatformKey>,
    pub resolved: bool,
    /// Ticks since the interval last widened
    pub intervals: u32,
    pub joined_at: DateTime<Utc>,
}

impl WaitingPlayer {
    pub fn new(player: &PlayerRecord, now: DateTime<Utc>) -> Self {
        Self {
            player_id: player.player_id.clone(),
            rating: player.rating,
            low: player.rating.low(),
            high: player.rating.high(),
            platforms: BTreeSet::new(),
            resolved: false,
            intervals: 0,
            joined_at: now,
        }
    }

    pub fn interval(&self) -> Interval {
        Interval::new(self.low, self.high)
    }

    /// Count one tick; every `every`-th tick widens both ends by `amount`.
    /// Returns whether the interval widened.
    pub fn extend(&mut self, every: u32, amount: f64) -> bool {
        self.intervals = (self.intervals + 1) % every.max(1);
        if self.intervals != 0 {
            return false;
        }
        let amount = amount.max(0.0);
        self.low -= amount;
        self.high += amount;
        true
    }
}
