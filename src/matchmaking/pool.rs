//! Per-platform matchmaking pools
//!
//! A player may wait in several platform pools at once but is tracked by a
//! single [`WaitingPlayer`]. Once paired in any pool the player is resolved,
//! skipped by every later pool in the same tick and purged by [`cleanup`].
//!
//! [`cleanup`]: MatchmakingPool::cleanup

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

use super::ribbon::{resolve_ribbon, Interval};
use super::waiting::WaitingPlayer;
use crate::config::{MatchmakingSettings, PlatformSettings};
use crate::error::{LadderError, Result};
use crate::storage::PlayerRecord;
use crate::types::{PlatformKey, PlayerId};

/// Two players paired in one pool
#[derive(Debug, Clone, PartialEq)]
pub struct Pairing {
    pub platform: PlatformKey,
    pub players: [WaitingPlayer; 2],
}

/// A queued-interest marker the front end should withdraw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearedInterest {
    pub player_id: PlayerId,
    pub platform: PlatformKey,
}

pub struct MatchmakingPool {
    platforms: PlatformSettings,
    /// Members of each pool, indexed like `platforms.pools`
    pools: Vec<BTreeSet<PlayerId>>,
    players: HashMap<PlayerId, WaitingPlayer>,
    extend_every: u32,
    extend_amount: f64,
}

impl MatchmakingPool {
    pub fn new(platforms: PlatformSettings, settings: &MatchmakingSettings) -> Self {
        let pools = vec![BTreeSet::new(); platforms.pools.len()];
        Self {
            platforms,
            pools,
            players: HashMap::new(),
            extend_every: settings.extend_intervals,
            extend_amount: settings.extend_amount,
        }
    }

    fn pool_index(&self, platform: &str) -> Result<usize> {
        self.platforms.index_of(platform).ok_or_else(|| {
            LadderError::InvalidPlatform {
                platform: platform.to_string(),
            }
            .into()
        })
    }

    /// Add a player to a platform pool.
    ///
    /// The caller is responsible for excluding players that hold a pending
    /// match and for checking platform registration.
    pub fn join(&mut self, platform: &str, player: &PlayerRecord, now: DateTime<Utc>) -> Result<()> {
        let index = self.pool_index(platform)?;
        if self.pools[index].contains(&player.player_id) {
            return Err(LadderError::AlreadyQueued {
                player_id: player.player_id.clone(),
                platform: platform.to_string(),
            }
            .into());
        }

        let waiting = self
            .players
            .entry(player.player_id.clone())
            .or_insert_with(|| WaitingPlayer::new(player, now));
        if waiting.resolved {
            return Err(LadderError::ConsistencyViolation {
                message: format!(
                    "Player {} is resolved but still in the pool index",
                    player.player_id
                ),
            }
            .into());
        }
        waiting.platforms.insert(platform.to_string());
        self.pools[index].insert(player.player_id.clone());

        info!(
            "Player {} joined {} pool with interval [{:.0}, {:.0}] ({} waiting)",
            player.player_id,
            platform,
            waiting.low,
            waiting.high,
            self.pools[index].len()
        );
        Ok(())
    }

    /// Remove a player from one platform pool
    pub fn leave(&mut self, platform: &str, player_id: &PlayerId) -> Result<()> {
        let index = self.pool_index(platform)?;
        if !self.pools[index].remove(player_id) {
            return Err(LadderError::NotQueued {
                player_id: player_id.clone(),
                platform: platform.to_string(),
            }
            .into());
        }

        let now_empty = match self.players.get_mut(player_id) {
            Some(waiting) => {
                waiting.platforms.remove(platform);
                waiting.platforms.is_empty()
            }
            None => {
                warn!("Player {} was in {} pool without an index entry", player_id, platform);
                true
            }
        };
        if now_empty {
            self.players.remove(player_id);
        }

        info!("Player {} left {} pool", player_id, platform);
        Ok(())
    }

    /// Remove a player from every pool, returning the markers to clear
    pub fn remove_player(&mut self, player_id: &PlayerId) -> Vec<ClearedInterest> {
        let Some(waiting) = self.players.remove(player_id) else {
            return Vec::new();
        };
        self.purge(&waiting)
    }

    fn purge(&mut self, waiting: &WaitingPlayer) -> Vec<ClearedInterest> {
        waiting
            .platforms
            .iter()
            .filter_map(|platform| {
                let index = self.platforms.index_of(platform)?;
                self.pools[index].remove(&waiting.player_id);
                Some(ClearedInterest {
                    player_id: waiting.player_id.clone(),
                    platform: platform.clone(),
                })
            })
            .collect()
    }

    /// Count one tick for every waiting player, returning how many widened
    pub fn extend_all(&mut self) -> usize {
        let (every, amount) = (self.extend_every, self.extend_amount);
        self.players
            .values_mut()
            .filter(|waiting| !waiting.resolved)
            .map(|waiting| waiting.extend(every, amount))
            .filter(|widened| *widened)
            .count()
    }

    /// Pair the unresolved players of one pool.
    ///
    /// Players are marked resolved only once every pairing of the pool has
    /// been built, so an error leaves the pool exactly as it was.
    pub fn resolve_matches(&mut self, platform: &str) -> Result<Vec<Pairing>> {
        let index = self.pool_index(platform)?;

        let mut entries: Vec<&WaitingPlayer> = Vec::new();
        for player_id in &self.pools[index] {
            let waiting = self.players.get(player_id).ok_or_else(|| {
                LadderError::ConsistencyViolation {
                    message: format!("Player {} in {} pool has no index entry", player_id, platform),
                }
            })?;
            if !waiting.resolved {
                entries.push(waiting);
            }
        }
        if entries.len() < 2 {
            return Ok(Vec::new());
        }

        let intervals: Vec<Interval> = entries.iter().map(|waiting| waiting.interval()).collect();
        let pairings: Vec<Pairing> = resolve_ribbon(&intervals)
            .into_iter()
            .map(|(first, second)| {
                let [a, b] = [entries[first], entries[second]];
                info!(
                    "Paired {} [{:.0}, {:.0}] with {} [{:.0}, {:.0}] on {}",
                    a.player_id, a.low, a.high, b.player_id, b.low, b.high, platform
                );
                Pairing {
                    platform: platform.to_string(),
                    players: [a, b].map(|waiting| WaitingPlayer {
                        resolved: true,
                        ..waiting.clone()
                    }),
                }
            })
            .collect();
        let candidates = entries.len();

        for pairing in &pairings {
            for paired in &pairing.players {
                if let Some(waiting) = self.players.get_mut(&paired.player_id) {
                    waiting.resolved = true;
                }
            }
        }

        debug!(
            "Resolved {} pairing(s) from {} candidate(s) in {} pool",
            pairings.len(),
            candidates,
            platform
        );
        Ok(pairings)
    }

    /// Resolve every pool in pool-index order, skipping pools that fail
    pub fn resolve_all(&mut self) -> Vec<Pairing> {
        let keys: Vec<PlatformKey> = self.platforms.keys().map(str::to_string).collect();
        let mut pairings = Vec::new();
        for platform in keys {
            match self.resolve_matches(&platform) {
                Ok(resolved) => pairings.extend(resolved),
                Err(e) => warn!("Could not resolve the {} pool: {:#}", platform, e),
            }
        }
        pairings
    }

    /// Put a paired player back into play after their match could not be created
    pub fn release(&mut self, player_id: &PlayerId) -> bool {
        match self.players.get_mut(player_id) {
            Some(waiting) if waiting.resolved => {
                waiting.resolved = false;
                debug!("Player {} released back into their pools", player_id);
                true
            }
            _ => false,
        }
    }

    /// Purge resolved players from every pool they occupied
    pub fn cleanup(&mut self) -> Vec<ClearedInterest> {
        let resolved: Vec<PlayerId> = self
            .players
            .values()
            .filter(|waiting| waiting.resolved)
            .map(|waiting| waiting.player_id.clone())
            .collect();

        let mut cleared = Vec::new();
        for player_id in resolved {
            cleared.extend(self.remove_player(&player_id));
        }
        cleared.sort_by(|a, b| (&a.player_id, &a.platform).cmp(&(&b.player_id, &b.platform)));
        cleared
    }

    pub fn is_queued(&self, platform: &str, player_id: &PlayerId) -> bool {
        self.platforms
            .index_of(platform)
            .is_some_and(|index| self.pools[index].contains(player_id))
    }

    pub fn waiting_player(&self, player_id: &PlayerId) -> Option<&WaitingPlayer> {
        self.players.get(player_id)
    }

    pub fn waiting_count(&self, platform: &str) -> usize {
        self.platforms
            .index_of(platform)
            .map(|index| self.pools[index].len())
            .unwrap_or(0)
    }

    /// `(platform, waiting)` for every pool, in pool-index order
    pub fn waiting_counts(&self) -> Vec<(PlatformKey, usize)> {
        self.platforms
            .keys()
            .zip(&self.pools)
            .map(|(platform, members)| (platform.to_string(), members.len()))
            .collect()
    }

    /// Distinct players waiting in at least one pool
    pub fn total_waiting(&self) -> usize {
        self.players.len()
    }
}
