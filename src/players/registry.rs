//! Player registry: typed access to player records
//!
//! Ratings only change through [`PlayerRegistry::rated_records`] (fed by the
//! rating provider) and the rating period decay sweep.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::PlatformSettings;
use crate::error::{LadderError, Result};
use crate::rating::RankTable;
use crate::storage::{LadderStorage, PlayerRecord};
use crate::types::{LeaderboardEntry, PlayerId, Rating, RatingChange};

/// Page size used when scanning every player
pub const SCAN_PAGE_SIZE: usize = 1024;

/// Default number of leaderboard entries
pub const LEADERBOARD_SIZE: usize = 10;

#[derive(Clone)]
pub struct PlayerRegistry {
    storage: Arc<dyn LadderStorage>,
    platforms: PlatformSettings,
    ranks: RankTable,
    initial_rating: Rating,
}

impl PlayerRegistry {
    pub fn new(
        storage: Arc<dyn LadderStorage>,
        platforms: PlatformSettings,
        ranks: RankTable,
        initial_rating: Rating,
    ) -> Self {
        Self {
            storage,
            platforms,
            ranks,
            initial_rating,
        }
    }

    pub fn get(&self, player_id: &PlayerId) -> Result<Option<PlayerRecord>> {
        self.storage.get_player(player_id)
    }

    fn check_platform(&self, platform: &str) -> Result<()> {
        if !self.platforms.contains(platform) {
            return Err(LadderError::InvalidPlatform {
                platform: platform.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Load a player that must be registered on `platform`
    pub fn require_registered(&self, player_id: &PlayerId, platform: &str) -> Result<PlayerRecord> {
        self.check_platform(platform)?;
        self.get(player_id)?
            .filter(|record| record.is_registered_on(platform))
            .ok_or_else(|| {
                LadderError::NotRegistered {
                    player_id: player_id.clone(),
                    platform: platform.to_string(),
                }
                .into()
            })
    }

    /// Load a player that must exist, as an internal invariant
    pub fn require_existing(&self, player_id: &PlayerId) -> Result<PlayerRecord> {
        self.get(player_id)?.ok_or_else(|| {
            LadderError::ConsistencyViolation {
                message: format!("Player {} has no record", player_id),
            }
            .into()
        })
    }

    /// Register a player on a platform, creating the player when new
    pub fn register(
        &self,
        player_id: &PlayerId,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<PlayerRecord> {
        self.check_platform(platform)?;

        let mut record = self
            .get(player_id)?
            .unwrap_or_else(|| PlayerRecord::new(player_id.clone(), self.initial_rating, now));

        if record.is_registered_on(platform) {
            return Err(LadderError::AlreadyRegistered {
                player_id: player_id.clone(),
                platform: platform.to_string(),
            }
            .into());
        }

        record.platforms.insert(platform.to_string());
        record.updated_at = now;
        self.storage.store_player(record.clone())?;

        info!(
            "Registered player {} on {} (platforms: {:?}, rating {})",
            player_id, platform, record.platforms, record.rating
        );
        Ok(record)
    }

    /// Remove a platform; the last removal also clears the player's profile
    pub fn unregister(
        &self,
        player_id: &PlayerId,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<PlayerRecord> {
        let mut record = self.require_registered(player_id, platform)?;

        record.platforms.remove(platform);
        record.usernames.remove(platform);
        if !record.is_active() {
            record.display_name = None;
            record.usernames.clear();
        }
        record.updated_at = now;
        self.storage.store_player(record.clone())?;

        info!(
            "Unregistered player {} from {} ({})",
            player_id,
            platform,
            if record.is_active() { "still active" } else { "now inactive" }
        );
        Ok(record)
    }

    pub fn set_display_name(
        &self,
        player_id: &PlayerId,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<PlayerRecord> {
        let mut record = self
            .get(player_id)?
            .filter(PlayerRecord::is_active)
            .ok_or_else(|| LadderError::NotRegistered {
                player_id: player_id.clone(),
                platform: "any platform".to_string(),
            })?;

        record.display_name = display_name.filter(|name| !name.trim().is_empty());
        record.updated_at = now;
        self.storage.store_player(record.clone())?;

        debug!("Player {} display name set to {:?}", player_id, record.display_name);
        Ok(record)
    }

    pub fn set_username(
        &self,
        player_id: &PlayerId,
        platform: &str,
        username: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<PlayerRecord> {
        let mut record = self.require_registered(player_id, platform)?;

        match username.filter(|name| !name.trim().is_empty()) {
            Some(name) => {
                record.usernames.insert(platform.to_string(), name);
            }
            None => {
                record.usernames.remove(platform);
            }
        }
        record.updated_at = now;
        self.storage.store_player(record.clone())?;

        debug!("Player {} usernames now {:?}", player_id, record.usernames);
        Ok(record)
    }

    /// Player records with `changes` applied, ready to be written
    pub fn rated_records(
        &self,
        changes: &[RatingChange],
        counts_as_match: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlayerRecord>> {
        changes
            .iter()
            .map(|change| {
                let mut record = self.require_existing(&change.player_id)?;
                record.rating = change.new_rating;
                if counts_as_match {
                    record.match_count += 1;
                }
                record.updated_at = now;
                Ok(record)
            })
            .collect()
    }

    /// Visit every player in id order, one page at a time
    pub fn for_each_page(
        &self,
        page_size: usize,
        visit: impl FnMut(Vec<PlayerRecord>) -> Result<()>,
    ) -> Result<()> {
        self.for_each_page_after(None, page_size, visit)
    }

    /// Visit the players sorting after `after`, one page at a time
    pub fn for_each_page_after(
        &self,
        mut after: Option<PlayerId>,
        page_size: usize,
        mut visit: impl FnMut(Vec<PlayerRecord>) -> Result<()>,
    ) -> Result<()> {
        loop {
            let page = self.storage.players_page(after.as_ref(), page_size)?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            after = Some(last.player_id.clone());
            let full = page.len() == page_size;
            visit(page)?;
            if !full {
                return Ok(());
            }
        }
    }

    /// Top placed active players by mu, then phi, both descending
    pub fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let mut ranked: Vec<PlayerRecord> = Vec::new();
        self.for_each_page(SCAN_PAGE_SIZE, |page| {
            ranked.extend(
                page.into_iter()
                    .filter(|record| record.is_active() && self.ranks.is_placed(&record.rating)),
            );
            Ok(())
        })?;

        ranked.sort_by(|a, b| {
            b.rating
                .mu
                .total_cmp(&a.rating.mu)
                .then_with(|| b.rating.phi.total_cmp(&a.rating.phi))
                .then_with(|| a.player_id.cmp(&b.player_id))
        });

        Ok(ranked
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(index, record)| LeaderboardEntry {
                position: index + 1,
                display: record.rating.to_string(),
                player_id: record.player_id,
                display_name: record.display_name,
                rating: record.rating,
            })
            .collect())
    }
}
