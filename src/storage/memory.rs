//! In-memory tables and the storage backed directly by them

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::records::{MatchRecord, PendingMatchRecord, PlayerRecord, RatingPeriodCheckpoint};
use super::LadderStorage;
use crate::error::{LadderError, Result};
use crate::types::{MatchId, PlayerId};

/// The full contents of the ladder store
#[derive(Debug, Clone, Default)]
pub struct LadderTables {
    pub players: BTreeMap<PlayerId, PlayerRecord>,
    pub matches: BTreeMap<MatchId, MatchRecord>,
    pub pending_matches: BTreeMap<MatchId, PendingMatchRecord>,
    pub checkpoint: Option<RatingPeriodCheckpoint>,
}

impl LadderTables {
    pub fn store_player(&mut self, record: PlayerRecord) {
        self.players.insert(record.player_id.clone(), record);
    }

    pub fn players_page(&self, after: Option<&PlayerId>, limit: usize) -> Vec<PlayerRecord> {
        let lower = match after {
            Some(player_id) => Bound::Excluded(player_id.clone()),
            None => Bound::Unbounded,
        };
        self.players
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn append_match(&mut self, record: MatchRecord) -> Result<()> {
        if self.matches.contains_key(&record.match_id) {
            return Err(LadderError::ConsistencyViolation {
                message: format!("Match {} was already recorded", record.match_id),
            }
            .into());
        }
        self.matches.insert(record.match_id, record);
        Ok(())
    }

    pub fn commit_match(&mut self, record: MatchRecord, players: Vec<PlayerRecord>) -> Result<()> {
        if !self.pending_matches.contains_key(&record.match_id) {
            return Err(LadderError::ConsistencyViolation {
                message: format!("Pending match {} has no stored row", record.match_id),
            }
            .into());
        }
        // append_match is the only step that can still fail, and it checks first
        let match_id = record.match_id;
        self.append_match(record)?;
        for player in players {
            self.store_player(player);
        }
        self.pending_matches.remove(&match_id);
        Ok(())
    }
}

/// In-memory storage implementation
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: RwLock<LadderTables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current tables
    pub fn snapshot(&self) -> Result<LadderTables> {
        Ok(self.read()?.clone())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LadderTables>> {
        self.tables.read().map_err(|_| {
            LadderError::InternalError {
                message: "Failed to acquire storage read lock".to_string(),
            }
            .into()
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LadderTables>> {
        self.tables.write().map_err(|_| {
            LadderError::InternalError {
                message: "Failed to acquire storage write lock".to_string(),
            }
            .into()
        })
    }
}

impl LadderStorage for InMemoryStorage {
    fn get_player(&self, player_id: &PlayerId) -> Result<Option<PlayerRecord>> {
        Ok(self.read()?.players.get(player_id).cloned())
    }

    fn store_player(&self, record: PlayerRecord) -> Result<()> {
        self.write()?.store_player(record);
        Ok(())
    }

    fn store_players(&self, records: Vec<PlayerRecord>) -> Result<()> {
        let mut tables = self.write()?;
        for record in records {
            tables.store_player(record);
        }
        Ok(())
    }

    fn players_page(&self, after: Option<&PlayerId>, limit: usize) -> Result<Vec<PlayerRecord>> {
        Ok(self.read()?.players_page(after, limit))
    }

    fn player_count(&self) -> Result<usize> {
        Ok(self.read()?.players.len())
    }

    fn append_match(&self, record: MatchRecord) -> Result<()> {
        self.write()?.append_match(record)
    }

    fn match_exists(&self, match_id: &MatchId) -> Result<bool> {
        Ok(self.read()?.matches.contains_key(match_id))
    }

    fn commit_match(&self, record: MatchRecord, players: Vec<PlayerRecord>) -> Result<()> {
        self.write()?.commit_match(record, players)
    }

    fn match_count(&self) -> Result<usize> {
        Ok(self.read()?.matches.len())
    }

    fn store_pending_match(&self, record: PendingMatchRecord) -> Result<()> {
        self.write()?
            .pending_matches
            .insert(record.match_id, record);
        Ok(())
    }

    fn delete_pending_match(&self, match_id: &MatchId) -> Result<bool> {
        Ok(self.write()?.pending_matches.remove(match_id).is_some())
    }

    fn pending_matches(&self) -> Result<Vec<PendingMatchRecord>> {
        Ok(self.read()?.pending_matches.values().cloned().collect())
    }

    fn load_checkpoint(&self) -> Result<Option<RatingPeriodCheckpoint>> {
        Ok(self.read()?.checkpoint.clone())
    }

    fn store_checkpoint(&self, checkpoint: RatingPeriodCheckpoint) -> Result<()> {
        self.write()?.checkpoint = Some(checkpoint);
        Ok(())
    }

    fn store_decay_page(
        &self,
        players: Vec<PlayerRecord>,
        checkpoint: RatingPeriodCheckpoint,
    ) -> Result<()> {
        let mut tables = self.write()?;
        for player in players {
            tables.store_player(player);
        }
        tables.checkpoint = Some(checkpoint);
        Ok(())
    }
}
