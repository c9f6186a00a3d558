//! Persistence for players, matches, pending matches and the rating period
//!
//! The service talks to storage only through [`LadderStorage`] and the typed
//! records in [`records`]. Every method is synchronous and durable on return.

pub mod memory;
pub mod records;
pub mod sqlite;

use crate::error::Result;
use crate::types::{MatchId, PlayerId};

pub use memory::{InMemoryStorage, LadderTables};
pub use records::{
    DecaySweep, MatchRecord, PendingMatchRecord, PlayerRecord, RatingPeriodCheckpoint,
};
pub use sqlite::SqliteStorage;

/// Trait for ladder storage operations
pub trait LadderStorage: Send + Sync {
    /// Get a player's record
    fn get_player(&self, player_id: &PlayerId) -> Result<Option<PlayerRecord>>;

    /// Insert or replace a player's record
    fn store_player(&self, record: PlayerRecord) -> Result<()>;

    /// Insert or replace several player records in one write
    fn store_players(&self, records: Vec<PlayerRecord>) -> Result<()>;

    /// Up to `limit` players ordered by id, starting after `after`
    fn players_page(&self, after: Option<&PlayerId>, limit: usize) -> Result<Vec<PlayerRecord>>;

    fn player_count(&self) -> Result<usize>;

    /// Append a finished match. A second record with the same id is rejected.
    fn append_match(&self, record: MatchRecord) -> Result<()>;

    fn match_exists(&self, match_id: &MatchId) -> Result<bool>;

    /// In one write: append `record`, store the updated `players` and delete
    /// the pending match row with the same id. Fails without changing
    /// anything when that row is missing.
    fn commit_match(&self, record: MatchRecord, players: Vec<PlayerRecord>) -> Result<()>;

    fn match_count(&self) -> Result<usize>;

    /// Insert or replace a pending match row
    fn store_pending_match(&self, record: PendingMatchRecord) -> Result<()>;

    /// Delete a pending match row, returning whether it existed
    fn delete_pending_match(&self, match_id: &MatchId) -> Result<bool>;

    fn pending_matches(&self) -> Result<Vec<PendingMatchRecord>>;

    fn load_checkpoint(&self) -> Result<Option<RatingPeriodCheckpoint>>;

    fn store_checkpoint(&self, checkpoint: RatingPeriodCheckpoint) -> Result<()>;

    /// In one write: store a page of decayed `players` and the `checkpoint`
    /// recording how far the sweep got
    fn store_decay_page(
        &self,
        players: Vec<PlayerRecord>,
        checkpoint: RatingPeriodCheckpoint,
    ) -> Result<()>;
}
