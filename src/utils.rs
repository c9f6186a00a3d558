//! Utility functions for the ladder service

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::MatchId;

/// Generate a new unique match ID
pub fn generate_match_id() -> MatchId {
    Uuid::new_v4()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a std duration into a chrono one, saturating on overflow
pub fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
