//! Pending match lifecycle: proposal, score reports, confirmation and expiry

pub mod pending_match;
pub mod tracker;

pub use pending_match::{CancelOutcome, PendingMatch, PendingState, ReportOutcome};
pub use tracker::{PendingMatchTracker, RestoreSummary, SweepReport};
