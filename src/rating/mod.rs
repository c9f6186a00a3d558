//! Rating system: Glicko-2 updates, rank tiers and uncertainty decay

pub mod decay;
pub mod provider;
pub mod ranks;

// Re-export commonly used types
pub use decay::{decay_rating, decayed_phi};
pub use provider::{Glicko2RatingProvider, MockRatingProvider, RatingProvider};
pub use ranks::{Rank, RankTable};
