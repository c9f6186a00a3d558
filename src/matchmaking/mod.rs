//! Matchmaking engine: per-platform pools paired by interval overlap

pub mod pool;
pub mod ribbon;
pub mod waiting;

pub use pool::{ClearedInterest, MatchmakingPool, Pairing};
pub use ribbon::{resolve_ribbon, Interval};
pub use waiting::WaitingPlayer;
