//! Ranked ladder - 1v1 ranked matchmaking service
//!
//! Players queue per platform, get paired by overlapping rating intervals,
//! play a first-to-N match, report and confirm the score, and receive
//! Glicko-2 rating updates. Inactive players lose certainty once per rating
//! period. Commands arrive and events leave over AMQP.

pub mod amqp;
pub mod config;
pub mod error;
pub mod matchmaking;
pub mod metrics;
pub mod pending;
pub mod players;
pub mod rating;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{LadderError, Result};
pub use types::*;

pub use amqp::EventPublisher;
pub use service::{LadderCommand, LadderHandle, LadderService};
pub use storage::LadderStorage;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
