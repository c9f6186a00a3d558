//! Service layer: the ladder state owner, its event loop and the application
//! wiring around it.

pub mod app;
pub mod commands;
pub mod health;
pub mod ladder;
pub mod runtime;

pub use app::{AppState, ServiceError};
pub use commands::LadderCommand;
pub use health::{ComponentCheck, HealthCheck, HealthStatus, ServiceProbe};
pub use ladder::{LadderService, LadderStats, MAX_LEADERBOARD_SIZE};
pub use runtime::{
    spawn_event_loop, spawn_publisher, CommandReply, LadderHandle, LadderRuntime, LoopMessage,
};
