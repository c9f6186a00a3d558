//! Player registry

pub mod registry;

pub use registry::{PlayerRegistry, LEADERBOARD_SIZE, SCAN_PAGE_SIZE};
