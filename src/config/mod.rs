//! Configuration management for the ladder service
//!
//! This module handles configuration loading from TOML files and environment
//! variables, validation, and default values.

pub mod app;
pub mod rating;
pub mod ranks;

// Re-export commonly used types
pub use app::{
    validate_config, AmqpSettings, AppConfig, MatchmakingSettings, PendingSettings, Platform,
    PlatformSettings, RatingPeriodSettings, ServiceSettings, StorageSettings,
};
pub use rating::RatingSettings;
pub use ranks::{RankTierSettings, RanksSettings};
