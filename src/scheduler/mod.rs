//! Timers: the job scheduler and rating period bookkeeping

pub mod jobs;
pub mod rating_period;

pub use jobs::{Cadence, JobKind, JobScheduler};
pub use rating_period::{
    period_boundary, period_index, DecaySummary, PeriodOutcome, RatingPeriodScheduler,
};
