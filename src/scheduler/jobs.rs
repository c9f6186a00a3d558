//! Cooperative job scheduler
//!
//! The scheduler never runs job bodies itself. When a job falls due it sends
//! the job's kind into the event loop's queue, so timer work is serialized
//! with front-end commands and never overlaps another handler.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::rating_period::{period_boundary, period_index};
use crate::utils::{current_timestamp, to_chrono};

/// Periodic work driven by the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Widen intervals, resolve pools, propose matches
    MatchmakingTick,
    /// Expire unreported and unconfirmed pending matches
    PendingSweep,
    /// Apply rating period decay when a boundary has passed
    RatingPeriod,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::MatchmakingTick => "matchmaking_tick",
            JobKind::PendingSweep => "pending_sweep",
            JobKind::RatingPeriod => "rating_period",
        }
    }
}

/// When a job fires
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cadence {
    /// Fixed interval from scheduler start; missed ticks are skipped
    Every(Duration),
    /// At each wall-clock boundary `start + k * length`
    Aligned {
        start: DateTime<Utc>,
        length_seconds: u64,
    },
}

impl Cadence {
    /// First firing strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::Every(interval) => after + to_chrono(interval.max(Duration::from_millis(1))),
            Cadence::Aligned {
                start,
                length_seconds,
            } => period_boundary(
                start,
                length_seconds,
                period_index(start, length_seconds, after) + 1,
            ),
        }
    }
}

struct Job {
    kind: JobKind,
    cadence: Cadence,
    next_due: DateTime<Utc>,
}

#[derive(Default)]
pub struct JobScheduler {
    jobs: Vec<Job>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job; its first firing is one cadence step from now
    pub fn add(mut self, kind: JobKind, cadence: Cadence) -> Self {
        let next_due = cadence.next_after(current_timestamp());
        debug!("Scheduled job {} first at {}", kind.name(), next_due);
        self.jobs.push(Job {
            kind,
            cadence,
            next_due,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run until shutdown or until the receiving queue is closed
    pub fn spawn<T>(
        mut self,
        queue: mpsc::Sender<T>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()>
    where
        T: From<JobKind> + Send + 'static,
    {
        tokio::spawn(async move {
            info!("Job scheduler started with {} job(s)", self.jobs.len());

            loop {
                let Some(next_due) = self.jobs.iter().map(|job| job.next_due).min() else {
                    warn!("Job scheduler has no jobs, stopping");
                    return;
                };

                let wait = (next_due - current_timestamp())
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.recv() => {
                        info!("Job scheduler stopped");
                        return;
                    }
                }

                let now = current_timestamp();
                for job in self.jobs.iter_mut().filter(|job| job.next_due <= now) {
                    job.next_due = job.cadence.next_after(now);
                    debug!("Job {} due, next at {}", job.kind.name(), job.next_due);
                    if queue.send(T::from(job.kind)).await.is_err() {
                        info!("Event loop queue closed, job scheduler stopping");
                        return;
                    }
                }
            }
        })
    }
}
