//! The ladder service
//!
//! [`LadderService`] is constructed once per process and owns every mutable
//! ladder structure: the matchmaking pools, the pending match tracker and the
//! rating period scheduler. It is driven from a single event loop, so none
//! of its methods lock anything; each takes the current time explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::commands::LadderCommand;
use crate::config::AppConfig;
use crate::error::{as_validation, is_fatal, LadderError, Result};
use crate::matchmaking::{MatchmakingPool, Pairing};
use crate::metrics::MetricsCollector;
use crate::pending::PendingMatchTracker;
use crate::players::{PlayerRegistry, LEADERBOARD_SIZE};
use crate::rating::{RankTable, RatingProvider};
use crate::scheduler::{JobKind, PeriodOutcome, RatingPeriodScheduler};
use crate::storage::LadderStorage;
use crate::types::{
    CommandRejected, LadderEvent, Leaderboard, PlatformKey, QueueInterestCleared,
    RatingPeriodApplied,
};

/// Largest leaderboard a single request may ask for
pub const MAX_LEADERBOARD_SIZE: usize = 100;

/// Snapshot of the service for health checks and metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LadderStats {
    /// `(platform, waiting)` per pool
    pub players_waiting: Vec<(PlatformKey, usize)>,
    pub total_waiting: usize,
    pub pending_matches: usize,
    pub confirming_matches: usize,
    pub registered_players: usize,
    pub commands_processed: u64,
    pub commands_rejected: u64,
    pub matches_proposed: u64,
    pub matches_completed: u64,
    pub matches_cancelled: u64,
    pub matches_timed_out: u64,
    /// Last rating period the ladder is reconciled with
    pub rating_period: Option<i64>,
    /// Expired matches whose resolution failed and awaits the next sweep
    pub unresolved_expiries: usize,
}

pub struct LadderService {
    registry: PlayerRegistry,
    pool: MatchmakingPool,
    tracker: PendingMatchTracker,
    rating_period: RatingPeriodScheduler,
    storage: Arc<dyn LadderStorage>,
    metrics: Option<Arc<MetricsCollector>>,
    counters: LadderStats,
}

impl LadderService {
    pub fn new(
        config: &AppConfig,
        storage: Arc<dyn LadderStorage>,
        provider: Arc<dyn RatingProvider>,
    ) -> Self {
        let ranks = RankTable::new(config.ranks.clone());
        let registry = PlayerRegistry::new(
            storage.clone(),
            config.platforms.clone(),
            ranks.clone(),
            provider.initial_rating(),
        );
        let tracker = PendingMatchTracker::new(
            storage.clone(),
            registry.clone(),
            provider,
            ranks.clone(),
            config.pending_lifetime(),
            config.confirmation_window(),
        );
        let rating_period = RatingPeriodScheduler::new(
            config.rating_period.clone(),
            config.rating.max_phi,
            storage.clone(),
            registry.clone(),
            ranks,
        );

        Self {
            registry,
            pool: MatchmakingPool::new(config.platforms.clone(), &config.matchmaking),
            tracker,
            rating_period,
            storage,
            metrics: None,
            counters: LadderStats::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.tracker.set_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &PlayerRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &MatchmakingPool {
        &self.pool
    }

    pub fn tracker(&self) -> &PendingMatchTracker {
        &self.tracker
    }

    /// Reload pending matches, catch up on rating periods and resolve
    /// anything that expired while the service was down
    pub fn startup(&mut self, now: DateTime<Utc>) -> Result<Vec<LadderEvent>> {
        let restored = self.tracker.restore()?;

        let mut events = self.run_job(JobKind::RatingPeriod, now)?;
        events.extend(self.run_job(JobKind::PendingSweep, now)?);

        info!(
            "Ladder ready: {} pending match(es) restored, {} event(s) from catch-up",
            restored.restored,
            events.len()
        );
        Ok(events)
    }

    /// Handle one front-end command.
    ///
    /// Validation failures become a [`CommandRejected`] event; any other
    /// failure is returned to the caller.
    pub fn handle_command(
        &mut self,
        command: LadderCommand,
        now: DateTime<Utc>,
    ) -> Result<Vec<LadderEvent>> {
        let started = Instant::now();
        let name = command.name();
        let player_id = command.player_id().cloned().unwrap_or_default();
        self.counters.commands_processed += 1;

        let (outcome, result) = match self.execute(command, now) {
            Ok(events) => ("accepted", Ok(events)),
            Err(e) => match as_validation(&e) {
                Some(reason) => {
                    debug!("Rejected {} from {}: {}", name, player_id, reason);
                    self.counters.commands_rejected += 1;
                    let rejected = LadderEvent::CommandRejected(CommandRejected {
                        player_id: player_id.clone(),
                        command: name.to_string(),
                        reason: reason.to_string(),
                        timestamp: now,
                    });
                    ("rejected", Ok(vec![rejected]))
                }
                None => {
                    error!("Command {} from {} failed: {:#}", name, player_id, e);
                    ("failed", Err(e))
                }
            },
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_command(name, outcome, started.elapsed());
        }
        if let Ok(events) = &result {
            self.record_events(events);
        }
        result
    }

    fn execute(&mut self, command: LadderCommand, now: DateTime<Utc>) -> Result<Vec<LadderEvent>> {
        match command {
            LadderCommand::Register {
                player_id,
                platform,
            } => {
                self.registry.register(&player_id, &platform, now)?;
                Ok(Vec::new())
            }
            LadderCommand::Unregister {
                player_id,
                platform,
            } => {
                self.registry.unregister(&player_id, &platform, now)?;
                if !self.pool.is_queued(&platform, &player_id) {
                    return Ok(Vec::new());
                }
                self.pool.leave(&platform, &player_id)?;
                Ok(vec![LadderEvent::QueueInterestCleared(QueueInterestCleared {
                    player_id,
                    platform,
                    timestamp: now,
                })])
            }
            LadderCommand::UpdateDisplayName {
                player_id,
                display_name,
            } => {
                self.registry
                    .set_display_name(&player_id, display_name, now)?;
                Ok(Vec::new())
            }
            LadderCommand::UpdateUsername {
                player_id,
                platform,
                username,
            } => {
                self.registry
                    .set_username(&player_id, &platform, username, now)?;
                Ok(Vec::new())
            }
            LadderCommand::JoinQueue {
                player_id,
                platform,
            } => {
                if self.tracker.has_active_match(&player_id) {
                    return Err(LadderError::AlreadyInMatch { player_id }.into());
                }
                let record = self.registry.require_registered(&player_id, &platform)?;
                self.pool.join(&platform, &record, now)?;
                Ok(Vec::new())
            }
            LadderCommand::LeaveQueue {
                player_id,
                platform,
            } => {
                self.pool.leave(&platform, &player_id)?;
                Ok(Vec::new())
            }
            LadderCommand::Acknowledge { player_id } => {
                self.tracker.acknowledge(&player_id)?;
                Ok(Vec::new())
            }
            LadderCommand::ReportScore {
                player_id,
                own_score,
                opponent_score,
            } => self
                .tracker
                .report_score(&player_id, own_score, opponent_score, now),
            LadderCommand::ConfirmScore { player_id } => self.tracker.confirm(&player_id, now),
            LadderCommand::RequestCancel { player_id } => {
                self.tracker.request_cancel(&player_id, now)
            }
            LadderCommand::RequestLeaderboard { player_id, limit } => {
                let limit = limit
                    .unwrap_or(LEADERBOARD_SIZE)
                    .clamp(1, MAX_LEADERBOARD_SIZE);
                let entries = self.registry.leaderboard(limit)?;
                Ok(vec![LadderEvent::Leaderboard(Leaderboard {
                    requested_by: player_id,
                    entries,
                    timestamp: now,
                })])
            }
        }
    }

    /// Run one timer job.
    ///
    /// Failures are logged and the job simply runs again on its next firing;
    /// only rating computation failures are returned.
    pub fn run_job(&mut self, job: JobKind, now: DateTime<Utc>) -> Result<Vec<LadderEvent>> {
        let started = Instant::now();
        let result = match job {
            JobKind::MatchmakingTick => self.matchmaking_tick(now),
            JobKind::PendingSweep => self.sweep_pending(now),
            JobKind::RatingPeriod => self.apply_rating_period(now),
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_job(job.name(), started.elapsed());
        }

        match result {
            Ok(events) => {
                self.record_events(&events);
                Ok(events)
            }
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                error!("Job {} failed, retrying on its next run: {:#}", job.name(), e);
                Ok(Vec::new())
            }
        }
    }

    fn matchmaking_tick(&mut self, now: DateTime<Utc>) -> Result<Vec<LadderEvent>> {
        let widened = self.pool.extend_all();

        let pairings: Vec<Pairing> = self.pool.resolve_all();

        let mut events = Vec::new();
        for pairing in &pairings {
            match self.tracker.propose(pairing, now) {
                Ok(proposed) => events.push(LadderEvent::MatchProposed(proposed)),
                Err(e) => {
                    error!(
                        "Could not create a match for {} and {} on {}, returning them to the pool: {:#}",
                        pairing.players[0].player_id,
                        pairing.players[1].player_id,
                        pairing.platform,
                        e
                    );
                    for waiting in &pairing.players {
                        self.pool.release(&waiting.player_id);
                    }
                }
            }
        }

        events.extend(self.pool.cleanup().into_iter().map(|cleared| {
            LadderEvent::QueueInterestCleared(QueueInterestCleared {
                player_id: cleared.player_id,
                platform: cleared.platform,
                timestamp: now,
            })
        }));

        debug!(
            "Matchmaking tick: {} widened, {} pairing(s), {} still waiting",
            widened,
            pairings.len(),
            self.pool.total_waiting()
        );
        Ok(events)
    }

    fn sweep_pending(&mut self, now: DateTime<Utc>) -> Result<Vec<LadderEvent>> {
        let report = self.tracker.sweep_expired(now);
        self.counters.unresolved_expiries = self.tracker.retry_count();

        let mut fatal = None;
        for (match_id, e) in report.failures {
            if let Some(metrics) = &self.metrics {
                metrics.record_pending_failure();
            }
            if fatal.is_none() && is_fatal(&e) {
                fatal = Some(e.context(format!("resolving expired match {}", match_id)));
            }
        }
        if let Some(e) = fatal {
            if !report.events.is_empty() {
                warn!(
                    "{} event(s) from the same sweep will not be published",
                    report.events.len()
                );
            }
            return Err(e);
        }
        Ok(report.events)
    }

    fn apply_rating_period(&mut self, now: DateTime<Utc>) -> Result<Vec<LadderEvent>> {
        match self.rating_period.reconcile(now)? {
            PeriodOutcome::Decayed(summary) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_rating_period(summary.players_updated);
                }
                self.counters.rating_period = Some(summary.period);

                let mut events = vec![LadderEvent::RatingPeriodApplied(RatingPeriodApplied {
                    period: summary.period,
                    periods_elapsed: summary.periods_elapsed,
                    players_updated: summary.players_updated,
                    timestamp: now,
                })];
                events.extend(summary.rank_changes.into_iter().map(LadderEvent::RankChanged));
                Ok(events)
            }
            PeriodOutcome::Initialized { period }
            | PeriodOutcome::Rebaselined { period }
            | PeriodOutcome::UpToDate { period } => {
                self.counters.rating_period = Some(period);
                Ok(Vec::new())
            }
        }
    }

    fn record_events(&mut self, events: &[LadderEvent]) {
        for event in events {
            let finished = match event {
                LadderEvent::MatchProposed(_) => {
                    self.counters.matches_proposed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_match_proposed();
                    }
                    None
                }
                LadderEvent::MatchCompleted(_) => {
                    self.counters.matches_completed += 1;
                    Some("completed")
                }
                LadderEvent::MatchCancelled(_) => {
                    self.counters.matches_cancelled += 1;
                    Some("cancelled")
                }
                LadderEvent::MatchTimedOut(_) => {
                    self.counters.matches_timed_out += 1;
                    Some("timed_out")
                }
                _ => None,
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_event(event.kind());
                if let Some(resolution) = finished {
                    metrics.record_match_finished(resolution);
                }
            }
        }
    }

    pub fn stats(&self) -> LadderStats {
        let registered_players = match self.storage.player_count() {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to count players: {:#}", e);
                self.counters.registered_players
            }
        };

        LadderStats {
            players_waiting: self.pool.waiting_counts(),
            total_waiting: self.pool.total_waiting(),
            pending_matches: self.tracker.len(),
            confirming_matches: self.tracker.confirming_count(),
            registered_players,
            ..self.counters.clone()
        }
    }
}
