//! Rating period scheduler
//!
//! Periods are fixed wall-clock windows `start + k * length`. The persisted
//! checkpoint records the last period whose decay was applied. Reconciling
//! against it is the same operation at startup and at every boundary: any
//! periods elapsed since the checkpoint are decayed in one sweep and the
//! checkpoint advances only after the whole sweep succeeded. While a sweep
//! runs, the checkpoint also carries its cursor, written atomically with
//! each page of decayed players.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RatingPeriodSettings;
use crate::error::Result;
use crate::players::PlayerRegistry;
use crate::rating::{decay_rating, RankTable};
use crate::storage::{DecaySweep, LadderStorage, PlayerRecord, RatingPeriodCheckpoint};
use crate::types::RankChanged;

/// Index of the period containing `now`; negative before `start`
pub fn period_index(start: DateTime<Utc>, length_seconds: u64, now: DateTime<Utc>) -> i64 {
    let length = length_seconds.max(1) as i64;
    (now - start).num_seconds().div_euclid(length)
}

/// Wall-clock start of period `index`
pub fn period_boundary(start: DateTime<Utc>, length_seconds: u64, index: i64) -> DateTime<Utc> {
    let length = length_seconds.max(1) as i64;
    start + Duration::seconds(index.saturating_mul(length))
}

/// What a reconciliation did
#[derive(Debug, Clone, PartialEq)]
pub enum PeriodOutcome {
    /// No checkpoint existed; baselined without decay
    Initialized { period: i64 },
    /// Period start or length changed; baselined without decay
    Rebaselined { period: i64 },
    /// Nothing elapsed since the checkpoint
    UpToDate { period: i64 },
    /// Decay applied for the elapsed periods
    Decayed(DecaySummary),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecaySummary {
    pub period: i64,
    pub periods_elapsed: i64,
    pub players_updated: usize,
    pub rank_changes: Vec<RankChanged>,
}

pub struct RatingPeriodScheduler {
    settings: RatingPeriodSettings,
    max_phi: f64,
    storage: Arc<dyn LadderStorage>,
    registry: PlayerRegistry,
    ranks: RankTable,
}

impl RatingPeriodScheduler {
    pub fn new(
        settings: RatingPeriodSettings,
        max_phi: f64,
        storage: Arc<dyn LadderStorage>,
        registry: PlayerRegistry,
        ranks: RankTable,
    ) -> Self {
        Self {
            settings,
            max_phi,
            storage,
            registry,
            ranks,
        }
    }

    pub fn current_period(&self, now: DateTime<Utc>) -> i64 {
        period_index(self.settings.start, self.settings.length_seconds, now)
    }

    /// First period boundary strictly after `now`
    pub fn next_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        period_boundary(
            self.settings.start,
            self.settings.length_seconds,
            self.current_period(now) + 1,
        )
    }

    fn checkpoint(&self, period: i64) -> RatingPeriodCheckpoint {
        RatingPeriodCheckpoint {
            period_start: self.settings.start,
            period_length_seconds: self.settings.length_seconds,
            last_processed_period: period,
            sweep: None,
        }
    }

    /// Bring the ladder up to the period containing `now`
    pub fn reconcile(&self, now: DateTime<Utc>) -> Result<PeriodOutcome> {
        let period = self.current_period(now);

        let Some(mut checkpoint) = self.storage.load_checkpoint()? else {
            self.storage.store_checkpoint(self.checkpoint(period))?;
            info!("Rating periods initialized at period {}", period);
            return Ok(PeriodOutcome::Initialized { period });
        };

        if checkpoint.period_start != self.settings.start
            || checkpoint.period_length_seconds != self.settings.length_seconds
        {
            warn!(
                "Rating period parameters changed (start {} -> {}, length {}s -> {}s), \
                 skipping pending decay and re-baselining at period {}",
                checkpoint.period_start,
                self.settings.start,
                checkpoint.period_length_seconds,
                self.settings.length_seconds,
                period
            );
            self.storage.store_checkpoint(self.checkpoint(period))?;
            return Ok(PeriodOutcome::Rebaselined { period });
        }

        let mut summary = DecaySummary {
            period,
            periods_elapsed: 0,
            players_updated: 0,
            rank_changes: Vec::new(),
        };

        if let Some(sweep) = checkpoint.sweep.clone() {
            info!(
                "Resuming decay sweep to period {} after player {}",
                sweep.target_period,
                sweep.after.as_deref().unwrap_or("<none>")
            );
            checkpoint = self.run_sweep(checkpoint, sweep, now, &mut summary)?;
        }

        let elapsed = period - checkpoint.last_processed_period;
        if elapsed > 0 {
            info!(
                "Applying {} rating period(s) of decay ({} -> {})",
                elapsed, checkpoint.last_processed_period, period
            );
            let sweep = DecaySweep {
                target_period: period,
                periods: elapsed,
                after: None,
            };
            self.run_sweep(checkpoint, sweep, now, &mut summary)?;
        } else if elapsed < 0 {
            warn!(
                "Current period {} is behind checkpoint {}, waiting",
                period, checkpoint.last_processed_period
            );
        }

        if summary.periods_elapsed == 0 {
            debug!("Rating period {} already processed", period);
            return Ok(PeriodOutcome::UpToDate { period });
        }

        info!(
            "Rating period {} processed: {} player(s) decayed, {} rank change(s)",
            period,
            summary.players_updated,
            summary.rank_changes.len()
        );
        Ok(PeriodOutcome::Decayed(summary))
    }

    /// Widen every player's phi after `sweep.after` by `sweep.periods`
    /// periods, one page at a time. Each page is stored together with the
    /// sweep's progress, so a failed sweep resumes where it stopped instead
    /// of decaying the stored pages again.
    fn run_sweep(
        &self,
        mut checkpoint: RatingPeriodCheckpoint,
        sweep: DecaySweep,
        now: DateTime<Utc>,
        summary: &mut DecaySummary,
    ) -> Result<RatingPeriodCheckpoint> {
        self.registry.for_each_page_after(
            sweep.after.clone(),
            self.settings.batch_size.max(1),
            |page| {
                let after = page.last().map(|record| record.player_id.clone());
                let changed = self.decay_page(page, sweep.periods, now, &mut summary.rank_changes);
                let count = changed.len();
                checkpoint.sweep = Some(DecaySweep {
                    after,
                    ..sweep.clone()
                });
                self.storage.store_decay_page(changed, checkpoint.clone())?;
                summary.players_updated += count;
                Ok(())
            },
        )?;

        checkpoint.last_processed_period = sweep.target_period;
        checkpoint.sweep = None;
        self.storage.store_checkpoint(checkpoint.clone())?;
        summary.periods_elapsed += sweep.periods;
        Ok(checkpoint)
    }

    /// The records of `page` whose rating changes after `periods` of decay
    fn decay_page(
        &self,
        page: Vec<PlayerRecord>,
        periods: i64,
        now: DateTime<Utc>,
        rank_changes: &mut Vec<RankChanged>,
    ) -> Vec<PlayerRecord> {
        let mut changed = Vec::with_capacity(page.len());
        for mut record in page {
            let decayed = decay_rating(
                &record.rating,
                periods,
                self.settings.phi_increase_rate,
                self.max_phi,
            );
            if decayed == record.rating {
                continue;
            }
            if record.is_active() {
                rank_changes.extend(self.ranks.rank_change(
                    &record.player_id,
                    &record.rating,
                    &decayed,
                    now,
                ));
            }
            record.rating = decayed;
            record.updated_at = now;
            changed.push(record);
        }
        changed
    }
}
