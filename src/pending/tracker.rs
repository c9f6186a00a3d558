//! Pending match tracker
//!
//! Owns every outstanding [`PendingMatch`], is the only writer of the
//! `pending_matches` table and turns finished matches into rating updates.
//! Each change is written to storage before the in-memory copy is replaced,
//! so a failed write leaves the tracker exactly as it was.
//!
//! Expiry uses two queues ordered by time. Entries are never removed eagerly;
//! a queue entry is only acted on if the match still exists and its timestamp
//! still matches the entry.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::pending_match::{CancelOutcome, PendingMatch, ReportOutcome};
use crate::error::{LadderError, Result};
use crate::matchmaking::Pairing;
use crate::metrics::MetricsCollector;
use crate::players::PlayerRegistry;
use crate::rating::{RankTable, RatingProvider};
use crate::storage::{LadderStorage, MatchRecord};
use crate::types::{
    CancelRequested, LadderEvent, MatchCancelled, MatchCompleted, MatchId, MatchProposed,
    MatchResolution, MatchTimedOut, PlayerId, Rating, RatingChange, ScoreReported, Side,
};
use crate::utils::{generate_match_id, to_chrono};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    /// No score was reported within the match lifetime
    Unreported,
    /// A report was not confirmed within the confirmation window
    Unconfirmed,
}

/// Outcome of one expiry sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    pub events: Vec<LadderEvent>,
    pub timed_out: usize,
    pub finalized: usize,
    /// Matches whose resolution failed; they stay pending and are retried
    pub failures: Vec<(MatchId, anyhow::Error)>,
}

/// Outcome of reloading persisted pending matches
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    /// Rows whose match had already been recorded and were deleted
    pub reconciled: usize,
}

pub struct PendingMatchTracker {
    matches: HashMap<MatchId, PendingMatch>,
    by_player: HashMap<PlayerId, MatchId>,
    awaiting_report: VecDeque<(DateTime<Utc>, MatchId)>,
    awaiting_confirmation: VecDeque<(DateTime<Utc>, MatchId)>,
    /// Expired entries whose resolution failed, with the time they were queued at
    retry: Vec<(Expiry, DateTime<Utc>, MatchId)>,
    lifetime: Duration,
    confirmation_window: Duration,
    storage: Arc<dyn LadderStorage>,
    registry: PlayerRegistry,
    provider: Arc<dyn RatingProvider>,
    ranks: RankTable,
    metrics: Option<Arc<MetricsCollector>>,
}

impl PendingMatchTracker {
    pub fn new(
        storage: Arc<dyn LadderStorage>,
        registry: PlayerRegistry,
        provider: Arc<dyn RatingProvider>,
        ranks: RankTable,
        lifetime: std::time::Duration,
        confirmation_window: std::time::Duration,
    ) -> Self {
        Self {
            matches: HashMap::new(),
            by_player: HashMap::new(),
            awaiting_report: VecDeque::new(),
            awaiting_confirmation: VecDeque::new(),
            retry: Vec::new(),
            lifetime: to_chrono(lifetime),
            confirmation_window: to_chrono(confirmation_window),
            storage,
            registry,
            provider,
            ranks,
            metrics: None,
        }
    }

    pub fn set_metrics(&mut self, metrics: Arc<MetricsCollector>) {
        self.metrics = Some(metrics);
    }

    /// Run the rating provider, timing the call
    fn compute_outcome(&self, winner: &Rating, loser: &Rating) -> Result<(Rating, Rating)> {
        let Some(metrics) = &self.metrics else {
            return self.provider.compute_outcome(winner, loser);
        };
        let timer = metrics.start_timer();
        let result = self.provider.compute_outcome(winner, loser);
        metrics.record_rating_calculation(timer.stop());
        result
    }

    /// Reload persisted pending matches after a restart
    pub fn restore(&mut self) -> Result<RestoreSummary> {
        let mut summary = RestoreSummary::default();
        let mut rows = self.storage.pending_matches()?;
        rows.sort_by_key(|row| row.proposed_at);

        for row in rows {
            if self.storage.match_exists(&row.match_id)? {
                warn!(
                    "Pending match {} was already recorded, deleting the stale row",
                    row.match_id
                );
                self.storage.delete_pending_match(&row.match_id)?;
                summary.reconciled += 1;
                continue;
            }

            let pending = PendingMatch::from_record(row)?;
            for player_id in &pending.players {
                if let Some(existing) = self.by_player.get(player_id) {
                    return Err(LadderError::ConsistencyViolation {
                        message: format!(
                            "Player {} is in pending matches {} and {}",
                            player_id, existing, pending.match_id
                        ),
                    }
                    .into());
                }
            }
            self.insert(pending);
            summary.restored += 1;
        }

        let mut confirming: Vec<_> = self
            .matches
            .values()
            .filter_map(|pending| Some((pending.confirming_since?, pending.match_id)))
            .collect();
        confirming.sort();
        self.awaiting_confirmation = confirming.into();

        info!(
            "Restored {} pending match(es), reconciled {} already recorded",
            summary.restored, summary.reconciled
        );
        Ok(summary)
    }

    fn insert(&mut self, pending: PendingMatch) {
        for player_id in &pending.players {
            self.by_player.insert(player_id.clone(), pending.match_id);
        }
        if pending.scores.is_none() {
            self.awaiting_report
                .push_back((pending.proposed_at, pending.match_id));
        }
        self.matches.insert(pending.match_id, pending);
    }

    fn forget(&mut self, match_id: &MatchId) -> Option<PendingMatch> {
        let pending = self.matches.remove(match_id)?;
        for player_id in &pending.players {
            self.by_player.remove(player_id);
        }
        Some(pending)
    }

    /// Persist a changed match, then replace the in-memory copy
    fn store(&mut self, updated: PendingMatch) -> Result<()> {
        self.storage.store_pending_match(updated.to_record())?;
        self.matches.insert(updated.match_id, updated);
        Ok(())
    }

    pub fn get(&self, match_id: &MatchId) -> Option<&PendingMatch> {
        self.matches.get(match_id)
    }

    pub fn active_match(&self, player_id: &PlayerId) -> Option<&PendingMatch> {
        self.by_player
            .get(player_id)
            .and_then(|match_id| self.matches.get(match_id))
    }

    pub fn has_active_match(&self, player_id: &PlayerId) -> bool {
        self.by_player.contains_key(player_id)
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Expired matches whose resolution failed and will be retried
    pub fn retry_count(&self) -> usize {
        self.retry.len()
    }

    /// Matches with a reported score waiting for confirmation
    pub fn confirming_count(&self) -> usize {
        self.matches
            .values()
            .filter(|pending| pending.scores.is_some())
            .count()
    }

    fn match_for(&self, player_id: &PlayerId) -> Result<(PendingMatch, Side)> {
        let pending = self
            .active_match(player_id)
            .ok_or_else(|| LadderError::NotInMatch {
                player_id: player_id.clone(),
            })?;
        let side = pending
            .side_of(player_id)
            .ok_or_else(|| LadderError::ConsistencyViolation {
                message: format!(
                    "Player {} is indexed to match {} but not part of it",
                    player_id, pending.match_id
                ),
            })?;
        Ok((pending.clone(), side))
    }

    /// Turn a pairing into a persisted pending match
    pub fn propose(&mut self, pairing: &Pairing, now: DateTime<Utc>) -> Result<MatchProposed> {
        let [first, second] = &pairing.players;
        if first.player_id == second.player_id {
            return Err(LadderError::ConsistencyViolation {
                message: format!("Player {} was paired with themselves", first.player_id),
            }
            .into());
        }
        for player_id in [&first.player_id, &second.player_id] {
            if self.has_active_match(player_id) {
                return Err(LadderError::ConsistencyViolation {
                    message: format!("Player {} was paired while in a pending match", player_id),
                }
                .into());
            }
        }

        let goal = self.ranks.match_goal(&first.rating, &second.rating);
        let pending = PendingMatch::new(
            generate_match_id(),
            pairing.platform.clone(),
            [first.player_id.clone(), second.player_id.clone()],
            goal,
            now,
        );
        self.storage.store_pending_match(pending.to_record())?;

        info!(
            "Proposed match {} on {}: {} ({}) vs {} ({}), first to {}",
            pending.match_id,
            pending.platform,
            first.player_id,
            first.rating,
            second.player_id,
            second.rating,
            goal
        );

        let event = MatchProposed {
            match_id: pending.match_id,
            platform: pending.platform.clone(),
            players: pending.players.clone(),
            goal,
            expires_at: now + self.lifetime,
            timestamp: now,
        };
        self.insert(pending);
        Ok(event)
    }

    /// Record that a player is present for their match
    pub fn acknowledge(&mut self, player_id: &PlayerId) -> Result<bool> {
        let (mut updated, side) = self.match_for(player_id)?;
        if !updated.acknowledge(side) {
            return Ok(false);
        }
        self.store(updated)?;
        debug!("Player {} acknowledged their match", player_id);
        Ok(true)
    }

    /// Apply a score report given from the reporter's point of view
    pub fn report_score(
        &mut self,
        player_id: &PlayerId,
        own_score: u32,
        opponent_score: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<LadderEvent>> {
        let (mut updated, side) = self.match_for(player_id)?;
        let scores = match side {
            Side::First => [own_score, opponent_score],
            Side::Second => [opponent_score, own_score],
        };
        let previous_since = updated.confirming_since;
        let outcome = updated.report(side, scores, now)?;
        let match_id = updated.match_id;

        match outcome {
            ReportOutcome::Unchanged => {
                debug!("Player {} repeated their report for {}", player_id, match_id);
                Ok(Vec::new())
            }
            ReportOutcome::Agreed => {
                info!(
                    "Both sides of match {} reported {}-{}",
                    match_id, scores[0], scores[1]
                );
                self.store(updated)?;
                self.complete_match(&match_id, now)
            }
            ReportOutcome::Started | ReportOutcome::Restarted => {
                let since = updated.confirming_since;
                let event = ScoreReported {
                    match_id,
                    players: updated.players.clone(),
                    reported_by: player_id.clone(),
                    scores,
                    confirm_by: since.unwrap_or(now) + self.confirmation_window,
                    timestamp: now,
                };
                self.store(updated)?;
                if let Some(since) = since.filter(|since| Some(*since) != previous_since) {
                    self.awaiting_confirmation.push_back((since, match_id));
                }

                if outcome == ReportOutcome::Restarted {
                    info!(
                        "Player {} disputed the score of {}: now {}-{}, confirmation restarted",
                        player_id, match_id, scores[0], scores[1]
                    );
                } else {
                    info!(
                        "Player {} reported {}-{} for {}",
                        player_id, scores[0], scores[1], match_id
                    );
                }
                Ok(vec![LadderEvent::ScoreReported(event)])
            }
        }
    }

    /// Accept the opponent's reported score
    pub fn confirm(&mut self, player_id: &PlayerId, now: DateTime<Utc>) -> Result<Vec<LadderEvent>> {
        let (mut updated, side) = self.match_for(player_id)?;
        let match_id = updated.match_id;
        let both = updated.confirm(side)?;

        if Some(&updated) == self.matches.get(&match_id) {
            return Ok(Vec::new());
        }
        self.store(updated)?;
        if both {
            info!("Player {} confirmed the score of {}", player_id, match_id);
            return self.complete_match(&match_id, now);
        }
        Ok(Vec::new())
    }

    /// Ask to call off a match that has no score yet
    pub fn request_cancel(
        &mut self,
        player_id: &PlayerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<LadderEvent>> {
        let (mut updated, side) = self.match_for(player_id)?;
        let match_id = updated.match_id;

        match updated.request_cancel(side)? {
            CancelOutcome::Unchanged => Ok(Vec::new()),
            CancelOutcome::Requested => {
                self.store(updated)?;
                info!("Player {} asked to cancel match {}", player_id, match_id);
                Ok(vec![LadderEvent::CancelRequested(CancelRequested {
                    match_id,
                    requested_by: player_id.clone(),
                    timestamp: now,
                })])
            }
            CancelOutcome::Cancelled => {
                self.delete_row(&match_id)?;
                self.forget(&match_id);
                info!("Match {} cancelled by both players", match_id);
                Ok(vec![LadderEvent::MatchCancelled(MatchCancelled {
                    match_id,
                    players: updated.players,
                    timestamp: now,
                })])
            }
        }
    }

    /// Delete a pending row that must exist
    fn delete_row(&self, match_id: &MatchId) -> Result<()> {
        match self.storage.delete_pending_match(match_id) {
            Ok(true) => Ok(()),
            Ok(false) => Err(LadderError::ConsistencyViolation {
                message: format!("Pending match {} has no stored row", match_id),
            }
            .into()),
            Err(e) => {
                error!("Failed to delete pending match {}: {:#}", match_id, e);
                Err(e)
            }
        }
    }

    fn rank_events(&self, changes: &[RatingChange], now: DateTime<Utc>) -> Vec<LadderEvent> {
        changes
            .iter()
            .filter_map(|change| {
                self.ranks
                    .rank_change(&change.player_id, &change.old_rating, &change.new_rating, now)
            })
            .map(LadderEvent::RankChanged)
            .collect()
    }

    /// Write the match record and new ratings, retiring the pending match
    fn commit(
        &mut self,
        pending: &PendingMatch,
        resolution: MatchResolution,
        before: [Rating; 2],
        after: [Rating; 2],
        counts_as_match: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<RatingChange>> {
        let changes: Vec<RatingChange> = [Side::First, Side::Second]
            .into_iter()
            .filter(|side| counts_as_match || before[side.index()] != after[side.index()])
            .map(|side| RatingChange {
                player_id: pending.player(side).clone(),
                old_rating: before[side.index()],
                new_rating: after[side.index()],
            })
            .collect();
        let players = self.registry.rated_records(&changes, counts_as_match, now)?;

        let record = MatchRecord {
            match_id: pending.match_id,
            platform: pending.platform.clone(),
            player1: pending.players[0].clone(),
            player2: pending.players[1].clone(),
            score1: pending.scores.map(|scores| scores[0]),
            score2: pending.scores.map(|scores| scores[1]),
            resolution,
            player1_before: before[0],
            player1_after: after[0],
            player2_before: before[1],
            player2_after: after[1],
            proposed_at: pending.proposed_at,
            completed_at: now,
        };

        if let Err(e) = self.storage.commit_match(record, players) {
            error!(
                "Failed to record match {} and retire its pending row: {:#}",
                pending.match_id, e
            );
            return Err(e);
        }
        self.forget(&pending.match_id);
        Ok(changes)
    }

    fn current_ratings(&self, pending: &PendingMatch) -> Result<[Rating; 2]> {
        Ok([
            self.registry.require_existing(&pending.players[0])?.rating,
            self.registry.require_existing(&pending.players[1])?.rating,
        ])
    }

    /// Finalize a match from its stored scores
    pub fn complete_match(
        &mut self,
        match_id: &MatchId,
        now: DateTime<Utc>,
    ) -> Result<Vec<LadderEvent>> {
        let pending = self.matches.get(match_id).cloned().ok_or_else(|| {
            LadderError::ConsistencyViolation {
                message: format!("Pending match {} is not tracked", match_id),
            }
        })?;
        let (Some(scores), Some(winner)) = (pending.scores, pending.winner()) else {
            return Err(LadderError::ConsistencyViolation {
                message: format!("Pending match {} has no decisive score", match_id),
            }
            .into());
        };
        let loser = winner.other();

        let before = self.current_ratings(&pending)?;
        let (new_winner, new_loser) =
            self.compute_outcome(&before[winner.index()], &before[loser.index()])?;
        let mut after = before;
        after[winner.index()] = new_winner;
        after[loser.index()] = new_loser;

        let changes = self.commit(&pending, MatchResolution::Played, before, after, true, now)?;

        info!(
            "Match {} completed {}-{}: {} {} -> {}, {} {} -> {}",
            match_id,
            scores[0],
            scores[1],
            pending.players[0],
            before[0],
            after[0],
            pending.players[1],
            before[1],
            after[1]
        );

        let mut events = self.rank_events(&changes, now);
        events.insert(
            0,
            LadderEvent::MatchCompleted(MatchCompleted {
                match_id: *match_id,
                platform: pending.platform.clone(),
                players: pending.players.clone(),
                scores,
                winner: pending.player(winner).clone(),
                rating_changes: changes,
                timestamp: now,
            }),
        );
        Ok(events)
    }

    /// Resolve a match nobody reported a score for
    fn time_out(&mut self, match_id: &MatchId, now: DateTime<Utc>) -> Result<Vec<LadderEvent>> {
        let pending = self.matches.get(match_id).cloned().ok_or_else(|| {
            LadderError::ConsistencyViolation {
                message: format!("Pending match {} is not tracked", match_id),
            }
        })?;
        let acknowledged = pending.acknowledged_sides();

        let changes = match acknowledged.as_slice() {
            [_, _] => {
                self.delete_row(match_id)?;
                self.forget(match_id);
                info!("Match {} expired with both players present, no penalty", match_id);
                Vec::new()
            }
            [present] => {
                let absent = present.other();
                let before = self.current_ratings(&pending)?;
                let (_, penalized) =
                    self.compute_outcome(&before[present.index()], &before[absent.index()])?;
                let mut after = before;
                after[absent.index()] = penalized;

                info!(
                    "Match {} expired, {} did not show up: {} -> {}",
                    match_id,
                    pending.player(absent),
                    before[absent.index()],
                    penalized
                );
                self.commit(
                    &pending,
                    MatchResolution::NoShow { absent },
                    before,
                    after,
                    false,
                    now,
                )?
            }
            _ => {
                let before = self.current_ratings(&pending)?;
                let (_, first_penalized) = self.compute_outcome(&before[1], &before[0])?;
                let (_, second_penalized) = self.compute_outcome(&before[0], &before[1])?;
                let after = [first_penalized, second_penalized];

                info!(
                    "Match {} expired with neither player present, both take a loss",
                    match_id
                );
                self.commit(
                    &pending,
                    MatchResolution::DoubleNoShow,
                    before,
                    after,
                    false,
                    now,
                )?
            }
        };

        let mut events = self.rank_events(&changes, now);
        events.insert(
            0,
            LadderEvent::MatchTimedOut(MatchTimedOut {
                match_id: *match_id,
                players: pending.players.clone(),
                acknowledged: acknowledged
                    .iter()
                    .map(|side| pending.player(*side).clone())
                    .collect(),
                rating_changes: changes,
                timestamp: now,
            }),
        );
        Ok(events)
    }

    /// Whether a queue entry still describes the match's current state
    fn still_due(&self, expiry: Expiry, at: DateTime<Utc>, match_id: &MatchId) -> bool {
        let Some(pending) = self.matches.get(match_id) else {
            return false;
        };
        match expiry {
            Expiry::Unreported => pending.scores.is_none() && at == pending.proposed_at,
            Expiry::Unconfirmed => {
                pending.scores.is_some() && Some(at) == pending.confirming_since
            }
        }
    }

    fn drain_expired(
        queue: &mut VecDeque<(DateTime<Utc>, MatchId)>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Vec<(DateTime<Utc>, MatchId)> {
        let mut expired = Vec::new();
        while let Some(&(at, match_id)) = queue.front() {
            if now < at + ttl {
                break;
            }
            queue.pop_front();
            expired.push((at, match_id));
        }
        expired
    }

    /// Time out unreported matches and finalize unconfirmed reports
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut due: Vec<(Expiry, DateTime<Utc>, MatchId)> = Vec::new();

        // A retried entry is dropped once a newer report has restarted its window
        for (expiry, at, match_id) in std::mem::take(&mut self.retry) {
            if self.still_due(expiry, at, &match_id) {
                due.push((expiry, at, match_id));
            }
        }
        for (at, match_id) in Self::drain_expired(&mut self.awaiting_report, self.lifetime, now) {
            if self.still_due(Expiry::Unreported, at, &match_id) {
                due.push((Expiry::Unreported, at, match_id));
            }
        }
        for (at, match_id) in
            Self::drain_expired(&mut self.awaiting_confirmation, self.confirmation_window, now)
        {
            if self.still_due(Expiry::Unconfirmed, at, &match_id) {
                due.push((Expiry::Unconfirmed, at, match_id));
            }
        }

        let mut report = SweepReport::default();
        for (expiry, at, match_id) in due {
            let result = match expiry {
                Expiry::Unreported => self.time_out(&match_id, now),
                Expiry::Unconfirmed => {
                    info!(
                        "Confirmation window of match {} ran out, using the last report",
                        match_id
                    );
                    self.complete_match(&match_id, now)
                }
            };
            match result {
                Ok(events) => {
                    match expiry {
                        Expiry::Unreported => report.timed_out += 1,
                        Expiry::Unconfirmed => report.finalized += 1,
                    }
                    report.events.extend(events);
                }
                Err(e) => {
                    error!("Failed to resolve expired match {}: {:#}", match_id, e);
                    self.retry.push((expiry, at, match_id));
                    report.failures.push((match_id, e));
                }
            }
        }

        if report.timed_out + report.finalized > 0 {
            info!(
                "Expiry sweep: {} timed out, {} finalized, {} still pending",
                report.timed_out,
                report.finalized,
                self.matches.len()
            );
        }
        report
    }
}
