//! A proposed match and its state transitions
//!
//! `PendingMatch` is pure state: it validates and applies one side's action
//! and reports what happened. Persisting and retiring matches is the
//! tracker's job.

use chrono::{DateTime, Utc};

use crate::error::{LadderError, Result};
use crate::storage::PendingMatchRecord;
use crate::types::{MatchId, PlatformKey, PlayerId, Side, BOTH_SIDES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Waiting for the first score report
    Proposed,
    /// A score is reported and waiting for the other side
    Confirming,
}

/// Result of a score report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// First report: confirmation window opened
    Started,
    /// Different scores replaced the stored report and reopened the window
    Restarted,
    /// The other side reported the same scores; the match is complete
    Agreed,
    /// Same side repeated its own report
    Unchanged,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    /// Both sides asked; the match is cancelled
    Cancelled,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMatch {
    pub match_id: MatchId,
    pub platform: PlatformKey,
    pub players: [PlayerId; 2],
    /// First-to-N target the winning score must equal
    pub goal: u32,
    pub proposed_at: DateTime<Utc>,
    /// Scores in player order, once reported
    pub scores: Option<[u32; 2]>,
    pub confirmations: u8,
    pub cancel_requests: u8,
    pub acknowledgements: u8,
    pub confirming_since: Option<DateTime<Utc>>,
}

impl PendingMatch {
    pub fn new(
        match_id: MatchId,
        platform: PlatformKey,
        players: [PlayerId; 2],
        goal: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            match_id,
            platform,
            players,
            goal,
            proposed_at: now,
            scores: None,
            confirmations: 0,
            cancel_requests: 0,
            acknowledgements: 0,
            confirming_since: None,
        }
    }

    pub fn state(&self) -> PendingState {
        if self.scores.is_some() {
            PendingState::Confirming
        } else {
            PendingState::Proposed
        }
    }

    pub fn side_of(&self, player_id: &PlayerId) -> Option<Side> {
        if &self.players[0] == player_id {
            Some(Side::First)
        } else if &self.players[1] == player_id {
            Some(Side::Second)
        } else {
            None
        }
    }

    pub fn player(&self, side: Side) -> &PlayerId {
        &self.players[side.index()]
    }

    /// Side with the higher reported score
    pub fn winner(&self) -> Option<Side> {
        let [first, second] = self.scores?;
        match first.cmp(&second) {
            std::cmp::Ordering::Greater => Some(Side::First),
            std::cmp::Ordering::Less => Some(Side::Second),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// The higher score must equal the goal and the lower one must fall short
    pub fn validate_scores(&self, scores: [u32; 2]) -> Result<()> {
        let high = scores[0].max(scores[1]);
        let low = scores[0].min(scores[1]);
        if high != self.goal {
            return Err(LadderError::InvalidScore {
                reason: format!(
                    "the winning score must be {} in a first to {} match, got {}-{}",
                    self.goal, self.goal, scores[0], scores[1]
                ),
            }
            .into());
        }
        if low >= self.goal {
            return Err(LadderError::InvalidScore {
                reason: format!("scores cannot be tied, got {}-{}", scores[0], scores[1]),
            }
            .into());
        }
        Ok(())
    }

    /// Record `side`'s availability; returns whether anything changed
    pub fn acknowledge(&mut self, side: Side) -> bool {
        let before = self.acknowledgements;
        self.acknowledgements |= side.bit();
        before != self.acknowledgements
    }

    /// Apply a score report from `side`, scores in player order
    pub fn report(&mut self, side: Side, scores: [u32; 2], now: DateTime<Utc>) -> Result<ReportOutcome> {
        self.validate_scores(scores)?;
        // Reporting a score implies being available
        self.acknowledgements |= side.bit();

        match self.scores {
            None => {
                self.scores = Some(scores);
                self.confirming_since = Some(now);
                self.confirmations = side.bit();
                Ok(ReportOutcome::Started)
            }
            Some(stored) if stored == scores => {
                if self.confirmations & side.bit() != 0 {
                    return Ok(ReportOutcome::Unchanged);
                }
                self.confirmations |= side.bit();
                if self.confirmations == BOTH_SIDES {
                    Ok(ReportOutcome::Agreed)
                } else {
                    Ok(ReportOutcome::Started)
                }
            }
            Some(_) => {
                self.scores = Some(scores);
                self.confirming_since = Some(now);
                self.confirmations = side.bit();
                Ok(ReportOutcome::Restarted)
            }
        }
    }

    /// Accept the stored report on behalf of `side`; `true` once both agree
    pub fn confirm(&mut self, side: Side) -> Result<bool> {
        if self.scores.is_none() {
            return Err(LadderError::NotConfirming {
                match_id: self.match_id.to_string(),
            }
            .into());
        }
        self.acknowledgements |= side.bit();
        self.confirmations |= side.bit();
        Ok(self.confirmations == BOTH_SIDES)
    }

    /// Register `side`'s wish to cancel; only allowed before any report
    pub fn request_cancel(&mut self, side: Side) -> Result<CancelOutcome> {
        if self.scores.is_some() {
            return Err(LadderError::CancelNotAllowed {
                match_id: self.match_id.to_string(),
            }
            .into());
        }
        if self.cancel_requests & side.bit() != 0 {
            return Ok(CancelOutcome::Unchanged);
        }
        self.cancel_requests |= side.bit();
        if self.cancel_requests == BOTH_SIDES {
            Ok(CancelOutcome::Cancelled)
        } else {
            Ok(CancelOutcome::Requested)
        }
    }

    /// Sides that acknowledged availability
    pub fn acknowledged_sides(&self) -> Vec<Side> {
        [Side::First, Side::Second]
            .into_iter()
            .filter(|side| self.acknowledgements & side.bit() != 0)
            .collect()
    }

    pub fn to_record(&self) -> PendingMatchRecord {
        PendingMatchRecord {
            match_id: self.match_id,
            platform: self.platform.clone(),
            player1: self.players[0].clone(),
            player2: self.players[1].clone(),
            goal: self.goal,
            proposed_at: self.proposed_at,
            score1: self.scores.map(|scores| scores[0]),
            score2: self.scores.map(|scores| scores[1]),
            confirmations: self.confirmations,
            cancel_requests: self.cancel_requests,
            acknowledgements: self.acknowledgements,
            confirming_since: self.confirming_since,
        }
    }

    /// Rebuild from a stored row, rejecting rows that break invariants
    pub fn from_record(record: PendingMatchRecord) -> Result<Self> {
        let invalid = |reason: &str| -> anyhow::Error {
            LadderError::ConsistencyViolation {
                message: format!("Pending match row {} {}", record.match_id, reason),
            }
            .into()
        };

        if record.player1 == record.player2 {
            return Err(invalid("pairs a player with themselves"));
        }
        if record.confirmations > BOTH_SIDES
            || record.cancel_requests > BOTH_SIDES
            || record.acknowledgements > BOTH_SIDES
        {
            return Err(invalid("has an out of range side mask"));
        }
        let scores = match (record.score1, record.score2) {
            (Some(first), Some(second)) => Some([first, second]),
            (None, None) => None,
            _ => return Err(invalid("has only one score")),
        };
        if scores.is_some() != record.confirming_since.is_some() {
            return Err(invalid("has scores and confirmation start out of step"));
        }

        Ok(Self {
            match_id: record.match_id,
            platform: record.platform,
            players: [record.player1, record.player2],
            goal: record.goal,
            proposed_at: record.proposed_at,
            scores,
            confirmations: record.confirmations,
            cancel_requests: record.cancel_requests,
            acknowledgements: record.acknowledgements,
            confirming_since: record.confirming_since,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending(goal: u32) -> PendingMatch {
        PendingMatch::new(
            uuid::Uuid::new_v4(),
            "pc".to_string(),
            ["alice".to_string(), "bob".to_string()],
            goal,
            Utc::now(),
        )
    }

    #[test]
    fn test_score_validation() {
        let m = pending(7);
        assert!(m.validate_scores([7, 3]).is_ok());
        assert!(m.validate_scores([0, 7]).is_ok());
        assert!(m.validate_scores([6, 3]).is_err());
        assert!(m.validate_scores([8, 3]).is_err());
        assert!(m.validate_scores([7, 7]).is_err());
    }

    #[test]
    fn test_first_report_starts_confirmation() {
        let mut m = pending(5);
        let now = Utc::now();
        assert_eq!(m.report(Side::First, [5, 2], now).unwrap(), ReportOutcome::Started);
        assert_eq!(m.state(), PendingState::Confirming);
        assert_eq!(m.confirmations, Side::First.bit());
        assert_eq!(m.confirming_since, Some(now));
        assert_eq!(m.winner(), Some(Side::First));
    }

    #[test]
    fn test_matching_reports_agree_in_either_order() {
        for first in [Side::First, Side::Second] {
            let mut m = pending(5);
            let now = Utc::now();
            m.report(first, [3, 5], now).unwrap();
            assert_eq!(
                m.report(first, [3, 5], now).unwrap(),
                ReportOutcome::Unchanged
            );
            assert_eq!(
                m.report(first.other(), [3, 5], now).unwrap(),
                ReportOutcome::Agreed
            );
            assert_eq!(m.winner(), Some(Side::Second));
        }
    }

    #[test]
    fn test_mismatch_restarts_window() {
        let mut m = pending(9);
        let start = Utc::now();
        m.report(Side::First, [9, 4], start).unwrap();

        let later = start + Duration::seconds(30);
        assert_eq!(
            m.report(Side::Second, [4, 9], later).unwrap(),
            ReportOutcome::Restarted
        );
        assert_eq!(m.scores, Some([4, 9]));
        assert_eq!(m.confirmations, Side::Second.bit());
        assert_eq!(m.confirming_since, Some(later));

        // Now the first side accepts the corrected score
        assert_eq!(
            m.report(Side::First, [4, 9], later).unwrap(),
            ReportOutcome::Agreed
        );
    }

    #[test]
    fn test_invalid_report_changes_nothing() {
        let mut m = pending(5);
        assert!(m.report(Side::First, [4, 2], Utc::now()).is_err());
        assert_eq!(m.state(), PendingState::Proposed);
        assert_eq!(m.acknowledgements, 0);
    }

    #[test]
    fn test_confirm_requires_report() {
        let mut m = pending(5);
        assert!(m.confirm(Side::Second).is_err());
        m.report(Side::First, [5, 0], Utc::now()).unwrap();
        assert!(!m.confirm(Side::First).unwrap());
        assert!(m.confirm(Side::Second).unwrap());
    }

    #[test]
    fn test_cancel_needs_both_sides_before_report() {
        let mut m = pending(5);
        assert_eq!(m.request_cancel(Side::First).unwrap(), CancelOutcome::Requested);
        assert_eq!(m.request_cancel(Side::First).unwrap(), CancelOutcome::Unchanged);
        assert_eq!(m.request_cancel(Side::Second).unwrap(), CancelOutcome::Cancelled);

        let mut reported = pending(5);
        reported.report(Side::First, [5, 1], Utc::now()).unwrap();
        assert!(reported.request_cancel(Side::Second).is_err());
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let mut m = pending(5);
        assert!(m.acknowledge(Side::Second));
        assert!(!m.acknowledge(Side::Second));
        assert_eq!(m.acknowledged_sides(), vec![Side::Second]);
    }

    #[test]
    fn test_record_roundtrip_keeps_progress() {
        let mut m = pending(11);
        m.acknowledge(Side::Second);
        m.report(Side::First, [11, 6], Utc::now()).unwrap();

        let restored = PendingMatch::from_record(m.to_record()).unwrap();
        assert_eq!(restored, m);
        assert_eq!(restored.goal, 11);
        assert_eq!(restored.scores, Some([11, 6]));
    }

    #[test]
    fn test_inconsistent_rows_rejected() {
        let mut record = pending(5).to_record();
        record.score1 = Some(5);
        assert!(PendingMatch::from_record(record.clone()).is_err());

        record.score1 = None;
        record.player2 = record.player1.clone();
        assert!(PendingMatch::from_record(record).is_err());
    }
}
