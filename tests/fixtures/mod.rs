//! Test fixtures and mock implementations for integration testing

use chrono::{DateTime, Duration, Utc};
use ranked_ladder::config::AppConfig;
use ranked_ladder::error::{LadderError, Result};
use ranked_ladder::rating::{MockRatingProvider, RatingProvider};
use ranked_ladder::scheduler::JobKind;
use ranked_ladder::storage::{
    InMemoryStorage, LadderStorage, MatchRecord, PendingMatchRecord, PlayerRecord,
    RatingPeriodCheckpoint,
};
use ranked_ladder::types::{MatchId, MatchProposed, PlayerId, Rating};
use ranked_ladder::{LadderCommand, LadderEvent, LadderService};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

mockall::mock! {
    pub Provider {}

    impl RatingProvider for Provider {
        fn compute_outcome(&self, winner: &Rating, loser: &Rating) -> Result<(Rating, Rating)>;
        fn initial_rating(&self) -> Rating;
    }
}

/// A provider whose every computation fails like a diverging Glicko-2 step
pub fn diverging_provider() -> MockProvider {
    let mut provider = MockProvider::new();
    provider.expect_initial_rating().return_const(Rating::default());
    provider.expect_compute_outcome().returning(|_, _| {
        Err(LadderError::RatingCalculationFailed {
            reason: "volatility iteration did not converge".to_string(),
        }
        .into())
    });
    provider
}

/// Storage that delegates to [`InMemoryStorage`] and fails writes on demand
#[derive(Debug, Default)]
pub struct FlakyStorage {
    inner: InMemoryStorage,
    fail_commits: AtomicBool,
    fail_pending_writes: AtomicBool,
    /// Decay pages still allowed to succeed; `None` never fails
    decay_page_budget: Mutex<Option<usize>>,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryStorage {
        &self.inner
    }

    /// Make `commit_match` fail until switched back
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make `store_pending_match` fail until switched back
    pub fn fail_pending_writes(&self, fail: bool) {
        self.fail_pending_writes.store(fail, Ordering::SeqCst);
    }

    /// Let `pages` more decay pages through, then fail the rest
    pub fn fail_decay_pages_after(&self, pages: Option<usize>) {
        *self.decay_page_budget.lock().unwrap() = pages;
    }

    fn check(flag: &AtomicBool, operation: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(LadderError::StorageFailure {
                message: format!("{} unavailable", operation),
            }
            .into());
        }
        Ok(())
    }
}

impl LadderStorage for FlakyStorage {
    fn get_player(&self, player_id: &PlayerId) -> Result<Option<PlayerRecord>> {
        self.inner.get_player(player_id)
    }

    fn store_player(&self, record: PlayerRecord) -> Result<()> {
        self.inner.store_player(record)
    }

    fn store_players(&self, records: Vec<PlayerRecord>) -> Result<()> {
        self.inner.store_players(records)
    }

    fn players_page(&self, after: Option<&PlayerId>, limit: usize) -> Result<Vec<PlayerRecord>> {
        self.inner.players_page(after, limit)
    }

    fn player_count(&self) -> Result<usize> {
        self.inner.player_count()
    }

    fn append_match(&self, record: MatchRecord) -> Result<()> {
        self.inner.append_match(record)
    }

    fn match_exists(&self, match_id: &MatchId) -> Result<bool> {
        self.inner.match_exists(match_id)
    }

    fn commit_match(&self, record: MatchRecord, players: Vec<PlayerRecord>) -> Result<()> {
        Self::check(&self.fail_commits, "commit_match")?;
        self.inner.commit_match(record, players)
    }

    fn match_count(&self) -> Result<usize> {
        self.inner.match_count()
    }

    fn store_pending_match(&self, record: PendingMatchRecord) -> Result<()> {
        Self::check(&self.fail_pending_writes, "store_pending_match")?;
        self.inner.store_pending_match(record)
    }

    fn delete_pending_match(&self, match_id: &MatchId) -> Result<bool> {
        self.inner.delete_pending_match(match_id)
    }

    fn pending_matches(&self) -> Result<Vec<PendingMatchRecord>> {
        self.inner.pending_matches()
    }

    fn load_checkpoint(&self) -> Result<Option<RatingPeriodCheckpoint>> {
        self.inner.load_checkpoint()
    }

    fn store_checkpoint(&self, checkpoint: RatingPeriodCheckpoint) -> Result<()> {
        self.inner.store_checkpoint(checkpoint)
    }

    fn store_decay_page(
        &self,
        players: Vec<PlayerRecord>,
        checkpoint: RatingPeriodCheckpoint,
    ) -> Result<()> {
        {
            let mut budget = self.decay_page_budget.lock().unwrap();
            match budget.as_mut() {
                Some(0) => {
                    return Err(LadderError::StorageFailure {
                        message: "store_decay_page unavailable".to_string(),
                    }
                    .into())
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }
        self.inner.store_decay_page(players, checkpoint)
    }
}

/// Fixed start of every scenario, so timeouts can be stepped through exactly
pub fn epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-04T12:00:00Z")
        .map(|time| time.with_timezone(&Utc))
        .unwrap()
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.pending.lifetime_seconds = 900;
    config.pending.confirmation_window_seconds = 180;
    config
}

pub fn ladder(storage: Arc<dyn LadderStorage>) -> LadderService {
    LadderService::new(
        &test_config(),
        storage,
        Arc::new(MockRatingProvider::new(20.0)),
    )
}

/// Run a command that is expected to succeed
pub fn command(
    service: &mut LadderService,
    command: LadderCommand,
    now: DateTime<Utc>,
) -> Vec<LadderEvent> {
    service.handle_command(command, now).unwrap()
}

pub fn register_and_join(
    service: &mut LadderService,
    players: &[&str],
    platform: &str,
    now: DateTime<Utc>,
) {
    for player in players {
        let registered = command(
            service,
            LadderCommand::Register {
                player_id: player.to_string(),
                platform: platform.to_string(),
            },
            now,
        );
        assert!(registered.is_empty(), "register rejected: {:?}", registered);

        let joined = command(
            service,
            LadderCommand::JoinQueue {
                player_id: player.to_string(),
                platform: platform.to_string(),
            },
            now,
        );
        assert!(joined.is_empty(), "join rejected: {:?}", joined);
    }
}

/// Register and queue two fresh players, then run one tick to pair them
pub fn propose_match(
    service: &mut LadderService,
    players: [&str; 2],
    now: DateTime<Utc>,
) -> MatchProposed {
    register_and_join(service, &players, "pc", now);
    let events = service.run_job(JobKind::MatchmakingTick, now).unwrap();
    events
        .into_iter()
        .find_map(|event| match event {
            LadderEvent::MatchProposed(proposed) => Some(proposed),
            _ => None,
        })
        .expect("the tick should pair two fresh players")
}

pub fn kinds(events: &[LadderEvent]) -> Vec<&'static str> {
    events.iter().map(LadderEvent::kind).collect()
}

pub fn minutes(count: i64) -> Duration {
    Duration::minutes(count)
}
