//! Integration tests for the ranked ladder service
//!
//! These tests drive the ladder the way the front end does, through
//! commands and timer jobs, and check what ends up in storage and on the
//! event stream:
//! - full match lifecycles (report and confirm, timeouts, cancellation)
//! - recovery from storage failures and restarts
//! - rating period decay
//! - the event loop, publisher and application wiring

mod fixtures;

use chrono::Duration;
use ranked_ladder::amqp::MockEventPublisher;
use ranked_ladder::error::is_fatal;
use ranked_ladder::scheduler::JobKind;
use ranked_ladder::service::{spawn_event_loop, spawn_publisher, AppState, HealthCheck, HealthStatus};
use ranked_ladder::storage::{InMemoryStorage, LadderStorage, PlayerRecord, SqliteStorage};
use ranked_ladder::types::{MatchResolution, Rating};
use ranked_ladder::{LadderCommand, LadderEvent, LadderService};
use std::sync::Arc;

use fixtures::{
    command, diverging_provider, epoch, kinds, ladder, minutes, propose_match,
    register_and_join, test_config, FlakyStorage,
};

fn report(player: &str, own_score: u32, opponent_score: u32) -> LadderCommand {
    LadderCommand::ReportScore {
        player_id: player.to_string(),
        own_score,
        opponent_score,
    }
}

#[test]
fn test_report_and_confirm_lifecycle() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut service = ladder(storage.clone());
    let start = epoch();

    let proposed = propose_match(&mut service, ["alice", "bob"], start);
    assert_eq!(proposed.goal, 11);
    assert_eq!(proposed.expires_at, start + minutes(15));
    assert_eq!(storage.pending_matches().unwrap().len(), 1);
    let [first, second] = proposed.players.clone();

    for player in [&first, &second] {
        command(
            &mut service,
            LadderCommand::Acknowledge {
                player_id: player.clone(),
            },
            start + minutes(1),
        );
    }

    let events = command(&mut service, report(&first, 11, 7), start + minutes(10));
    let LadderEvent::ScoreReported(reported) = &events[0] else {
        panic!("expected a score report, got {:?}", events);
    };
    assert_eq!(reported.scores, [11, 7]);
    assert_eq!(reported.confirm_by, start + minutes(13));
    assert_eq!(service.stats().confirming_matches, 1);

    let events = command(
        &mut service,
        LadderCommand::ConfirmScore {
            player_id: second.clone(),
        },
        start + minutes(11),
    );
    let LadderEvent::MatchCompleted(completed) = &events[0] else {
        panic!("expected completion, got {:?}", events);
    };
    assert_eq!(completed.winner, first);
    assert_eq!(completed.scores, [11, 7]);
    assert_eq!(completed.rating_changes.len(), 2);

    let tables = storage.snapshot().unwrap();
    assert!(tables.pending_matches.is_empty());
    let record = &tables.matches[&proposed.match_id];
    assert_eq!(record.resolution, MatchResolution::Played);
    assert_eq!(record.score1, Some(11));
    assert_eq!(tables.players[&first].rating.mu, 1520.0);
    assert_eq!(tables.players[&second].rating.mu, 1480.0);

    // Both players may queue again once the match is recorded
    for player in [&first, &second] {
        let events = command(
            &mut service,
            LadderCommand::JoinQueue {
                player_id: player.clone(),
                platform: "pc".to_string(),
            },
            start + minutes(12),
        );
        assert!(events.is_empty());
    }
    assert_eq!(service.stats().total_waiting, 2);
}

#[test]
fn test_disputed_score_restarts_confirmation() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut service = ladder(storage.clone());
    let start = epoch();
    let proposed = propose_match(&mut service, ["alice", "bob"], start);
    let [first, second] = proposed.players.clone();

    command(&mut service, report(&first, 11, 3), start + minutes(5));
    let events = command(&mut service, report(&second, 11, 9), start + minutes(6));
    let LadderEvent::ScoreReported(disputed) = &events[0] else {
        panic!("expected a restarted report, got {:?}", events);
    };
    assert_eq!(disputed.scores, [9, 11]);
    assert_eq!(disputed.confirm_by, start + minutes(9));

    // The first window has lapsed but was superseded by the dispute
    let events = service
        .run_job(JobKind::PendingSweep, start + minutes(8))
        .unwrap();
    assert!(events.is_empty());

    // The second window lapses with the latest report standing
    let events = service
        .run_job(JobKind::PendingSweep, start + minutes(9))
        .unwrap();
    let LadderEvent::MatchCompleted(completed) = &events[0] else {
        panic!("expected completion, got {:?}", events);
    };
    assert_eq!(completed.winner, second);
    assert_eq!(storage.match_count().unwrap(), 1);
}

#[test]
fn test_invalid_scores_are_rejected() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut service = ladder(storage);
    let proposed = propose_match(&mut service, ["alice", "bob"], epoch());
    let [first, _] = proposed.players.clone();

    for (own, opponent) in [(10, 7), (11, 11), (12, 3)] {
        let events = command(&mut service, report(&first, own, opponent), epoch());
        let LadderEvent::CommandRejected(rejected) = &events[0] else {
            panic!("expected {}-{} to be rejected, got {:?}", own, opponent, events);
        };
        assert_eq!(rejected.command, "report_score");
    }
    assert_eq!(service.stats().confirming_matches, 0);
}

#[test]
fn test_timeouts_penalize_absent_players() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut service = ladder(storage.clone());
    let start = epoch();

    let present = propose_match(&mut service, ["alice", "bob"], start);
    let absent = propose_match(&mut service, ["carol", "dave"], start);
    let [carol_or_dave, _] = absent.players.clone();
    command(
        &mut service,
        LadderCommand::Acknowledge {
            player_id: carol_or_dave.clone(),
        },
        start,
    );
    for player in &present.players {
        command(
            &mut service,
            LadderCommand::Acknowledge {
                player_id: player.clone(),
            },
            start,
        );
    }

    let early = service
        .run_job(JobKind::PendingSweep, start + minutes(14))
        .unwrap();
    assert!(early.is_empty());

    let events = service
        .run_job(JobKind::PendingSweep, start + minutes(15))
        .unwrap();
    let timed_out: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            LadderEvent::MatchTimedOut(timed_out) => Some(timed_out),
            _ => None,
        })
        .collect();
    assert_eq!(timed_out.len(), 2);

    let both_present = timed_out
        .iter()
        .find(|event| event.match_id == present.match_id)
        .unwrap();
    assert!(both_present.rating_changes.is_empty());
    assert_eq!(both_present.acknowledged.len(), 2);

    let no_show = timed_out
        .iter()
        .find(|event| event.match_id == absent.match_id)
        .unwrap();
    assert_eq!(no_show.acknowledged, vec![carol_or_dave.clone()]);
    assert_eq!(no_show.rating_changes.len(), 1);
    assert!(no_show.rating_changes[0].mu_delta() < 0.0);
    assert_ne!(no_show.rating_changes[0].player_id, carol_or_dave);

    let tables = storage.snapshot().unwrap();
    assert!(tables.pending_matches.is_empty());
    // Only the penalized match leaves a record
    assert_eq!(tables.matches.len(), 1);
    assert!(matches!(
        tables.matches[&absent.match_id].resolution,
        MatchResolution::NoShow { .. }
    ));
    assert_eq!(service.stats().matches_timed_out, 2);
}

#[test]
fn test_double_no_show_penalizes_both() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut service = ladder(storage.clone());
    let proposed = propose_match(&mut service, ["alice", "bob"], epoch());

    let events = service
        .run_job(JobKind::PendingSweep, epoch() + minutes(20))
        .unwrap();
    let LadderEvent::MatchTimedOut(timed_out) = &events[0] else {
        panic!("expected a timeout, got {:?}", events);
    };
    assert!(timed_out.acknowledged.is_empty());
    assert_eq!(timed_out.rating_changes.len(), 2);
    assert!(timed_out
        .rating_changes
        .iter()
        .all(|change| change.mu_delta() < 0.0));

    let tables = storage.snapshot().unwrap();
    assert_eq!(
        tables.matches[&proposed.match_id].resolution,
        MatchResolution::DoubleNoShow
    );
}

#[test]
fn test_mutual_cancel_discards_the_match() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut service = ladder(storage.clone());
    let proposed = propose_match(&mut service, ["alice", "bob"], epoch());
    let [first, second] = proposed.players.clone();

    let events = command(
        &mut service,
        LadderCommand::RequestCancel {
            player_id: first.clone(),
        },
        epoch(),
    );
    assert_eq!(kinds(&events), vec!["cancel_requested"]);

    let events = command(
        &mut service,
        LadderCommand::RequestCancel {
            player_id: second.clone(),
        },
        epoch(),
    );
    assert_eq!(kinds(&events), vec!["match_cancelled"]);

    assert!(storage.pending_matches().unwrap().is_empty());
    assert_eq!(storage.match_count().unwrap(), 0);
    assert!(!service.tracker().has_active_match(&first));

    // Nothing is left to time out
    let events = service
        .run_job(JobKind::PendingSweep, epoch() + minutes(30))
        .unwrap();
    assert!(events.is_empty());
}

#[test]
fn test_cancel_after_report_is_rejected() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut service = ladder(storage);
    let proposed = propose_match(&mut service, ["alice", "bob"], epoch());
    let [first, second] = proposed.players.clone();

    command(&mut service, report(&first, 11, 4), epoch());
    let events = command(
        &mut service,
        LadderCommand::RequestCancel {
            player_id: second,
        },
        epoch(),
    );
    assert_eq!(kinds(&events), vec!["command_rejected"]);
    assert_eq!(service.tracker().len(), 1);
}

#[test]
fn test_failed_proposal_returns_players_to_the_pool() {
    let storage = Arc::new(FlakyStorage::new());
    let mut service = ladder(storage.clone());
    register_and_join(&mut service, &["alice", "bob"], "pc", epoch());

    storage.fail_pending_writes(true);
    let events = service
        .run_job(JobKind::MatchmakingTick, epoch())
        .unwrap();
    assert!(events.is_empty());
    assert_eq!(service.stats().total_waiting, 2);
    assert_eq!(service.tracker().len(), 0);

    storage.fail_pending_writes(false);
    let events = service
        .run_job(JobKind::MatchmakingTick, epoch() + Duration::seconds(10))
        .unwrap();
    assert_eq!(
        kinds(&events),
        vec!["match_proposed", "queue_interest_cleared", "queue_interest_cleared"]
    );
}

#[test]
fn test_failed_commit_is_retried_by_the_sweep() {
    let storage = Arc::new(FlakyStorage::new());
    let mut service = ladder(storage.clone());
    let start = epoch();
    let proposed = propose_match(&mut service, ["alice", "bob"], start);
    let [first, second] = proposed.players.clone();

    command(&mut service, report(&first, 11, 6), start + minutes(2));

    storage.fail_commits(true);
    let result = service.handle_command(report(&second, 6, 11), start + minutes(3));
    let error = result.unwrap_err();
    assert!(!is_fatal(&error));
    assert_eq!(storage.inner().match_count().unwrap(), 0);
    assert_eq!(service.tracker().len(), 1);

    // Still failing when the confirmation window lapses
    let events = service
        .run_job(JobKind::PendingSweep, start + minutes(5))
        .unwrap();
    assert!(events.is_empty());
    assert_eq!(service.stats().unresolved_expiries, 1);

    storage.fail_commits(false);
    let events = service
        .run_job(JobKind::PendingSweep, start + minutes(6))
        .unwrap();
    let LadderEvent::MatchCompleted(completed) = &events[0] else {
        panic!("expected completion, got {:?}", events);
    };
    assert_eq!(completed.winner, first);
    assert_eq!(service.stats().unresolved_expiries, 0);
    assert_eq!(storage.inner().match_count().unwrap(), 1);
    assert!(storage.inner().pending_matches().unwrap().is_empty());
}

#[test]
fn test_dispute_after_failed_finalize_waits_for_new_window() {
    let storage = Arc::new(FlakyStorage::new());
    let mut service = ladder(storage.clone());
    let start = epoch();
    let proposed = propose_match(&mut service, ["alice", "bob"], start);
    let [first, second] = proposed.players.clone();

    command(&mut service, report(&first, 11, 6), start + minutes(2));

    storage.fail_commits(true);
    let events = service
        .run_job(JobKind::PendingSweep, start + minutes(5))
        .unwrap();
    assert!(events.is_empty());
    assert_eq!(service.stats().unresolved_expiries, 1);

    // The opponent disputes before storage recovers; the window restarts at 5m30s
    let disputed_at = start + minutes(5) + Duration::seconds(30);
    let events = command(&mut service, report(&second, 11, 8), disputed_at);
    assert_eq!(kinds(&events), vec!["score_reported"]);
    storage.fail_commits(false);

    let events = service
        .run_job(JobKind::PendingSweep, start + minutes(6))
        .unwrap();
    assert!(events.is_empty(), "finalized early: {:?}", events);
    assert_eq!(service.stats().unresolved_expiries, 0);
    assert_eq!(service.tracker().len(), 1);
    assert_eq!(storage.inner().match_count().unwrap(), 0);

    let events = service
        .run_job(JobKind::PendingSweep, disputed_at + minutes(3))
        .unwrap();
    let LadderEvent::MatchCompleted(completed) = &events[0] else {
        panic!("expected completion, got {:?}", events);
    };
    assert_eq!(completed.winner, second);
    assert_eq!(storage.inner().match_count().unwrap(), 1);
}

#[test]
fn test_rating_failure_is_fatal() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut service = LadderService::new(
        &test_config(),
        storage.clone(),
        Arc::new(diverging_provider()),
    );
    let proposed = propose_match(&mut service, ["alice", "bob"], epoch());
    let [first, second] = proposed.players.clone();

    command(&mut service, report(&first, 11, 0), epoch());
    let error = service
        .handle_command(report(&second, 0, 11), epoch())
        .unwrap_err();
    assert!(is_fatal(&error));
    assert_eq!(storage.match_count().unwrap(), 0);
    assert_eq!(storage.pending_matches().unwrap().len(), 1);
}

#[test]
fn test_restart_restores_pending_matches() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ladder.db");
    let start = epoch();

    let proposed = {
        let storage = Arc::new(SqliteStorage::open(&path).unwrap());
        let mut service = ladder(storage);
        let proposed = propose_match(&mut service, ["alice", "bob"], start);
        command(
            &mut service,
            report(&proposed.players[0], 11, 8),
            start + minutes(4),
        );
        proposed
    };

    let storage = Arc::new(SqliteStorage::open(&path).unwrap());
    let mut service = ladder(storage.clone());
    let events = service.startup(start + minutes(5)).unwrap();
    assert!(events.is_empty());
    assert_eq!(service.tracker().len(), 1);
    assert_eq!(service.stats().confirming_matches, 1);

    let events = command(
        &mut service,
        LadderCommand::JoinQueue {
            player_id: proposed.players[1].clone(),
            platform: "pc".to_string(),
        },
        start + minutes(5),
    );
    assert_eq!(kinds(&events), vec!["command_rejected"]);

    // The restored confirmation window still runs from the first report
    let events = service
        .run_job(JobKind::PendingSweep, start + minutes(7))
        .unwrap();
    assert_eq!(kinds(&events)[0], "match_completed");
    assert_eq!(storage.match_count().unwrap(), 1);
}

#[test]
fn test_startup_resolves_matches_that_expired_while_down() {
    let storage = Arc::new(InMemoryStorage::new());
    let start = epoch();
    {
        let mut service = ladder(storage.clone());
        propose_match(&mut service, ["alice", "bob"], start);
    }

    let mut service = ladder(storage.clone());
    let events = service.startup(start + Duration::hours(2)).unwrap();
    assert!(kinds(&events).contains(&"match_timed_out"));
    assert!(service.tracker().is_empty());
    assert!(storage.pending_matches().unwrap().is_empty());
}

#[test]
fn test_rating_periods_decay_certainty() {
    let storage = Arc::new(InMemoryStorage::new());
    let start = epoch();
    let mut config = test_config();
    config.rating_period.start = start;
    config.rating_period.length_seconds = 3600;

    let mut service = LadderService::new(
        &config,
        storage.clone(),
        Arc::new(ranked_ladder::rating::MockRatingProvider::new(20.0)),
    );
    let mut veteran = PlayerRecord::new("veteran".to_string(), Rating::new(1700.0, 60.0, 0.06), start);
    veteran.platforms.insert("pc".to_string());
    storage.store_player(veteran).unwrap();

    assert!(service
        .run_job(JobKind::RatingPeriod, start + minutes(30))
        .unwrap()
        .is_empty());

    let events = service
        .run_job(JobKind::RatingPeriod, start + Duration::hours(2) + minutes(30))
        .unwrap();
    let LadderEvent::RatingPeriodApplied(applied) = &events[0] else {
        panic!("expected decay, got {:?}", events);
    };
    assert_eq!(applied.period, 2);
    assert_eq!(applied.periods_elapsed, 2);
    assert_eq!(applied.players_updated, 1);

    let decayed = storage.get_player(&"veteran".to_string()).unwrap().unwrap();
    assert!(decayed.rating.phi > 60.0);
    assert_eq!(decayed.rating.mu, 1700.0);

    // The same period is never applied twice
    assert!(service
        .run_job(JobKind::RatingPeriod, start + Duration::hours(2) + minutes(50))
        .unwrap()
        .is_empty());
    assert_eq!(service.stats().rating_period, Some(2));
}

#[test]
fn test_failed_decay_page_is_not_decayed_twice() {
    let storage = Arc::new(FlakyStorage::new());
    let start = epoch();
    let mut config = test_config();
    config.rating_period.start = start;
    config.rating_period.length_seconds = 3600;
    config.rating_period.phi_increase_rate = 4.0;
    config.rating_period.batch_size = 2;

    let mut service = LadderService::new(
        &config,
        storage.clone(),
        Arc::new(ranked_ladder::rating::MockRatingProvider::new(20.0)),
    );
    for name in ["amy", "ben", "cat", "dan", "eve"] {
        let record = PlayerRecord::new(name.to_string(), Rating::new(1500.0, 50.0, 0.06), start);
        storage.store_player(record).unwrap();
    }
    service.run_job(JobKind::RatingPeriod, start).unwrap();

    // The first page is stored, the second fails
    storage.fail_decay_pages_after(Some(1));
    let events = service
        .run_job(JobKind::RatingPeriod, start + minutes(90))
        .unwrap();
    assert!(events.is_empty());
    let checkpoint = storage.load_checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.last_processed_period, 0);
    assert!(checkpoint.sweep.is_some());

    storage.fail_decay_pages_after(None);
    let events = service
        .run_job(JobKind::RatingPeriod, start + minutes(100))
        .unwrap();
    let LadderEvent::RatingPeriodApplied(applied) = &events[0] else {
        panic!("expected decay, got {:?}", events);
    };
    assert_eq!(applied.period, 1);
    assert_eq!(applied.periods_elapsed, 1);
    assert_eq!(applied.players_updated, 3);

    let once = 2504.0_f64.sqrt();
    for name in ["amy", "ben", "cat", "dan", "eve"] {
        let phi = storage.get_player(&name.to_string()).unwrap().unwrap().rating.phi;
        assert!((phi - once).abs() < 1e-9, "{} has phi {}", name, phi);
    }
    assert_eq!(storage.load_checkpoint().unwrap().unwrap().sweep, None);
}

#[tokio::test]
async fn test_event_loop_publishes_in_order() {
    let publisher = Arc::new(MockEventPublisher::new());
    let service = ladder(Arc::new(InMemoryStorage::new()));
    let runtime = spawn_event_loop(service, Vec::new(), 64);
    let publishing = spawn_publisher(runtime.events, publisher.clone());
    let handle = runtime.handle.clone();

    let registrations = ["alice", "bob"].map(|player| {
        let handle = handle.clone();
        async move {
            handle
                .execute(LadderCommand::Register {
                    player_id: player.to_string(),
                    platform: "pc".to_string(),
                })
                .await
        }
    });
    for result in futures::future::join_all(registrations).await {
        assert!(result.unwrap().is_empty());
    }

    for player in ["alice", "bob"] {
        handle
            .execute(LadderCommand::JoinQueue {
                player_id: player.to_string(),
                platform: "pc".to_string(),
            })
            .await
            .unwrap();
    }
    handle.run_job(JobKind::MatchmakingTick).await.unwrap();
    handle.shutdown().await.unwrap();

    runtime.task.await.unwrap().unwrap();
    publishing.await.unwrap();

    assert_eq!(
        publisher.published_routing_keys(),
        vec![
            "ladder.match.proposed",
            "ladder.queue.cleared",
            "ladder.queue.cleared"
        ]
    );
    let stats = runtime.stats.borrow().clone();
    assert_eq!(stats.matches_proposed, 1);
    assert_eq!(stats.pending_matches, 1);
}

#[tokio::test]
async fn test_fatal_failure_stops_the_event_loop() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut service = LadderService::new(
        &test_config(),
        storage,
        Arc::new(diverging_provider()),
    );
    let proposed = propose_match(&mut service, ["alice", "bob"], epoch());
    let [first, second] = proposed.players.clone();

    let runtime = spawn_event_loop(service, Vec::new(), 8);
    runtime.handle.execute(report(&first, 11, 1)).await.unwrap();

    let failed = runtime.handle.execute(report(&second, 1, 11)).await;
    assert!(failed.is_err());

    let outcome = runtime.task.await.unwrap();
    assert!(is_fatal(&outcome.unwrap_err()));
    assert!(runtime.handle.submit(report(&first, 11, 1)).await.is_err());
}

#[tokio::test]
async fn test_application_lifecycle() {
    let publisher = Arc::new(MockEventPublisher::new());
    let storage = Arc::new(InMemoryStorage::new());
    let mut config = test_config();
    config.service.health_port = 18932;

    let mut app = AppState::with_components(config, storage.clone(), publisher.clone()).unwrap();
    app.start().await.unwrap();
    let probe = app.probe().unwrap();
    let handle = app.handle().unwrap();

    for player in ["alice", "bob"] {
        handle
            .execute(LadderCommand::Register {
                player_id: player.to_string(),
                platform: "switch".to_string(),
            })
            .await
            .unwrap();
    }
    let events = handle
        .execute(LadderCommand::RequestLeaderboard {
            player_id: Some("alice".to_string()),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(kinds(&events), vec!["leaderboard"]);
    assert_eq!(
        HealthCheck::readiness_check(&probe).await,
        HealthStatus::Healthy
    );

    app.shutdown().await.unwrap();
    assert_eq!(storage.player_count().unwrap(), 2);
    assert!(publisher
        .published_routing_keys()
        .contains(&"ladder.leaderboard".to_string()));
    assert_eq!(
        HealthCheck::liveness_check(&probe).await,
        HealthStatus::Unhealthy
    );
}
