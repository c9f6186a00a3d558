//! Durable storage in a SQLite database
//!
//! Each table of the ladder store is a SQL table. Multi-row writes
//! (`commit_match`, `store_decay_page`) run inside one transaction.
//!
//! [`LadderStorage`] is synchronous while sqlx is async, so the connection
//! lives on a dedicated thread with its own current-thread runtime. Calls are
//! shipped to it as boxed operations and the caller blocks on the reply,
//! which also works from inside the service's tokio runtime.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{
    migrate, query, query_as,
    sqlite::{SqliteConnectOptions, SqliteConnection},
    ConnectOptions, Connection, FromRow,
};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::records::{
    DecaySweep, MatchRecord, PendingMatchRecord, PlayerRecord, RatingPeriodCheckpoint,
};
use super::LadderStorage;
use crate::error::{LadderError, Result};
use crate::types::{MatchId, PlayerId, Rating};

type BoxFuture<'c, T> = Pin<Box<dyn Future<Output = T> + Send + 'c>>;

type Job = Box<dyn for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, ()> + Send>;

fn job<F>(f: F) -> Job
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, ()> + Send + 'static,
{
    Box::new(f)
}

#[derive(Debug)]
pub struct SqliteStorage {
    path: Option<PathBuf>,
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SqliteStorage {
    /// Open the database at `path`, creating it and its directory if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::default()
            .filename(&path)
            .create_if_missing(true);
        let storage = Self::start(options, Some(path.clone()))?;
        info!(
            "Opened ladder database {}: {} players, {} matches",
            path.display(),
            storage.player_count()?,
            storage.match_count()?
        );
        Ok(storage)
    }

    /// A private in-memory database
    pub fn memory() -> Result<Self> {
        Self::start(SqliteConnectOptions::default(), None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn start(options: SqliteConnectOptions, path: Option<PathBuf>) -> Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let (ready, opened) = mpsc::sync_channel::<Result<()>>(1);

        let worker = thread::Builder::new()
            .name("ladder-sqlite".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready.send(Err(e.into()));
                        return;
                    }
                };
                let mut conn = match runtime.block_on(connect(options)) {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                };
                let _ = ready.send(Ok(()));

                while let Ok(job) = queue.recv() {
                    runtime.block_on(job(&mut conn));
                }
                if let Err(e) = runtime.block_on(conn.close()) {
                    warn!("Failed to close ladder database: {}", e);
                }
                debug!("Ladder database worker stopped");
            })
            .context("Failed to start the database thread")?;

        opened
            .recv()
            .context("Database thread exited while opening")??;

        Ok(Self {
            path,
            jobs: Some(jobs),
            worker: Some(worker),
        })
    }

    /// Run `op` on the database thread and wait for its result
    fn call<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, anyhow::Result<R>>
            + Send
            + 'static,
    {
        let (reply, response) = mpsc::sync_channel(1);
        let job = job(move |conn| {
            Box::pin(async move {
                let _ = reply.send(op(conn).await);
            })
        });

        let stopped = || LadderError::StorageFailure {
            message: "Database thread is not running".to_string(),
        };
        self.jobs
            .as_ref()
            .ok_or_else(stopped)?
            .send(job)
            .map_err(|_| stopped())?;
        let result = response.recv().map_err(|_| stopped())?;

        result.map_err(|e| {
            if e.is::<LadderError>() {
                e
            } else {
                LadderError::StorageFailure {
                    message: format!("{:#}", e),
                }
                .into()
            }
        })
    }
}

impl Drop for SqliteStorage {
    fn drop(&mut self) {
        // Closing the queue stops the worker once it drained
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Ladder database thread panicked");
            }
        }
    }
}

async fn connect(options: SqliteConnectOptions) -> anyhow::Result<SqliteConnection> {
    let mut conn = options.connect().await?;
    migrate!("db/migrations").run(&mut conn).await?;
    Ok(conn)
}

#[derive(FromRow)]
struct PlayerRow {
    player_id: String,
    mu: f64,
    phi: f64,
    sigma: f64,
    platforms: String,
    display_name: Option<String>,
    usernames: String,
    match_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PlayerRow> for PlayerRecord {
    type Error = anyhow::Error;

    fn try_from(row: PlayerRow) -> anyhow::Result<Self> {
        Ok(Self {
            rating: Rating::new(row.mu, row.phi, row.sigma),
            platforms: serde_json::from_str(&row.platforms)
                .with_context(|| format!("Bad platforms for player {}", row.player_id))?,
            usernames: serde_json::from_str(&row.usernames)
                .with_context(|| format!("Bad usernames for player {}", row.player_id))?,
            display_name: row.display_name,
            match_count: u64::try_from(row.match_count)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            player_id: row.player_id,
        })
    }
}

#[derive(FromRow)]
struct PendingMatchRow {
    match_id: String,
    platform: String,
    player1: String,
    player2: String,
    goal: u32,
    proposed_at: DateTime<Utc>,
    score1: Option<u32>,
    score2: Option<u32>,
    confirmations: u8,
    cancel_requests: u8,
    acknowledgements: u8,
    confirming_since: Option<DateTime<Utc>>,
}

impl TryFrom<PendingMatchRow> for PendingMatchRecord {
    type Error = anyhow::Error;

    fn try_from(row: PendingMatchRow) -> anyhow::Result<Self> {
        Ok(Self {
            match_id: row.match_id.parse()?,
            platform: row.platform,
            player1: row.player1,
            player2: row.player2,
            goal: row.goal,
            proposed_at: row.proposed_at,
            score1: row.score1,
            score2: row.score2,
            confirmations: row.confirmations,
            cancel_requests: row.cancel_requests,
            acknowledgements: row.acknowledgements,
            confirming_since: row.confirming_since,
        })
    }
}

#[derive(FromRow)]
struct CheckpointRow {
    period_start: DateTime<Utc>,
    period_length_seconds: i64,
    last_processed_period: i64,
    sweep_target_period: Option<i64>,
    sweep_periods: Option<i64>,
    sweep_after: Option<String>,
}

impl TryFrom<CheckpointRow> for RatingPeriodCheckpoint {
    type Error = anyhow::Error;

    fn try_from(row: CheckpointRow) -> anyhow::Result<Self> {
        let sweep = row
            .sweep_target_period
            .zip(row.sweep_periods)
            .map(|(target_period, periods)| DecaySweep {
                target_period,
                periods,
                after: row.sweep_after,
            });
        Ok(Self {
            period_start: row.period_start,
            period_length_seconds: u64::try_from(row.period_length_seconds)?,
            last_processed_period: row.last_processed_period,
            sweep,
        })
    }
}

const PLAYER_COLUMNS: &str = "player_id, mu, phi, sigma, platforms, display_name, usernames, \
                              match_count, created_at, updated_at";

async fn upsert_player(conn: &mut SqliteConnection, record: &PlayerRecord) -> anyhow::Result<()> {
    query(
        "INSERT OR REPLACE INTO players (player_id, mu, phi, sigma, platforms, display_name, \
         usernames, match_count, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(&record.player_id)
    .bind(record.rating.mu)
    .bind(record.rating.phi)
    .bind(record.rating.sigma)
    .bind(serde_json::to_string(&record.platforms)?)
    .bind(&record.display_name)
    .bind(serde_json::to_string(&record.usernames)?)
    .bind(i64::try_from(record.match_count)?)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_match(conn: &mut SqliteConnection, record: &MatchRecord) -> anyhow::Result<()> {
    let (exists,): (bool,) = query_as("SELECT EXISTS (SELECT 1 FROM matches WHERE match_id = $1)")
        .bind(record.match_id.to_string())
        .fetch_one(&mut *conn)
        .await?;
    if exists {
        return Err(LadderError::ConsistencyViolation {
            message: format!("Match {} was already recorded", record.match_id),
        }
        .into());
    }

    let ratings = [
        record.player1_before,
        record.player1_after,
        record.player2_before,
        record.player2_after,
    ];
    let mut insert = query(
        "INSERT INTO matches (match_id, platform, player1, player2, score1, score2, resolution, \
         player1_before_mu, player1_before_phi, player1_before_sigma, \
         player1_after_mu, player1_after_phi, player1_after_sigma, \
         player2_before_mu, player2_before_phi, player2_before_sigma, \
         player2_after_mu, player2_after_phi, player2_after_sigma, \
         proposed_at, completed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
         $18, $19, $20, $21)",
    )
    .bind(record.match_id.to_string())
    .bind(&record.platform)
    .bind(&record.player1)
    .bind(&record.player2)
    .bind(record.score1)
    .bind(record.score2)
    .bind(serde_json::to_string(&record.resolution)?);
    for rating in ratings {
        insert = insert.bind(rating.mu).bind(rating.phi).bind(rating.sigma);
    }
    insert
        .bind(record.proposed_at)
        .bind(record.completed_at)
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_checkpoint(
    conn: &mut SqliteConnection,
    checkpoint: &RatingPeriodCheckpoint,
) -> anyhow::Result<()> {
    let sweep = checkpoint.sweep.as_ref();
    query(
        "INSERT OR REPLACE INTO checkpoint (id, period_start, period_length_seconds, \
         last_processed_period, sweep_target_period, sweep_periods, sweep_after) \
         VALUES (0, $1, $2, $3, $4, $5, $6)",
    )
    .bind(checkpoint.period_start)
    .bind(i64::try_from(checkpoint.period_length_seconds)?)
    .bind(checkpoint.last_processed_period)
    .bind(sweep.map(|sweep| sweep.target_period))
    .bind(sweep.map(|sweep| sweep.periods))
    .bind(sweep.and_then(|sweep| sweep.after.clone()))
    .execute(conn)
    .await?;
    Ok(())
}

impl LadderStorage for SqliteStorage {
    fn get_player(&self, player_id: &PlayerId) -> Result<Option<PlayerRecord>> {
        let player_id = player_id.clone();
        self.call(move |conn| {
            Box::pin(async move {
                let row: Option<PlayerRow> = query_as(&format!(
                    "SELECT {PLAYER_COLUMNS} FROM players WHERE player_id = $1"
                ))
                .bind(player_id)
                .fetch_optional(conn)
                .await?;
                row.map(PlayerRecord::try_from).transpose()
            })
        })
    }

    fn store_player(&self, record: PlayerRecord) -> Result<()> {
        self.call(move |conn| Box::pin(async move { upsert_player(conn, &record).await }))
    }

    fn store_players(&self, records: Vec<PlayerRecord>) -> Result<()> {
        self.call(move |conn| {
            Box::pin(async move {
                let mut tx = conn.begin().await?;
                for record in &records {
                    upsert_player(tx.as_mut(), record).await?;
                }
                tx.commit().await?;
                Ok::<_, anyhow::Error>(())
            })
        })
    }

    fn players_page(&self, after: Option<&PlayerId>, limit: usize) -> Result<Vec<PlayerRecord>> {
        let after = after.cloned();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |conn| {
            Box::pin(async move {
                let rows: Vec<PlayerRow> = query_as(&format!(
                    "SELECT {PLAYER_COLUMNS} FROM players \
                     WHERE $1 IS NULL OR player_id > $1 \
                     ORDER BY player_id LIMIT $2"
                ))
                .bind(after)
                .bind(limit)
                .fetch_all(conn)
                .await?;
                rows.into_iter().map(PlayerRecord::try_from).collect()
            })
        })
    }

    fn player_count(&self) -> Result<usize> {
        self.call(|conn| {
            Box::pin(async move {
                let (count,): (i64,) = query_as("SELECT COUNT(*) FROM players")
                    .fetch_one(conn)
                    .await?;
                Ok::<_, anyhow::Error>(usize::try_from(count)?)
            })
        })
    }

    fn append_match(&self, record: MatchRecord) -> Result<()> {
        self.call(move |conn| Box::pin(async move { insert_match(conn, &record).await }))
    }

    fn match_exists(&self, match_id: &MatchId) -> Result<bool> {
        let match_id = match_id.to_string();
        self.call(move |conn| {
            Box::pin(async move {
                let (exists,): (bool,) =
                    query_as("SELECT EXISTS (SELECT 1 FROM matches WHERE match_id = $1)")
                        .bind(match_id)
                        .fetch_one(conn)
                        .await?;
                Ok::<_, anyhow::Error>(exists)
            })
        })
    }

    fn commit_match(&self, record: MatchRecord, players: Vec<PlayerRecord>) -> Result<()> {
        self.call(move |conn| {
            Box::pin(async move {
                let mut tx = conn.begin().await?;
                let deleted = query("DELETE FROM pending_matches WHERE match_id = $1")
                    .bind(record.match_id.to_string())
                    .execute(tx.as_mut())
                    .await?
                    .rows_affected();
                if deleted == 0 {
                    return Err(LadderError::ConsistencyViolation {
                        message: format!("Pending match {} has no stored row", record.match_id),
                    }
                    .into());
                }
                insert_match(tx.as_mut(), &record).await?;
                for player in &players {
                    upsert_player(tx.as_mut(), player).await?;
                }
                tx.commit().await?;

                debug!(match_id = %record.match_id, players = players.len(), "committed match");
                Ok::<_, anyhow::Error>(())
            })
        })
    }

    fn match_count(&self) -> Result<usize> {
        self.call(|conn| {
            Box::pin(async move {
                let (count,): (i64,) = query_as("SELECT COUNT(*) FROM matches")
                    .fetch_one(conn)
                    .await?;
                Ok::<_, anyhow::Error>(usize::try_from(count)?)
            })
        })
    }

    fn store_pending_match(&self, record: PendingMatchRecord) -> Result<()> {
        self.call(move |conn| {
            Box::pin(async move {
                query(
                    "INSERT OR REPLACE INTO pending_matches (match_id, platform, player1, player2, \
                     goal, proposed_at, score1, score2, confirmations, cancel_requests, \
                     acknowledgements, confirming_since) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                )
                .bind(record.match_id.to_string())
                .bind(&record.platform)
                .bind(&record.player1)
                .bind(&record.player2)
                .bind(record.goal)
                .bind(record.proposed_at)
                .bind(record.score1)
                .bind(record.score2)
                .bind(record.confirmations)
                .bind(record.cancel_requests)
                .bind(record.acknowledgements)
                .bind(record.confirming_since)
                .execute(conn)
                .await?;
                Ok::<_, anyhow::Error>(())
            })
        })
    }

    fn delete_pending_match(&self, match_id: &MatchId) -> Result<bool> {
        let match_id = match_id.to_string();
        self.call(move |conn| {
            Box::pin(async move {
                let deleted = query("DELETE FROM pending_matches WHERE match_id = $1")
                    .bind(match_id)
                    .execute(conn)
                    .await?
                    .rows_affected();
                Ok::<_, anyhow::Error>(deleted > 0)
            })
        })
    }

    fn pending_matches(&self) -> Result<Vec<PendingMatchRecord>> {
        self.call(|conn| {
            Box::pin(async move {
                let rows: Vec<PendingMatchRow> = query_as(
                    "SELECT match_id, platform, player1, player2, goal, proposed_at, score1, \
                     score2, confirmations, cancel_requests, acknowledgements, confirming_since \
                     FROM pending_matches ORDER BY proposed_at, match_id",
                )
                .fetch_all(conn)
                .await?;
                rows.into_iter().map(PendingMatchRecord::try_from).collect()
            })
        })
    }

    fn load_checkpoint(&self) -> Result<Option<RatingPeriodCheckpoint>> {
        self.call(|conn| {
            Box::pin(async move {
                let row: Option<CheckpointRow> = query_as(
                    "SELECT period_start, period_length_seconds, last_processed_period, \
                     sweep_target_period, sweep_periods, sweep_after \
                     FROM checkpoint WHERE id = 0",
                )
                .fetch_optional(conn)
                .await?;
                row.map(RatingPeriodCheckpoint::try_from).transpose()
            })
        })
    }

    fn store_checkpoint(&self, checkpoint: RatingPeriodCheckpoint) -> Result<()> {
        self.call(move |conn| Box::pin(async move { upsert_checkpoint(conn, &checkpoint).await }))
    }

    fn store_decay_page(
        &self,
        players: Vec<PlayerRecord>,
        checkpoint: RatingPeriodCheckpoint,
    ) -> Result<()> {
        self.call(move |conn| {
            Box::pin(async move {
                let mut tx = conn.begin().await?;
                for player in &players {
                    upsert_player(tx.as_mut(), player).await?;
                }
                upsert_checkpoint(tx.as_mut(), &checkpoint).await?;
                tx.commit().await?;
                Ok::<_, anyhow::Error>(())
            })
        })
    }
}
