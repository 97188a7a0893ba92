//! SQLite persistence for the score ledger.
//!
//! One connection behind a mutex: statements serialize, which is what gives
//! `record_result` its no-lost-updates guarantee for concurrent increments
//! of the same `(player, week)` row. Async callers go through
//! `spawn_blocking` wrappers so the scheduler's control flow never blocks a
//! runtime worker on database I/O.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{LedgerError, PlayerWeekScore, SyncState};
use crate::schedule::TournamentWeek;

/// Ledger schema, applied on open.
const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS player_week_scores (
        player TEXT NOT NULL,
        week INTEGER NOT NULL,
        off_chain_score INTEGER NOT NULL,
        last_synced_score INTEGER,
        last_sync_attempt_at INTEGER,
        sync_state TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (player, week)
    );

    CREATE INDEX IF NOT EXISTS idx_scores_week ON player_week_scores(week);

    CREATE TABLE IF NOT EXISTS tournament_weeks (
        week INTEGER PRIMARY KEY,
        registration_start INTEGER NOT NULL,
        registration_end INTEGER NOT NULL,
        point_collection_start INTEGER NOT NULL,
        point_collection_end INTEGER NOT NULL
    );
";

fn db_err(e: rusqlite::Error) -> LedgerError {
    LedgerError::Database(e.to_string())
}

fn to_secs(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

fn from_secs(secs: i64) -> Result<DateTime<Utc>, LedgerError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| LedgerError::Database(format!("timestamp out of range: {secs}")))
}

/// SQLite-backed score ledger.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ScoreLedger {
    conn: Arc<Mutex<Connection>>,
}

impl ScoreLedger {
    /// Opens (creating if needed) a ledger database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the database cannot be opened or
    /// the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory ledger for tests.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Records one finalized match result: atomically increments the
    /// player's off-chain total for the week, creating the row in `Pending`
    /// state on first result.
    ///
    /// Returns the new total.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidDelta`] for negative deltas or totals
    /// that would overflow, [`LedgerError::Database`] on storage faults.
    pub fn record_result(
        &self,
        player: &str,
        week: u64,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        if delta < 0 {
            return Err(LedgerError::InvalidDelta {
                delta,
                player: player.to_string(),
                week,
            });
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT off_chain_score FROM player_week_scores WHERE player = ?1 AND week = ?2",
                params![player, week],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let new_total = match existing {
            Some(current) => {
                let total = current.checked_add(delta).ok_or(LedgerError::InvalidDelta {
                    delta,
                    player: player.to_string(),
                    week,
                })?;
                tx.execute(
                    "UPDATE player_week_scores
                     SET off_chain_score = ?3, updated_at = ?4
                     WHERE player = ?1 AND week = ?2",
                    params![player, week, total, to_secs(now)],
                )
                .map_err(db_err)?;
                total
            },
            None => {
                tx.execute(
                    "INSERT INTO player_week_scores
                     (player, week, off_chain_score, sync_state, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![player, week, delta, SyncState::Pending.as_str(), to_secs(now)],
                )
                .map_err(db_err)?;
                delta
            },
        };

        tx.commit().map_err(db_err)?;

        #[allow(clippy::cast_sign_loss)] // delta >= 0 and existing totals are non-negative
        Ok(new_total as u64)
    }

    /// Point-in-time read of all players' totals for a week.
    ///
    /// Reflects every `record_result` that completed before this call
    /// started; results arriving concurrently are picked up by the next
    /// reconciliation pass.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage faults.
    #[allow(clippy::cast_sign_loss)] // totals are written non-negative
    pub fn snapshot(&self, week: u64) -> Result<BTreeMap<String, u64>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT player, off_chain_score FROM player_week_scores WHERE week = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![week], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(db_err)?;

        let mut totals = BTreeMap::new();
        for row in rows {
            let (player, score) = row.map_err(db_err)?;
            totals.insert(player, score);
        }
        Ok(totals)
    }

    /// Updates sync bookkeeping for one row. Never touches
    /// `off_chain_score` and never creates rows. Passing `None` for
    /// `synced_score` keeps the previously confirmed value, so marking a row
    /// `Failed` does not erase what is known to be on-chain.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::MissingRow`] if the row does not exist,
    /// [`LedgerError::Database`] on storage faults.
    pub fn mark_sync_state(
        &self,
        player: &str,
        week: u64,
        state: SyncState,
        synced_score: Option<u64>,
        attempt_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE player_week_scores
                 SET sync_state = ?3,
                     last_synced_score = COALESCE(?4, last_synced_score),
                     last_sync_attempt_at = ?5,
                     updated_at = ?5
                 WHERE player = ?1 AND week = ?2",
                params![
                    player,
                    week,
                    state.as_str(),
                    synced_score.map(|s| s as i64),
                    to_secs(attempt_at)
                ],
            )
            .map_err(db_err)?;

        if updated == 0 {
            return Err(LedgerError::MissingRow {
                player: player.to_string(),
                week,
            });
        }
        Ok(())
    }

    /// Full per-player rows for a week, for the diagnostic surface.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage faults.
    #[allow(clippy::cast_sign_loss)] // scores are written non-negative
    pub fn week_rows(&self, week: u64) -> Result<Vec<PlayerWeekScore>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT player, off_chain_score, last_synced_score, last_sync_attempt_at, sync_state
                 FROM player_week_scores WHERE week = ?1 ORDER BY player",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![week], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (player, score, synced, attempt, state) = row.map_err(db_err)?;
            let sync_state = SyncState::parse(&state)
                .ok_or_else(|| LedgerError::Database(format!("corrupt sync_state: {state}")))?;
            out.push(PlayerWeekScore {
                player,
                week,
                off_chain_score: score as u64,
                last_synced_score: synced.map(|s| s as u64),
                last_sync_attempt_at: attempt.map(from_secs).transpose()?,
                sync_state,
            });
        }
        Ok(out)
    }

    /// Persists a week's boundaries. Weeks are immutable: re-inserting an
    /// existing week is a no-op, so re-running the generator is always safe.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage faults.
    pub fn put_week(&self, week: &TournamentWeek) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO tournament_weeks
             (week, registration_start, registration_end, point_collection_start, point_collection_end)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                week.week,
                to_secs(week.registration_start),
                to_secs(week.registration_end),
                to_secs(week.point_collection_start),
                to_secs(week.point_collection_end)
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Reads a week's boundaries, `None` if never generated.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on storage faults.
    pub fn get_week(&self, week: u64) -> Result<Option<TournamentWeek>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(i64, i64, i64, i64)> = conn
            .query_row(
                "SELECT registration_start, registration_end, point_collection_start,
                        point_collection_end
                 FROM tournament_weeks WHERE week = ?1",
                params![week],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                },
            )
            .optional()
            .map_err(db_err)?;

        match row {
            Some((rs, re, cs, ce)) => {
                let week = TournamentWeek::new(
                    week,
                    from_secs(rs)?,
                    from_secs(re)?,
                    from_secs(cs)?,
                    from_secs(ce)?,
                )
                .map_err(|e| LedgerError::Database(format!("corrupt week row: {e}")))?;
                Ok(Some(week))
            },
            None => Ok(None),
        }
    }

    /// Async wrapper for [`Self::record_result`].
    ///
    /// # Errors
    ///
    /// See [`Self::record_result`].
    pub async fn record_result_async(
        &self,
        player: String,
        week: u64,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let ledger = self.clone();
        spawn(move || ledger.record_result(&player, week, delta, now)).await
    }

    /// Async wrapper for [`Self::snapshot`].
    ///
    /// # Errors
    ///
    /// See [`Self::snapshot`].
    pub async fn snapshot_async(&self, week: u64) -> Result<BTreeMap<String, u64>, LedgerError> {
        let ledger = self.clone();
        spawn(move || ledger.snapshot(week)).await
    }

    /// Async wrapper for [`Self::mark_sync_state`].
    ///
    /// # Errors
    ///
    /// See [`Self::mark_sync_state`].
    pub async fn mark_sync_state_async(
        &self,
        player: String,
        week: u64,
        state: SyncState,
        synced_score: Option<u64>,
        attempt_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let ledger = self.clone();
        spawn(move || ledger.mark_sync_state(&player, week, state, synced_score, attempt_at)).await
    }

    /// Async wrapper for [`Self::week_rows`].
    ///
    /// # Errors
    ///
    /// See [`Self::week_rows`].
    pub async fn week_rows_async(&self, week: u64) -> Result<Vec<PlayerWeekScore>, LedgerError> {
        let ledger = self.clone();
        spawn(move || ledger.week_rows(week)).await
    }

    /// Async wrapper for [`Self::get_week`].
    ///
    /// # Errors
    ///
    /// See [`Self::get_week`].
    pub async fn get_week_async(&self, week: u64) -> Result<Option<TournamentWeek>, LedgerError> {
        let ledger = self.clone();
        spawn(move || ledger.get_week(week)).await
    }
}

/// Runs a blocking ledger operation off the async runtime.
async fn spawn<T, F>(f: F) -> Result<T, LedgerError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LedgerError::Database(format!("spawn_blocking failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn first_result_creates_pending_row() {
        let ledger = ScoreLedger::in_memory().unwrap();
        let total = ledger.record_result("p1", 29, 50, ts(100)).unwrap();
        assert_eq!(total, 50);

        let rows = ledger.week_rows(29).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].player, "p1");
        assert_eq!(rows[0].off_chain_score, 50);
        assert_eq!(rows[0].sync_state, SyncState::Pending);
        assert_eq!(rows[0].last_synced_score, None);
    }

    #[test]
    fn increments_accumulate() {
        let ledger = ScoreLedger::in_memory().unwrap();
        ledger.record_result("p1", 29, 50, ts(100)).unwrap();
        ledger.record_result("p1", 29, 100, ts(101)).unwrap();
        ledger.record_result("p2", 29, 7, ts(102)).unwrap();
        ledger.record_result("p1", 30, 3, ts(103)).unwrap();

        let snap = ledger.snapshot(29).unwrap();
        assert_eq!(snap.get("p1"), Some(&150));
        assert_eq!(snap.get("p2"), Some(&7));
        assert_eq!(snap.len(), 2);
        assert_eq!(ledger.snapshot(30).unwrap().get("p1"), Some(&3));
    }

    #[test]
    fn negative_delta_rejected() {
        let ledger = ScoreLedger::in_memory().unwrap();
        let err = ledger.record_result("p1", 29, -1, ts(100)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidDelta { delta: -1, .. }));
        assert!(ledger.snapshot(29).unwrap().is_empty());
    }

    #[test]
    fn overflow_rejected() {
        let ledger = ScoreLedger::in_memory().unwrap();
        ledger.record_result("p1", 1, i64::MAX, ts(0)).unwrap();
        let err = ledger.record_result("p1", 1, 1, ts(1)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidDelta { .. }));
    }

    #[test]
    fn mark_sync_state_updates_bookkeeping_only() {
        let ledger = ScoreLedger::in_memory().unwrap();
        ledger.record_result("p1", 29, 150, ts(100)).unwrap();
        ledger
            .mark_sync_state("p1", 29, SyncState::Clean, Some(150), ts(200))
            .unwrap();

        let rows = ledger.week_rows(29).unwrap();
        assert_eq!(rows[0].off_chain_score, 150);
        assert_eq!(rows[0].sync_state, SyncState::Clean);
        assert_eq!(rows[0].last_synced_score, Some(150));
        assert_eq!(rows[0].last_sync_attempt_at, Some(ts(200)));
    }

    #[test]
    fn marking_failed_preserves_confirmed_score() {
        let ledger = ScoreLedger::in_memory().unwrap();
        ledger.record_result("p1", 29, 150, ts(100)).unwrap();
        ledger
            .mark_sync_state("p1", 29, SyncState::Clean, Some(150), ts(200))
            .unwrap();
        ledger
            .mark_sync_state("p1", 29, SyncState::Failed, None, ts(300))
            .unwrap();

        let rows = ledger.week_rows(29).unwrap();
        assert_eq!(rows[0].sync_state, SyncState::Failed);
        assert_eq!(rows[0].last_synced_score, Some(150));
        assert_eq!(rows[0].last_sync_attempt_at, Some(ts(300)));
    }

    #[test]
    fn mark_sync_state_never_creates_rows() {
        let ledger = ScoreLedger::in_memory().unwrap();
        let err = ledger
            .mark_sync_state("ghost", 29, SyncState::Clean, Some(1), ts(0))
            .unwrap_err();
        assert!(matches!(err, LedgerError::MissingRow { .. }));
        assert!(ledger.week_rows(29).unwrap().is_empty());
    }

    #[test]
    fn weeks_are_immutable_once_written() {
        let ledger = ScoreLedger::in_memory().unwrap();
        let week = TournamentWeek::new(5, ts(0), ts(10), ts(10), ts(100)).unwrap();
        ledger.put_week(&week).unwrap();

        // A different derivation for the same number is ignored.
        let other = TournamentWeek::new(5, ts(1), ts(11), ts(11), ts(101)).unwrap();
        ledger.put_week(&other).unwrap();

        assert_eq!(ledger.get_week(5).unwrap(), Some(week));
        assert_eq!(ledger.get_week(6).unwrap(), None);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");

        {
            let ledger = ScoreLedger::open(&path).unwrap();
            ledger.record_result("p1", 29, 150, ts(100)).unwrap();
        }

        let ledger = ScoreLedger::open(&path).unwrap();
        assert_eq!(ledger.snapshot(29).unwrap().get("p1"), Some(&150));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_increments_never_lose_updates() {
        let ledger = ScoreLedger::in_memory().unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                ledger
                    .record_result_async("p1".to_string(), 29, 5, ts(i))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(ledger.snapshot(29).unwrap().get("p1"), Some(&100));
    }

    proptest! {
        /// The final total equals the sum of all recorded deltas, whatever
        /// the interleaving of players and weeks.
        #[test]
        fn total_equals_sum_of_deltas(deltas in proptest::collection::vec(0i64..1000, 1..40)) {
            let ledger = ScoreLedger::in_memory().unwrap();
            for (i, delta) in deltas.iter().enumerate() {
                ledger.record_result("p1", 29, *delta, ts(i as i64)).unwrap();
            }
            let expected: i64 = deltas.iter().sum();
            let snap = ledger.snapshot(29).unwrap();
            prop_assert_eq!(snap.get("p1"), Some(&(expected as u64)));
        }
    }
}
