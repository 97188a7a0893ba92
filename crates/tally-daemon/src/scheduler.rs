//! The reconciliation scheduler.
//!
//! One background loop drives automatic reconciliation; the diagnostic
//! surface drives manual resyncs. Both paths funnel into [`Scheduler::run_week`],
//! so there is exactly one code path from trigger to terminal outcome.
//!
//! Each tick the scheduler materializes upcoming weeks from the generator,
//! then reconciles the current and the immediately previous week while their
//! phase allows score collection. Older weeks stuck in partial failure stay
//! reachable through manual resync indefinitely.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tally_core::chain::ChainClient;
use tally_core::ledger::{ScoreLedger, SyncState};
use tally_core::schedule::{TimeSource, WeekSchedule};
use tally_core::sync::{run_pass, PassReport, SyncSettings};
use tracing::{debug, info, warn};

use crate::state::SharedState;

/// Scheduler wiring and tunables.
pub struct Scheduler {
    ledger: ScoreLedger,
    chain: Arc<dyn ChainClient>,
    settings: SyncSettings,
    schedule: WeekSchedule,
    state: SharedState,
    time: Arc<dyn TimeSource>,
    poll_interval: Duration,
    weeks_ahead: u64,
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    #[allow(clippy::too_many_arguments)] // constructor mirrors the config sections
    pub fn new(
        ledger: ScoreLedger,
        chain: Arc<dyn ChainClient>,
        settings: SyncSettings,
        schedule: WeekSchedule,
        state: SharedState,
        time: Arc<dyn TimeSource>,
        poll_interval: Duration,
        weeks_ahead: u64,
    ) -> Self {
        Self {
            ledger,
            chain,
            settings,
            schedule,
            state,
            time,
            poll_interval,
            weeks_ahead,
        }
    }

    /// Runs the timer loop until shutdown is requested.
    ///
    /// In-flight passes always reach a terminal state: the shutdown flag is
    /// only checked between ticks, never mid-pass.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "reconciliation scheduler started"
        );
        while !self.state.is_shutdown_requested() {
            self.tick().await;
            tokio::time::sleep(self.poll_interval).await;
        }
        info!("reconciliation scheduler stopped");
    }

    /// One scheduler tick: materialize upcoming weeks, then reconcile every
    /// candidate week whose phase collects points.
    ///
    /// The clock is read once per tick; every phase and candidate decision in
    /// the tick observes the same instant.
    pub async fn tick(&self) {
        let now = self.time.now();

        if let Err(e) = self.materialize_weeks(now).await {
            warn!(error = %e, "week materialization failed; will retry next tick");
        }

        let Some(current) = self.schedule.week_index_at(now) else {
            debug!("before genesis; nothing to reconcile");
            return;
        };

        // Current week plus the one before it: late results for a week that
        // just ended are the common straggler case.
        let mut candidates = vec![current];
        if current > 0 {
            candidates.push(current - 1);
        }

        for week in candidates {
            match self.week_needs_pass(week, now).await {
                Ok(true) => {
                    self.run_week_at(week, false, now).await;
                },
                Ok(false) => debug!(week, "week needs no reconciliation this tick"),
                Err(e) => warn!(week, error = %e, "failed to evaluate week; skipping tick"),
            }
        }
    }

    /// Runs one reconciliation pass for `week`, serialized per week.
    ///
    /// Timer triggers (`manual == false`) skip when a pass for the week is
    /// already in flight: the running pass counts as this tick's work.
    /// Manual triggers wait for the lock so the caller always gets a fresh
    /// report.
    pub async fn run_week(&self, week: u64, manual: bool) -> Option<PassReport> {
        self.run_week_at(week, manual, self.time.now()).await
    }

    async fn run_week_at(&self, week: u64, manual: bool, now: DateTime<Utc>) -> Option<PassReport> {
        let lock = self.state.week_lock(week).await;
        let guard = if manual {
            lock.lock().await
        } else {
            match lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(week, "pass already in flight; skipping timer trigger");
                    return None;
                },
            }
        };

        let report = run_pass(week, &self.ledger, self.chain.as_ref(), &self.settings, now).await;
        self.state.record_report(report.clone()).await;
        drop(guard);
        Some(report)
    }

    /// Ensures week rows exist for the current week and `weeks_ahead` beyond
    /// it. Re-running is a no-op for weeks already persisted.
    async fn materialize_weeks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(), tally_core::ledger::LedgerError> {
        let Some(current) = self.schedule.week_index_at(now) else {
            return Ok(());
        };
        for week in current..=current + self.weeks_ahead {
            match self.schedule.week(week) {
                Ok(w) => {
                    let ledger = self.ledger.clone();
                    let week_row = w.clone();
                    tokio::task::spawn_blocking(move || ledger.put_week(&week_row))
                        .await
                        .map_err(|e| {
                            tally_core::ledger::LedgerError::Database(format!(
                                "spawn_blocking failed: {e}"
                            ))
                        })??;
                },
                Err(e) => {
                    warn!(week, error = %e, "week derivation failed");
                },
            }
        }
        Ok(())
    }

    /// Whether a timer tick should run a pass for `week`.
    ///
    /// A week needs a pass while its phase collects points, unless it has
    /// already settled: ended, last pass synced, and every row's off-chain
    /// total matches its confirmed score. Settled weeks are immutable and
    /// skipping them keeps steady-state ticks free of chain reads.
    async fn week_needs_pass(
        &self,
        week: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, tally_core::ledger::LedgerError> {
        let Some(week_row) = self.ledger.get_week_async(week).await? else {
            return Ok(false);
        };
        let phase = week_row.phase_at(now);
        if !phase.is_syncable() {
            return Ok(false);
        }

        let last_synced = self
            .state
            .last_report(week)
            .await
            .is_some_and(|r| r.outcome.is_synced());
        if !last_synced {
            return Ok(true);
        }

        let rows = self.ledger.week_rows_async(week).await?;
        let settled = rows.iter().all(|row| {
            row.sync_state == SyncState::Clean && row.last_synced_score == Some(row.off_chain_score)
        });
        Ok(!settled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Utc};
    use tally_core::chain::MockChainClient;
    use tally_core::schedule::TimeSource;
    use tally_core::sync::{BackoffConfig, PassOutcome};

    use super::*;
    use crate::state::DaemonStateHandle;

    /// Fixed test clock.
    struct FixedTime(DateTime<Utc>);

    impl TimeSource for FixedTime {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    const WEEK_LEN: u64 = 1000;
    const REG_LEN: u64 = 100;

    fn scheduler_at(now: i64, chain: Arc<MockChainClient>) -> (Scheduler, ScoreLedger) {
        let ledger = ScoreLedger::in_memory().unwrap();
        let schedule = WeekSchedule::new(
            ts(0),
            Duration::from_secs(WEEK_LEN),
            Duration::from_secs(REG_LEN),
        )
        .unwrap();
        let settings = SyncSettings {
            backoff: BackoffConfig::Fixed {
                delay: Duration::from_millis(1),
            },
            ..SyncSettings::default()
        };
        let state = Arc::new(DaemonStateHandle::new(ts(now)));
        let scheduler = Scheduler::new(
            ledger.clone(),
            chain,
            settings,
            schedule,
            state,
            Arc::new(FixedTime(ts(now))),
            Duration::from_secs(60),
            2,
        );
        (scheduler, ledger)
    }

    #[tokio::test]
    async fn tick_materializes_weeks_ahead() {
        let chain = Arc::new(MockChainClient::new("0xabc"));
        // Middle of week 3's collection phase.
        let (scheduler, ledger) = scheduler_at(3_500, chain);

        scheduler.tick().await;

        for week in 3..=5 {
            assert!(ledger.get_week(week).unwrap().is_some(), "week {week}");
        }
        assert!(ledger.get_week(6).unwrap().is_none());
    }

    #[tokio::test]
    async fn tick_reconciles_current_and_previous_week() {
        let chain = Arc::new(MockChainClient::new("0xabc"));
        let (scheduler, ledger) = scheduler_at(3_500, Arc::clone(&chain));

        scheduler.tick().await; // materialize weeks 3..=5
        ledger.record_result("P", 3, 150, ts(3_400)).unwrap();
        // Week 2 ended but was never materialized while running; seed it.
        ledger
            .put_week(&scheduler.schedule.week(2).unwrap())
            .unwrap();
        ledger.record_result("Q", 2, 70, ts(2_900)).unwrap();

        scheduler.tick().await;

        assert_eq!(chain.score("P", 3), Some(150));
        assert_eq!(chain.score("Q", 2), Some(70));
        assert!(scheduler.state.last_report(3).await.unwrap().outcome.is_synced());
        assert!(scheduler.state.last_report(2).await.unwrap().outcome.is_synced());
    }

    #[tokio::test]
    async fn settled_weeks_are_skipped_on_later_ticks() {
        let chain = Arc::new(MockChainClient::new("0xabc"));
        let (scheduler, ledger) = scheduler_at(3_500, Arc::clone(&chain));

        scheduler.tick().await;
        ledger.record_result("P", 3, 150, ts(3_400)).unwrap();
        scheduler.tick().await;
        let calls_after_sync = chain.calls().len();

        // Nothing changed; the next tick issues no further chain calls for
        // the settled week.
        scheduler.tick().await;
        assert_eq!(chain.calls().len(), calls_after_sync);
    }

    #[tokio::test]
    async fn registration_phase_does_not_sync() {
        let chain = Arc::new(MockChainClient::new("0xabc"));
        // Inside week 3's registration window.
        let (scheduler, ledger) = scheduler_at(3_050, Arc::clone(&chain));

        scheduler.tick().await;
        ledger.record_result("P", 3, 10, ts(3_040)).unwrap();
        scheduler.tick().await;

        assert_eq!(chain.submit_count(), 0);
        assert_eq!(chain.score("P", 3), None);
    }

    #[tokio::test]
    async fn manual_resync_recovers_a_failed_week() {
        let chain = Arc::new(MockChainClient::new("0xabc"));
        let (scheduler, ledger) = scheduler_at(3_500, Arc::clone(&chain));

        scheduler.tick().await;
        ledger.record_result("P", 3, 150, ts(3_400)).unwrap();
        chain.revert_submits("IncorrectBidAmount");
        scheduler.tick().await;

        let report = scheduler.state.last_report(3).await.unwrap();
        assert!(matches!(report.outcome, PassOutcome::PartialFailure { .. }));

        chain.clear_revert();
        let report = scheduler.run_week(3, true).await.unwrap();
        assert!(report.outcome.is_synced());
        assert_eq!(chain.score("P", 3), Some(150));
    }

    #[tokio::test]
    async fn concurrent_manual_triggers_serialize() {
        let chain = Arc::new(MockChainClient::new("0xabc"));
        let (scheduler, ledger) = scheduler_at(3_500, Arc::clone(&chain));
        scheduler.tick().await;
        ledger.record_result("P", 3, 150, ts(3_400)).unwrap();

        let scheduler = Arc::new(scheduler);
        let a = tokio::spawn({
            let s = Arc::clone(&scheduler);
            async move { s.run_week(3, true).await }
        });
        let b = tokio::spawn({
            let s = Arc::clone(&scheduler);
            async move { s.run_week(3, true).await }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.unwrap().outcome.is_synced());
        assert!(b.unwrap().outcome.is_synced());
        // Serialized passes: the second saw agreement and wrote nothing, so
        // exactly one submit reached the chain.
        assert_eq!(chain.submit_count(), 1);
    }

    #[tokio::test]
    async fn before_genesis_ticks_are_inert() {
        let chain = Arc::new(MockChainClient::new("0xabc"));
        let ledger = ScoreLedger::in_memory().unwrap();
        let schedule = WeekSchedule::new(
            ts(10_000),
            Duration::from_secs(WEEK_LEN),
            Duration::from_secs(REG_LEN),
        )
        .unwrap();
        let state = Arc::new(DaemonStateHandle::new(ts(0)));
        let scheduler = Scheduler::new(
            ledger,
            Arc::clone(&chain) as Arc<dyn ChainClient>,
            SyncSettings::default(),
            schedule,
            state,
            Arc::new(FixedTime(ts(5))),
            Duration::from_secs(60),
            2,
        );

        scheduler.tick().await;
        assert!(chain.calls().is_empty());
    }

    /// Clock that counts how often it is sampled.
    struct CountingTime {
        now: DateTime<Utc>,
        reads: AtomicUsize,
    }

    impl TimeSource for CountingTime {
        fn now(&self) -> DateTime<Utc> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.now
        }
    }

    #[tokio::test]
    async fn tick_reads_the_clock_exactly_once() {
        let chain = Arc::new(MockChainClient::new("0xabc"));
        let ledger = ScoreLedger::in_memory().unwrap();
        let schedule = WeekSchedule::new(
            ts(0),
            Duration::from_secs(WEEK_LEN),
            Duration::from_secs(REG_LEN),
        )
        .unwrap();
        let state = Arc::new(DaemonStateHandle::new(ts(3_500)));
        let time = Arc::new(CountingTime {
            now: ts(3_500),
            reads: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(
            ledger.clone(),
            chain,
            SyncSettings::default(),
            schedule,
            state,
            Arc::clone(&time) as Arc<dyn TimeSource>,
            Duration::from_secs(60),
            2,
        );
        ledger.record_result("P", 3, 150, ts(3_400)).unwrap();

        // Materialization, candidate evaluation, and the pass itself all
        // observe the single instant read at tick entry.
        scheduler.tick().await;
        assert_eq!(time.reads.load(Ordering::SeqCst), 1);
    }
}
