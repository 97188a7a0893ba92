//! Shared daemon state.
//!
//! One handle, shared by the scheduler loop, the diagnostic surface, and the
//! signal handler. Holds the last recorded pass report per week, the
//! per-week pass locks that serialize reconciliation triggers, and the
//! shutdown flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tally_core::sync::PassReport;
use tokio::sync::{Mutex, RwLock};

/// Shared daemon state.
pub type SharedState = Arc<DaemonStateHandle>;

/// Handle to daemon state with interior mutability.
pub struct DaemonStateHandle {
    /// Last pass report per week.
    reports: RwLock<HashMap<u64, PassReport>>,
    /// Per-week pass locks. At most one in-flight reconciliation per week:
    /// concurrent triggers (timer + manual) serialize on these rather than
    /// race.
    locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    /// Time when the daemon started.
    started_at: DateTime<Utc>,
}

impl DaemonStateHandle {
    /// Creates a fresh state handle.
    #[must_use]
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            reports: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            started_at,
        }
    }

    /// Records the terminal report of a finished pass.
    pub async fn record_report(&self, report: PassReport) {
        self.reports.write().await.insert(report.week, report);
    }

    /// The last recorded report for a week, if any pass has run.
    pub async fn last_report(&self, week: u64) -> Option<PassReport> {
        self.reports.read().await.get(&week).cloned()
    }

    /// Returns the pass lock for a week, creating it on first use.
    ///
    /// Locks are never removed: a week's lock stays valid for manual resync
    /// long after the week ended, and the map grows by one small entry per
    /// week ever touched.
    pub async fn week_lock(&self, week: u64) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .await
                .entry(week)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown. In-flight passes run to their terminal state; only
    /// the loops stop picking up new work.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Daemon start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Daemon uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.started_at).num_seconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tally_core::sync::PassOutcome;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn records_and_replaces_reports() {
        let state = DaemonStateHandle::new(ts(0));
        assert!(state.last_report(29).await.is_none());

        state
            .record_report(PassReport {
                week: 29,
                outcome: PassOutcome::PartialFailure {
                    at: tally_core::sync::PassState::Submitting,
                    error: "chain unavailable".to_string(),
                },
                started_at: ts(10),
            })
            .await;
        state
            .record_report(PassReport {
                week: 29,
                outcome: PassOutcome::Synced {
                    players_updated: 3,
                    deferred: 0,
                },
                started_at: ts(20),
            })
            .await;

        let report = state.last_report(29).await.unwrap();
        assert!(report.outcome.is_synced());
        assert_eq!(report.started_at, ts(20));
    }

    #[tokio::test]
    async fn week_locks_are_stable_per_week() {
        let state = DaemonStateHandle::new(ts(0));
        let a = state.week_lock(29).await;
        let b = state.week_lock(29).await;
        let c = state.week_lock(30).await;

        assert!(Arc::ptr_eq(&a, &b), "same week shares one lock");
        assert!(!Arc::ptr_eq(&a, &c), "different weeks have distinct locks");

        // Holding week 29's lock does not block week 30.
        let _guard = a.lock().await;
        assert!(c.try_lock().is_ok());
        assert!(b.try_lock().is_err());
    }

    #[test]
    fn shutdown_flag_and_uptime() {
        let state = DaemonStateHandle::new(ts(100));
        assert!(!state.is_shutdown_requested());
        state.request_shutdown();
        assert!(state.is_shutdown_requested());
        assert_eq!(state.uptime_secs(ts(160)), 60);
        assert_eq!(state.uptime_secs(ts(50)), 0);
    }
}
