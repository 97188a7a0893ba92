//! Off-chain score ledger.
//!
//! The ledger is the fast, mutable, authoritative record of per-player,
//! per-week scores, written incrementally as matches finalize. It owns the
//! `off_chain_score` column exclusively; the sync bookkeeping columns
//! (`last_synced_score`, `sync_state`, `last_sync_attempt_at`) are written
//! only by the reconciliation scheduler through [`storage::ScoreLedger::mark_sync_state`].
//!
//! Rows are append-only history: created on a player's first result in a
//! week, never deleted, and effectively immutable once the week has ended
//! and fully synced.

pub mod storage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use storage::ScoreLedger;

/// Errors raised by ledger operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    /// The caller supplied a negative delta, or the increment would
    /// overflow the stored total. Rejected locally; never reaches the chain.
    #[error("invalid delta {delta} for {player} week {week}")]
    InvalidDelta {
        /// Offending delta.
        delta: i64,
        /// Target player.
        player: String,
        /// Target week.
        week: u64,
    },

    /// Sync bookkeeping referenced a `(player, week)` row that does not
    /// exist. Scheduler bug: bookkeeping never creates rows.
    #[error("no score row for {player} week {week}")]
    MissingRow {
        /// Target player.
        player: String,
        /// Target week.
        week: u64,
    },

    /// Underlying storage fault.
    #[error("ledger database error: {0}")]
    Database(String),
}

/// Synchronization state of one `(player, week)` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// On-chain score matches the last confirmed submission.
    Clean,
    /// Off-chain changes have not been confirmed on-chain yet.
    Pending,
    /// The last reconciliation pass for this row ended in failure.
    Failed,
}

impl SyncState {
    /// Canonical column value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    /// Parses a column value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clean" => Some(Self::Clean),
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(player, week)` ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerWeekScore {
    /// Player address.
    pub player: String,
    /// Week number.
    pub week: u64,
    /// Accumulated off-chain total; monotone non-decreasing within a week.
    pub off_chain_score: u64,
    /// Last value confirmed on-chain, if any.
    pub last_synced_score: Option<u64>,
    /// When the scheduler last attempted to sync this row.
    pub last_sync_attempt_at: Option<DateTime<Utc>>,
    /// Current sync bookkeeping state.
    pub sync_state: SyncState,
}
