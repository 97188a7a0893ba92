//! Reconciliation pass logic.
//!
//! A reconciliation pass for week `W` walks the state machine
//!
//! ```text
//! Idle -> Computing -> Submitting -> Confirming -> Synced | PartialFailure
//! ```
//!
//! Computing diffs a ledger snapshot against per-player on-chain reads and
//! produces a delta set of *absolute* target scores. Submitting sends the
//! batch (retrying transient faults on a backoff schedule), Confirming waits
//! for finality (re-polling bounded times on timeout). Both terminal states
//! leave the system safe to trigger again: re-running the pass recomputes
//! the delta set from current state, which is the repair mechanism for every
//! ambiguous outcome.

pub mod backoff;
pub mod pass;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::chain::{ChainError, PlayerRecord, ScoreEntry};
use crate::config::humantime_serde;
use crate::ledger::LedgerError;

pub use backoff::BackoffConfig;
pub use pass::{run_pass, PassReport};

/// Errors terminating a reconciliation pass.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncError {
    /// A chain gateway operation failed.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// A ledger operation failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Submit retries were exhausted while the chain stayed unavailable.
    #[error("submit attempts exhausted after {attempts} tries: {last}")]
    SubmitAttemptsExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The last transient error observed.
        last: String,
    },

    /// The transaction did not reach finality within the bounded re-poll
    /// budget. It may still land later; the next pass absorbs that because
    /// submitted targets are absolute.
    #[error("confirmation timed out after {attempts} polls of {tx}")]
    ConfirmationTimeout {
        /// How many confirm polls were made.
        attempts: u32,
        /// The transaction that never confirmed.
        tx: String,
    },

    /// The requested week has no generated schedule entry.
    #[error("unknown week {0}")]
    UnknownWeek(u64),
}

/// State-machine position of a pass, for logs and failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    /// No pass in flight.
    Idle,
    /// Diffing ledger snapshot against on-chain reads.
    Computing,
    /// Batch submission in flight.
    Submitting,
    /// Waiting for transaction finality.
    Confirming,
}

impl PassState {
    /// Lowercase name for logs and JSON.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Computing => "computing",
            Self::Submitting => "submitting",
            Self::Confirming => "confirming",
        }
    }
}

impl std::fmt::Display for PassState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PassOutcome {
    /// Off-chain and on-chain totals agree for every player in the batch.
    Synced {
        /// Players whose on-chain record was updated this pass.
        players_updated: usize,
        /// Players deferred to the next pass by the batch-size cap.
        deferred: usize,
    },
    /// The pass stopped before reaching agreement. The week stays eligible
    /// for resync indefinitely; nothing is auto-escalated.
    PartialFailure {
        /// Where the pass stopped.
        at: PassState,
        /// Human-readable cause, durably recorded and exposed via
        /// diagnostics.
        error: String,
    },
}

impl PassOutcome {
    /// Whether the pass reached full agreement.
    #[must_use]
    pub const fn is_synced(&self) -> bool {
        matches!(self, Self::Synced { .. })
    }
}

/// Tunables for the reconciliation pipeline, the `[sync]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Maximum players per on-chain batch; overflow is deferred to the next
    /// pass. Default 64.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Bounded submit attempts for transient chain faults. Default 5.
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,

    /// Bounded confirm re-polls before escalating an ambiguous transaction.
    /// Default 5.
    #[serde(default = "default_max_confirm_attempts")]
    pub max_confirm_attempts: u32,

    /// Per-poll confirmation timeout. Default 15s.
    #[serde(default = "default_confirm_timeout")]
    #[serde(with = "humantime_serde")]
    pub confirm_timeout: Duration,

    /// Backoff schedule between submit retries.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_max_batch_size() -> usize {
    64
}

const fn default_max_submit_attempts() -> u32 {
    5
}

const fn default_max_confirm_attempts() -> u32 {
    5
}

const fn default_confirm_timeout() -> Duration {
    Duration::from_secs(15)
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_submit_attempts: default_max_submit_attempts(),
            max_confirm_attempts: default_max_confirm_attempts(),
            confirm_timeout: default_confirm_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Computes the delta set: players whose off-chain total differs from their
/// on-chain record, paired with the absolute off-chain target.
///
/// A row whose on-chain score *exceeds* the off-chain total is never
/// included: submitting it would regress a confirmed score. That situation
/// cannot arise from this system's own writes and is logged for operator
/// attention.
#[must_use]
pub fn compute_deltas(
    week: u64,
    off_chain: &BTreeMap<String, u64>,
    on_chain: &BTreeMap<String, PlayerRecord>,
) -> Vec<ScoreEntry> {
    let mut deltas = Vec::new();
    for (player, &target) in off_chain {
        let current = on_chain.get(player).copied().unwrap_or(PlayerRecord::absent());
        if !current.present || current.score < target {
            deltas.push(ScoreEntry {
                player: player.clone(),
                new_score: target,
            });
        } else if current.score > target {
            warn!(
                week,
                player = %player,
                on_chain = current.score,
                off_chain = target,
                "on-chain score exceeds off-chain total; refusing to regress"
            );
        }
    }
    deltas
}

/// Ephemeral unit of work: one batch submission for one week.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    /// Target week.
    pub week: u64,
    /// Entries in this batch (capped at `max_batch_size`).
    pub entries: Vec<ScoreEntry>,
    /// Entries deferred to the next pass by the cap.
    pub deferred: usize,
    /// Hex digest of `(week, entries)`; stable across retries of the same
    /// content, distinct whenever the delta set changes.
    pub idempotency_key: String,
}

impl SyncJob {
    /// Builds a job from a delta set, applying the batch-size cap.
    #[must_use]
    pub fn new(week: u64, mut deltas: Vec<ScoreEntry>, max_batch_size: usize) -> Self {
        let deferred = deltas.len().saturating_sub(max_batch_size);
        deltas.truncate(max_batch_size);

        let mut hasher = Sha256::new();
        hasher.update(week.to_be_bytes());
        for entry in &deltas {
            hasher.update((entry.player.len() as u64).to_be_bytes());
            hasher.update(entry.player.as_bytes());
            hasher.update(entry.new_score.to_be_bytes());
        }
        let idempotency_key = hex::encode(hasher.finalize());

        Self {
            week,
            entries: deltas,
            deferred,
            idempotency_key,
        }
    }

    /// Whether there is anything to submit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
