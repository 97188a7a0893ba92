//! Chain gateway.
//!
//! All on-chain reads and writes go through the [`ChainClient`] trait. The
//! contract itself is an opaque remote service reached through a relay; this
//! module only fixes the operation set and the failure taxonomy. Score
//! submissions carry *absolute* per-player totals, never deltas, so a retry
//! after an ambiguous outcome is a no-op once the first submission lands.
//!
//! Implementations:
//!
//! - [`rpc::RpcChainClient`]: JSON-over-HTTP relay client for production
//! - [`mock::MockChainClient`]: scriptable in-process fake for tests

pub mod mock;
pub mod rpc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::{ChainCall, MockChainClient};
pub use rpc::{RpcChainClient, RpcChainConfig};

/// Errors surfaced by chain gateway operations.
///
/// The scheduler branches on these variants: `Unavailable` is transient and
/// retried with backoff, `Revert` and `Authorization` are terminal for the
/// pass and require a configuration or contract fix before a resync can
/// succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChainError {
    /// The chain or relay could not be reached; safe to retry.
    #[error("chain unavailable: {0}")]
    Unavailable(String),

    /// The transaction executed and reverted; retrying the same call wastes
    /// gas and cannot succeed without an external fix.
    #[error("chain revert: {reason}")]
    Revert {
        /// Revert reason reported by the contract.
        reason: String,
    },

    /// The configured signing identity is not the contract's authorized
    /// writer. All writes short-circuit until an operator fixes the drift.
    #[error("signer not authorized: configured {configured}, contract trusts {authorized}")]
    Authorization {
        /// The address this process signs with.
        configured: String,
        /// The address the contract currently trusts.
        authorized: String,
    },
}

/// Opaque handle for a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHandle(pub String);

impl std::fmt::Display for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A player's stored record for one week, as the chain sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Stored score; zero when `present` is false.
    pub score: u64,
    /// Whether the record has ever been written.
    pub present: bool,
}

impl PlayerRecord {
    /// A record that has never been written.
    #[must_use]
    pub const fn absent() -> Self {
        Self {
            score: 0,
            present: false,
        }
    }
}

/// Finality status of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ConfirmStatus {
    /// Mined and successful.
    Success,
    /// Mined but reverted.
    Reverted {
        /// Revert reason, if the relay reported one.
        reason: String,
    },
    /// Not mined within the confirmation timeout. The transaction may still
    /// land later; callers must re-check rather than assume failure.
    TimedOut,
}

/// Result of comparing the configured signer against the contract's
/// authorized writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerCheck {
    /// The address this process signs with.
    pub configured: String,
    /// The address the contract currently trusts.
    pub authorized: String,
    /// Whether the two match.
    pub is_match: bool,
}

impl SignerCheck {
    /// Converts a mismatch into the error the write path short-circuits with.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Authorization`] when the addresses differ.
    pub fn require_match(&self) -> Result<(), ChainError> {
        if self.is_match {
            Ok(())
        } else {
            Err(ChainError::Authorization {
                configured: self.configured.clone(),
                authorized: self.authorized.clone(),
            })
        }
    }
}

/// One entry of a score batch: a player and their absolute new total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreEntry {
    /// Player address.
    pub player: String,
    /// Absolute new total for the week (not a delta).
    pub new_score: u64,
}

/// Synchronous request/response facade over the on-chain ledger.
///
/// Every operation is a network round trip and may suspend. Implementations
/// must be safe to share across tasks; the daemon holds one behind an `Arc`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Reads the week counter the contract believes is active.
    ///
    /// Used for sanity cross-checks only; the off-chain schedule, not this
    /// value, decides what to sync.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if the read fails.
    async fn current_week(&self) -> Result<u64, ChainError>;

    /// Reads a player's stored record for a week.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if the read fails.
    async fn player_record(&self, player: &str, week: u64) -> Result<PlayerRecord, ChainError>;

    /// Submits a batch of absolute score totals for a week.
    ///
    /// Re-submitting the same totals after a prior success is a contract-side
    /// no-op; that property is what makes every retry in the scheduler safe.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if the submission fails or reverts.
    async fn submit_score_batch(
        &self,
        week: u64,
        entries: &[ScoreEntry],
    ) -> Result<TxHandle, ChainError>;

    /// Waits for a transaction to reach finality, up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if the status could not be queried at all;
    /// a transaction that merely has not landed yet is [`ConfirmStatus::TimedOut`],
    /// not an error.
    async fn confirm_transaction(
        &self,
        handle: &TxHandle,
        timeout: std::time::Duration,
    ) -> Result<ConfirmStatus, ChainError>;

    /// Compares the configured signing identity against the contract's
    /// authorized writer.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if the authorization read fails.
    async fn verify_signer(&self) -> Result<SignerCheck, ChainError>;
}
