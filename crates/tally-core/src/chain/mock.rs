//! In-process chain fake for tests.
//!
//! [`MockChainClient`] holds the "on-chain" state in memory and lets tests
//! script failures: unavailable windows, revert reasons, signer drift, and
//! confirmation timeouts. Every gateway call is appended to a call log so
//! tests can assert not just outcomes but which writes were (or were not)
//! issued.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ChainClient, ChainError, ConfirmStatus, PlayerRecord, ScoreEntry, SignerCheck, TxHandle,
};

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCall {
    /// `current_week` read.
    CurrentWeek,
    /// `player_record` read.
    PlayerRecord {
        /// Queried player.
        player: String,
        /// Queried week.
        week: u64,
    },
    /// `submit_score_batch` write attempt (logged even when it fails).
    SubmitScoreBatch {
        /// Target week.
        week: u64,
        /// Submitted entries.
        entries: Vec<ScoreEntry>,
    },
    /// `confirm_transaction` poll.
    ConfirmTransaction {
        /// Polled handle.
        handle: TxHandle,
    },
    /// `verify_signer` read.
    VerifySigner,
}

#[derive(Debug, Default)]
struct MockState {
    current_week: u64,
    records: HashMap<(String, u64), u64>,
    pending: HashMap<String, (u64, Vec<ScoreEntry>)>,
    next_tx: u64,
    authorized: String,
    configured: String,
    // Fault scripting
    unavailable_submits: u32,
    revert_reason: Option<String>,
    confirm_script: VecDeque<ConfirmStatus>,
    calls: Vec<ChainCall>,
}

/// Scriptable in-memory [`ChainClient`].
#[derive(Debug)]
pub struct MockChainClient {
    state: Mutex<MockState>,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new("0xsigner")
    }
}

impl MockChainClient {
    /// Creates a mock whose configured and authorized signer both equal
    /// `signer`.
    #[must_use]
    pub fn new(signer: &str) -> Self {
        Self {
            state: Mutex::new(MockState {
                authorized: signer.to_string(),
                configured: signer.to_string(),
                ..MockState::default()
            }),
        }
    }

    /// Sets the week counter returned by `current_week`.
    pub fn set_current_week(&self, week: u64) {
        self.state.lock().unwrap().current_week = week;
    }

    /// Seeds an on-chain record directly.
    pub fn set_record(&self, player: &str, week: u64, score: u64) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert((player.to_string(), week), score);
    }

    /// Reads an on-chain score, `None` if never written.
    #[must_use]
    pub fn score(&self, player: &str, week: u64) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&(player.to_string(), week))
            .copied()
    }

    /// Makes the contract trust a different writer than the configured one.
    pub fn set_authorized_writer(&self, address: &str) {
        self.state.lock().unwrap().authorized = address.to_string();
    }

    /// Fails the next `n` submit calls with [`ChainError::Unavailable`].
    pub fn fail_submits(&self, n: u32) {
        self.state.lock().unwrap().unavailable_submits = n;
    }

    /// Makes submit calls revert with `reason` until [`Self::clear_revert`].
    pub fn revert_submits(&self, reason: &str) {
        self.state.lock().unwrap().revert_reason = Some(reason.to_string());
    }

    /// Clears a scripted revert, simulating the contract-side fix.
    pub fn clear_revert(&self) {
        self.state.lock().unwrap().revert_reason = None;
    }

    /// Scripts the outcome of the next confirm call. Unscripted confirms
    /// succeed and apply the pending batch.
    pub fn push_confirm(&self, status: ConfirmStatus) {
        self.state.lock().unwrap().confirm_script.push_back(status);
    }

    /// Returns the full call log.
    #[must_use]
    pub fn calls(&self) -> Vec<ChainCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of submit attempts recorded.
    #[must_use]
    pub fn submit_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| matches!(c, ChainCall::SubmitScoreBatch { .. }))
            .count()
    }

    fn apply(state: &mut MockState, handle: &str) {
        if let Some((week, entries)) = state.pending.remove(handle) {
            for entry in entries {
                // Absolute totals: applying the same batch twice is a no-op.
                state.records.insert((entry.player, week), entry.new_score);
            }
        }
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn current_week(&self) -> Result<u64, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ChainCall::CurrentWeek);
        Ok(state.current_week)
    }

    async fn player_record(&self, player: &str, week: u64) -> Result<PlayerRecord, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ChainCall::PlayerRecord {
            player: player.to_string(),
            week,
        });
        Ok(state
            .records
            .get(&(player.to_string(), week))
            .map_or(PlayerRecord::absent(), |&score| PlayerRecord {
                score,
                present: true,
            }))
    }

    async fn submit_score_batch(
        &self,
        week: u64,
        entries: &[ScoreEntry],
    ) -> Result<TxHandle, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ChainCall::SubmitScoreBatch {
            week,
            entries: entries.to_vec(),
        });

        if state.configured != state.authorized {
            return Err(ChainError::Authorization {
                configured: state.configured.clone(),
                authorized: state.authorized.clone(),
            });
        }
        if state.unavailable_submits > 0 {
            state.unavailable_submits -= 1;
            return Err(ChainError::Unavailable("scripted outage".to_string()));
        }
        if let Some(reason) = state.revert_reason.clone() {
            return Err(ChainError::Revert { reason });
        }

        state.next_tx += 1;
        let handle = format!("0xtx{:04x}", state.next_tx);
        state
            .pending
            .insert(handle.clone(), (week, entries.to_vec()));
        Ok(TxHandle(handle))
    }

    async fn confirm_transaction(
        &self,
        handle: &TxHandle,
        _timeout: Duration,
    ) -> Result<ConfirmStatus, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ChainCall::ConfirmTransaction {
            handle: handle.clone(),
        });

        if let Some(status) = state.confirm_script.pop_front() {
            if status == ConfirmStatus::Success {
                Self::apply(&mut state, &handle.0);
            }
            return Ok(status);
        }

        Self::apply(&mut state, &handle.0);
        Ok(ConfirmStatus::Success)
    }

    async fn verify_signer(&self) -> Result<SignerCheck, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ChainCall::VerifySigner);
        Ok(SignerCheck {
            configured: state.configured.clone(),
            authorized: state.authorized.clone(),
            is_match: state.configured == state.authorized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_then_confirm_applies_absolute_totals() {
        let chain = MockChainClient::new("0xabc");
        let entries = vec![ScoreEntry {
            player: "p1".to_string(),
            new_score: 150,
        }];

        let tx = chain.submit_score_batch(29, &entries).await.unwrap();
        assert_eq!(chain.score("p1", 29), None, "not applied before confirm");

        let status = chain
            .confirm_transaction(&tx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status, ConfirmStatus::Success);
        assert_eq!(chain.score("p1", 29), Some(150));
    }

    #[tokio::test]
    async fn duplicate_absolute_submission_is_a_no_op() {
        let chain = MockChainClient::new("0xabc");
        let entries = vec![ScoreEntry {
            player: "p1".to_string(),
            new_score: 150,
        }];

        for _ in 0..2 {
            let tx = chain.submit_score_batch(29, &entries).await.unwrap();
            chain
                .confirm_transaction(&tx, Duration::from_secs(1))
                .await
                .unwrap();
        }

        // Same net effect as a single successful submission.
        assert_eq!(chain.score("p1", 29), Some(150));
    }

    #[tokio::test]
    async fn scripted_outage_clears_after_n_calls() {
        let chain = MockChainClient::new("0xabc");
        chain.fail_submits(2);
        let entries = vec![ScoreEntry {
            player: "p1".to_string(),
            new_score: 10,
        }];

        assert!(matches!(
            chain.submit_score_batch(1, &entries).await,
            Err(ChainError::Unavailable(_))
        ));
        assert!(matches!(
            chain.submit_score_batch(1, &entries).await,
            Err(ChainError::Unavailable(_))
        ));
        assert!(chain.submit_score_batch(1, &entries).await.is_ok());
    }

    #[tokio::test]
    async fn signer_drift_blocks_writes() {
        let chain = MockChainClient::new("0xabc");
        chain.set_authorized_writer("0xother");

        let check = chain.verify_signer().await.unwrap();
        assert!(!check.is_match);
        assert!(check.require_match().is_err());

        let err = chain
            .submit_score_batch(
                1,
                &[ScoreEntry {
                    player: "p1".to_string(),
                    new_score: 5,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Authorization { .. }));
    }
}
