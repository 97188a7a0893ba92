//! The reconciliation pass executor.
//!
//! [`run_pass`] drives one week through Computing, Submitting, and
//! Confirming to a terminal [`PassOutcome`]. It owns no scheduling concerns:
//! the daemon's scheduler decides *when* to run a pass and guarantees at
//! most one in-flight pass per week; this function only guarantees that a
//! pass, once started, either reaches agreement or records exactly where and
//! why it stopped.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{compute_deltas, PassOutcome, PassState, SyncError, SyncJob, SyncSettings};
use crate::chain::{ChainClient, ChainError, ConfirmStatus, PlayerRecord, TxHandle};
use crate::ledger::{ScoreLedger, SyncState};

/// Record of one finished reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    /// The reconciled week.
    pub week: u64,
    /// Terminal outcome.
    #[serde(flatten)]
    pub outcome: PassOutcome,
    /// Instant the pass observed at its start; all bookkeeping stamps in the
    /// pass use this single reading.
    pub started_at: DateTime<Utc>,
}

/// Runs one reconciliation pass for `week` to a terminal outcome.
///
/// Never returns an error: every fault is folded into
/// [`PassOutcome::PartialFailure`] so the caller always has something durable
/// to record. Re-running after any outcome is safe; the delta set is
/// recomputed from current state each time.
pub async fn run_pass(
    week: u64,
    ledger: &ScoreLedger,
    chain: &dyn ChainClient,
    settings: &SyncSettings,
    now: DateTime<Utc>,
) -> PassReport {
    info!(week, "reconciliation pass: idle -> computing");
    let outcome = match drive(week, ledger, chain, settings, now).await {
        Ok(outcome) => outcome,
        Err((at, error)) => {
            warn!(week, at = %at, %error, "reconciliation pass failed");
            PassOutcome::PartialFailure {
                at,
                error: error.to_string(),
            }
        },
    };

    match &outcome {
        PassOutcome::Synced {
            players_updated,
            deferred,
        } => info!(week, players_updated, deferred, "reconciliation pass synced"),
        PassOutcome::PartialFailure { at, error } => {
            info!(week, at = %at, %error, "reconciliation pass recorded partial failure");
        },
    }

    PassReport {
        week,
        outcome,
        started_at: now,
    }
}

async fn drive(
    week: u64,
    ledger: &ScoreLedger,
    chain: &dyn ChainClient,
    settings: &SyncSettings,
    now: DateTime<Utc>,
) -> Result<PassOutcome, (PassState, SyncError)> {
    // ---- Computing -------------------------------------------------------
    let computing = |e: SyncError| (PassState::Computing, e);

    ledger
        .get_week_async(week)
        .await
        .map_err(|e| computing(e.into()))?
        .ok_or_else(|| computing(SyncError::UnknownWeek(week)))?;

    // Signer gate: a mismatch short-circuits the pass before any chain
    // write. Requires operator intervention, never retried here.
    let signer = chain.verify_signer().await.map_err(|e| computing(e.into()))?;
    signer
        .require_match()
        .map_err(|e| computing(SyncError::Chain(e)))?;

    // Sanity cross-check only; the off-chain schedule decides what to sync.
    match chain.current_week().await {
        Ok(chain_week) if chain_week < week => {
            warn!(week, chain_week, "chain week counter is behind the schedule");
        },
        Ok(_) => {},
        Err(e) => return Err(computing(e.into())),
    }

    let off_chain = ledger
        .snapshot_async(week)
        .await
        .map_err(|e| computing(e.into()))?;

    let mut on_chain: BTreeMap<String, PlayerRecord> = BTreeMap::new();
    for player in off_chain.keys() {
        let record = chain
            .player_record(player, week)
            .await
            .map_err(|e| computing(e.into()))?;
        debug!(week, player = %player, score = record.score, present = record.present,
               "fetched on-chain record");
        on_chain.insert(player.clone(), record);
    }

    let deltas = compute_deltas(week, &off_chain, &on_chain);

    // Rows already in agreement get their bookkeeping settled here; this is
    // how a pass repairs state after an ambiguous prior outcome (submitted,
    // crashed before confirming, transaction landed anyway).
    settle_agreed_rows(week, ledger, &off_chain, &on_chain, now)
        .await
        .map_err(|e| computing(e.into()))?;

    if deltas.is_empty() {
        info!(week, "delta set empty: computing -> synced");
        return Ok(PassOutcome::Synced {
            players_updated: 0,
            deferred: 0,
        });
    }

    let job = SyncJob::new(week, deltas, settings.max_batch_size);
    info!(
        week,
        batch = job.entries.len(),
        deferred = job.deferred,
        idempotency_key = %job.idempotency_key,
        "computing -> submitting"
    );

    // ---- Submitting ------------------------------------------------------
    let handle = match submit_with_retry(chain, &job, settings).await {
        Ok(handle) => handle,
        Err(e) => {
            mark_batch_failed(week, ledger, &job, now).await;
            return Err((PassState::Submitting, e));
        },
    };

    // ---- Confirming ------------------------------------------------------
    info!(week, tx = %handle, "submitting -> confirming");
    let mut polls = 0u32;
    loop {
        polls += 1;
        let status = chain
            .confirm_transaction(&handle, settings.confirm_timeout)
            .await
            .map_err(|e| (PassState::Confirming, SyncError::Chain(e)))?;

        match status {
            ConfirmStatus::Success => {
                for entry in &job.entries {
                    ledger
                        .mark_sync_state_async(
                            entry.player.clone(),
                            week,
                            SyncState::Clean,
                            Some(entry.new_score),
                            now,
                        )
                        .await
                        .map_err(|e| (PassState::Confirming, SyncError::Ledger(e)))?;
                }
                return Ok(PassOutcome::Synced {
                    players_updated: job.entries.len(),
                    deferred: job.deferred,
                });
            },
            ConfirmStatus::Reverted { reason } => {
                mark_batch_failed(week, ledger, &job, now).await;
                return Err((
                    PassState::Confirming,
                    SyncError::Chain(ChainError::Revert { reason }),
                ));
            },
            ConfirmStatus::TimedOut => {
                if polls >= settings.max_confirm_attempts {
                    mark_batch_failed(week, ledger, &job, now).await;
                    return Err((
                        PassState::Confirming,
                        SyncError::ConfirmationTimeout {
                            attempts: polls,
                            tx: handle.to_string(),
                        },
                    ));
                }
                // The transaction may still land; re-poll rather than assume
                // failure.
                warn!(week, tx = %handle, polls, "confirmation timed out; re-polling");
            },
        }
    }
}

/// Submits the batch, retrying only transient unavailability on the
/// configured backoff schedule. Reverts and authorization failures are
/// terminal: blind retry of a reverting call wastes gas and cannot succeed
/// without an external fix.
async fn submit_with_retry(
    chain: &dyn ChainClient,
    job: &SyncJob,
    settings: &SyncSettings,
) -> Result<TxHandle, SyncError> {
    let mut last = String::new();
    for attempt in 1..=settings.max_submit_attempts {
        match chain.submit_score_batch(job.week, &job.entries).await {
            Ok(handle) => return Ok(handle),
            Err(ChainError::Unavailable(reason)) => {
                let delay = settings.backoff.delay_for_attempt(attempt);
                warn!(
                    week = job.week,
                    attempt,
                    max = settings.max_submit_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "chain unavailable; backing off before retry"
                );
                last = reason;
                if attempt < settings.max_submit_attempts {
                    tokio::time::sleep(delay).await;
                }
            },
            Err(e) => return Err(e.into()),
        }
    }
    Err(SyncError::SubmitAttemptsExhausted {
        attempts: settings.max_submit_attempts,
        last,
    })
}

/// Marks rows whose off-chain and on-chain totals already agree as `Clean`.
async fn settle_agreed_rows(
    week: u64,
    ledger: &ScoreLedger,
    off_chain: &BTreeMap<String, u64>,
    on_chain: &BTreeMap<String, PlayerRecord>,
    now: DateTime<Utc>,
) -> Result<(), crate::ledger::LedgerError> {
    let rows = ledger.week_rows_async(week).await?;
    for row in rows {
        if row.sync_state == SyncState::Clean {
            continue;
        }
        let Some(&target) = off_chain.get(&row.player) else {
            continue;
        };
        let agreed = on_chain
            .get(&row.player)
            .is_some_and(|r| r.present && r.score == target);
        if agreed {
            debug!(week, player = %row.player, score = target,
                   "row already agrees on-chain; settling bookkeeping");
            ledger
                .mark_sync_state_async(row.player, week, SyncState::Clean, Some(target), now)
                .await?;
        }
    }
    Ok(())
}

/// Best-effort `Failed` bookkeeping for a batch whose pass is terminating in
/// failure. The pass outcome is already decided; a bookkeeping fault here
/// must not mask it.
async fn mark_batch_failed(week: u64, ledger: &ScoreLedger, job: &SyncJob, now: DateTime<Utc>) {
    for entry in &job.entries {
        if let Err(e) = ledger
            .mark_sync_state_async(entry.player.clone(), week, SyncState::Failed, None, now)
            .await
        {
            warn!(week, player = %entry.player, error = %e, "failed to mark row failed");
        }
    }
}
