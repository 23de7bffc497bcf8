//! Exit execution: remove liquidity, convert the base asset, unwrap.
//!
//! The removal is the durability point. Once it is confirmed the record is
//! closed and persisted before anything else happens; conversion and unwrap
//! are best effort, with failed conversions handed to the swap retry queue.

use anyhow::Result;
use chrono::Utc;
use lpexit_chain::WSOL_MINT;
use std::str::FromStr;
use solana_sdk::signature::Signature;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ExecutorConfig;
use crate::error::StepError;
use crate::inflight::{InFlightGuard, InFlightSet};
use crate::position::PositionRecord;
use crate::retry::{poll_until, retry, RetryPolicy};
use crate::services::{RemovalRequest, Services};
use crate::store::StateStore;

/// Which removal budget applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitBudget {
    /// Fired by the monitor
    Primary,
    /// Retried by reconciliation
    Reconcile,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwapOutcome {
    Settled { signature: String, unwrapped: bool },
    /// Released balance never exceeded the swap minimum
    BelowMinimum { balance: u64 },
    /// Every attempt failed; queued for the retry sweep
    Deferred,
    /// The base asset already is the quote asset
    NotNeeded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Closed {
        removal_signatures: Vec<String>,
        swap: SwapOutcome,
    },
    RemovalFailed,
    AlreadyInFlight,
    AlreadyClosed,
    Unknown,
}

/// Drives a triggered position through removal, swap and unwrap.
#[derive(Debug)]
pub struct ExitExecutor {
    services: Services,
    store: StateStore,
    inflight: InFlightSet,
    config: ExecutorConfig,
    owner: String,
}

impl ExitExecutor {
    pub fn new(
        services: Services,
        store: StateStore,
        inflight: InFlightSet,
        config: ExecutorConfig,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            services,
            store,
            inflight,
            config,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Acquire the position's guard and run the exit.
    pub async fn try_execute(
        &self,
        position_id: &str,
        lower_bin_id: i32,
        upper_bin_id: i32,
        budget: ExitBudget,
    ) -> Result<ExitOutcome> {
        let Some(guard) = self.inflight.try_acquire(position_id) else {
            debug!(position = %position_id, "Exit already in flight");
            return Ok(ExitOutcome::AlreadyInFlight);
        };
        self.run(&guard, lower_bin_id, upper_bin_id, budget).await
    }

    /// Run the exit for the guarded position.
    ///
    /// Errors are store failures only; external failures are retried and
    /// reported through the outcome.
    #[instrument(skip(self, guard), fields(position = %guard.key()))]
    pub async fn run(
        &self,
        guard: &InFlightGuard,
        lower_bin_id: i32,
        upper_bin_id: i32,
        budget: ExitBudget,
    ) -> Result<ExitOutcome> {
        let position_id = guard.key();
        let Some(record) = self.store.ledger.get(position_id) else {
            warn!("Exit requested for unknown position");
            return Ok(ExitOutcome::Unknown);
        };
        if record.is_closed() {
            debug!("Position already closed");
            return Ok(ExitOutcome::AlreadyClosed);
        }

        let request = RemovalRequest {
            owner: self.owner.clone(),
            pool: record.pool_id.clone(),
            position: position_id.to_string(),
            lower_bin_id,
            upper_bin_id,
        };
        let attempts = match budget {
            ExitBudget::Primary => self.config.remove_attempts,
            ExitBudget::Reconcile => self.config.reconcile_remove_attempts,
        };
        info!(
            reason = ?record.last_trigger,
            attempts,
            bins = format!("{}..={}", lower_bin_id, upper_bin_id),
            "Removing liquidity"
        );

        let removal_signatures = match self.remove(&request, attempts).await {
            Ok(signatures) => signatures,
            Err(e) => {
                self.store.ledger.update(position_id, |r| r.fail_removal())?;
                error!(error = %e, "Removal exhausted, position left for reconciliation");
                return Ok(ExitOutcome::RemovalFailed);
            }
        };

        self.store.ledger.update(position_id, |r| r.mark_closed(Utc::now()))?;
        info!(signatures = ?removal_signatures, "Liquidity removed, position closed");

        if !self.config.post_remove_delay().is_zero() {
            tokio::time::sleep(self.config.post_remove_delay()).await;
        }

        let swap = self.settle(&record).await?;
        Ok(ExitOutcome::Closed {
            removal_signatures,
            swap,
        })
    }

    /// Build and submit every removal transaction, retrying the whole
    /// sequence on any failure.
    async fn remove(&self, request: &RemovalRequest, attempts: u32) -> Result<Vec<String>, StepError> {
        let policy = RetryPolicy::new(attempts, self.config.remove_retry_delay());
        retry("remove", policy, move |_| async move {
            let transactions = self.services.removal.build_removal(request).await?;
            let mut signatures = Vec::with_capacity(transactions.len());
            for instructions in transactions {
                let signature = self.services.submitter.submit(instructions).await?;
                signatures.push(signature.to_string());
            }
            Ok(signatures)
        })
        .await
    }

    /// Wait for the released base asset and convert it.
    async fn settle(&self, record: &PositionRecord) -> Result<SwapOutcome> {
        if record.base_mint == self.config.quote_mint {
            self.store.ledger.update(&record.position_id, |r| r.swap_settled = true)?;
            return Ok(SwapOutcome::NotNeeded);
        }

        let min = self.config.min_swap_amount;
        let (balance, settled) = poll_until(
            "settlement",
            self.config.settle_polls,
            self.config.settle_poll_interval(),
            || self.services.chain.token_balance(&self.owner, &record.base_mint),
            |balance: &u64| *balance > min,
        )
        .await;
        let balance = balance.unwrap_or(0);

        if !settled {
            info!(balance, min, mint = %record.base_mint, "Released balance below swap minimum, skipping swap");
            return Ok(SwapOutcome::BelowMinimum { balance });
        }

        let policy = RetryPolicy::new(self.config.swap_attempts, self.config.swap_retry_delay());
        match self
            .swap_with_retry(&record.base_mint, &self.config.quote_mint, balance, policy)
            .await
        {
            Ok(signature) => {
                self.store.ledger.update(&record.position_id, |r| r.swap_settled = true)?;
                info!(signature = %signature, amount = balance, "Base asset converted");
                let unwrapped = self.config.quote_is_wrapped_sol() && self.unwrap_proceeds().await;
                Ok(SwapOutcome::Settled { signature, unwrapped })
            }
            Err(e) => {
                self.store
                    .swap_retries
                    .track(&record.base_mint, &self.owner, Utc::now())?;
                warn!(error = %e, mint = %record.base_mint, "Swap failed, queued for retry");
                Ok(SwapOutcome::Deferred)
            }
        }
    }

    /// Swap with a fixed budget, accepting only a well-formed signature whose
    /// transaction reports no on-chain error.
    pub async fn swap_with_retry(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        policy: RetryPolicy,
    ) -> Result<String, StepError> {
        retry("swap", policy, move |_| async move {
            let signature = self.services.swap.swap(input_mint, output_mint, amount).await?;
            self.verify_swap(&signature).await?;
            Ok(signature)
        })
        .await
    }

    async fn verify_swap(&self, signature: &str) -> Result<(), StepError> {
        if Signature::from_str(signature).is_err() {
            return Err(StepError::InvalidSignature(signature.to_string()));
        }
        match self.services.chain.transaction_error(signature).await {
            Ok(None) => Ok(()),
            Ok(Some(reason)) => Err(StepError::OnChainFailure {
                signature: signature.to_string(),
                reason,
            }),
            Err(e) => {
                // Status unknown; the swap service reported success.
                debug!(signature = %signature, error = %e, "Could not read swap status");
                Ok(())
            }
        }
    }

    /// Wait for wrapped SOL to show up, then unwrap it. Failures are only logged.
    pub async fn unwrap_proceeds(&self) -> bool {
        let (_, visible) = poll_until(
            "wrapped SOL",
            self.config.unwrap_polls,
            self.config.unwrap_poll_interval(),
            || self.services.chain.token_balance(&self.owner, WSOL_MINT),
            |balance: &u64| *balance > 0,
        )
        .await;
        if !visible {
            debug!("No wrapped SOL to unwrap");
            return false;
        }

        if !self.config.unwrap_delay().is_zero() {
            tokio::time::sleep(self.config.unwrap_delay()).await;
        }

        let policy = RetryPolicy::new(self.config.unwrap_attempts, self.config.unwrap_retry_delay());
        match retry("unwrap", policy, |_| self.services.unwrap.unwrap(&self.owner)).await {
            Ok(unwrapped) => {
                if unwrapped {
                    info!("Wrapped SOL unwrapped");
                }
                unwrapped
            }
            Err(e) => {
                warn!(error = %e, "Unwrap failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{ExitReason, PositionState};
    use crate::testing::{record, signature, Harness, BASE, OWNER, WSOL};
    use std::sync::atomic::Ordering;

    fn pending(harness: &Harness, id: &str) {
        let mut rec = record(id);
        rec.set_baseline(100.0);
        rec.mark_pending(ExitReason::TakeProfit, Utc::now());
        harness.store.ledger.upsert(rec).unwrap();
    }

    #[tokio::test]
    async fn test_full_exit() {
        let harness = Harness::new();
        pending(&harness, "Pos1");
        harness.chain.script_balance(BASE, &[0, 500, 250_000]);
        harness.chain.set_balance(WSOL, 1_000_000);

        let outcome = harness
            .executor()
            .try_execute("Pos1", -5, 5, ExitBudget::Primary)
            .await
            .unwrap();

        let expected_swap = signature(200).to_string();
        match outcome {
            ExitOutcome::Closed { removal_signatures, swap } => {
                assert_eq!(removal_signatures.len(), 1);
                assert_eq!(
                    swap,
                    SwapOutcome::Settled {
                        signature: expected_swap,
                        unwrapped: true
                    }
                );
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let rec = harness.store.ledger.get("Pos1").unwrap();
        assert!(rec.is_closed());
        assert!(rec.swap_settled);
        assert!(matches!(
            rec.state,
            PositionState::Closed {
                reason: Some(ExitReason::TakeProfit),
                ..
            }
        ));

        let calls = harness.swap.calls.lock().clone();
        assert_eq!(calls, vec![(BASE.to_string(), WSOL.to_string(), 250_000)]);
        assert_eq!(harness.unwrap.calls.load(Ordering::SeqCst), 1);
        assert!(harness.store.swap_retries.is_empty());
        assert!(harness.inflight.is_empty());

        let request = harness.removal.requests.lock()[0].clone();
        assert_eq!(request.owner, OWNER);
        assert_eq!((request.lower_bin_id, request.upper_bin_id), (-5, 5));
    }

    #[tokio::test]
    async fn test_removal_retried_then_succeeds() {
        let harness = Harness::new();
        pending(&harness, "Pos1");
        harness.removal.failures.store(2, Ordering::SeqCst);
        harness.chain.set_balance(BASE, 50_000);

        let outcome = harness
            .executor()
            .try_execute("Pos1", -5, 5, ExitBudget::Primary)
            .await
            .unwrap();
        assert!(matches!(outcome, ExitOutcome::Closed { .. }));
        assert_eq!(harness.removal.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_removal_exhaustion_leaves_position_open() {
        let harness = Harness::new();
        pending(&harness, "Pos1");
        *harness.removal.always_fail.lock() = true;

        let outcome = harness
            .executor()
            .try_execute("Pos1", -5, 5, ExitBudget::Primary)
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::RemovalFailed);
        assert_eq!(harness.removal.calls.load(Ordering::SeqCst), 5);

        let rec = harness.store.ledger.get("Pos1").unwrap();
        assert!(!rec.is_closed());
        assert!(rec.remove_failed);
        assert_eq!(rec.state, PositionState::Active);
        assert!(harness.inflight.is_empty());
        assert_eq!(harness.swap.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_budget() {
        let harness = Harness::new();
        pending(&harness, "Pos1");
        *harness.removal.always_fail.lock() = true;

        harness
            .executor()
            .try_execute("Pos1", -5, 5, ExitBudget::Reconcile)
            .await
            .unwrap();
        assert_eq!(harness.removal.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_balance_never_settles() {
        let harness = Harness::new();
        pending(&harness, "Pos1");
        harness.chain.set_balance(BASE, 900);

        let outcome = harness
            .executor()
            .try_execute("Pos1", -5, 5, ExitBudget::Primary)
            .await
            .unwrap();

        match outcome {
            ExitOutcome::Closed { swap, .. } => assert_eq!(swap, SwapOutcome::BelowMinimum { balance: 900 }),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(harness.store.ledger.get("Pos1").unwrap().is_closed());
        assert_eq!(harness.swap.call_count(), 0);
        assert!(harness.store.swap_retries.is_empty());
    }

    #[tokio::test]
    async fn test_swap_failure_is_queued() {
        let harness = Harness::new();
        pending(&harness, "Pos1");
        harness.chain.set_balance(BASE, 80_000);
        *harness.swap.always_fail.lock() = true;

        let outcome = harness
            .executor()
            .try_execute("Pos1", -5, 5, ExitBudget::Primary)
            .await
            .unwrap();

        match outcome {
            ExitOutcome::Closed { swap, .. } => assert_eq!(swap, SwapOutcome::Deferred),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(harness.swap.call_count(), 3);
        assert!(harness.store.swap_retries.contains(BASE, OWNER));
        let rec = harness.store.ledger.get("Pos1").unwrap();
        assert!(rec.is_closed());
        assert!(!rec.swap_settled);
    }

    #[tokio::test]
    async fn test_swap_signature_validation() {
        let harness = Harness::new();
        let executor = harness.executor();
        let failed = signature(9).to_string();
        harness.chain.fail_tx(&failed, "InstructionError(2, Custom(6001))");
        harness.swap.results.lock().extend([
            Ok("not-a-signature".to_string()),
            Ok(failed),
            Ok(signature(10).to_string()),
        ]);

        let policy = RetryPolicy::new(3, std::time::Duration::ZERO);
        let accepted = executor.swap_with_retry(BASE, WSOL, 10_000, policy).await.unwrap();
        assert_eq!(accepted, signature(10).to_string());
        assert_eq!(harness.swap.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unwrap_failure_only_logged() {
        let harness = Harness::new();
        pending(&harness, "Pos1");
        harness.chain.set_balance(BASE, 80_000);
        harness.chain.set_balance(WSOL, 5_000);
        *harness.unwrap.fail.lock() = true;

        let outcome = harness
            .executor()
            .try_execute("Pos1", -5, 5, ExitBudget::Primary)
            .await
            .unwrap();
        match outcome {
            ExitOutcome::Closed { swap: SwapOutcome::Settled { unwrapped, .. }, .. } => assert!(!unwrapped),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(harness.unwrap.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_never_reenters_closed_or_in_flight() {
        let harness = Harness::new();
        pending(&harness, "Pos1");
        let executor = harness.executor();

        let guard = harness.inflight.try_acquire("Pos1").unwrap();
        let outcome = executor.try_execute("Pos1", -5, 5, ExitBudget::Primary).await.unwrap();
        assert_eq!(outcome, ExitOutcome::AlreadyInFlight);
        drop(guard);

        harness.store.ledger.update("Pos1", |r| r.mark_closed(Utc::now())).unwrap();
        let outcome = executor.try_execute("Pos1", -5, 5, ExitBudget::Primary).await.unwrap();
        assert_eq!(outcome, ExitOutcome::AlreadyClosed);
        assert_eq!(harness.removal.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quote_asset_needs_no_swap() {
        let harness = Harness::new();
        let mut rec = record("Pos1");
        rec.base_mint = WSOL.to_string();
        rec.mark_pending(ExitReason::ForceExit, Utc::now());
        harness.store.ledger.upsert(rec).unwrap();

        let outcome = harness
            .executor()
            .try_execute("Pos1", -5, 5, ExitBudget::Primary)
            .await
            .unwrap();
        match outcome {
            ExitOutcome::Closed { swap, .. } => assert_eq!(swap, SwapOutcome::NotNeeded),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(harness.store.ledger.get("Pos1").unwrap().swap_settled);
    }
}
