//! Periodic reconciliation of the ledger against the chain.
//!
//! Picks up whatever the monitor could not finish: removals that exhausted
//! their budget or were interrupted by a restart, positions closed outside
//! the engine, and closed positions whose released balance was never
//! converted.

use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::executor::{ExitBudget, ExitExecutor, ExitOutcome};
use crate::inflight::InFlightSet;
use crate::position::{PoolPositions, PositionRecord};
use crate::retry::{poll_until, RetryPolicy};
use crate::services::Services;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub collected: usize,
    pub closed_externally: usize,
    pub removals_retried: usize,
    pub removals_completed: usize,
    pub swaps: usize,
    pub settled_without_swap: usize,
}

pub struct Reconciler {
    services: Services,
    store: StateStore,
    inflight: InFlightSet,
    executor: Arc<ExitExecutor>,
    config: Arc<EngineConfig>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("owner", &self.executor.owner())
            .field("interval_secs", &self.config.schedule.reconcile_interval_secs)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        services: Services,
        store: StateStore,
        inflight: InFlightSet,
        executor: Arc<ExitExecutor>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            services,
            store,
            inflight,
            executor,
            config,
        }
    }

    pub async fn run(&self) {
        info!(
            interval_secs = self.config.schedule.reconcile_interval_secs,
            "Starting reconciliation"
        );
        let mut ticker = interval(self.config.schedule.reconcile_interval());
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(stats) if stats != ReconcileStats::default() => info!(?stats, "Reconciliation pass complete"),
                Ok(_) => debug!("Reconciliation pass: nothing to do"),
                Err(e) => error!(error = %format!("{:#}", e), "Reconciliation pass failed"),
            }
        }
    }

    pub async fn run_once(&self) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let now = Utc::now();

        stats.collected = self.store.ledger.gc(now - self.config.reconcile.retention())?;
        let pruned = self.store.cooldowns.prune(now)?;
        if stats.collected > 0 || pruned > 0 {
            debug!(records = stats.collected, cooldowns = pruned, "Expired state collected");
        }

        self.reconcile_open(&mut stats).await?;
        self.settle_closed(&mut stats).await?;
        Ok(stats)
    }

    /// Compare open records with the live listing of their pool.
    async fn reconcile_open(&self, stats: &mut ReconcileStats) -> Result<()> {
        let owner = self.executor.owner();
        let mut by_pool: BTreeMap<String, Vec<PositionRecord>> = BTreeMap::new();
        for record in self.store.ledger.open_records() {
            if record.owner_id == owner {
                by_pool.entry(record.pool_id.clone()).or_default().push(record);
            }
        }

        for (pool, records) in by_pool {
            let Some(listing) = self.list(owner, &pool).await else {
                continue;
            };

            for record in records {
                let id = record.position_id.as_str();
                let Some(guard) = self.inflight.try_acquire(id) else {
                    continue;
                };

                let Some(raw) = listing.find(id) else {
                    let closed = self.store.ledger.update(id, |r| r.mark_closed(Utc::now()))?;
                    if closed == Some(true) {
                        stats.closed_externally += 1;
                        info!(position = %id, pool = %pool, "Position gone from chain, marked closed");
                    }
                    continue;
                };

                if !record.needs_removal() {
                    continue;
                }

                stats.removals_retried += 1;
                info!(
                    position = %id,
                    remove_failed = record.remove_failed,
                    pending = record.is_pending_exit(),
                    "Retrying removal"
                );
                let outcome = self
                    .executor
                    .run(&guard, raw.lower_bin_id, raw.upper_bin_id, ExitBudget::Reconcile)
                    .await?;
                if matches!(outcome, ExitOutcome::Closed { .. }) {
                    stats.removals_completed += 1;
                }
            }
        }
        Ok(())
    }

    /// One listing per pool. Only a successful listing counts; after the
    /// usual polls an empty one means the owner has no positions left.
    async fn list(&self, owner: &str, pool: &str) -> Option<PoolPositions> {
        let (listing, _) = poll_until(
            "positions",
            self.config.schedule.position_poll_attempts,
            self.config.schedule.position_poll_interval(),
            || self.services.positions.list_positions(owner, pool),
            |listing: &PoolPositions| !listing.positions.is_empty(),
        )
        .await;
        if listing.is_none() {
            warn!(pool = %pool, "Listing unavailable, skipping pool");
        }
        listing
    }

    /// Convert leftover balances of closed positions.
    async fn settle_closed(&self, stats: &mut ReconcileStats) -> Result<()> {
        let owner = self.executor.owner();
        let quote = self.config.executor.quote_mint.clone();
        let cutoff = Utc::now() - self.config.reconcile.retention();

        let candidates: Vec<PositionRecord> = self
            .store
            .ledger
            .all()
            .into_iter()
            .filter(|r| r.is_closed() && !r.swap_settled && r.owner_id == owner)
            .filter(|r| r.closed_at().is_some_and(|at| at >= cutoff))
            .collect();

        for record in candidates {
            let id = record.position_id.as_str();
            if self.store.swap_retries.contains(&record.base_mint, owner) {
                continue;
            }
            let Some(_guard) = self.inflight.try_acquire(id) else {
                continue;
            };
            // An earlier record with the same asset may have settled it already.
            if self.store.ledger.get(id).map_or(true, |r| r.swap_settled) {
                continue;
            }

            if record.base_mint == quote {
                self.store.ledger.mark_settled(&record.base_mint, owner)?;
                continue;
            }

            let min = self.config.reconcile.min_balance;
            let (balance, found) = poll_until(
                "leftover balance",
                self.config.reconcile.balance_polls,
                self.config.reconcile.balance_poll_interval(),
                || self.services.chain.token_balance(owner, &record.base_mint),
                |balance: &u64| *balance > min,
            )
            .await;

            let Some(balance) = balance else {
                // Every read failed; try again next pass.
                continue;
            };
            if !found {
                self.store.ledger.update(id, |r| r.swap_settled = true)?;
                stats.settled_without_swap += 1;
                debug!(position = %id, balance, "Leftover below minimum, nothing to convert");
                continue;
            }

            let policy = RetryPolicy::new(1, self.config.executor.swap_retry_delay());
            match self
                .executor
                .swap_with_retry(&record.base_mint, &quote, balance, policy)
                .await
            {
                Ok(signature) => {
                    self.store.ledger.mark_settled(&record.base_mint, owner)?;
                    stats.swaps += 1;
                    info!(position = %id, signature = %signature, amount = balance, "Leftover converted");
                    if self.config.executor.quote_is_wrapped_sol() {
                        self.executor.unwrap_proceeds().await;
                    }
                }
                Err(e) => warn!(position = %id, error = %e, "Leftover swap failed, will retry next pass"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::ExitReason;
    use crate::testing::{pool_listing, raw_position, record, Harness, BASE, OWNER, WSOL};
    use std::sync::atomic::Ordering;

    fn reconciler(harness: &Harness) -> Reconciler {
        Reconciler::new(
            harness.services.clone(),
            harness.store.clone(),
            harness.inflight.clone(),
            harness.executor(),
            harness.config.clone(),
        )
    }

    #[tokio::test]
    async fn test_retries_failed_removal_with_reconcile_budget() {
        let harness = Harness::new();
        let mut rec = record("Pos1");
        rec.mark_pending(ExitReason::StopLoss, Utc::now());
        rec.fail_removal();
        harness.store.ledger.upsert(rec).unwrap();
        harness.positions.set(pool_listing(Some(0), vec![raw_position("Pos1", 10.0, 0.1)]));
        harness.removal.failures.store(2, Ordering::SeqCst);

        let stats = reconciler(&harness).run_once().await.unwrap();
        assert_eq!(stats.removals_retried, 1);
        assert_eq!(stats.removals_completed, 1);
        assert_eq!(harness.removal.calls.load(Ordering::SeqCst), 3);

        let rec = harness.store.ledger.get("Pos1").unwrap();
        assert!(rec.is_closed());
        assert!(!rec.remove_failed);
    }

    #[tokio::test]
    async fn test_resumes_interrupted_exit() {
        let harness = Harness::new();
        let mut rec = record("Pos1");
        rec.mark_pending(ExitReason::OutOfRangeTimeout, Utc::now());
        harness.store.ledger.upsert(rec).unwrap();
        harness.positions.set(pool_listing(Some(0), vec![raw_position("Pos1", 10.0, 0.1)]));

        let stats = reconciler(&harness).run_once().await.unwrap();
        assert_eq!(stats.removals_completed, 1);
        assert!(harness.store.ledger.get("Pos1").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_healthy_open_position_untouched() {
        let harness = Harness::new();
        harness.store.ledger.upsert(record("Pos1")).unwrap();
        harness.positions.set(pool_listing(Some(0), vec![raw_position("Pos1", 10.0, 0.1)]));

        let stats = reconciler(&harness).run_once().await.unwrap();
        assert_eq!(stats, ReconcileStats::default());
        assert_eq!(harness.removal.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_marks_externally_closed() {
        let harness = Harness::new();
        harness.store.ledger.upsert(record("Gone")).unwrap();
        harness.store.ledger.upsert(record("Still")).unwrap();
        harness.positions.set(pool_listing(Some(0), vec![raw_position("Still", 10.0, 0.1)]));

        let stats = reconciler(&harness).run_once().await.unwrap();
        assert_eq!(stats.closed_externally, 1);
        assert!(harness.store.ledger.get("Gone").unwrap().is_closed());
        assert!(!harness.store.ledger.get("Still").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_failed_listing_closes_nothing() {
        let harness = Harness::new();
        harness.store.ledger.upsert(record("Pos1")).unwrap();
        harness.positions.set_error("bridge down");

        let stats = reconciler(&harness).run_once().await.unwrap();
        assert_eq!(stats.closed_externally, 0);
        assert!(!harness.store.ledger.get("Pos1").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_skips_in_flight() {
        let harness = Harness::new();
        let mut rec = record("Pos1");
        rec.fail_removal();
        harness.store.ledger.upsert(rec).unwrap();
        harness.positions.set(pool_listing(Some(0), vec![raw_position("Pos1", 10.0, 0.1)]));

        let _guard = harness.inflight.try_acquire("Pos1").unwrap();
        let stats = reconciler(&harness).run_once().await.unwrap();
        assert_eq!(stats.removals_retried, 0);
        assert_eq!(harness.removal.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_converts_leftover_balance() {
        let harness = Harness::new();
        let mut rec = record("Pos1");
        rec.mark_closed(Utc::now());
        harness.store.ledger.upsert(rec).unwrap();
        harness.chain.set_balance(BASE, 40_000);

        let stats = reconciler(&harness).run_once().await.unwrap();
        assert_eq!(stats.swaps, 1);
        assert_eq!(harness.swap.call_count(), 1);
        assert!(harness.store.ledger.get("Pos1").unwrap().swap_settled);

        // Settled records are not swapped again
        let stats = reconciler(&harness).run_once().await.unwrap();
        assert_eq!(stats.swaps, 0);
        assert_eq!(harness.swap.call_count(), 1);
    }

    #[tokio::test]
    async fn test_small_leftover_settles_without_swap() {
        let harness = Harness::new();
        let mut rec = record("Pos1");
        rec.mark_closed(Utc::now());
        harness.store.ledger.upsert(rec).unwrap();
        harness.chain.set_balance(BASE, 9_000);

        let stats = reconciler(&harness).run_once().await.unwrap();
        assert_eq!(stats.settled_without_swap, 1);
        assert_eq!(harness.swap.call_count(), 0);
        assert!(harness.store.ledger.get("Pos1").unwrap().swap_settled);
    }

    #[tokio::test]
    async fn test_queued_asset_left_to_sweep() {
        let harness = Harness::new();
        let mut rec = record("Pos1");
        rec.mark_closed(Utc::now());
        harness.store.ledger.upsert(rec).unwrap();
        harness.store.swap_retries.track(BASE, OWNER, Utc::now()).unwrap();
        harness.chain.set_balance(BASE, 40_000);

        reconciler(&harness).run_once().await.unwrap();
        assert_eq!(harness.swap.call_count(), 0);
        assert!(!harness.store.ledger.get("Pos1").unwrap().swap_settled);
    }

    #[tokio::test]
    async fn test_garbage_collects_old_closed() {
        let harness = Harness::new();
        let mut rec = record("Old");
        rec.mark_closed(Utc::now() - chrono::Duration::hours(25));
        harness.store.ledger.upsert(rec).unwrap();
        harness.store.cooldowns.set(WSOL, Utc::now() - chrono::Duration::minutes(1)).unwrap();

        let stats = reconciler(&harness).run_once().await.unwrap();
        assert_eq!(stats.collected, 1);
        assert!(harness.store.ledger.is_empty());
        assert!(harness.store.cooldowns.is_empty());
    }
}
