//! Background sweeps: queued swap retries and stray wrapped SOL.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::executor::ExitExecutor;
use crate::retry::RetryPolicy;
use crate::services::{Services, UnwrapService};
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub checked: usize,
    pub swapped: usize,
    pub deferred: usize,
    pub evicted: usize,
}

/// Retries conversions the executor gave up on.
pub struct SwapRetrySweep {
    services: Services,
    store: StateStore,
    executor: Arc<ExitExecutor>,
    config: Arc<EngineConfig>,
}

impl std::fmt::Debug for SwapRetrySweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapRetrySweep")
            .field("queued", &self.store.swap_retries.len())
            .finish_non_exhaustive()
    }
}

impl SwapRetrySweep {
    pub fn new(services: Services, store: StateStore, executor: Arc<ExitExecutor>, config: Arc<EngineConfig>) -> Self {
        Self {
            services,
            store,
            executor,
            config,
        }
    }

    pub async fn run(&self) {
        info!(
            interval_secs = self.config.schedule.swap_retry_interval_secs,
            "Starting swap retry sweep"
        );
        let mut ticker = interval(self.config.schedule.swap_retry_interval());
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(stats) if stats.checked > 0 => info!(?stats, "Swap retry sweep complete"),
                Ok(_) => {}
                Err(e) => error!(error = %format!("{:#}", e), "Swap retry sweep failed"),
            }
        }
    }

    pub async fn run_once(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let owner = self.executor.owner();
        let cfg = &self.config.swap_retry;
        let quote = &self.config.executor.quote_mint;

        for entry in self.store.swap_retries.entries() {
            if entry.owner_id != owner {
                continue;
            }
            stats.checked += 1;

            let balance = match self.services.chain.token_balance(owner, &entry.asset_id).await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!(asset = %entry.asset_id, error = %e, "Balance read failed, retrying next sweep");
                    continue;
                }
            };

            if balance < cfg.min_balance {
                let retries = self
                    .store
                    .swap_retries
                    .increment(&entry.asset_id, owner)?
                    .unwrap_or(cfg.max_retries);
                if retries >= cfg.max_retries {
                    self.store.swap_retries.remove(&entry.asset_id, owner)?;
                    self.store.ledger.mark_settled(&entry.asset_id, owner)?;
                    stats.evicted += 1;
                    info!(asset = %entry.asset_id, balance, retries, "Balance stayed below minimum, dropped from queue");
                } else {
                    stats.deferred += 1;
                    debug!(asset = %entry.asset_id, balance, retries, "Balance below minimum");
                }
                continue;
            }

            let policy = RetryPolicy::new(cfg.swap_attempts, cfg.retry_delay());
            match self
                .executor
                .swap_with_retry(&entry.asset_id, quote, balance, policy)
                .await
            {
                Ok(signature) => {
                    self.store.swap_retries.remove(&entry.asset_id, owner)?;
                    self.store.ledger.mark_settled(&entry.asset_id, owner)?;
                    stats.swapped += 1;
                    info!(asset = %entry.asset_id, amount = balance, signature = %signature, "Queued swap completed");
                }
                Err(e) => {
                    self.store.swap_retries.remove(&entry.asset_id, owner)?;
                    stats.evicted += 1;
                    warn!(asset = %entry.asset_id, error = %e, "Queued swap exhausted, dropped from queue");
                }
            }
        }
        Ok(stats)
    }
}

/// Unwraps any wrapped SOL the signer holds.
#[derive(Debug)]
pub struct WsolSweep {
    unwrap: Arc<dyn UnwrapService>,
    owner: String,
    interval: Duration,
}

impl WsolSweep {
    pub fn new(unwrap: Arc<dyn UnwrapService>, owner: impl Into<String>, interval: Duration) -> Self {
        Self {
            unwrap,
            owner: owner.into(),
            interval,
        }
    }

    pub async fn run(&self) {
        let mut ticker = interval(self.interval);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    pub async fn run_once(&self) -> bool {
        match self.unwrap.unwrap(&self.owner).await {
            Ok(true) => {
                info!("Unwrapped stray wrapped SOL");
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(error = %e, "Wrapped SOL sweep failed");
                false
            }
        }
    }
}
