//! Position monitor: the primary valuation and trigger loop.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use smallvec::{smallvec, SmallVec};
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::executor::{ExitBudget, ExitExecutor, ExitOutcome};
use crate::inflight::InFlightSet;
use crate::position::{PoolPositions, PositionRecord, RawPosition};
use crate::retry::poll_until;
use crate::services::Services;
use crate::store::StateStore;
use crate::trigger::{TriggerConfig, TriggerEvaluator};
use crate::valuation::{price_or_zero, value_position};

/// Counters for one monitor cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub pools: usize,
    pub positions: usize,
    pub skipped: usize,
    pub exits: usize,
}

impl CycleStats {
    fn merge(&mut self, other: CycleStats) {
        self.pools += other.pools;
        self.positions += other.positions;
        self.skipped += other.skipped;
        self.exits += other.exits;
    }
}

pub struct PositionMonitor {
    services: Services,
    store: StateStore,
    inflight: InFlightSet,
    executor: Arc<ExitExecutor>,
    evaluator: TriggerEvaluator,
    config: Arc<EngineConfig>,
}

impl std::fmt::Debug for PositionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionMonitor")
            .field("pools", &self.config.pools)
            .field("owner", &self.executor.owner())
            .finish_non_exhaustive()
    }
}

impl PositionMonitor {
    pub fn new(
        services: Services,
        store: StateStore,
        inflight: InFlightSet,
        executor: Arc<ExitExecutor>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let evaluator = TriggerEvaluator::new(TriggerConfig::from(&config.exit));
        Self {
            services,
            store,
            inflight,
            executor,
            evaluator,
            config,
        }
    }

    /// Run cycles forever.
    pub async fn run(&self) {
        info!(
            pools = self.config.pools.len(),
            interval_secs = self.config.schedule.monitor_interval_secs,
            "Starting position monitor"
        );
        let mut ticker = interval(self.config.schedule.monitor_interval());
        loop {
            ticker.tick().await;
            let stats = self.run_cycle().await;
            debug!(
                pools = stats.pools,
                positions = stats.positions,
                skipped = stats.skipped,
                exits = stats.exits,
                "Monitor cycle complete"
            );
        }
    }

    /// Check every configured pool once. Pools are checked concurrently.
    pub async fn run_cycle(&self) -> CycleStats {
        if let Err(e) = self.store.force_exits.refresh() {
            warn!(error = %format!("{:#}", e), "Could not read force exit requests");
        }
        let results = join_all(self.config.pools.iter().map(|pool| self.check_pool(pool))).await;

        let mut stats = CycleStats::default();
        for (pool, result) in self.config.pools.iter().zip(results) {
            match result {
                Ok(pool_stats) => stats.merge(pool_stats),
                Err(e) => error!(pool = %pool, error = %format!("{:#}", e), "Pool check failed"),
            }
        }
        stats
    }

    /// List, value and evaluate every position of one pool.
    #[instrument(skip(self))]
    pub async fn check_pool(&self, pool: &str) -> Result<CycleStats> {
        let mut stats = CycleStats::default();
        let owner = self.executor.owner();

        let Some(listing) = self.list_with_poll(owner, pool).await else {
            debug!("No positions, pool idle this cycle");
            return Ok(stats);
        };
        stats.pools = 1;

        let mints: SmallVec<[String; 2]> = smallvec![listing.token_x.mint.clone(), listing.token_y.mint.clone()];
        let prices = match self.services.prices.prices_usd(&mints).await {
            Ok(prices) => prices,
            Err(e) => {
                warn!(error = %e, "Price lookup failed, skipping pool this cycle");
                return Ok(stats);
            }
        };
        let price_x = price_or_zero(&prices, &listing.token_x.mint);
        let price_y = price_or_zero(&prices, &listing.token_y.mint);
        let pool_name = self.services.positions.pool_name(pool).await;

        for raw in &listing.positions {
            stats.positions += 1;
            match self.check_position(&listing, raw, price_x, price_y, &pool_name).await {
                Ok(Some(outcome)) => {
                    stats.exits += 1;
                    debug!(position = %raw.position_id, outcome = ?outcome, "Exit finished");
                }
                Ok(None) => {}
                Err(e) => {
                    stats.skipped += 1;
                    error!(position = %raw.position_id, error = %format!("{:#}", e), "Position check failed");
                }
            }
        }
        Ok(stats)
    }

    /// Poll the listing until positions appear.
    async fn list_with_poll(&self, owner: &str, pool: &str) -> Option<PoolPositions> {
        let (listing, found) = poll_until(
            "positions",
            self.config.schedule.position_poll_attempts,
            self.config.schedule.position_poll_interval(),
            || self.services.positions.list_positions(owner, pool),
            |listing: &PoolPositions| !listing.positions.is_empty(),
        )
        .await;
        if found {
            listing
        } else {
            None
        }
    }

    /// Returns the exit outcome when a trigger fired.
    async fn check_position(
        &self,
        listing: &PoolPositions,
        raw: &RawPosition,
        price_x: f64,
        price_y: f64,
        pool_name: &str,
    ) -> Result<Option<ExitOutcome>> {
        let id = raw.position_id.as_str();
        let Some(guard) = self.inflight.try_acquire(id) else {
            debug!(position = %id, "In flight, skipping");
            return Ok(None);
        };

        let now = Utc::now();
        let mut record = self
            .store
            .ledger
            .get_or_insert(id, || self.new_record(listing, id, now))?;
        if record.is_closed() {
            debug!(position = %id, "Already closed, skipping");
            return Ok(None);
        }

        let snapshot = value_position(raw, listing.active_bin_id, price_x, price_y);
        if record.start_value_usd.is_none() && snapshot.current_value_usd > 0.0 {
            record.set_baseline(snapshot.current_value_usd);
            self.store.ledger.update(id, |r| r.set_baseline(snapshot.current_value_usd))?;
            info!(position = %id, value = format!("{:.2}", snapshot.current_value_usd), "Baseline recorded");
        }
        record.touch(now);

        let forced = self.store.force_exits.contains(id);
        let cooling = record.in_cooldown(now) || self.store.cooldowns.is_cooling(&record.base_mint, now);
        if cooling && !forced {
            self.store.ledger.upsert(record)?;
            debug!(position = %id, "In cooldown, skipping");
            return Ok(None);
        }

        let start = record.start_value_usd.unwrap_or(snapshot.current_value_usd);
        info!(
            pool = %pool_name,
            position = %id,
            in_range = ?snapshot.in_range,
            value = format!("{:.2}", snapshot.current_value_usd),
            profit_usd = format!("{:.2}", snapshot.profit_usd(start)),
            profit_pct = format!("{:.2}", snapshot.profit_pct(start)),
            fees = format!("{:.2}", snapshot.fee_value_usd),
            il_pct = format!("{:.2}", snapshot.impermanent_loss_pct),
            "Position PnL"
        );

        let event = self.evaluator.evaluate(&mut record, &snapshot, forced, now);
        self.store.ledger.upsert(record.clone())?;

        let Some(event) = event else {
            return Ok(None);
        };

        if let Some(until) = event.cooldown_until {
            self.store.cooldowns.set(&record.base_mint, until)?;
        }
        if forced {
            self.store.force_exits.take(id)?;
        }

        let outcome = self
            .executor
            .run(&guard, raw.lower_bin_id, raw.upper_bin_id, ExitBudget::Primary)
            .await?;
        Ok(Some(outcome))
    }

    fn new_record(&self, listing: &PoolPositions, position_id: &str, now: DateTime<Utc>) -> PositionRecord {
        let quote = &self.config.executor.quote_mint;
        let base = if &listing.token_x.mint == quote {
            &listing.token_y.mint
        } else {
            &listing.token_x.mint
        };
        PositionRecord::new(
            position_id,
            listing.pool.clone(),
            self.executor.owner(),
            base.clone(),
            quote.clone(),
            self.config.exit.policy(),
            now,
        )
    }
}
