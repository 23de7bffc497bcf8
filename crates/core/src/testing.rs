//! In-memory collaborators for tests.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::executor::ExitExecutor;
use crate::inflight::InFlightSet;
use crate::position::{ExitPolicy, PoolPositions, PositionRecord, RawPosition, TokenInfo};
use crate::services::{
    ChainReader, PositionSource, PriceOracle, RemovalBuilder, RemovalRequest, Services, SwapService,
    TransactionSubmitter, UnwrapService,
};
use crate::store::StateStore;

pub const OWNER: &str = "Owner111111111111111111111111111111111111111";
pub const POOL: &str = "Pool111111111111111111111111111111111111111";
pub const BASE: &str = "Base111111111111111111111111111111111111111";
pub const WSOL: &str = lpexit_chain::WSOL_MINT;

pub fn signature(n: u8) -> Signature {
    Signature::from([n; 64])
}

pub fn raw_position(id: &str, amount_x: f64, amount_y: f64) -> RawPosition {
    RawPosition {
        position_id: id.to_string(),
        amount_x,
        amount_y,
        fee_x: 0.0,
        fee_y: 0.0,
        lower_bin_id: -5,
        upper_bin_id: 5,
    }
}

pub fn pool_listing(active_bin_id: Option<i32>, positions: Vec<RawPosition>) -> PoolPositions {
    PoolPositions {
        pool: POOL.to_string(),
        token_x: TokenInfo {
            mint: BASE.to_string(),
            decimals: 6,
        },
        token_y: TokenInfo {
            mint: WSOL.to_string(),
            decimals: 9,
        },
        active_bin_id,
        positions,
    }
}

pub fn record(id: &str) -> PositionRecord {
    PositionRecord::new(
        id,
        POOL,
        OWNER,
        BASE,
        WSOL,
        ExitPolicy {
            take_profit_pct: 10.0,
            stop_loss_pct: -5.0,
            trailing_offset_pct: None,
        },
        chrono::Utc::now(),
    )
}

#[derive(Debug, Default)]
pub struct MockPositions {
    /// Listings returned in order; the last one repeats
    pub listings: Mutex<VecDeque<Result<PoolPositions, String>>>,
    pub calls: AtomicU32,
}

impl MockPositions {
    pub fn set(&self, listing: PoolPositions) {
        let mut listings = self.listings.lock();
        listings.clear();
        listings.push_back(Ok(listing));
    }

    pub fn set_error(&self, error: &str) {
        let mut listings = self.listings.lock();
        listings.clear();
        listings.push_back(Err(error.to_string()));
    }

    pub fn push(&self, listing: Result<PoolPositions, String>) {
        self.listings.lock().push_back(listing);
    }
}

#[async_trait]
impl PositionSource for MockPositions {
    async fn list_positions(&self, _owner: &str, _pool: &str) -> Result<PoolPositions> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut listings = self.listings.lock();
        let next = if listings.len() > 1 {
            listings.pop_front()
        } else {
            listings.front().cloned()
        };
        match next {
            Some(Ok(listing)) => Ok(listing),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(pool_listing(Some(0), Vec::new())),
        }
    }

    async fn pool_name(&self, _pool: &str) -> String {
        "BASE-SOL".to_string()
    }
}

#[derive(Debug, Default)]
pub struct MockPrices {
    pub prices: Mutex<HashMap<String, f64>>,
    pub fail: Mutex<bool>,
}

impl MockPrices {
    pub fn set(&self, mint: &str, price: f64) {
        self.prices.lock().insert(mint.to_string(), price);
    }
}

#[async_trait]
impl PriceOracle for MockPrices {
    async fn prices_usd(&self, mints: &[String]) -> Result<HashMap<String, f64>> {
        if *self.fail.lock() {
            anyhow::bail!("price API down");
        }
        let prices = self.prices.lock();
        Ok(mints
            .iter()
            .filter_map(|m| prices.get(m).map(|p| (m.clone(), *p)))
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MockRemoval {
    /// Builds that fail before the first success
    pub failures: AtomicU32,
    pub always_fail: Mutex<bool>,
    pub calls: AtomicU32,
    pub requests: Mutex<Vec<RemovalRequest>>,
}

#[async_trait]
impl RemovalBuilder for MockRemoval {
    async fn build_removal(&self, request: &RemovalRequest) -> Result<Vec<Vec<Instruction>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if *self.always_fail.lock() {
            anyhow::bail!("bridge unavailable");
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("blockhash expired");
        }
        let ix = Instruction::new_with_bytes(Pubkey::new_unique(), &[1], Vec::new());
        Ok(vec![vec![ix]])
    }
}

#[derive(Debug, Default)]
pub struct MockSubmitter {
    pub calls: AtomicU32,
}

#[async_trait]
impl TransactionSubmitter for MockSubmitter {
    async fn submit(&self, _instructions: Vec<Instruction>) -> Result<Signature> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(signature(n as u8 + 1))
    }
}

#[derive(Debug, Default)]
pub struct MockSwap {
    /// Results returned in order; an empty queue succeeds
    pub results: Mutex<VecDeque<Result<String, String>>>,
    pub always_fail: Mutex<bool>,
    pub calls: Mutex<Vec<(String, String, u64)>>,
}

impl MockSwap {
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl SwapService for MockSwap {
    async fn swap(&self, input_mint: &str, output_mint: &str, amount: u64) -> Result<String> {
        self.calls
            .lock()
            .push((input_mint.to_string(), output_mint.to_string(), amount));
        if *self.always_fail.lock() {
            anyhow::bail!("no route");
        }
        match self.results.lock().pop_front() {
            Some(Ok(sig)) => Ok(sig),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(signature(200).to_string()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MockUnwrap {
    pub calls: AtomicU32,
    pub fail: Mutex<bool>,
}

#[async_trait]
impl UnwrapService for MockUnwrap {
    async fn unwrap(&self, _owner: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock() {
            anyhow::bail!("close account failed");
        }
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct MockChain {
    /// Balance readings per mint; the last one repeats
    pub balances: Mutex<HashMap<String, VecDeque<u64>>>,
    pub failed_txs: Mutex<HashMap<String, String>>,
    pub unreadable: Mutex<HashSet<String>>,
    pub reads: AtomicU32,
}

impl MockChain {
    pub fn set_balance(&self, mint: &str, balance: u64) {
        self.balances.lock().insert(mint.to_string(), VecDeque::from([balance]));
    }

    pub fn script_balance(&self, mint: &str, readings: &[u64]) {
        self.balances
            .lock()
            .insert(mint.to_string(), readings.iter().copied().collect());
    }

    pub fn fail_tx(&self, signature: &str, reason: &str) {
        self.failed_txs
            .lock()
            .insert(signature.to_string(), reason.to_string());
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn token_balance(&self, _owner: &str, mint: &str) -> Result<u64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.unreadable.lock().contains(mint) {
            anyhow::bail!("rpc timeout");
        }
        let mut balances = self.balances.lock();
        let Some(readings) = balances.get_mut(mint) else {
            return Ok(0);
        };
        let value = if readings.len() > 1 {
            readings.pop_front()
        } else {
            readings.front().copied()
        };
        Ok(value.unwrap_or(0))
    }

    async fn transaction_error(&self, signature: &str) -> Result<Option<String>> {
        Ok(self.failed_txs.lock().get(signature).cloned())
    }
}

/// Engine wiring over mocks and a temporary data directory.
pub struct Harness {
    pub positions: Arc<MockPositions>,
    pub prices: Arc<MockPrices>,
    pub removal: Arc<MockRemoval>,
    pub submitter: Arc<MockSubmitter>,
    pub swap: Arc<MockSwap>,
    pub unwrap: Arc<MockUnwrap>,
    pub chain: Arc<MockChain>,
    pub services: Services,
    pub store: StateStore,
    pub inflight: InFlightSet,
    pub config: Arc<EngineConfig>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = EngineConfig::testing();
        config.pools = vec![POOL.to_string()];
        Self::with_config(config)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let positions = Arc::new(MockPositions::default());
        let prices = Arc::new(MockPrices::default());
        let removal = Arc::new(MockRemoval::default());
        let submitter = Arc::new(MockSubmitter::default());
        let swap = Arc::new(MockSwap::default());
        let unwrap = Arc::new(MockUnwrap::default());
        let chain = Arc::new(MockChain::default());

        let services = Services {
            positions: positions.clone(),
            prices: prices.clone(),
            removal: removal.clone(),
            submitter: submitter.clone(),
            swap: swap.clone(),
            unwrap: unwrap.clone(),
            chain: chain.clone(),
        };

        Self {
            positions,
            prices,
            removal,
            submitter,
            swap,
            unwrap,
            chain,
            services,
            store: StateStore::open(dir.path()).unwrap(),
            inflight: InFlightSet::new(),
            config: Arc::new(config),
            _dir: dir,
        }
    }

    pub fn data_dir(&self) -> &std::path::Path {
        self._dir.path()
    }

    pub fn executor(&self) -> Arc<ExitExecutor> {
        Arc::new(ExitExecutor::new(
            self.services.clone(),
            self.store.clone(),
            self.inflight.clone(),
            self.config.executor.clone(),
            OWNER,
        ))
    }
}
