//! DLMM Position Exit Engine
//!
//! Watches Meteora DLMM positions on Solana and exits them on take profit,
//! stop loss, trailing stop, range timeout or operator request.
//! Features:
//! - Removal, conversion to SOL and unwrap with bounded retries
//! - Durable JSON state surviving restarts
//! - Reconciliation and swap retry sweeps

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lpexit_api::{DlmmBridgeClient, JupiterPriceClient, JupiterUltraClient};
use lpexit_chain::{ChainProvider, TransactionSenderBuilder, WsolUnwrapper};
use lpexit_core::{
    EngineConfig, ExitExecutor, InFlightSet, PositionMonitor, Reconciler, Services, StateStore, SwapRetrySweep,
    UltraSwapper, WsolSweep,
};

/// Environment variable names.
mod env {
    pub const RPC_URL: &str = "RPC_URL";
    pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
    pub const DLMM_BRIDGE_URL: &str = "DLMM_BRIDGE_URL";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    // ENGINE_CONFIG selects a file, ENGINE_PROFILE a built-in profile
    let config = EngineConfig::from_env()?;
    config.validate()?;
    config.log_config();
    let config = Arc::new(config);

    info!("Starting DLMM Position Exit Engine");

    let endpoints = load_endpoints()?;
    let engine = initialize_components(endpoints, config.clone()).await?;

    let pending = engine.store.force_exits.pending();
    if !pending.is_empty() {
        warn!(positions = ?pending, "Force exit requests pending");
    }

    let monitor = engine.monitor.clone();
    tokio::spawn(async move { monitor.run().await });

    let reconciler = engine.reconciler.clone();
    tokio::spawn(async move { reconciler.run().await });

    let swap_sweep = engine.swap_sweep.clone();
    tokio::spawn(async move { swap_sweep.run().await });

    let wsol_sweep = engine.wsol_sweep.clone();
    tokio::spawn(async move { wsol_sweep.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, exiting");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lpexit_core=debug,lpexit_chain=debug"));
    let json = std::env::var(env::LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .with(filter)
        .init();
}

/// Endpoints and secrets loaded from environment.
struct Endpoints {
    rpc_url: String,
    bridge_url: String,
    private_key: String,
}

fn load_endpoints() -> Result<Endpoints> {
    let get_env = |name: &str| -> Result<String> {
        std::env::var(name).map_err(|_| anyhow::anyhow!("Missing env var: {}", name))
    };

    Ok(Endpoints {
        rpc_url: get_env(env::RPC_URL).unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string()),
        bridge_url: get_env(env::DLMM_BRIDGE_URL).unwrap_or_else(|_| "http://localhost:3000".to_string()),
        private_key: get_env(env::PRIVATE_KEY)?,
    })
}

struct Engine {
    store: StateStore,
    monitor: Arc<PositionMonitor>,
    reconciler: Arc<Reconciler>,
    swap_sweep: Arc<SwapRetrySweep>,
    wsol_sweep: Arc<WsolSweep>,
}

async fn initialize_components(endpoints: Endpoints, config: Arc<EngineConfig>) -> Result<Engine> {
    info!("Initializing components...");

    let provider = ChainProvider::connect(&endpoints.rpc_url).await?;
    info!(rpc = %provider.rpc_url(), "RPC connected");

    let sender = Arc::new(
        TransactionSenderBuilder::new(provider.rpc())
            .priority(config.executor.priority)
            .build(&endpoints.private_key)?,
    );
    let owner = sender.pubkey.to_string();
    info!(owner = %owner, priority = %sender.priority(), "Transaction sender initialized");

    let bridge = Arc::new(DlmmBridgeClient::new(endpoints.bridge_url.as_str()));
    let unwrapper = Arc::new(WsolUnwrapper::new(provider.clone(), sender.clone()));
    let services = Services {
        positions: bridge.clone(),
        prices: Arc::new(JupiterPriceClient::new()),
        removal: bridge,
        submitter: sender.clone(),
        swap: Arc::new(UltraSwapper::new(JupiterUltraClient::new(), sender.clone())),
        unwrap: unwrapper.clone(),
        chain: Arc::new(provider),
    };
    info!(bridge = %endpoints.bridge_url, "Services configured");

    let store = StateStore::open(&config.store.data_dir)?;
    let inflight = InFlightSet::new();

    let executor = Arc::new(ExitExecutor::new(
        services.clone(),
        store.clone(),
        inflight.clone(),
        config.executor.clone(),
        owner.clone(),
    ));

    let monitor = Arc::new(PositionMonitor::new(
        services.clone(),
        store.clone(),
        inflight.clone(),
        executor.clone(),
        config.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        services.clone(),
        store.clone(),
        inflight,
        executor.clone(),
        config.clone(),
    ));
    let swap_sweep = Arc::new(SwapRetrySweep::new(services, store.clone(), executor, config.clone()));
    let wsol_sweep = Arc::new(WsolSweep::new(
        unwrapper,
        owner,
        config.schedule.unwrap_sweep_interval(),
    ));

    info!("All components initialized");

    Ok(Engine {
        store,
        monitor,
        reconciler,
        swap_sweep,
        wsol_sweep,
    })
}
