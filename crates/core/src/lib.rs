//! Position exit engine core.
//!
//! This crate provides the exit engine for Meteora DLMM positions:
//! - Position valuation and PnL
//! - Exit triggers (take profit, stop loss, trailing stop, range timeout, forced)
//! - Exit execution: remove liquidity, convert, unwrap
//! - Durable JSON state with atomic writes
//! - Reconciliation and swap retry sweeps
//!
//! Network services are reached through the traits in [`services`].

mod adapters;
pub mod config;
mod error;
mod executor;
mod inflight;
mod monitor;
mod position;
mod reconciler;
mod retry;
pub mod services;
pub mod store;
mod swap_retry;
mod trigger;
mod valuation;

#[cfg(test)]
mod testing;

pub use adapters::{normalize_positions, UltraSwapper};
pub use config::EngineConfig;
pub use error::StepError;
pub use executor::{ExitBudget, ExitExecutor, ExitOutcome, SwapOutcome};
pub use inflight::{InFlightGuard, InFlightSet};
pub use monitor::{CycleStats, PositionMonitor};
pub use position::{ExitPolicy, ExitReason, PoolPositions, PositionRecord, PositionState, RawPosition, TokenInfo};
pub use reconciler::{ReconcileStats, Reconciler};
pub use retry::{poll_until, retry, RetryPolicy};
pub use services::Services;
pub use store::StateStore;
pub use swap_retry::{SwapRetrySweep, SweepStats, WsolSweep};
pub use trigger::{TriggerConfig, TriggerEvaluator, TriggerEvent};
pub use valuation::{price_or_zero, value_position, PnlSnapshot};
