//! External collaborators the engine drives.
//!
//! Each trait is a seam between the engine and a network service. The
//! production implementations live in [`crate::adapters`].

use anyhow::Result;
use async_trait::async_trait;
use solana_sdk::instruction::Instruction;
use solana_sdk::signature::Signature;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::position::PoolPositions;

/// Lists an owner's positions in a pool.
#[async_trait]
pub trait PositionSource: Send + Sync + Debug {
    /// Current positions with amounts in UI units.
    async fn list_positions(&self, owner: &str, pool: &str) -> Result<PoolPositions>;

    /// Human readable pool name, for logs.
    async fn pool_name(&self, pool: &str) -> String;
}

/// Asset to USD price lookup.
#[async_trait]
pub trait PriceOracle: Send + Sync + Debug {
    /// Prices for the given mints. Unpriced mints are absent.
    async fn prices_usd(&self, mints: &[String]) -> Result<HashMap<String, f64>>;
}

/// Full removal of one position: every bin, fees claimed, account closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalRequest {
    pub owner: String,
    pub pool: String,
    pub position: String,
    pub lower_bin_id: i32,
    pub upper_bin_id: i32,
}

/// Builds removal instructions.
#[async_trait]
pub trait RemovalBuilder: Send + Sync + Debug {
    /// One instruction list per transaction, in submission order.
    async fn build_removal(&self, request: &RemovalRequest) -> Result<Vec<Vec<Instruction>>>;
}

/// Signs, submits and confirms instruction lists.
#[async_trait]
pub trait TransactionSubmitter: Send + Sync + Debug {
    async fn submit(&self, instructions: Vec<Instruction>) -> Result<Signature>;
}

/// Converts one asset into another.
#[async_trait]
pub trait SwapService: Send + Sync + Debug {
    /// Swap `amount` raw units. Returns the transaction signature as reported
    /// by the service; the caller validates it.
    async fn swap(&self, input_mint: &str, output_mint: &str, amount: u64) -> Result<String>;
}

/// Turns wrapped SOL back into native SOL.
#[async_trait]
pub trait UnwrapService: Send + Sync + Debug {
    /// Returns false when the owner had nothing to unwrap.
    async fn unwrap(&self, owner: &str) -> Result<bool>;
}

/// Read-only chain queries.
#[async_trait]
pub trait ChainReader: Send + Sync + Debug {
    /// Token balance in raw units. Zero when the owner holds no account.
    async fn token_balance(&self, owner: &str, mint: &str) -> Result<u64>;

    /// The transaction's on-chain error, if it failed. None when it
    /// succeeded or is unknown to the node.
    async fn transaction_error(&self, signature: &str) -> Result<Option<String>>;
}

/// Handles to every collaborator.
#[derive(Debug, Clone)]
pub struct Services {
    pub positions: Arc<dyn PositionSource>,
    pub prices: Arc<dyn PriceOracle>,
    pub removal: Arc<dyn RemovalBuilder>,
    pub submitter: Arc<dyn TransactionSubmitter>,
    pub swap: Arc<dyn SwapService>,
    pub unwrap: Arc<dyn UnwrapService>,
    pub chain: Arc<dyn ChainReader>,
}
