//! HTTP API clients for external services.
//!
//! This crate provides HTTP clients for:
//! - DLMM bridge: position listing and removal instructions
//! - Meteora: pool metadata
//! - Jupiter: USD prices and Ultra swaps

mod dlmm;
mod jupiter;

pub use dlmm::{
    BridgePosition, BridgePositionData, DlmmBridgeClient, PairInfo, PoolPositionsResponse,
    RemoveLiquidityRequest, TokenMeta, DEFAULT_TOKEN_DECIMALS,
};
pub use jupiter::{
    decode_transaction, encode_transaction, JupiterPriceClient, JupiterUltraClient,
    UltraExecuteResponse, UltraOrder,
};
