//! Solana chain interaction layer.
//!
//! This crate provides:
//! - RPC provider for balances and signature status
//! - Priority fee (compute budget) handling
//! - Transaction signing and sending
//! - Wrapped SOL recovery

pub mod fee;
mod provider;
mod signer;
mod unwrap;

pub use fee::{with_priority_fee, PriorityLevel, DEFAULT_COMPUTE_UNIT_LIMIT};
pub use provider::ChainProvider;
pub use signer::{parse_keypair, TransactionSender, TransactionSenderBuilder};
pub use unwrap::{close_wsol_instruction, WsolUnwrapper};

/// Wrapped SOL mint.
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";
