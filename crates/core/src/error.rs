//! Step-level failures the executor distinguishes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    /// The swap service returned something that is not a transaction signature.
    #[error("invalid transaction signature: {0:?}")]
    InvalidSignature(String),

    #[error("transaction {signature} failed on chain: {reason}")]
    OnChainFailure { signature: String, reason: String },

    #[error("{step} failed after {attempts} attempts: {last}")]
    Exhausted {
        step: &'static str,
        attempts: u32,
        last: String,
    },
}
