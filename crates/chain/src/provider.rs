//! RPC provider for balance and signature status reads.
//! Wraps the nonblocking Solana `RpcClient`.

use anyhow::{Context, Result};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use spl_associated_token_account::get_associated_token_address;
use std::sync::Arc;
use tracing::{debug, info};

/// Read-side access to the chain.
#[derive(Clone)]
pub struct ChainProvider {
    rpc: Arc<RpcClient>,
    rpc_url: String,
}

impl ChainProvider {
    /// Create a provider at `confirmed` commitment.
    pub fn new(rpc_url: &str) -> Self {
        let rpc = RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed());
        Self {
            rpc: Arc::new(rpc),
            rpc_url: rpc_url.to_string(),
        }
    }

    /// Create a provider and verify the endpoint answers.
    pub async fn connect(rpc_url: &str) -> Result<Self> {
        let provider = Self::new(rpc_url);
        let slot = provider
            .rpc
            .get_slot()
            .await
            .with_context(|| format!("RPC endpoint {} unreachable", rpc_url))?;
        info!(rpc = rpc_url, slot = slot, "Provider connection verified");
        Ok(provider)
    }

    /// Shared RPC client handle.
    pub fn rpc(&self) -> Arc<RpcClient> {
        self.rpc.clone()
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Native SOL balance in lamports.
    pub async fn native_balance(&self, owner: &Pubkey) -> Result<u64> {
        let lamports = self
            .rpc
            .get_balance(owner)
            .await
            .context("get_balance")?;
        Ok(lamports)
    }

    /// SPL token balance in raw units.
    ///
    /// Reads the associated token account first. If it is missing (not yet
    /// created, or the mint lives under another token program) falls back to
    /// scanning every account the owner holds for the mint and returns the
    /// largest one.
    pub async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<u64> {
        let ata = get_associated_token_address(owner, mint);
        match self.rpc.get_token_account_balance(&ata).await {
            Ok(amount) => amount
                .amount
                .parse::<u64>()
                .with_context(|| format!("bad token amount {}", amount.amount)),
            Err(e) => {
                debug!(owner = %owner, mint = %mint, error = %e, "ATA read failed, scanning owner accounts");
                self.largest_token_account_balance(owner, mint).await
            }
        }
    }

    async fn largest_token_account_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<u64> {
        let accounts = self
            .rpc
            .get_token_accounts_by_owner(owner, TokenAccountsFilter::Mint(*mint))
            .await
            .context("get_token_accounts_by_owner")?;

        let mut max_balance = 0u64;
        for acc in accounts {
            let data = serde_json::to_value(&acc.account.data).context("serialize ui account data")?;
            let balance = parsed_token_amount(&data).unwrap_or(0);
            debug!(account = %acc.pubkey, balance = balance, "Token account");
            max_balance = max_balance.max(balance);
        }
        Ok(max_balance)
    }

    /// On-chain error for a landed transaction, if any.
    ///
    /// Returns `None` both for a successful transaction and for one the node
    /// does not (yet) know about.
    pub async fn transaction_error(&self, signature: &Signature) -> Result<Option<String>> {
        let status = self
            .rpc
            .get_signature_status_with_commitment(signature, CommitmentConfig::confirmed())
            .await
            .context("get_signature_status")?;

        Ok(match status {
            Some(Err(e)) => Some(e.to_string()),
            _ => None,
        })
    }

    /// Check if provider is healthy.
    pub async fn health_check(&self) -> Result<bool> {
        let slot = self.rpc.get_slot().await?;
        debug!(slot = slot, "Provider health check passed");
        Ok(slot > 0)
    }
}

impl std::fmt::Debug for ChainProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainProvider")
            .field("rpc_url", &self.rpc_url)
            .finish_non_exhaustive()
    }
}

/// Extract `parsed.info.tokenAmount.amount` from jsonParsed account data.
fn parsed_token_amount(data: &serde_json::Value) -> Option<u64> {
    data.get("parsed")?
        .get("info")?
        .get("tokenAmount")?
        .get("amount")?
        .as_str()?
        .parse()
        .ok()
}
