//! Production implementations of the collaborator traits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lpexit_api::{
    decode_transaction, encode_transaction, DlmmBridgeClient, JupiterPriceClient, JupiterUltraClient,
    PoolPositionsResponse, RemoveLiquidityRequest,
};
use lpexit_chain::{ChainProvider, TransactionSender, WsolUnwrapper};
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::position::{PoolPositions, RawPosition, TokenInfo};
use crate::services::{
    ChainReader, PositionSource, PriceOracle, RemovalBuilder, RemovalRequest, SwapService, TransactionSubmitter,
    UnwrapService,
};

fn to_ui(raw: u64, decimals: u8) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}

/// Convert a bridge listing into UI units.
pub fn normalize_positions(pool: &str, response: PoolPositionsResponse) -> PoolPositions {
    let token_x = TokenInfo {
        mint: response.token_x.mint,
        decimals: response.token_x.decimals,
    };
    let token_y = TokenInfo {
        mint: response.token_y.mint,
        decimals: response.token_y.decimals,
    };

    let positions = response
        .user_positions
        .into_iter()
        .map(|p| RawPosition {
            position_id: p.public_key,
            amount_x: to_ui(p.position_data.total_x_amount, token_x.decimals),
            amount_y: to_ui(p.position_data.total_y_amount, token_y.decimals),
            fee_x: to_ui(p.position_data.fee_x, token_x.decimals),
            fee_y: to_ui(p.position_data.fee_y, token_y.decimals),
            lower_bin_id: p.position_data.lower_bin_id,
            upper_bin_id: p.position_data.upper_bin_id,
        })
        .collect();

    PoolPositions {
        pool: pool.to_string(),
        token_x,
        token_y,
        active_bin_id: response.active_bin.map(|b| b.bin_id),
        positions,
    }
}

#[async_trait]
impl PositionSource for DlmmBridgeClient {
    async fn list_positions(&self, owner: &str, pool: &str) -> Result<PoolPositions> {
        let response = self.positions(owner, pool).await?;
        Ok(normalize_positions(pool, response))
    }

    async fn pool_name(&self, pool: &str) -> String {
        DlmmBridgeClient::pool_name(self, pool).await
    }
}

#[async_trait]
impl RemovalBuilder for DlmmBridgeClient {
    async fn build_removal(&self, request: &RemovalRequest) -> Result<Vec<Vec<Instruction>>> {
        let body = RemoveLiquidityRequest::full_exit(
            &request.owner,
            &request.pool,
            &request.position,
            request.lower_bin_id,
            request.upper_bin_id,
        );
        self.remove_liquidity(&body).await
    }
}

#[async_trait]
impl PriceOracle for JupiterPriceClient {
    async fn prices_usd(&self, mints: &[String]) -> Result<HashMap<String, f64>> {
        self.get_prices(mints).await
    }
}

#[async_trait]
impl TransactionSubmitter for TransactionSender {
    async fn submit(&self, instructions: Vec<Instruction>) -> Result<Signature> {
        self.send_instructions(instructions).await
    }
}

#[async_trait]
impl ChainReader for ChainProvider {
    async fn token_balance(&self, owner: &str, mint: &str) -> Result<u64> {
        let owner = Pubkey::from_str(owner).context("invalid owner")?;
        let mint = Pubkey::from_str(mint).context("invalid mint")?;
        ChainProvider::token_balance(self, &owner, &mint).await
    }

    async fn transaction_error(&self, signature: &str) -> Result<Option<String>> {
        let signature = Signature::from_str(signature).context("invalid signature")?;
        ChainProvider::transaction_error(self, &signature).await
    }
}

#[async_trait]
impl UnwrapService for WsolUnwrapper {
    async fn unwrap(&self, owner: &str) -> Result<bool> {
        let signer = self.owner().to_string();
        if owner != signer {
            anyhow::bail!("cannot unwrap for {}, signer is {}", owner, signer);
        }
        WsolUnwrapper::unwrap(self).await
    }
}

/// Swaps through Jupiter Ultra, signing with the engine's key.
#[derive(Debug, Clone)]
pub struct UltraSwapper {
    client: JupiterUltraClient,
    sender: Arc<TransactionSender>,
}

impl UltraSwapper {
    pub fn new(client: JupiterUltraClient, sender: Arc<TransactionSender>) -> Self {
        Self { client, sender }
    }
}

#[async_trait]
impl SwapService for UltraSwapper {
    #[instrument(skip(self))]
    async fn swap(&self, input_mint: &str, output_mint: &str, amount: u64) -> Result<String> {
        let taker = self.sender.pubkey.to_string();
        let order = self.client.order(input_mint, output_mint, amount, &taker).await?;
        let encoded = order.transaction.as_deref().context("order has no transaction")?;

        let signed = self.sender.sign_versioned(decode_transaction(encoded)?)?;
        let result = self
            .client
            .execute(encode_transaction(&signed)?, &order.request_id)
            .await?;

        let signature = result.signature.context("execute response without signature")?;
        debug!(signature = %signature, out_amount = ?order.out_amount, "Ultra swap executed");
        Ok(signature)
    }
}
