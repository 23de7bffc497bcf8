//! Meteora DLMM clients.
//!
//! Position listing and removal instructions come from a DLMM bridge, a thin
//! HTTP service wrapping the Meteora SDK. Pair metadata comes from the public
//! Meteora API. SDK versions disagree on field names for amounts and fees;
//! every known spelling is folded into one shape here so nothing downstream
//! has to care.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Decimals assumed when the bridge omits them.
pub const DEFAULT_TOKEN_DECIMALS: u8 = 6;

const METEORA_API: &str = "https://dlmm-api.meteora.ag";

/// DLMM bridge client.
#[derive(Clone)]
pub struct DlmmBridgeClient {
    client: reqwest::Client,
    base_url: String,
    meteora_url: String,
    /// Pool address -> pair name
    names: Arc<DashMap<String, String>>,
}

impl std::fmt::Debug for DlmmBridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlmmBridgeClient")
            .field("base_url", &self.base_url)
            .field("cached_names", &self.names.len())
            .finish()
    }
}

impl DlmmBridgeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            meteora_url: METEORA_API.to_string(),
            names: Arc::new(DashMap::new()),
        }
    }

    /// Override the Meteora metadata endpoint.
    pub fn with_meteora_url(mut self, url: impl Into<String>) -> Self {
        self.meteora_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// List the owner's positions in a pool together with the pool's active bin.
    #[instrument(skip(self))]
    pub async fn positions(&self, owner: &str, pool: &str) -> Result<PoolPositionsResponse> {
        let url = format!("{}/positions", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("owner", owner), ("pool", pool)])
            .send()
            .await
            .context("DLMM bridge unreachable")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("DLMM bridge error: {} - {}", status, body);
        }

        let parsed: PoolPositionsResponse = response.json().await.context("bad positions payload")?;
        debug!(
            pool = pool,
            positions = parsed.user_positions.len(),
            active_bin = ?parsed.active_bin.as_ref().map(|b| b.bin_id),
            "Fetched positions"
        );
        Ok(parsed)
    }

    /// Build the instructions removing 100% of a position, claiming fees and closing it.
    ///
    /// Wide positions may need several transactions; each inner vec is one.
    #[instrument(skip(self, request), fields(position = %request.position))]
    pub async fn remove_liquidity(&self, request: &RemoveLiquidityRequest) -> Result<Vec<Vec<Instruction>>> {
        let url = format!("{}/remove-liquidity", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .context("DLMM bridge unreachable")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("DLMM bridge error: {} - {}", status, body);
        }

        let parsed: RemoveLiquidityResponse = response.json().await.context("bad removal payload")?;
        parsed.into_instructions()
    }

    /// Human readable pair name ("SOL-USDC"), cached per pool.
    ///
    /// Falls back to "Unknown" when the metadata API does not answer.
    pub async fn pool_name(&self, pool: &str) -> String {
        if let Some(name) = self.names.get(pool) {
            return name.clone();
        }

        match self.fetch_pair(pool).await {
            Ok(pair) => {
                self.names.insert(pool.to_string(), pair.name.clone());
                pair.name
            }
            Err(e) => {
                debug!(pool = pool, error = %e, "Pair name lookup failed");
                "Unknown".to_string()
            }
        }
    }

    async fn fetch_pair(&self, pool: &str) -> Result<PairInfo> {
        let url = format!("{}/pair/{}", self.meteora_url, pool);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("Meteora API error: {}", response.status());
        }
        Ok(response.json().await?)
    }
}

/// Body of `POST /remove-liquidity`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveLiquidityRequest {
    pub owner: String,
    pub pool: String,
    pub position: String,
    pub from_bin_id: i32,
    pub to_bin_id: i32,
    /// Share to remove in basis points (10000 = everything)
    pub bps: u16,
    pub should_claim_and_close: bool,
}

impl RemoveLiquidityRequest {
    /// Full exit over the position's whole bin range.
    pub fn full_exit(owner: &str, pool: &str, position: &str, from_bin_id: i32, to_bin_id: i32) -> Self {
        Self {
            owner: owner.to_string(),
            pool: pool.to_string(),
            position: position.to_string(),
            from_bin_id,
            to_bin_id,
            bps: 10_000,
            should_claim_and_close: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoveLiquidityResponse {
    pub transactions: Vec<BridgeTransaction>,
}

#[derive(Debug, Deserialize)]
pub struct BridgeTransaction {
    pub instructions: Vec<BridgeInstruction>,
}

/// Serialized instruction, same layout as Jupiter's swap-instructions API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInstruction {
    pub program_id: String,
    pub accounts: Vec<BridgeAccountMeta>,
    /// Base64 instruction data
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeAccountMeta {
    pub pubkey: String,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl BridgeInstruction {
    pub fn to_instruction(&self) -> Result<Instruction> {
        let program_id = Pubkey::from_str(&self.program_id)
            .with_context(|| format!("bad program id {}", self.program_id))?;
        let accounts = self
            .accounts
            .iter()
            .map(|a| {
                let pubkey = Pubkey::from_str(&a.pubkey)
                    .with_context(|| format!("bad account {}", a.pubkey))?;
                Ok(AccountMeta {
                    pubkey,
                    is_signer: a.is_signer,
                    is_writable: a.is_writable,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let data = STANDARD.decode(&self.data).context("bad instruction data")?;
        Ok(Instruction {
            program_id,
            accounts,
            data,
        })
    }
}

impl RemoveLiquidityResponse {
    pub fn into_instructions(self) -> Result<Vec<Vec<Instruction>>> {
        if self.transactions.is_empty() {
            anyhow::bail!("DLMM bridge returned no removal transactions");
        }
        self.transactions
            .iter()
            .map(|tx| tx.instructions.iter().map(BridgeInstruction::to_instruction).collect())
            .collect()
    }
}

/// Response of `GET /positions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolPositionsResponse {
    #[serde(default)]
    pub active_bin: Option<ActiveBin>,
    pub token_x: TokenMeta,
    pub token_y: TokenMeta,
    #[serde(default)]
    pub user_positions: Vec<BridgePosition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBin {
    pub bin_id: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenMeta {
    pub mint: String,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

fn default_decimals() -> u8 {
    DEFAULT_TOKEN_DECIMALS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgePosition {
    pub public_key: String,
    pub position_data: BridgePositionData,
}

/// Position amounts in raw token units.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgePositionData {
    #[serde(rename = "totalXAmount", alias = "amount_x", alias = "amountX", default, deserialize_with = "raw_amount")]
    pub total_x_amount: u64,
    #[serde(rename = "totalYAmount", alias = "amount_y", alias = "amountY", default, deserialize_with = "raw_amount")]
    pub total_y_amount: u64,
    #[serde(rename = "feeX", alias = "fees_x", alias = "feeXAmount", default, deserialize_with = "raw_amount")]
    pub fee_x: u64,
    #[serde(rename = "feeY", alias = "fees_y", alias = "feeYAmount", default, deserialize_with = "raw_amount")]
    pub fee_y: u64,
    #[serde(rename = "lowerBinId", alias = "lower_bin_id")]
    pub lower_bin_id: i32,
    #[serde(rename = "upperBinId", alias = "upper_bin_id")]
    pub upper_bin_id: i32,
}

/// Accept raw amounts as decimal strings (BN.toString()), integers, floats or null.
fn raw_amount<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(0),
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                Ok(v)
            } else {
                Ok(n.as_f64().map(|f| f.max(0.0) as u64).unwrap_or(0))
            }
        }
        serde_json::Value::String(s) if s.is_empty() => Ok(0),
        serde_json::Value::String(s) => {
            let int_part = s.split('.').next().unwrap_or("0");
            int_part.parse::<u64>().map_err(D::Error::custom)
        }
        other => Err(D::Error::custom(format!("unexpected amount {}", other))),
    }
}

/// Meteora pair metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct PairInfo {
    pub name: String,
    #[serde(default)]
    pub mint_x: Option<String>,
    #[serde(default)]
    pub mint_y: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_positions_sdk_spelling() {
        let json = r#"{
            "activeBin": {"binId": 120, "price": "1.02"},
            "tokenX": {"mint": "So11111111111111111111111111111111111111112", "decimals": 9},
            "tokenY": {"mint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"},
            "userPositions": [{
                "publicKey": "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin",
                "positionData": {
                    "totalXAmount": "1500000000",
                    "totalYAmount": "25000000",
                    "feeX": "1000",
                    "feeY": 42,
                    "lowerBinId": 100,
                    "upperBinId": 140
                }
            }]
        }"#;

        let parsed: PoolPositionsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.active_bin.unwrap().bin_id, 120);
        assert_eq!(parsed.token_x.decimals, 9);
        assert_eq!(parsed.token_y.decimals, DEFAULT_TOKEN_DECIMALS);
        let data = &parsed.user_positions[0].position_data;
        assert_eq!(data.total_x_amount, 1_500_000_000);
        assert_eq!(data.total_y_amount, 25_000_000);
        assert_eq!(data.fee_x, 1000);
        assert_eq!(data.fee_y, 42);
        assert_eq!(data.lower_bin_id, 100);
        assert_eq!(data.upper_bin_id, 140);
    }

    #[test]
    fn test_deserialize_positions_legacy_spelling() {
        let json = r#"{
            "amount_x": 500,
            "amount_y": "700",
            "fees_x": null,
            "lowerBinId": -10,
            "upperBinId": 10
        }"#;

        let data: BridgePositionData = serde_json::from_str(json).unwrap();
        assert_eq!(data.total_x_amount, 500);
        assert_eq!(data.total_y_amount, 700);
        assert_eq!(data.fee_x, 0);
        assert_eq!(data.fee_y, 0);
        assert_eq!(data.lower_bin_id, -10);
    }

    #[test]
    fn test_bridge_instruction_conversion() {
        let program = Pubkey::new_unique();
        let account = Pubkey::new_unique();
        let json = format!(
            r#"{{"transactions": [{{"instructions": [{{
                "programId": "{}",
                "accounts": [{{"pubkey": "{}", "isSigner": true, "isWritable": false}}],
                "data": "AQID"
            }}]}}]}}"#,
            program, account
        );

        let response: RemoveLiquidityResponse = serde_json::from_str(&json).unwrap();
        let txs = response.into_instructions().unwrap();
        assert_eq!(txs.len(), 1);
        let ix = &txs[0][0];
        assert_eq!(ix.program_id, program);
        assert_eq!(ix.accounts[0].pubkey, account);
        assert!(ix.accounts[0].is_signer);
        assert!(!ix.accounts[0].is_writable);
        assert_eq!(ix.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_removal_rejected() {
        let response: RemoveLiquidityResponse = serde_json::from_str(r#"{"transactions": []}"#).unwrap();
        assert!(response.into_instructions().is_err());
    }

    #[test]
    fn test_full_exit_request() {
        let req = RemoveLiquidityRequest::full_exit("owner", "pool", "pos", -5, 5);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["bps"], 10_000);
        assert_eq!(json["shouldClaimAndClose"], true);
        assert_eq!(json["fromBinId"], -5);
        assert_eq!(json["toBinId"], 5);
    }
}
