//! Jupiter API clients: USD prices and Ultra swaps.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use solana_sdk::transaction::VersionedTransaction;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

const PRICE_API: &str = "https://api.jup.ag/price/v2";
const ULTRA_API: &str = "https://ultra-api.jup.ag";

/// Cached price with timestamp for TTL expiration.
#[derive(Clone, Copy)]
struct CachedPrice {
    price: f64,
    cached_at: Instant,
}

/// Jupiter price client with a short-lived cache.
#[derive(Clone)]
pub struct JupiterPriceClient {
    client: reqwest::Client,
    base_url: String,
    /// Mint -> cached USD price
    cache: Arc<DashMap<String, CachedPrice>>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for JupiterPriceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JupiterPriceClient")
            .field("base_url", &self.base_url)
            .field("cache_size", &self.cache.len())
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl JupiterPriceClient {
    pub fn new() -> Self {
        Self::with_cache_ttl(Duration::from_secs(5))
    }

    pub fn with_cache_ttl(cache_ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: PRICE_API.to_string(),
            cache: Arc::new(DashMap::new()),
            cache_ttl,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// USD prices for the given mints.
    ///
    /// Mints the API does not price are absent from the result.
    #[instrument(skip(self))]
    pub async fn get_prices(&self, mints: &[String]) -> Result<HashMap<String, f64>> {
        let mut prices = HashMap::with_capacity(mints.len());
        let mut missing = Vec::new();

        for mint in mints {
            match self.cache.get(mint) {
                Some(cached) if cached.cached_at.elapsed() < self.cache_ttl => {
                    prices.insert(mint.clone(), cached.price);
                }
                _ => missing.push(mint.clone()),
            }
        }

        if missing.is_empty() {
            return Ok(prices);
        }

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("ids", missing.join(","))])
            .send()
            .await
            .context("Jupiter price API unreachable")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Jupiter price API error: {} - {}", status, body);
        }

        let parsed: PriceResponse = response.json().await?;
        let now = Instant::now();
        for (mint, entry) in parsed.data {
            let Some(price) = entry.and_then(|e| e.usd()) else {
                continue;
            };
            self.cache.insert(mint.clone(), CachedPrice { price, cached_at: now });
            prices.insert(mint, price);
        }

        debug!(requested = mints.len(), priced = prices.len(), "Fetched prices");
        Ok(prices)
    }

    /// Clear expired entries from cache.
    pub fn cleanup_cache(&self) {
        self.cache.retain(|_, cached| cached.cached_at.elapsed() < self.cache_ttl);
    }
}

impl Default for JupiterPriceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
pub struct PriceResponse {
    #[serde(default)]
    pub data: HashMap<String, Option<PriceEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct PriceEntry {
    #[serde(default)]
    pub id: Option<String>,
    /// Returned as a decimal string, occasionally as a number
    #[serde(default)]
    pub price: Option<serde_json::Value>,
}

impl PriceEntry {
    pub fn usd(&self) -> Option<f64> {
        match self.price.as_ref()? {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }
}

/// Jupiter Ultra swap client.
///
/// Ultra returns a fully built transaction for the taker to sign; signing
/// happens outside this crate.
#[derive(Debug, Clone)]
pub struct JupiterUltraClient {
    client: reqwest::Client,
    base_url: String,
}

impl JupiterUltraClient {
    pub fn new() -> Self {
        Self::with_base_url(ULTRA_API)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Request an ExactIn order for `amount` raw units of `input_mint`.
    #[instrument(skip(self))]
    pub async fn order(&self, input_mint: &str, output_mint: &str, amount: u64, taker: &str) -> Result<UltraOrder> {
        let url = format!("{}/order", self.base_url);
        let amount = amount.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("inputMint", input_mint),
                ("outputMint", output_mint),
                ("amount", amount.as_str()),
                ("taker", taker),
                ("swapMode", "ExactIn"),
            ])
            .send()
            .await
            .context("Jupiter Ultra unreachable")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Jupiter Ultra order error: {} - {}", status, body);
        }

        let order: UltraOrder = response.json().await.context("bad order payload")?;
        if order.transaction.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!(
                "Order response missing transaction: {}",
                order.error_message.as_deref().unwrap_or("no route")
            );
        }
        debug!(request_id = %order.request_id, out_amount = ?order.out_amount, "Got Ultra order");
        Ok(order)
    }

    /// Submit a signed order transaction.
    #[instrument(skip(self, signed_transaction))]
    pub async fn execute(&self, signed_transaction: String, request_id: &str) -> Result<UltraExecuteResponse> {
        let url = format!("{}/execute", self.base_url);
        let body = UltraExecuteRequest {
            signed_transaction,
            request_id: request_id.to_string(),
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Jupiter Ultra unreachable")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Jupiter Ultra execute error: {} - {}", status, body);
        }

        let result: UltraExecuteResponse = response.json().await.context("bad execute payload")?;
        if !result.is_success() {
            warn!(status = %result.status, error = ?result.error, "Ultra swap not successful");
            anyhow::bail!(
                "Swap failed: status={} error={}",
                result.status,
                result.error.as_deref().unwrap_or("unknown")
            );
        }
        Ok(result)
    }
}

impl Default for JupiterUltraClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UltraOrder {
    /// Base64 encoded unsigned versioned transaction
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub out_amount: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl UltraOrder {
    /// Decode the order's transaction.
    pub fn decode_transaction(&self) -> Result<VersionedTransaction> {
        let encoded = self
            .transaction
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("order has no transaction"))?;
        decode_transaction(encoded)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UltraExecuteRequest {
    signed_transaction: String,
    request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UltraExecuteResponse {
    pub status: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
}

impl UltraExecuteResponse {
    pub fn is_success(&self) -> bool {
        self.status == "Success"
    }
}

/// Base64 + bincode decode of a versioned transaction.
pub fn decode_transaction(encoded: &str) -> Result<VersionedTransaction> {
    let bytes = STANDARD.decode(encoded).context("transaction is not base64")?;
    let tx: VersionedTransaction = bincode::deserialize(&bytes).context("transaction does not deserialize")?;
    Ok(tx)
}

/// Bincode + base64 encode of a versioned transaction.
pub fn encode_transaction(tx: &VersionedTransaction) -> Result<String> {
    let bytes = bincode::serialize(tx).context("transaction does not serialize")?;
    Ok(STANDARD.encode(bytes))
}
