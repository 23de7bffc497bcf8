//! Transaction signer and sender.
//!
//! Every send goes through the same pipeline: drop builder-injected compute
//! budget instructions, prepend our priority fee pair, attach a fresh
//! blockhash, sign, submit and wait for `confirmed`.

use crate::fee::{with_priority_fee, PriorityLevel, DEFAULT_COMPUTE_UNIT_LIMIT};
use anyhow::{Context, Result};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::{Transaction, VersionedTransaction};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Parse a signer key from the environment.
///
/// Accepts a base58 secret key (Phantom export) or the JSON byte array
/// written by `solana-keygen`.
pub fn parse_keypair(secret: &str) -> Result<Keypair> {
    let secret = secret.trim();
    let bytes: Vec<u8> = if secret.starts_with('[') {
        serde_json::from_str(secret).context("invalid keypair byte array")?
    } else {
        bs58::decode(secret)
            .into_vec()
            .context("invalid base58 private key")?
    };
    #[allow(deprecated)]
    let keypair = Keypair::from_bytes(&bytes).map_err(|e| anyhow::anyhow!("invalid keypair: {}", e))?;
    Ok(keypair)
}

/// Builder for TransactionSender.
pub struct TransactionSenderBuilder {
    rpc: Arc<RpcClient>,
    priority: PriorityLevel,
    compute_unit_limit: u32,
}

impl TransactionSenderBuilder {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self {
            rpc,
            priority: PriorityLevel::default(),
            compute_unit_limit: DEFAULT_COMPUTE_UNIT_LIMIT,
        }
    }

    /// Set the priority fee level.
    pub fn priority(mut self, level: PriorityLevel) -> Self {
        self.priority = level;
        self
    }

    /// Set the compute unit limit.
    pub fn compute_unit_limit(mut self, limit: u32) -> Self {
        self.compute_unit_limit = limit;
        self
    }

    /// Build from a secret key string.
    pub fn build(self, private_key: &str) -> Result<TransactionSender> {
        let keypair = parse_keypair(private_key)?;
        Ok(self.build_with_keypair(keypair))
    }

    pub fn build_with_keypair(self, keypair: Keypair) -> TransactionSender {
        let pubkey = keypair.pubkey();
        info!(
            signer = %pubkey,
            priority = %self.priority,
            cu_limit = self.compute_unit_limit,
            "Transaction sender initialized"
        );
        TransactionSender {
            rpc: self.rpc,
            keypair: Arc::new(keypair),
            pubkey,
            priority: self.priority,
            compute_unit_limit: self.compute_unit_limit,
        }
    }
}

/// Signs and submits transactions for the engine's single signer.
pub struct TransactionSender {
    rpc: Arc<RpcClient>,
    keypair: Arc<Keypair>,
    /// Signer public key
    pub pubkey: Pubkey,
    priority: PriorityLevel,
    compute_unit_limit: u32,
}

impl TransactionSender {
    /// Create a sender at the default priority level.
    pub fn new(rpc: Arc<RpcClient>, private_key: &str) -> Result<Self> {
        TransactionSenderBuilder::new(rpc).build(private_key)
    }

    pub fn priority(&self) -> PriorityLevel {
        self.priority
    }

    /// Send instructions at the configured priority level.
    pub async fn send_instructions(&self, instructions: Vec<Instruction>) -> Result<Signature> {
        self.send_with_priority(instructions, self.priority).await
    }

    /// Send instructions and wait for confirmation.
    ///
    /// A fresh blockhash is fetched for every call, so retrying a failed send
    /// never reuses an expired one.
    pub async fn send_with_priority(
        &self,
        instructions: Vec<Instruction>,
        level: PriorityLevel,
    ) -> Result<Signature> {
        let total_start = Instant::now();
        let instructions = with_priority_fee(instructions, level, self.compute_unit_limit);

        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .context("get_latest_blockhash")?;

        let tx = Transaction::new_signed_with_payer(
            &instructions,
            Some(&self.pubkey),
            &[self.keypair.as_ref()],
            blockhash,
        );

        debug!(
            instructions = instructions.len(),
            priority = %level,
            blockhash = %blockhash,
            "Sending transaction"
        );

        match self.rpc.send_and_confirm_transaction(&tx).await {
            Ok(signature) => {
                info!(
                    signature = %signature,
                    total_ms = total_start.elapsed().as_millis(),
                    "Transaction confirmed"
                );
                Ok(signature)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    total_ms = total_start.elapsed().as_millis(),
                    "Transaction failed"
                );
                Err(anyhow::Error::new(e).context("send_and_confirm_transaction"))
            }
        }
    }

    /// Sign a versioned transaction built by a third party (aggregator).
    ///
    /// The message is left untouched, including its blockhash.
    pub fn sign_versioned(&self, tx: VersionedTransaction) -> Result<VersionedTransaction> {
        VersionedTransaction::try_new(tx.message, &[self.keypair.as_ref()])
            .context("failed to sign versioned transaction")
    }
}

impl std::fmt::Debug for TransactionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSender")
            .field("pubkey", &self.pubkey)
            .field("priority", &self.priority)
            .field("compute_unit_limit", &self.compute_unit_limit)
            .finish_non_exhaustive()
    }
}
