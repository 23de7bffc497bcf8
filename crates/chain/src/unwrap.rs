//! Wrapped SOL recovery.

use crate::provider::ChainProvider;
use crate::signer::TransactionSender;
use anyhow::{Context, Result};
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use spl_associated_token_account::get_associated_token_address;
use std::sync::Arc;
use tracing::{debug, info};

/// Closes the signer's wrapped SOL account, returning the lamports as native SOL.
#[derive(Debug, Clone)]
pub struct WsolUnwrapper {
    provider: ChainProvider,
    sender: Arc<TransactionSender>,
}

impl WsolUnwrapper {
    pub fn new(provider: ChainProvider, sender: Arc<TransactionSender>) -> Self {
        Self { provider, sender }
    }

    pub fn owner(&self) -> Pubkey {
        self.sender.pubkey
    }

    /// Unwrap the signer's wrapped SOL.
    ///
    /// Returns `Ok(false)` when there is nothing to unwrap (no account, or an
    /// empty one), `Ok(true)` once the close is confirmed. RPC failures are
    /// errors so callers can retry them.
    pub async fn unwrap(&self) -> Result<bool> {
        let owner = self.sender.pubkey;
        let ata = get_associated_token_address(&owner, &spl_token::native_mint::id());

        let rpc = self.provider.rpc();
        let account = rpc
            .get_account_with_commitment(&ata, rpc.commitment())
            .await
            .context("read wrapped SOL account")?
            .value;
        let Some(account) = account else {
            debug!(owner = %owner, "No wrapped SOL account");
            return Ok(false);
        };
        let amount = token_account_amount(&account.data).context("malformed wrapped SOL account")?;

        if amount == 0 {
            return Ok(false);
        }

        info!(
            owner = %owner,
            sol = amount as f64 / 1e9,
            "Unwrapping WSOL"
        );

        let ix = close_wsol_instruction(&owner)?;
        let signature = self
            .sender
            .send_instructions(vec![ix])
            .await
            .context("close wrapped SOL account")?;

        info!(signature = %signature, "WSOL unwrapped to SOL");
        Ok(true)
    }
}

/// Amount field of an SPL token account (mint 32, owner 32, amount u64 LE).
fn token_account_amount(data: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = data.get(64..72)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Close the owner's wrapped SOL ATA, sending rent and balance back to the owner.
pub fn close_wsol_instruction(owner: &Pubkey) -> Result<Instruction> {
    let ata = get_associated_token_address(owner, &spl_token::native_mint::id());
    spl_token::instruction::close_account(&spl_token::id(), &ata, owner, owner, &[])
        .map_err(|e| anyhow::anyhow!("close_account instruction: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::TransactionSenderBuilder;
    use solana_sdk::signature::Keypair;

    #[test]
    fn test_close_wsol_instruction() {
        let owner = Pubkey::new_unique();
        let ix = close_wsol_instruction(&owner).unwrap();
        let ata = get_associated_token_address(&owner, &spl_token::native_mint::id());

        assert_eq!(ix.program_id, spl_token::id());
        assert_eq!(ix.accounts[0].pubkey, ata);
        assert_eq!(ix.accounts[1].pubkey, owner);
        assert_eq!(ix.accounts[2].pubkey, owner);
        assert!(ix.accounts[2].is_signer);
    }

    #[test]
    fn test_token_account_amount() {
        let mut data = vec![0u8; 165];
        data[64..72].copy_from_slice(&2_500_000u64.to_le_bytes());
        assert_eq!(token_account_amount(&data), Some(2_500_000));
        assert_eq!(token_account_amount(&data[..40]), None);
    }

    #[tokio::test]
    async fn test_rpc_failure_is_an_error() {
        let provider = ChainProvider::new("http://127.0.0.1:1");
        let sender = TransactionSenderBuilder::new(provider.rpc()).build_with_keypair(Keypair::new());
        let unwrapper = WsolUnwrapper::new(provider, Arc::new(sender));

        assert!(unwrapper.unwrap().await.is_err());
    }
}
