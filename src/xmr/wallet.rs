use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::coins::MoneroAmount;
use crate::xmr::keys::{PrivateKeyPair, PrivateViewKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    pub balance: MoneroAmount,
    pub unlocked_balance: MoneroAmount,
    pub blocks_to_unlock: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub tx_id: String,
    pub amount: MoneroAmount,
    pub fee: MoneroAmount,
    pub height: u64,
}

/// Monero wallet RPC surface used by the swap. A client drives one wallet
/// file at a time, so opening a wallet implicitly closes the previous one.
#[async_trait]
pub trait WalletClient: Send + Sync {
    async fn open_wallet(&self, filename: &str) -> Result<()>;

    async fn close_wallet(&self) -> Result<()>;

    /// Creates (or reopens) a wallet that can see, but not spend, funds sent
    /// to `address`, and leaves it open.
    async fn generate_view_only_wallet(
        &self,
        filename: &str,
        view_key: &PrivateViewKey,
        address: &monero::Address,
    ) -> Result<()>;

    /// Creates (or reopens) a spendable wallet for `keys` and leaves it open.
    async fn generate_from_keys(
        &self,
        filename: &str,
        keys: &PrivateKeyPair,
        address: &monero::Address,
    ) -> Result<()>;

    async fn get_address(&self) -> Result<monero::Address>;

    async fn get_balance(&self) -> Result<Balance>;

    async fn refresh(&self) -> Result<()>;

    async fn get_height(&self) -> Result<u64>;

    async fn transfer(&self, to: &monero::Address, amount: MoneroAmount) -> Result<TransferReceipt>;

    async fn sweep_all(&self, to: &monero::Address) -> Result<Vec<TransferReceipt>>;

    /// Development networks only.
    async fn generate_blocks(&self, address: &monero::Address, count: u64) -> Result<()>;
}

/// Polls the open wallet until the chain is `confirmations` blocks past
/// `from_height`.
pub async fn wait_for_confirmations(
    wallet: &dyn WalletClient,
    from_height: u64,
    confirmations: u64,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<u64> {
    let target = from_height.saturating_add(confirmations);
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        wallet.refresh().await?;
        let height = wallet.get_height().await?;
        if height >= target {
            return Ok(height);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timeout waiting for {confirmations} confirmations: height={height} target={target}");
        }
        tracing::debug!(height, target, "waiting for monero confirmations");
        tokio::time::sleep(poll_interval).await;
    }
}

/// Polls the open wallet until its whole balance is spendable.
pub async fn wait_until_balance_unlocks(
    wallet: &dyn WalletClient,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<Balance> {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        wallet.refresh().await?;
        let balance = wallet.get_balance().await?;
        if balance.blocks_to_unlock == 0 && balance.unlocked_balance == balance.balance {
            return Ok(balance);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "timeout waiting for balance to unlock: blocks_to_unlock={}",
                balance.blocks_to_unlock
            );
        }
        tokio::time::sleep(poll_interval).await;
    }
}
