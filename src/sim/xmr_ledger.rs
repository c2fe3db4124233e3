//! In-memory monero ledger with per-party wallet-rpc style clients.
//!
//! Outputs unlock `UNLOCK_BLOCKS` after the block that created them. Every
//! transaction pays `FEE`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result, anyhow, bail, ensure};
use async_trait::async_trait;

use crate::coins::MoneroAmount;
use crate::xmr::keys::{PrivateKeyPair, PrivateViewKey};
use crate::xmr::wallet::{Balance, TransferReceipt, WalletClient};

pub const UNLOCK_BLOCKS: u64 = 10;
pub const FEE: MoneroAmount = MoneroAmount::from_piconero(10_000_000);
const START_HEIGHT: u64 = 100;

#[derive(Debug, Clone)]
struct Output {
    owner: monero::Address,
    amount: MoneroAmount,
    height: u64,
    spent: bool,
}

impl Output {
    fn unlocked_at(&self, height: u64) -> bool {
        height >= self.height + UNLOCK_BLOCKS
    }
}

struct Ledger {
    height: u64,
    outputs: Vec<Output>,
    mining_failures: usize,
}

#[derive(Clone)]
pub struct SimMonero {
    network: monero::Network,
    ledger: Arc<Mutex<Ledger>>,
}

impl SimMonero {
    pub fn new(network: monero::Network) -> Self {
        Self {
            network,
            ledger: Arc::new(Mutex::new(Ledger {
                height: START_HEIGHT,
                outputs: Vec::new(),
                mining_failures: 0,
            })),
        }
    }

    pub fn network(&self) -> monero::Network {
        self.network
    }

    /// Credits an already spendable output to `address`.
    pub fn mint(&self, address: &monero::Address, amount: MoneroAmount) {
        self.lock().outputs.push(Output {
            owner: address.clone(),
            amount,
            height: 0,
            spent: false,
        });
    }

    /// Total unspent amount held by `address`, locked or not.
    pub fn balance_of(&self, address: &monero::Address) -> MoneroAmount {
        self.lock()
            .outputs
            .iter()
            .filter(|o| !o.spent && o.owner == *address)
            .fold(MoneroAmount::ZERO, |acc, o| {
                acc.checked_add(o.amount).unwrap_or(acc)
            })
    }

    /// Makes the next `count` `generate_blocks` calls fail.
    pub fn fail_mining(&self, count: usize) {
        self.lock().mining_failures = count;
    }

    pub fn height(&self) -> u64 {
        self.lock().height
    }

    /// A wallet-rpc client with its own, initially empty, wallet directory.
    pub fn client(&self) -> SimWalletClient {
        SimWalletClient {
            monero: self.clone(),
            wallets: Mutex::new(HashMap::new()),
            open: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().expect("monero ledger mutex poisoned")
    }
}

#[derive(Debug, Clone)]
struct WalletFile {
    address: monero::Address,
    spendable: bool,
}

pub struct SimWalletClient {
    monero: SimMonero,
    wallets: Mutex<HashMap<String, WalletFile>>,
    open: Mutex<Option<WalletFile>>,
}

impl SimWalletClient {
    /// Creates a spendable wallet file for `keys` and returns its address.
    pub fn create_wallet(&self, filename: &str, keys: &PrivateKeyPair) -> Result<monero::Address> {
        let address = keys
            .address(self.monero.network)
            .context("derive wallet address")?;
        self.store(filename, WalletFile {
            address,
            spendable: true,
        });
        Ok(address)
    }

    fn store(&self, filename: &str, wallet: WalletFile) {
        self.wallets
            .lock()
            .expect("wallet dir mutex poisoned")
            .insert(filename.to_string(), wallet.clone());
        *self.open.lock().expect("open wallet mutex poisoned") = Some(wallet);
    }

    fn current(&self) -> Result<WalletFile> {
        self.open
            .lock()
            .expect("open wallet mutex poisoned")
            .clone()
            .ok_or_else(|| anyhow!("no wallet is open"))
    }

    /// Spends unlocked outputs of the open wallet. `amount` of `None` sweeps.
    fn spend(&self, to: &monero::Address, amount: Option<MoneroAmount>) -> Result<Option<TransferReceipt>> {
        let wallet = self.current()?;
        ensure!(wallet.spendable, "wallet {} is view-only", wallet.address);

        let mut ledger = self.monero.lock();
        let height = ledger.height;
        let spendable: Vec<usize> = ledger
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.spent && o.owner == wallet.address && o.unlocked_at(height))
            .map(|(i, _)| i)
            .collect();
        let available = spendable
            .iter()
            .map(|&i| ledger.outputs[i].amount.as_piconero())
            .sum::<u64>();

        let fee = FEE.as_piconero();
        let send = match amount {
            Some(amount) => amount.as_piconero(),
            None if available <= fee => return Ok(None),
            None => available - fee,
        };
        let needed = send
            .checked_add(fee)
            .ok_or_else(|| anyhow!("transfer amount overflow"))?;
        if available < needed {
            bail!("not enough unlocked money: have {available}, need {needed}");
        }

        let mut gathered = 0u64;
        for i in spendable {
            if gathered >= needed {
                break;
            }
            ledger.outputs[i].spent = true;
            gathered += ledger.outputs[i].amount.as_piconero();
        }
        ledger.outputs.push(Output {
            owner: to.clone(),
            amount: MoneroAmount::from_piconero(send),
            height,
            spent: false,
        });
        if gathered > needed {
            ledger.outputs.push(Output {
                owner: wallet.address,
                amount: MoneroAmount::from_piconero(gathered - needed),
                height,
                spent: false,
            });
        }

        Ok(Some(TransferReceipt {
            tx_id: hex::encode(rand::random::<[u8; 32]>()),
            amount: MoneroAmount::from_piconero(send),
            fee: FEE,
            height,
        }))
    }
}

#[async_trait]
impl WalletClient for SimWalletClient {
    async fn open_wallet(&self, filename: &str) -> Result<()> {
        let wallet = self
            .wallets
            .lock()
            .expect("wallet dir mutex poisoned")
            .get(filename)
            .cloned()
            .ok_or_else(|| anyhow!("wallet file {filename} not found"))?;
        *self.open.lock().expect("open wallet mutex poisoned") = Some(wallet);
        Ok(())
    }

    async fn close_wallet(&self) -> Result<()> {
        self.open.lock().expect("open wallet mutex poisoned").take();
        Ok(())
    }

    async fn generate_view_only_wallet(
        &self,
        filename: &str,
        view_key: &PrivateViewKey,
        address: &monero::Address,
    ) -> Result<()> {
        let public_view = view_key.public().to_monero()?;
        ensure!(
            public_view == address.public_view,
            "view key does not belong to {address}"
        );
        self.store(filename, WalletFile {
            address: address.clone(),
            spendable: false,
        });
        Ok(())
    }

    async fn generate_from_keys(
        &self,
        filename: &str,
        keys: &PrivateKeyPair,
        address: &monero::Address,
    ) -> Result<()> {
        let derived = keys.address(address.network)?;
        ensure!(derived == *address, "keys derive {derived}, not {address}");
        self.store(filename, WalletFile {
            address: address.clone(),
            spendable: true,
        });
        Ok(())
    }

    async fn get_address(&self) -> Result<monero::Address> {
        Ok(self.current()?.address)
    }

    async fn get_balance(&self) -> Result<Balance> {
        let wallet = self.current()?;
        let ledger = self.monero.lock();
        let mut balance = 0u64;
        let mut unlocked = 0u64;
        let mut blocks_to_unlock = 0u64;
        for output in ledger
            .outputs
            .iter()
            .filter(|o| !o.spent && o.owner == wallet.address)
        {
            balance += output.amount.as_piconero();
            if output.unlocked_at(ledger.height) {
                unlocked += output.amount.as_piconero();
            } else {
                blocks_to_unlock =
                    blocks_to_unlock.max(output.height + UNLOCK_BLOCKS - ledger.height);
            }
        }
        Ok(Balance {
            balance: MoneroAmount::from_piconero(balance),
            unlocked_balance: MoneroAmount::from_piconero(unlocked),
            blocks_to_unlock,
        })
    }

    async fn refresh(&self) -> Result<()> {
        self.current().map(|_| ())
    }

    async fn get_height(&self) -> Result<u64> {
        Ok(self.monero.height())
    }

    async fn transfer(&self, to: &monero::Address, amount: MoneroAmount) -> Result<TransferReceipt> {
        self.spend(to, Some(amount))?
            .ok_or_else(|| anyhow!("transfer produced no transaction"))
    }

    async fn sweep_all(&self, to: &monero::Address) -> Result<Vec<TransferReceipt>> {
        Ok(self.spend(to, None)?.into_iter().collect())
    }

    async fn generate_blocks(&self, _address: &monero::Address, count: u64) -> Result<()> {
        let mut ledger = self.monero.lock();
        if ledger.mining_failures > 0 {
            ledger.mining_failures -= 1;
            bail!("simulated mining failure");
        }
        ledger.height += count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmr::keys::PrivateSpendKey;

    fn xmr(piconero: u64) -> MoneroAmount {
        MoneroAmount::from_piconero(piconero)
    }

    #[tokio::test]
    async fn transfer_locks_outputs_until_mined() {
        let monero = SimMonero::new(monero::Network::Mainnet);
        let client = monero.client();
        let alice = client
            .create_wallet("alice", &PrivateSpendKey::random().key_pair())
            .unwrap();
        let bob = PrivateSpendKey::random()
            .key_pair()
            .address(monero::Network::Mainnet)
            .unwrap();
        monero.mint(&alice, xmr(1_000_000_000));

        client.open_wallet("alice").await.unwrap();
        let receipt = client.transfer(&bob, xmr(500_000_000)).await.unwrap();
        assert_eq!(receipt.fee, FEE);
        assert_eq!(monero.balance_of(&bob), xmr(500_000_000));

        let balance = client.get_balance().await.unwrap();
        assert_eq!(balance.unlocked_balance, MoneroAmount::ZERO);
        assert_eq!(balance.blocks_to_unlock, UNLOCK_BLOCKS);
        assert!(client.transfer(&bob, xmr(1)).await.is_err());

        client.generate_blocks(&alice, UNLOCK_BLOCKS).await.unwrap();
        let balance = client.get_balance().await.unwrap();
        assert_eq!(balance.unlocked_balance, balance.balance);
    }

    #[tokio::test]
    async fn view_only_wallet_cannot_spend() {
        let monero = SimMonero::new(monero::Network::Mainnet);
        let client = monero.client();
        let keys = PrivateSpendKey::random().key_pair();
        let address = keys.address(monero::Network::Mainnet).unwrap();
        monero.mint(&address, xmr(1_000_000_000));

        let wrong_view = PrivateSpendKey::random().view();
        assert!(
            client
                .generate_view_only_wallet("view", &wrong_view, &address)
                .await
                .is_err()
        );

        client
            .generate_view_only_wallet("view", &keys.view, &address)
            .await
            .unwrap();
        assert_eq!(client.get_balance().await.unwrap().balance, xmr(1_000_000_000));
        assert!(client.sweep_all(&address).await.is_err());
    }

    #[tokio::test]
    async fn sweeping_an_empty_wallet_is_a_no_op() {
        let monero = SimMonero::new(monero::Network::Mainnet);
        let client = monero.client();
        let address = client
            .create_wallet("empty", &PrivateSpendKey::random().key_pair())
            .unwrap();
        assert!(client.sweep_all(&address).await.unwrap().is_empty());
    }
}
