//! In-memory stand-in for the swap contract on an Ethereum dev chain.
//!
//! Enforces the same rules as the deployed contract, keeps account balances
//! and an event log per contract, and publishes events to subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::coins::EtherAmount;
use crate::eth::contract::{
    ContractEvent, ContractEventKind, ContractLog, ContractRevert, NewSwap, SwapContract,
    SwapContractFactory, SwapTimeouts, unix_now,
};
use crate::eth::secp256k1::{Commitment, commitment_for_secret};
use crate::eth::{Address, TxHash};

const EVENT_CAPACITY: usize = 64;

struct Contract {
    owner: Address,
    claimer: Address,
    claim_commitment: Commitment,
    refund_commitment: Commitment,
    timeouts: SwapTimeouts,
    value: EtherAmount,
    ready: bool,
    completed: bool,
    logs: Vec<ContractLog>,
    events: broadcast::Sender<ContractLog>,
}

#[derive(Default)]
struct ChainState {
    block_number: u64,
    balances: HashMap<Address, EtherAmount>,
    contracts: HashMap<Address, Contract>,
    receipts: HashMap<TxHash, Vec<ContractLog>>,
    transactions: u64,
    read_failures: usize,
    set_ready_failures: usize,
    timeout_reads: usize,
}

impl ChainState {
    fn credit(&mut self, account: Address, amount: EtherAmount) -> Result<()> {
        let balance = self.balances.entry(account).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| anyhow!("balance overflow for {account}"))?;
        Ok(())
    }

    fn debit(&mut self, account: Address, amount: EtherAmount) -> Result<()> {
        let balance = self.balances.entry(account).or_default();
        *balance = balance
            .checked_sub(amount)
            .ok_or(ContractRevert::InsufficientBalance("deploy"))?;
        Ok(())
    }

    /// Mines a block holding one transaction that emitted `event`.
    fn emit(&mut self, contract: Address, event: ContractEvent) -> Result<TxHash> {
        self.block_number += 1;
        self.transactions += 1;
        let tx_hash = TxHash::random();
        let log = ContractLog {
            contract,
            tx_hash,
            block_number: self.block_number,
            event,
        };
        let state = self
            .contracts
            .get_mut(&contract)
            .ok_or_else(|| anyhow!("no contract at {contract}"))?;
        state.logs.push(log.clone());
        // No subscribers is fine.
        let _ = state.events.send(log.clone());
        self.receipts.insert(tx_hash, vec![log]);
        Ok(tx_hash)
    }

    fn contract(&self, address: Address) -> Result<&Contract> {
        self.contracts
            .get(&address)
            .ok_or_else(|| anyhow!("no contract at {address}"))
    }

    fn contract_mut(&mut self, address: Address) -> Result<&mut Contract> {
        self.contracts
            .get_mut(&address)
            .ok_or_else(|| anyhow!("no contract at {address}"))
    }

    fn read(&mut self) -> Result<()> {
        if self.read_failures > 0 {
            self.read_failures -= 1;
            anyhow::bail!("simulated rpc failure");
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct SimulatedChain {
    state: Arc<Mutex<ChainState>>,
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fund(&self, account: Address, amount: EtherAmount) -> Result<()> {
        self.lock().credit(account, amount)
    }

    pub fn balance_of(&self, account: Address) -> EtherAmount {
        self.lock().balances.get(&account).copied().unwrap_or_default()
    }

    /// Ether still held by the contract at `address`.
    pub fn contract_balance(&self, address: Address) -> Result<EtherAmount> {
        let state = self.lock();
        let contract = state.contract(address)?;
        Ok(if contract.completed {
            EtherAmount::ZERO
        } else {
            contract.value
        })
    }

    /// Number of transactions mined so far.
    pub fn transaction_count(&self) -> u64 {
        self.lock().transactions
    }

    /// Makes the next `count` contract reads fail.
    pub fn fail_reads(&self, count: usize) {
        self.lock().read_failures = count;
    }

    /// Makes the next `count` `set_ready` submissions fail before reaching
    /// the contract.
    pub fn fail_set_ready(&self, count: usize) {
        self.lock().set_ready_failures = count;
    }

    /// How many times any client read a contract's deadlines.
    pub fn timeout_reads(&self) -> usize {
        self.lock().timeout_reads
    }

    /// Deadlines of the contract at `address`, without counting as a read.
    pub fn timeouts_of(&self, address: Address) -> Result<SwapTimeouts> {
        Ok(self.lock().contract(address)?.timeouts)
    }

    /// A handle that signs as `account`.
    pub fn account(&self, account: Address) -> SimAccount {
        SimAccount {
            chain: self.clone(),
            account,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().expect("chain mutex poisoned")
    }
}

#[derive(Clone)]
pub struct SimAccount {
    chain: SimulatedChain,
    account: Address,
}

#[async_trait]
impl SwapContractFactory for SimAccount {
    fn account(&self) -> Address {
        self.account
    }

    async fn balance(&self) -> Result<EtherAmount> {
        let mut state = self.chain.lock();
        state.read()?;
        Ok(state.balances.get(&self.account).copied().unwrap_or_default())
    }

    async fn deploy(&self, params: NewSwap) -> Result<(Arc<dyn SwapContract>, TxHash)> {
        let timeout = params.timeout.as_secs();
        let address = Address::random();
        let tx_hash = {
            let mut state = self.chain.lock();
            state.debit(self.account, params.value)?;
            let t0 = unix_now() + timeout;
            let (events, _) = broadcast::channel(EVENT_CAPACITY);
            state.contracts.insert(
                address,
                Contract {
                    owner: self.account,
                    claimer: params.claimer,
                    claim_commitment: params.claim_commitment,
                    refund_commitment: params.refund_commitment,
                    timeouts: SwapTimeouts {
                        t0,
                        t1: t0 + timeout,
                    },
                    value: params.value,
                    ready: false,
                    completed: false,
                    logs: Vec::new(),
                    events,
                },
            );
            state.emit(
                address,
                ContractEvent::New {
                    claim_commitment: params.claim_commitment,
                    refund_commitment: params.refund_commitment,
                },
            )?
        };
        tracing::debug!(contract = %address, tx_hash = %tx_hash, value = %params.value, "deployed swap contract");
        Ok((self.bind(address), tx_hash))
    }

    fn attach(&self, address: Address) -> Result<Arc<dyn SwapContract>> {
        self.chain.lock().contract(address)?;
        Ok(self.bind(address))
    }
}

impl SimAccount {
    fn bind(&self, address: Address) -> Arc<dyn SwapContract> {
        Arc::new(SimContract {
            chain: self.chain.clone(),
            caller: self.account,
            address,
        })
    }
}

pub struct SimContract {
    chain: SimulatedChain,
    caller: Address,
    address: Address,
}

#[async_trait]
impl SwapContract for SimContract {
    fn address(&self) -> Address {
        self.address
    }

    async fn timeouts(&self) -> Result<SwapTimeouts> {
        let mut state = self.chain.lock();
        state.read()?;
        state.timeout_reads += 1;
        Ok(state.contract(self.address)?.timeouts)
    }

    async fn is_ready(&self) -> Result<bool> {
        let mut state = self.chain.lock();
        state.read()?;
        Ok(state.contract(self.address)?.ready)
    }

    async fn balance(&self) -> Result<EtherAmount> {
        self.chain.lock().read()?;
        self.chain.contract_balance(self.address)
    }

    async fn claimer(&self) -> Result<Address> {
        let mut state = self.chain.lock();
        state.read()?;
        Ok(state.contract(self.address)?.claimer)
    }

    async fn commitments(&self) -> Result<(Commitment, Commitment)> {
        let mut state = self.chain.lock();
        state.read()?;
        let contract = state.contract(self.address)?;
        Ok((contract.claim_commitment, contract.refund_commitment))
    }

    async fn set_ready(&self) -> Result<TxHash> {
        let mut state = self.chain.lock();
        if state.set_ready_failures > 0 {
            state.set_ready_failures -= 1;
            anyhow::bail!("simulated rpc failure submitting set ready");
        }
        let contract = state.contract_mut(self.address)?;
        if contract.completed {
            return Err(ContractRevert::SwapCompleted.into());
        }
        if self.caller != contract.owner {
            return Err(ContractRevert::Unauthorized("set ready").into());
        }
        if unix_now() >= contract.timeouts.t0 {
            return Err(ContractRevert::TooLate("set ready").into());
        }
        contract.ready = true;
        state.emit(self.address, ContractEvent::Ready)
    }

    async fn claim(&self, secret: &[u8; 32]) -> Result<TxHash> {
        let mut state = self.chain.lock();
        let contract = state.contract_mut(self.address)?;
        if contract.completed {
            return Err(ContractRevert::SwapCompleted.into());
        }
        if self.caller != contract.claimer {
            return Err(ContractRevert::Unauthorized("claim").into());
        }
        let now = unix_now();
        if now >= contract.timeouts.t1 {
            return Err(ContractRevert::TooLate("claim").into());
        }
        if !contract.ready && now < contract.timeouts.t0 {
            return Err(ContractRevert::TooEarly("claim").into());
        }
        if commitment_for_secret(secret).ok() != Some(contract.claim_commitment) {
            return Err(ContractRevert::InvalidSecret("claim").into());
        }

        contract.completed = true;
        let (claimer, value) = (contract.claimer, contract.value);
        state.credit(claimer, value)?;
        state.emit(self.address, ContractEvent::Claimed { secret: *secret })
    }

    async fn refund(&self, secret: &[u8; 32]) -> Result<TxHash> {
        let mut state = self.chain.lock();
        let contract = state.contract_mut(self.address)?;
        if contract.completed {
            return Err(ContractRevert::SwapCompleted.into());
        }
        if self.caller != contract.owner {
            return Err(ContractRevert::Unauthorized("refund").into());
        }
        let now = unix_now();
        let allowed = (now < contract.timeouts.t0 && !contract.ready) || now >= contract.timeouts.t1;
        if !allowed {
            return Err(ContractRevert::TooEarly("refund").into());
        }
        if commitment_for_secret(secret).ok() != Some(contract.refund_commitment) {
            return Err(ContractRevert::InvalidSecret("refund").into());
        }

        contract.completed = true;
        let (owner, value) = (contract.owner, contract.value);
        state.credit(owner, value)?;
        state.emit(self.address, ContractEvent::Refunded { secret: *secret })
    }

    async fn transaction_logs(&self, tx_hash: TxHash) -> Result<Vec<ContractLog>> {
        let state = self.chain.lock();
        let logs = state
            .receipts
            .get(&tx_hash)
            .ok_or_else(|| anyhow!("unknown transaction {tx_hash}"))?;
        Ok(logs
            .iter()
            .filter(|log| log.contract == self.address)
            .cloned()
            .collect())
    }

    async fn filter_logs(&self, kind: ContractEventKind) -> Result<Vec<ContractLog>> {
        let mut state = self.chain.lock();
        state.read()?;
        Ok(state
            .contract(self.address)?
            .logs
            .iter()
            .filter(|log| log.event.kind() == kind)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ContractLog> {
        match self.chain.lock().contract(self.address) {
            Ok(contract) => contract.events.subscribe(),
            // Unknown contract: a stream that is already closed.
            Err(_) => broadcast::channel(1).1,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

    use super::*;
    use crate::eth::secp256k1::commitment;

    fn keypair(byte: u8) -> ([u8; 32], Commitment) {
        let secret = [byte; 32];
        let key = SecretKey::from_slice(&secret).unwrap();
        let public = PublicKey::from_secret_key(&Secp256k1::new(), &key);
        (secret, commitment(&public))
    }

    async fn deploy(chain: &SimulatedChain, timeout: Duration) -> (Address, Address, [u8; 32], [u8; 32]) {
        let owner = Address::random();
        let claimer = Address::random();
        chain.fund(owner, EtherAmount::from_wei(1_000)).unwrap();
        let (claim_secret, claim_commitment) = keypair(1);
        let (refund_secret, refund_commitment) = keypair(2);
        let (contract, _) = chain
            .account(owner)
            .deploy(NewSwap {
                claimer,
                claim_commitment,
                refund_commitment,
                timeout,
                value: EtherAmount::from_wei(600),
            })
            .await
            .unwrap();
        (contract.address(), claimer, claim_secret, refund_secret)
    }

    #[tokio::test]
    async fn claim_requires_ready_before_t0() {
        let chain = SimulatedChain::new();
        let (address, claimer, claim_secret, _) = deploy(&chain, Duration::from_secs(60)).await;
        let contract = chain.account(claimer).attach(address).unwrap();

        let err = contract.claim(&claim_secret).await.unwrap_err();
        assert_eq!(
            ContractRevert::from_error(&err),
            Some(&ContractRevert::TooEarly("claim"))
        );
    }

    #[tokio::test]
    async fn refund_before_t0_then_everything_reverts() {
        let chain = SimulatedChain::new();
        let (address, claimer, claim_secret, refund_secret) =
            deploy(&chain, Duration::from_secs(60)).await;
        let owner_view = chain.attach_owner(address);

        let bad = owner_view.refund(&claim_secret).await.unwrap_err();
        assert_eq!(
            ContractRevert::from_error(&bad),
            Some(&ContractRevert::InvalidSecret("refund"))
        );

        owner_view.refund(&refund_secret).await.unwrap();
        assert_eq!(chain.contract_balance(address).unwrap(), EtherAmount::ZERO);

        let again = owner_view.refund(&refund_secret).await.unwrap_err();
        assert!(crate::eth::contract::is_swap_completed(&again));
        let claim = chain
            .account(claimer)
            .attach(address)
            .unwrap()
            .claim(&claim_secret)
            .await
            .unwrap_err();
        assert!(crate::eth::contract::is_swap_completed(&claim));
    }

    #[tokio::test]
    async fn ready_blocks_early_refund_and_allows_claim() {
        let chain = SimulatedChain::new();
        let (address, claimer, claim_secret, refund_secret) =
            deploy(&chain, Duration::from_secs(60)).await;
        let owner_view = chain.attach_owner(address);
        owner_view.set_ready().await.unwrap();

        let err = owner_view.refund(&refund_secret).await.unwrap_err();
        assert_eq!(
            ContractRevert::from_error(&err),
            Some(&ContractRevert::TooEarly("refund"))
        );

        let contract = chain.account(claimer).attach(address).unwrap();
        let tx_hash = contract.claim(&claim_secret).await.unwrap();
        let logs = contract.transaction_logs(tx_hash).await.unwrap();
        assert_eq!(
            crate::eth::contract::find_secret(&logs, ContractEventKind::Claimed),
            Some((tx_hash, claim_secret))
        );
        assert_eq!(chain.balance_of(claimer), EtherAmount::from_wei(600));
    }

    impl SimulatedChain {
        fn attach_owner(&self, address: Address) -> Arc<dyn SwapContract> {
            let owner = self.lock().contract(address).unwrap().owner;
            self.account(owner).attach(address).unwrap()
        }
    }
}
