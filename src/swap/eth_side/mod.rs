//! Asset-locker (ETH) side of the swap.
//!
//! Locks ether in a fresh swap contract, waits for the counterparty to lock
//! monero to the joint address, marks the contract ready and then either
//! learns the counterparty's secret from its claim or refunds.

mod message_handler;
pub mod recovery;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot, watch};

pub use recovery::{EthRecoveryResult, EthRecoveryState};

use super::error::{ChainIoExt as _, SwapError};
use super::info_file::InfoFile;
use super::keys::{KeysAndProof, generate_keys_and_proof};
use super::offer::Offer;
use super::session::{SessionCore, SwapDeps, sleep_until};
use super::{HandleOutcome, SwapId, SwapRecord, SwapRole, SwapSession, SwapStatus};
use crate::coins::{EtherAmount, MoneroAmount};
use crate::eth::contract::{
    ContractEventKind, ContractLog, SwapContract, SwapTimeouts, is_swap_completed, unix_now,
};
use crate::eth::{Address, TxHash};
use crate::net::{Message, MessageType};
use crate::xmr::keys::{PrivateSpendKey, PrivateViewKey, PublicKey};

/// Work pushed by watchers to the session's driver task.
#[derive(Debug)]
pub(crate) enum Command {
    RefundBeforeT0,
    RefundAfterT1,
    ClaimObserved(ContractLog),
}

struct PeerKeys {
    public_spend: PublicKey,
    private_view: PrivateViewKey,
}

#[derive(Default)]
struct State {
    next_expected: Option<MessageType>,
    peer: Option<PeerKeys>,
    contract: Option<Arc<dyn SwapContract>>,
    timeouts: Option<SwapTimeouts>,
    xmr_locked: Option<oneshot::Sender<()>>,
    claimed: Option<oneshot::Sender<()>>,
}

/// How a swap was settled once funds were locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settlement {
    Refunded(TxHash),
    Claimed(monero::Address),
}

struct Inner {
    core: SessionCore,
    offer_id: Option<String>,
    provided: EtherAmount,
    expected: MoneroAmount,
    keys: KeysAndProof,
    state: Mutex<State>,
    commands: mpsc::UnboundedSender<Command>,
}

#[derive(Clone)]
pub struct EthSwapSession {
    inner: Arc<Inner>,
}

impl EthSwapSession {
    /// Takes `offer` for `provided` wei. Must be called inside a tokio runtime.
    pub fn new(deps: SwapDeps, offer: &Offer, provided: EtherAmount) -> Result<Self, SwapError> {
        offer
            .verify_id()
            .map_err(|e| SwapError::ProtocolViolation(format!("{e:#}")))?;
        let expected = offer
            .monero_for(provided)
            .map_err(|e| SwapError::ProtocolViolation(format!("{e:#}")))?;
        Self::with_terms(deps, Some(offer.id().to_string()), provided, expected)
    }

    pub fn with_terms(
        deps: SwapDeps,
        offer_id: Option<String>,
        provided: EtherAmount,
        expected: MoneroAmount,
    ) -> Result<Self, SwapError> {
        let keys = generate_keys_and_proof(deps.dleq.as_ref())?;
        let id = SwapId::new_v4();
        let record = SwapRecord {
            swap_id: id.to_string(),
            role: SwapRole::AssetLocker,
            offer_id: offer_id.clone(),
            eth_amount: provided,
            xmr_amount: expected,
            contract_address: None,
            lock_tx: None,
            xmr_lock_address: None,
            settle_tx: None,
            created_at: unix_now(),
            status: SwapStatus::ExpectingKeys,
        };
        let core = SessionCore::new(record, id, deps);
        core.info
            .write_keys(id, SwapRole::AssetLocker, &keys.private_key_pair, core.env())
            .map_err(SwapError::Persistence)?;

        let (commands, queue) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            core,
            offer_id,
            provided,
            expected,
            keys,
            state: Mutex::new(State {
                next_expected: Some(MessageType::SendKeys),
                ..State::default()
            }),
            commands,
        });
        tokio::spawn(drive(Arc::downgrade(&inner), queue));

        tracing::info!(
            swap_id = %id,
            provided = %provided,
            expected = %expected,
            "created asset-locker swap"
        );
        Ok(Self { inner })
    }

    /// Opening `SendKeys` message for the counterparty.
    pub fn initiate(&self) -> Message {
        let inner = &self.inner;
        Message::SendKeys(crate::net::SendKeys {
            offer_id: inner.offer_id.clone(),
            provided_wei: Some(inner.provided),
            private_view_key: Some(inner.keys.private_key_pair.view.to_hex()),
            eth_address: Some(inner.core.deps.contracts.account()),
            ..inner.keys.to_send_keys()
        })
    }

    pub fn info_file(&self) -> &InfoFile {
        &self.inner.core.info
    }

    pub fn provided(&self) -> EtherAmount {
        self.inner.provided
    }

    pub fn expected(&self) -> MoneroAmount {
        self.inner.expected
    }

    pub async fn contract_address(&self) -> Option<Address> {
        let state = self.inner.state.lock().await;
        state.contract.as_ref().map(|c| c.address())
    }

    /// Refunds on request. Only valid once ether is locked and before the
    /// swap settled.
    pub async fn refund(&self) -> Result<TxHash, SwapError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        match state.next_expected {
            Some(MessageType::NotifyXmrLock | MessageType::NotifyClaimed) => {}
            _ => {
                return Err(SwapError::ProtocolViolation(format!(
                    "cannot refund in status {}",
                    inner.core.status()
                )));
            }
        }
        match inner.settle_by_refund(&mut state).await? {
            Settlement::Refunded(tx_hash) => Ok(tx_hash),
            Settlement::Claimed(_) => Err(SwapError::AlreadyCompleted),
        }
    }
}

#[async_trait]
impl SwapSession for EthSwapSession {
    fn id(&self) -> SwapId {
        self.inner.core.id
    }

    fn role(&self) -> SwapRole {
        SwapRole::AssetLocker
    }

    fn status(&self) -> SwapStatus {
        self.inner.core.status()
    }

    fn subscribe_status(&self) -> watch::Receiver<SwapStatus> {
        self.inner.core.subscribe_status()
    }

    async fn handle_protocol_message(&self, message: Message) -> Result<HandleOutcome, SwapError> {
        self.inner.handle(message).await
    }

    async fn protocol_exited(&self) -> Result<(), SwapError> {
        self.inner.exit().await
    }

    fn shutdown(&self) {
        tracing::warn!(swap_id = %self.inner.core.id, "asset-locker session shut down");
        self.inner.core.cancel();
    }
}

async fn drive(inner: Weak<Inner>, mut queue: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = queue.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.apply(command).await;
    }
}

impl Inner {
    async fn apply(&self, command: Command) {
        let mut state = self.state.lock().await;
        if !self.core.status().is_ongoing() || self.core.is_cancelled() {
            tracing::debug!(swap_id = %self.core.id, ?command, "swap settled; ignoring watcher");
            return;
        }

        let result = match command {
            Command::RefundBeforeT0 if state.next_expected == Some(MessageType::NotifyXmrLock) => {
                tracing::warn!(swap_id = %self.core.id, "monero lock not verified before t0; refunding");
                self.settle_by_refund(&mut state).await.map(drop)
            }
            Command::RefundAfterT1 if state.next_expected == Some(MessageType::NotifyClaimed) => {
                tracing::warn!(swap_id = %self.core.id, "counterparty did not claim before t1; refunding");
                self.settle_by_refund(&mut state).await.map(drop)
            }
            Command::ClaimObserved(log) if state.next_expected == Some(MessageType::NotifyClaimed) => {
                match log.event.secret() {
                    Some(secret) => self
                        .claim_monero(&mut state, secret, log.tx_hash)
                        .await
                        .map(drop),
                    None => Ok(()),
                }
            }
            command => {
                tracing::debug!(swap_id = %self.core.id, ?command, "stage moved on; ignoring watcher");
                Ok(())
            }
        };

        if let Err(err) = result {
            tracing::error!(swap_id = %self.core.id, error = %err, "watcher-driven transition failed");
        }
    }

    async fn exit(&self) -> Result<(), SwapError> {
        let mut state = self.state.lock().await;
        let result = match state.next_expected {
            Some(MessageType::SendKeys) => {
                tracing::info!(swap_id = %self.core.id, "protocol exited before ether was locked");
                state.next_expected = None;
                self.core.set_status(SwapStatus::Aborted);
                Ok(())
            }
            Some(MessageType::NotifyXmrLock | MessageType::NotifyClaimed) => {
                self.settle_by_refund(&mut state).await.map(drop)
            }
            Some(other) => Err(SwapError::ProtocolViolation(format!(
                "asset-locker cannot be waiting for {other}"
            ))),
            None => Ok(()),
        };
        self.core.cancel();
        result
    }

    /// Refunds the contract, or claims the monero if the counterparty
    /// already claimed.
    async fn settle_by_refund(&self, state: &mut State) -> Result<Settlement, SwapError> {
        let contract = state
            .contract
            .clone()
            .ok_or_else(|| SwapError::ProtocolViolation("no contract to refund".to_string()))?;
        let timeouts =
            super::session::cached_timeouts(&self.core.deps, &mut state.timeouts, contract.as_ref())
                .await?;

        let mut cancel = self.core.cancel_rx();
        match refund_contract(
            &self.core.deps,
            contract.as_ref(),
            timeouts,
            self.keys.spend_key(),
            &mut cancel,
        )
        .await
        {
            Ok(tx_hash) => {
                self.finish_refund(state, tx_hash).await;
                Ok(Settlement::Refunded(tx_hash))
            }
            Err(SwapError::AlreadyCompleted) => {
                tracing::info!(swap_id = %self.core.id, "contract already settled; looking for the claim");
                let logs = contract
                    .filter_logs(ContractEventKind::Claimed)
                    .await
                    .chain_io("filter claim logs")?;
                let (tx_hash, secret) =
                    crate::eth::contract::find_secret(&logs, ContractEventKind::Claimed)
                        .ok_or(SwapError::NoLogsFound(ContractEventKind::Claimed))?;
                let address = self.claim_monero(state, secret, tx_hash).await?;
                Ok(Settlement::Claimed(address))
            }
            Err(err) => Err(err),
        }
    }

    async fn finish_refund(&self, state: &mut State, tx_hash: TxHash) {
        state.xmr_locked.take();
        state.claimed.take();
        state.next_expected = None;

        let id = self.core.id.to_string();
        self.core.deps.record(self.core.id, "refund", |s| {
            s.set_settlement(&id, &tx_hash.to_string(), SwapStatus::Refunded)
        });
        self.core.set_status(SwapStatus::Refunded);
        tracing::info!(swap_id = %self.core.id, tx_hash = %tx_hash, "refunded ether");

        if let Err(err) = self
            .core
            .deps
            .sender
            .send_swap_message(Message::NotifyRefund { tx_hash })
            .await
        {
            tracing::warn!(swap_id = %self.core.id, error = %format!("{err:#}"), "failed to notify counterparty of refund");
        }
        self.core.cancel();
    }
}

/// Calls `refund` once the contract allows it: immediately while not ready
/// and before t0, otherwise after t1. Maps "already completed" to
/// `SwapError::AlreadyCompleted`.
pub(crate) async fn refund_contract(
    deps: &SwapDeps,
    contract: &dyn SwapContract,
    timeouts: SwapTimeouts,
    secret: &PrivateSpendKey,
    cancel: &mut watch::Receiver<bool>,
) -> Result<TxHash, SwapError> {
    let claimed = contract
        .filter_logs(ContractEventKind::Claimed)
        .await
        .chain_io("filter claim logs")?;
    if !claimed.is_empty() {
        return Err(SwapError::AlreadyCompleted);
    }

    let ready = contract.is_ready().await.chain_io("read contract ready flag")?;
    let now = unix_now();
    if (ready || now >= timeouts.t0) && now < timeouts.t1 {
        tracing::info!(
            contract = %contract.address(),
            t1 = timeouts.t1,
            "refund not allowed before t1; waiting"
        );
        sleep_until(timeouts.t1_time() + deps.config.claim_buffer, cancel).await?;
    }

    match contract.refund(&secret.to_contract_secret()).await {
        Ok(tx_hash) => Ok(tx_hash),
        Err(err) if is_swap_completed(&err) => Err(SwapError::AlreadyCompleted),
        Err(err) => Err(SwapError::ChainIo(err.context("refund swap contract"))),
    }
}
