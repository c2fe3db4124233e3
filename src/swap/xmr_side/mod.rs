//! Currency-locker (XMR) side of the swap.
//!
//! Answers the asset-locker's keys, checks the deployed contract, locks
//! monero to the joint address and claims the ether once the contract is
//! ready or t0 passed. A refund by the asset-locker reveals its secret, which
//! is enough to take the monero back.

mod message_handler;
pub mod recovery;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey as SecpPublicKey;
use tokio::sync::{Mutex, mpsc, oneshot, watch};

pub use recovery::{XmrRecoveryResult, XmrRecoveryState};

use super::error::{ChainIoExt as _, SwapError};
use super::info_file::InfoFile;
use super::keys::{KeysAndProof, generate_keys_and_proof};
use super::offer::Offer;
use super::session::{SessionCore, SwapDeps, cached_timeouts, open_joint_wallet, sleep_until};
use super::{HandleOutcome, SwapId, SwapRecord, SwapRole, SwapSession, SwapStatus};
use crate::coins::{EtherAmount, MoneroAmount};
use crate::eth::contract::{
    ContractEventKind, ContractLog, SwapContract, SwapTimeouts, find_secret, is_swap_completed,
    unix_now,
};
use crate::eth::{Address, TxHash};
use crate::net::{Message, MessageType};
use crate::xmr::keys::{
    PrivateKeyPair, PrivateSpendKey, PrivateViewKey, PublicKeyPair, sum_private_spend_keys,
    sum_private_view_keys,
};

#[derive(Debug)]
pub(crate) enum Command {
    ClaimAfterT0,
    RefundObserved(ContractLog),
}

struct PeerKeys {
    public: PublicKeyPair,
    private_view: PrivateViewKey,
    secp256k1: SecpPublicKey,
}

#[derive(Default)]
struct State {
    next_expected: Option<MessageType>,
    peer: Option<PeerKeys>,
    contract: Option<Arc<dyn SwapContract>>,
    timeouts: Option<SwapTimeouts>,
    ready: Option<oneshot::Sender<()>>,
    /// Joint address once our monero is sent to it.
    locked: Option<monero::Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settlement {
    Claimed(TxHash),
    Recovered(monero::Address),
}

struct Inner {
    core: SessionCore,
    offer_id: Option<String>,
    provided: MoneroAmount,
    expected: EtherAmount,
    keys: KeysAndProof,
    state: Mutex<State>,
    commands: mpsc::UnboundedSender<Command>,
}

#[derive(Clone)]
pub struct XmrSwapSession {
    inner: Arc<Inner>,
}

impl XmrSwapSession {
    /// Serves `offer` for `provided` piconero, consuming the stored offer if
    /// a store is configured. Must be called inside a tokio runtime.
    pub fn new(deps: SwapDeps, offer: &Offer, provided: MoneroAmount) -> Result<Self, SwapError> {
        offer
            .verify_id()
            .map_err(|e| SwapError::ProtocolViolation(format!("{e:#}")))?;
        let expected = offer
            .ether_for(provided)
            .map_err(|e| SwapError::ProtocolViolation(format!("{e:#}")))?;
        let id = SwapId::new_v4();

        if let Some(store) = &deps.store {
            let mut store = store.lock().expect("store mutex poisoned");
            let stored = store.get_offer(offer.id()).map_err(SwapError::Persistence)?;
            if stored.is_some() {
                store
                    .take_offer(offer.id(), &id.to_string())
                    .map_err(|e| SwapError::ProtocolViolation(format!("{e:#}")))?;
            }
        }

        Self::with_terms(deps, id, Some(offer.id().to_string()), provided, expected)
    }

    fn with_terms(
        deps: SwapDeps,
        id: SwapId,
        offer_id: Option<String>,
        provided: MoneroAmount,
        expected: EtherAmount,
    ) -> Result<Self, SwapError> {
        let keys = generate_keys_and_proof(deps.dleq.as_ref())?;
        let record = SwapRecord {
            swap_id: id.to_string(),
            role: SwapRole::CurrencyLocker,
            offer_id: offer_id.clone(),
            eth_amount: expected,
            xmr_amount: provided,
            contract_address: None,
            lock_tx: None,
            xmr_lock_address: None,
            settle_tx: None,
            created_at: unix_now(),
            status: SwapStatus::ExpectingKeys,
        };
        let core = SessionCore::new(record, id, deps);
        core.info
            .write_keys(id, SwapRole::CurrencyLocker, &keys.private_key_pair, core.env())
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
            "created currency-locker swap"
        );
        Ok(Self { inner })
    }

    pub fn info_file(&self) -> &InfoFile {
        &self.inner.core.info
    }

    pub fn provided(&self) -> MoneroAmount {
        self.inner.provided
    }

    pub fn expected(&self) -> EtherAmount {
        self.inner.expected
    }

    pub async fn contract_address(&self) -> Option<Address> {
        let state = self.inner.state.lock().await;
        state.contract.as_ref().map(|c| c.address())
    }
}

#[async_trait]
impl SwapSession for XmrSwapSession {
    fn id(&self) -> SwapId {
        self.inner.core.id
    }

    fn role(&self) -> SwapRole {
        SwapRole::CurrencyLocker
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
        tracing::warn!(swap_id = %self.inner.core.id, "currency-locker session shut down");
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
            Command::ClaimAfterT0 if state.next_expected == Some(MessageType::NotifyReady) => {
                tracing::warn!(swap_id = %self.core.id, "contract not set ready; claiming after t0");
                match self.settle_by_claim(&mut state).await {
                    Ok(Settlement::Claimed(tx_hash)) => {
                        self.notify(Message::NotifyClaimed { tx_hash }).await;
                        Ok(())
                    }
                    Ok(Settlement::Recovered(_)) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Command::RefundObserved(log) if state.locked.is_some() && state.next_expected.is_some() => {
                match log.event.secret() {
                    Some(secret) => self
                        .reclaim_monero(&mut state, secret, log.tx_hash)
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
            Some(MessageType::SendKeys | MessageType::NotifyEthLocked) => {
                tracing::info!(swap_id = %self.core.id, "protocol exited before monero was locked");
                state.next_expected = None;
                self.core.set_status(SwapStatus::Aborted);
                Ok(())
            }
            Some(MessageType::NotifyReady) => self.settle_by_claim(&mut state).await.map(drop),
            Some(other) => Err(SwapError::ProtocolViolation(format!(
                "currency-locker cannot be waiting for {other}"
            ))),
            None => Ok(()),
        };
        self.core.cancel();
        result
    }

    async fn notify(&self, message: Message) {
        if let Err(err) = self.core.deps.sender.send_swap_message(message).await {
            tracing::warn!(swap_id = %self.core.id, error = %format!("{err:#}"), "failed to notify counterparty");
        }
    }

    /// Claims the ether; if the asset-locker refunded instead, takes the
    /// monero back.
    async fn settle_by_claim(&self, state: &mut State) -> Result<Settlement, SwapError> {
        let contract = state
            .contract
            .clone()
            .ok_or_else(|| SwapError::ProtocolViolation("no contract to claim from".to_string()))?;
        let timeouts = cached_timeouts(&self.core.deps, &mut state.timeouts, contract.as_ref()).await?;

        let mut cancel = self.core.cancel_rx();
        let claim_err = match claim_contract(
            &self.core.deps,
            contract.as_ref(),
            timeouts,
            self.keys.spend_key(),
            &mut cancel,
        )
        .await
        {
            Ok(tx_hash) => {
                self.finish_claim(state, tx_hash);
                return Ok(Settlement::Claimed(tx_hash));
            }
            Err(SwapError::Cancelled) => return Err(SwapError::Cancelled),
            Err(err) => err,
        };

        tracing::info!(swap_id = %self.core.id, error = %claim_err, "claim failed; looking for a refund");
        let logs = contract
            .filter_logs(ContractEventKind::Refunded)
            .await
            .chain_io("filter refund logs")?;
        match find_secret(&logs, ContractEventKind::Refunded) {
            Some((tx_hash, secret)) => self
                .reclaim_monero(state, secret, tx_hash)
                .await
                .map(Settlement::Recovered),
            None => Err(claim_err),
        }
    }

    fn finish_claim(&self, state: &mut State, tx_hash: TxHash) {
        if let Some(ready) = state.ready.take() {
            let _ = ready.send(());
        }
        state.next_expected = None;
        let id = self.core.id.to_string();
        self.core.deps.record(self.core.id, "claim", |s| {
            s.set_settlement(&id, &tx_hash.to_string(), SwapStatus::Success)
        });
        self.core.set_status(SwapStatus::Success);
        self.core.cancel();
        tracing::info!(swap_id = %self.core.id, tx_hash = %tx_hash, amount = %self.expected, "claimed ether");
    }

    /// Rebuilds the joint key from the asset-locker's refund secret and the
    /// view key it sent, then sweeps the monero back to the primary wallet.
    async fn reclaim_monero(
        &self,
        state: &mut State,
        secret: [u8; 32],
        tx_hash: TxHash,
    ) -> Result<monero::Address, SwapError> {
        let peer_spend = PrivateSpendKey::from_contract_secret(secret).map_err(|e| {
            SwapError::ProtocolViolation(format!("refund secret is not a spend key: {e}"))
        })?;
        let peer = state
            .peer
            .as_ref()
            .ok_or_else(|| SwapError::ProtocolViolation("counterparty keys not received".to_string()))?;
        if peer_spend.public() != peer.public.spend {
            return Err(SwapError::ProtocolViolation(
                "refund secret does not match the counterparty spend key".to_string(),
            ));
        }

        let joint = PrivateKeyPair {
            spend: sum_private_spend_keys(self.keys.spend_key(), &peer_spend),
            view: sum_private_view_keys(&self.keys.private_key_pair.view, &peer.private_view),
        };
        let rebuilt = joint
            .address(self.core.deps.network())
            .map_err(|e| SwapError::ProtocolViolation(format!("derive joint address: {e}")))?;
        if let Some(locked) = &state.locked
            && *locked != rebuilt
        {
            return Err(SwapError::AddressMismatch {
                expected: locked.to_string(),
                got: rebuilt.to_string(),
            });
        }

        let address = open_joint_wallet(
            &self.core.deps,
            &self.core.info,
            &self.core.wallet_filename("reclaim"),
            &joint,
            true,
        )
        .await?;

        if let Some(ready) = state.ready.take() {
            let _ = ready.send(());
        }
        state.next_expected = None;
        let id = self.core.id.to_string();
        self.core.deps.record(self.core.id, "refund", |s| {
            s.set_settlement(&id, &tx_hash.to_string(), SwapStatus::Refunded)
        });
        self.core.set_status(SwapStatus::Refunded);
        self.core.cancel();
        tracing::info!(swap_id = %self.core.id, address = %address, "reclaimed monero after refund");
        Ok(address)
    }
}

/// Calls `claim` once the contract allows it: right away when ready,
/// otherwise after t0. Past t1 the claim window is closed.
pub(crate) async fn claim_contract(
    deps: &SwapDeps,
    contract: &dyn SwapContract,
    timeouts: SwapTimeouts,
    secret: &PrivateSpendKey,
    cancel: &mut watch::Receiver<bool>,
) -> Result<TxHash, SwapError> {
    let refunded = contract
        .filter_logs(ContractEventKind::Refunded)
        .await
        .chain_io("filter refund logs")?;
    if !refunded.is_empty() {
        return Err(SwapError::AlreadyCompleted);
    }

    if unix_now() >= timeouts.t1 {
        return Err(SwapError::PastClaimWindow);
    }
    let ready = contract.is_ready().await.chain_io("read contract ready flag")?;
    if !ready && unix_now() < timeouts.t0 {
        tracing::info!(contract = %contract.address(), t0 = timeouts.t0, "contract not ready; waiting for t0");
        sleep_until(timeouts.t0_time() + deps.config.claim_buffer, cancel).await?;
        if unix_now() >= timeouts.t1 {
            return Err(SwapError::PastClaimWindow);
        }
    }

    match contract.claim(&secret.to_contract_secret()).await {
        Ok(tx_hash) => Ok(tx_hash),
        Err(err) if is_swap_completed(&err) => Err(SwapError::AlreadyCompleted),
        Err(err) => Err(SwapError::ChainIo(err.context("claim swap contract"))),
    }
}
