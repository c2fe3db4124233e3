use std::sync::Arc;

use super::{Command, Inner, PeerKeys, Settlement, State};
use crate::config::Environment;
use crate::eth::contract::{ContractEventKind, SwapContract, find_secret, unix_now};
use crate::eth::secp256k1::commitment;
use crate::eth::{Address, TxHash};
use crate::net::{Message, MessageType, SendKeys};
use crate::retry::retry_with_backoff;
use crate::swap::error::{ChainIoExt as _, ProofError, SwapError};
use crate::swap::keys::verify_send_keys;
use crate::swap::session::{advance, cached_timeouts, check_message_type};
use crate::swap::watcher::{EventTrigger, Watcher};
use crate::swap::{HandleOutcome, SwapStatus};
use crate::xmr::keys::{PrivateViewKey, PublicKeyPair, sum_public_key_pairs};
use crate::xmr::wallet::TransferReceipt;

impl Inner {
    pub(super) async fn handle(&self, message: Message) -> Result<HandleOutcome, SwapError> {
        let mut state = self.state.lock().await;
        // A watcher may have settled the swap while we waited for the lock.
        if self.core.is_cancelled() {
            return Err(SwapError::Cancelled);
        }
        let got = message.message_type();
        // A refund can arrive at any point of a running swap.
        if got != MessageType::NotifyRefund || state.next_expected.is_none() {
            check_message_type(state.next_expected, got)?;
        }

        match message {
            Message::SendKeys(keys) => self.handle_send_keys(&mut state, &keys),
            Message::NotifyEthLocked { address, tx_hash } => {
                self.handle_notify_eth_locked(&mut state, address, tx_hash).await
            }
            Message::NotifyReady => self.handle_notify_ready(&mut state).await,
            Message::NotifyRefund { tx_hash } => {
                self.handle_notify_refund(&mut state, tx_hash).await
            }
            other @ (Message::NotifyXmrLock { .. } | Message::NotifyClaimed { .. }) => {
                Err(SwapError::UnexpectedMessage {
                    expected: state.next_expected,
                    got: other.message_type(),
                })
            }
        }
    }

    fn handle_send_keys(&self, state: &mut State, msg: &SendKeys) -> Result<HandleOutcome, SwapError> {
        let verified = verify_send_keys(self.core.deps.dleq.as_ref(), msg)?;
        let missing = |field| SwapError::MissingField {
            message: MessageType::SendKeys,
            field,
        };
        let private_view = msg
            .private_view_key
            .as_deref()
            .ok_or_else(|| missing("private_view_key"))?;
        let private_view = PrivateViewKey::from_hex(private_view).map_err(ProofError::from)?;
        let offered = msg.provided_wei.ok_or_else(|| missing("provided_wei"))?;

        if offered < self.expected {
            return Err(SwapError::AmountTooLow {
                expected: self.expected.to_string(),
                offered: offered.to_string(),
            });
        }
        if let (Some(ours), Some(theirs)) = (&self.offer_id, &msg.offer_id)
            && ours != theirs
        {
            return Err(SwapError::ProtocolViolation(format!(
                "counterparty took offer {theirs}, this swap serves {ours}"
            )));
        }

        self.core
            .info
            .write_counterparty_keys(&verified.ed25519_public_key, &private_view)
            .map_err(SwapError::Persistence)?;
        state.peer = Some(PeerKeys {
            public: PublicKeyPair {
                spend: verified.ed25519_public_key,
                view: private_view.public(),
            },
            private_view,
            secp256k1: verified.secp256k1_public_key,
        });
        advance(&mut state.next_expected, Some(MessageType::NotifyEthLocked));
        self.core.set_status(SwapStatus::KeysExchanged);

        Ok(HandleOutcome::respond(Message::SendKeys(SendKeys {
            offer_id: self.offer_id.clone(),
            provided_piconero: Some(self.provided),
            private_view_key: Some(self.keys.private_key_pair.view.to_hex()),
            eth_address: Some(self.core.deps.contracts.account()),
            ..self.keys.to_send_keys()
        })))
    }

    async fn handle_notify_eth_locked(
        &self,
        state: &mut State,
        address: Address,
        tx_hash: TxHash,
    ) -> Result<HandleOutcome, SwapError> {
        let deps = &self.core.deps;
        let contract = deps
            .contracts
            .attach(address)
            .chain_io("attach swap contract")?;
        self.core
            .info
            .write_contract_address(address)
            .map_err(SwapError::Persistence)?;
        let id = self.core.id.to_string();
        deps.record(self.core.id, "contract", |s| {
            s.set_contract(&id, &address.to_string(), None)
        });
        tracing::info!(swap_id = %self.core.id, contract = %address, tx_hash = %tx_hash, "counterparty locked ether");

        self.check_contract(state, contract.as_ref()).await?;
        let timeouts = cached_timeouts(deps, &mut state.timeouts, contract.as_ref()).await?;
        if unix_now().saturating_add(deps.config.refund_buffer.as_secs()) >= timeouts.t0 {
            return Err(SwapError::DeadlinePassed("too close to t0 to lock monero"));
        }

        let events = contract.subscribe();
        state.contract = Some(Arc::clone(&contract));
        let (joint_address, receipt) = self.lock_monero(state).await?;

        let lock_address = joint_address.to_string();
        state.locked = Some(joint_address);
        advance(&mut state.next_expected, Some(MessageType::NotifyReady));
        self.core.set_status(SwapStatus::XmrLocked);
        deps.record(self.core.id, "monero lock", |s| {
            s.set_xmr_lock(&id, &lock_address, Some(&receipt.tx_id))
        });

        let (ready, done) = tokio::sync::oneshot::channel();
        state.ready = Some(ready);
        Watcher {
            name: "t0",
            swap_id: self.core.id,
            fire_at: timeouts.t0_time() + deps.config.claim_buffer,
            on_deadline: Command::ClaimAfterT0,
            done,
            cancel: self.core.cancel_rx(),
            event: Some(EventTrigger {
                events,
                kind: ContractEventKind::Refunded,
                command: Command::RefundObserved,
            }),
        }
        .spawn(self.commands.clone());

        // The monero has left the wallet: from here on a failure ends in a
        // claim or reclaim, never an abort.
        self.mine_lock().await?;

        Ok(HandleOutcome::respond(Message::NotifyXmrLock {
            address: lock_address,
            tx_id: Some(receipt.tx_id),
        }))
    }

    /// The contract must hold the agreed ether, name us as claimer and commit
    /// to both parties' keys.
    async fn check_contract(&self, state: &State, contract: &dyn SwapContract) -> Result<(), SwapError> {
        let peer = state
            .peer
            .as_ref()
            .ok_or_else(|| SwapError::ProtocolViolation("counterparty keys not received".to_string()))?;
        let backoff = &self.core.deps.config.backoff;

        let balance = retry_with_backoff("read contract balance", backoff, || contract.balance())
            .await
            .map_err(SwapError::ChainIo)?;
        if balance < self.expected {
            return Err(SwapError::ProtocolViolation(format!(
                "contract holds {balance}, expected {}",
                self.expected
            )));
        }

        let (claim, refund) =
            retry_with_backoff("read contract commitments", backoff, || contract.commitments())
                .await
                .map_err(SwapError::ChainIo)?;
        if claim != self.keys.commitment() {
            return Err(SwapError::ProtocolViolation(
                "claim commitment does not match our key".to_string(),
            ));
        }
        if refund != commitment(&peer.secp256k1) {
            return Err(SwapError::ProtocolViolation(
                "refund commitment does not match the counterparty key".to_string(),
            ));
        }

        let claimer = retry_with_backoff("read contract claimer", backoff, || contract.claimer())
            .await
            .map_err(SwapError::ChainIo)?;
        let account = self.core.deps.contracts.account();
        if claimer != account {
            return Err(SwapError::ProtocolViolation(format!(
                "contract claimer is {claimer}, expected {account}"
            )));
        }
        Ok(())
    }

    async fn lock_monero(&self, state: &State) -> Result<(monero::Address, TransferReceipt), SwapError> {
        let peer = state
            .peer
            .as_ref()
            .ok_or_else(|| SwapError::ProtocolViolation("counterparty keys not received".to_string()))?;
        let joint = sum_public_key_pairs(&self.keys.public_key_pair, &peer.public);
        let address = joint
            .address(self.core.deps.network())
            .map_err(|e| SwapError::ProtocolViolation(format!("derive joint address: {e}")))?;

        let cfg = &self.core.deps.config;
        let wallet = self.core.deps.wallet.as_ref();
        wallet
            .open_wallet(&cfg.xmr_wallet_file)
            .await
            .chain_io("open primary monero wallet")?;
        let balance = retry_with_backoff("read monero balance", &cfg.backoff, || async move {
            wallet.refresh().await?;
            wallet.get_balance().await
        })
        .await
        .map_err(SwapError::ChainIo)?;
        if balance.unlocked_balance < self.provided {
            return Err(SwapError::insufficient_monero(
                self.provided,
                balance.unlocked_balance,
            ));
        }

        let receipt = wallet
            .transfer(&address, self.provided)
            .await
            .chain_io("lock monero")?;
        tracing::info!(
            swap_id = %self.core.id,
            address = %address,
            tx_id = %receipt.tx_id,
            amount = %receipt.amount,
            fee = %receipt.fee,
            "locked monero to joint address"
        );
        Ok((address, receipt))
    }

    /// Development networks have no miner; mine the lock ourselves.
    async fn mine_lock(&self) -> Result<(), SwapError> {
        if self.core.deps.config.env != Environment::Development {
            return Ok(());
        }
        let wallet = self.core.deps.wallet.as_ref();
        let own = wallet.get_address().await.chain_io("get primary monero address")?;
        wallet
            .generate_blocks(&own, 1)
            .await
            .chain_io("mine monero lock")?;
        Ok(())
    }

    async fn handle_notify_ready(&self, state: &mut State) -> Result<HandleOutcome, SwapError> {
        if let Some(ready) = state.ready.take() {
            let _ = ready.send(());
        }
        self.core.set_status(SwapStatus::ContractReady);
        match self.settle_by_claim(state).await? {
            Settlement::Claimed(tx_hash) => Ok(HandleOutcome::finished(Some(
                Message::NotifyClaimed { tx_hash },
            ))),
            Settlement::Recovered(_) => Ok(HandleOutcome::finished(None)),
        }
    }

    async fn handle_notify_refund(
        &self,
        state: &mut State,
        tx_hash: TxHash,
    ) -> Result<HandleOutcome, SwapError> {
        if state.locked.is_none() {
            tracing::info!(swap_id = %self.core.id, tx_hash = %tx_hash, "counterparty refunded before monero was locked");
            state.ready.take();
            state.next_expected = None;
            self.core.set_status(SwapStatus::Aborted);
            self.core.cancel();
            return Ok(HandleOutcome::finished(None));
        }

        let contract = state
            .contract
            .clone()
            .ok_or_else(|| SwapError::ProtocolViolation("no contract to read".to_string()))?;
        let logs = contract
            .transaction_logs(tx_hash)
            .await
            .chain_io("read refund transaction logs")?;
        let (_, secret) = find_secret(&logs, ContractEventKind::Refunded).ok_or_else(|| {
            SwapError::ProtocolViolation(format!("transaction {tx_hash} has no Refunded event"))
        })?;
        self.reclaim_monero(state, secret, tx_hash).await?;
        Ok(HandleOutcome::finished(None))
    }
}
