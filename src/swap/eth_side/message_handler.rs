use std::sync::Arc;
use std::time::UNIX_EPOCH;

use super::{Command, Inner, PeerKeys, State};
use crate::eth::TxHash;
use crate::eth::contract::{ContractEventKind, NewSwap, find_secret};
use crate::eth::secp256k1::commitment;
use crate::net::{Message, MessageType, SendKeys};
use crate::retry::retry_with_backoff;
use crate::swap::HandleOutcome;
use crate::swap::SwapStatus;
use crate::swap::error::{ChainIoExt as _, ProofError, SwapError};
use crate::swap::keys::verify_send_keys;
use crate::swap::session::{advance, cached_timeouts, check_message_type, open_joint_wallet};
use crate::swap::watcher::{EventTrigger, Watcher};
use crate::xmr::keys::{
    PrivateKeyPair, PrivateSpendKey, PrivateViewKey, PublicKeyPair, sum_private_spend_keys,
    sum_private_view_keys, sum_public_keys,
};
use crate::xmr::wallet;

impl Inner {
    pub(super) async fn handle(&self, message: Message) -> Result<HandleOutcome, SwapError> {
        let mut state = self.state.lock().await;
        // A watcher may have settled the swap while we waited for the lock.
        if self.core.is_cancelled() {
            return Err(SwapError::Cancelled);
        }
        check_message_type(state.next_expected, message.message_type())?;

        match message {
            Message::SendKeys(keys) => self.handle_send_keys(&mut state, &keys).await,
            Message::NotifyXmrLock { address, .. } => {
                drop(state);
                self.handle_notify_xmr_lock(&address).await
            }
            Message::NotifyClaimed { tx_hash } => {
                self.handle_notify_claimed(&mut state, tx_hash).await
            }
            other @ (Message::NotifyEthLocked { .. }
            | Message::NotifyReady
            | Message::NotifyRefund { .. }) => Err(SwapError::UnexpectedMessage {
                expected: state.next_expected,
                got: other.message_type(),
            }),
        }
    }

    async fn handle_send_keys(
        &self,
        state: &mut State,
        msg: &SendKeys,
    ) -> Result<HandleOutcome, SwapError> {
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
        let eth_address = msg.eth_address.ok_or_else(|| missing("eth_address"))?;
        let offered = msg
            .provided_piconero
            .ok_or_else(|| missing("provided_piconero"))?;

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
                "counterparty answered offer {theirs}, expected {ours}"
            )));
        }

        let deps = &self.core.deps;
        let balance = retry_with_backoff("read ether balance", &deps.config.backoff, || {
            deps.contracts.balance()
        })
        .await
        .map_err(SwapError::ChainIo)?;
        if balance < self.provided {
            return Err(SwapError::insufficient_ether(self.provided, balance));
        }

        self.core
            .info
            .write_counterparty_keys(&verified.ed25519_public_key, &private_view)
            .map_err(SwapError::Persistence)?;

        let claim_commitment = commitment(&verified.secp256k1_public_key);
        state.peer = Some(PeerKeys {
            public_spend: verified.ed25519_public_key,
            private_view,
        });
        self.core.set_status(SwapStatus::KeysExchanged);

        let (contract, tx_hash) = deps
            .contracts
            .deploy(NewSwap {
                claimer: eth_address,
                claim_commitment,
                refund_commitment: self.keys.commitment(),
                timeout: deps.config.swap_timeout,
                value: self.provided,
            })
            .await
            .chain_io("deploy swap contract")?;
        let address = contract.address();
        tracing::info!(
            swap_id = %self.core.id,
            contract = %address,
            tx_hash = %tx_hash,
            claimer = %eth_address,
            amount = %self.provided,
            "locked ether in swap contract"
        );

        state.contract = Some(Arc::clone(&contract));
        advance(&mut state.next_expected, Some(MessageType::NotifyXmrLock));
        self.core.set_status(SwapStatus::EthLocked);

        self.core
            .info
            .write_contract_address(address)
            .map_err(SwapError::Persistence)?;
        let id = self.core.id.to_string();
        deps.record(self.core.id, "contract", |s| {
            s.set_contract(&id, &address.to_string(), Some(&tx_hash.to_string()))
        });

        let timeouts = cached_timeouts(deps, &mut state.timeouts, contract.as_ref()).await?;
        let (xmr_locked, done) = tokio::sync::oneshot::channel();
        state.xmr_locked = Some(xmr_locked);
        Watcher {
            name: "t0",
            swap_id: self.core.id,
            fire_at: timeouts
                .t0_time()
                .checked_sub(deps.config.refund_buffer)
                .unwrap_or(UNIX_EPOCH),
            on_deadline: Command::RefundBeforeT0,
            done,
            cancel: self.core.cancel_rx(),
            event: None,
        }
        .spawn(self.commands.clone());

        Ok(HandleOutcome::respond(Message::NotifyEthLocked {
            address,
            tx_hash,
        }))
    }

    async fn handle_notify_xmr_lock(&self, address: &str) -> Result<HandleOutcome, SwapError> {
        let (joint, joint_view) = {
            let state = self.state.lock().await;
            let peer = peer_keys(&state)?;
            let view = sum_private_view_keys(&self.keys.private_key_pair.view, &peer.private_view);
            let joint = PublicKeyPair {
                spend: sum_public_keys(&self.keys.public_key_pair.spend, &peer.public_spend),
                view: view.public(),
            };
            (joint, view)
        };

        let expected = joint
            .address(self.core.deps.network())
            .map_err(|e| SwapError::ProtocolViolation(format!("derive joint address: {e}")))?;
        if expected.to_string() != address {
            return Err(SwapError::AddressMismatch {
                expected: expected.to_string(),
                got: address.to_string(),
            });
        }

        self.verify_xmr_lock(&expected, &joint_view).await?;

        let mut state = self.state.lock().await;
        if state.next_expected != Some(MessageType::NotifyXmrLock) || !self.core.status().is_ongoing() {
            return Err(SwapError::DeadlinePassed(
                "swap settled while the monero lock was being verified",
            ));
        }
        self.core.set_status(SwapStatus::XmrLocked);
        let id = self.core.id.to_string();
        self.core.deps.record(self.core.id, "monero lock", |s| {
            s.set_xmr_lock(&id, address, None)
        });

        let contract = state
            .contract
            .clone()
            .ok_or_else(|| SwapError::ProtocolViolation("no contract to mark ready".to_string()))?;
        let events = contract.subscribe();
        // The t0 watcher stays armed until the contract is actually ready.
        let tx_hash = contract.set_ready().await.chain_io("set swap contract ready")?;
        if let Some(xmr_locked) = state.xmr_locked.take() {
            let _ = xmr_locked.send(());
        }
        tracing::info!(swap_id = %self.core.id, tx_hash = %tx_hash, "swap contract set ready");
        self.core.set_status(SwapStatus::ContractReady);

        let timeouts =
            cached_timeouts(&self.core.deps, &mut state.timeouts, contract.as_ref()).await?;
        let (claimed, done) = tokio::sync::oneshot::channel();
        state.claimed = Some(claimed);
        Watcher {
            name: "t1",
            swap_id: self.core.id,
            fire_at: timeouts.t1_time() + self.core.deps.config.claim_buffer,
            on_deadline: Command::RefundAfterT1,
            done,
            cancel: self.core.cancel_rx(),
            event: Some(EventTrigger {
                events,
                kind: ContractEventKind::Claimed,
                command: Command::ClaimObserved,
            }),
        }
        .spawn(self.commands.clone());

        advance(&mut state.next_expected, Some(MessageType::NotifyClaimed));
        Ok(HandleOutcome::respond(Message::NotifyReady))
    }

    /// Checks through a view-only wallet that the joint address holds at
    /// least the expected amount. Runs without the session lock.
    async fn verify_xmr_lock(
        &self,
        address: &monero::Address,
        view: &PrivateViewKey,
    ) -> Result<(), SwapError> {
        let cfg = &self.core.deps.config;
        let wallet = self.core.deps.wallet.as_ref();
        wallet
            .generate_view_only_wallet(&self.core.wallet_filename("view"), view, address)
            .await
            .chain_io("open joint view-only wallet")?;

        if cfg.xmr_confirmations > 0 {
            let height = wallet.get_height().await.chain_io("get monero height")?;
            wallet::wait_for_confirmations(
                wallet,
                height,
                cfg.xmr_confirmations,
                cfg.confirmation_poll_interval,
                cfg.swap_timeout,
            )
            .await
            .chain_io("wait for monero lock confirmations")?;
        }

        let balance = retry_with_backoff("read joint wallet balance", &cfg.backoff, || async move {
            wallet.refresh().await?;
            wallet.get_balance().await
        })
        .await
        .map_err(SwapError::ChainIo)?;
        wallet.close_wallet().await.chain_io("close view-only wallet")?;

        if balance.balance < self.expected {
            return Err(SwapError::LockedAmountTooLow {
                expected: self.expected,
                actual: balance.balance,
            });
        }
        tracing::info!(
            swap_id = %self.core.id,
            address = %address,
            balance = %balance.balance,
            "verified monero lock"
        );
        Ok(())
    }

    async fn handle_notify_claimed(
        &self,
        state: &mut State,
        tx_hash: TxHash,
    ) -> Result<HandleOutcome, SwapError> {
        let contract = state
            .contract
            .clone()
            .ok_or_else(|| SwapError::ProtocolViolation("no contract to read".to_string()))?;
        let logs = contract
            .transaction_logs(tx_hash)
            .await
            .chain_io("read claim transaction logs")?;
        let (_, secret) = find_secret(&logs, ContractEventKind::Claimed).ok_or_else(|| {
            SwapError::ProtocolViolation(format!("transaction {tx_hash} has no Claimed event"))
        })?;
        self.claim_monero(state, secret, tx_hash).await?;
        Ok(HandleOutcome::finished(None))
    }

    /// Rebuilds the joint key from the revealed claim secret and takes the
    /// monero.
    pub(super) async fn claim_monero(
        &self,
        state: &mut State,
        secret: [u8; 32],
        tx_hash: TxHash,
    ) -> Result<monero::Address, SwapError> {
        let peer = peer_keys(state)?;
        let peer_spend = PrivateSpendKey::from_contract_secret(secret).map_err(|e| {
            SwapError::ProtocolViolation(format!("claim secret is not a spend key: {e}"))
        })?;
        if peer_spend.public() != peer.public_spend {
            return Err(SwapError::ProtocolViolation(
                "claim secret does not match the counterparty spend key".to_string(),
            ));
        }

        let joint = PrivateKeyPair {
            spend: sum_private_spend_keys(self.keys.spend_key(), &peer_spend),
            view: sum_private_view_keys(&self.keys.private_key_pair.view, &peer.private_view),
        };
        let address = open_joint_wallet(
            &self.core.deps,
            &self.core.info,
            &self.core.wallet_filename("claim"),
            &joint,
            self.core.deps.config.sweep_to_primary,
        )
        .await?;

        if let Some(claimed) = state.claimed.take() {
            let _ = claimed.send(());
        }
        state.next_expected = None;
        let id = self.core.id.to_string();
        self.core.deps.record(self.core.id, "claim", |s| {
            s.set_settlement(&id, &tx_hash.to_string(), SwapStatus::Success)
        });
        self.core.set_status(SwapStatus::Success);
        self.core.cancel();
        tracing::info!(swap_id = %self.core.id, address = %address, "claimed monero");
        Ok(address)
    }
}

fn peer_keys(state: &State) -> Result<&PeerKeys, SwapError> {
    state
        .peer
        .as_ref()
        .ok_or_else(|| SwapError::ProtocolViolation("counterparty keys not received".to_string()))
}
