use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;

use super::error::{ChainIoExt as _, SwapError};
use super::info_file::InfoFile;
use super::store::SqliteSwapStore;
use super::{SwapId, SwapRecord, SwapRole, SwapStatus};
use crate::config::{Environment, SwapConfig};
use crate::dleq::DleqProver;
use crate::eth::contract::{SwapContract, SwapContractFactory, SwapTimeouts};
use crate::net::{MessageSender, MessageType};
use crate::retry::retry_with_backoff;
use crate::xmr::keys::{
    PrivateKeyPair, PrivateSpendKey, PrivateViewKey, PublicKey, sum_private_spend_keys,
    sum_private_view_keys,
};
use crate::xmr::wallet::{self, WalletClient};

/// Collaborators a session needs, passed in at construction.
#[derive(Clone)]
pub struct SwapDeps {
    pub config: SwapConfig,
    pub contracts: Arc<dyn SwapContractFactory>,
    pub wallet: Arc<dyn WalletClient>,
    pub sender: Arc<dyn MessageSender>,
    pub dleq: Arc<dyn DleqProver>,
    pub store: Option<Arc<Mutex<SqliteSwapStore>>>,
}

impl SwapDeps {
    pub fn network(&self) -> monero::Network {
        self.config.env.monero_network()
    }

    pub(crate) fn record(&self, swap_id: SwapId, what: &'static str, f: impl FnOnce(&mut SqliteSwapStore) -> anyhow::Result<()>) {
        let Some(store) = &self.store else {
            return;
        };
        let mut store = store.lock().expect("store mutex poisoned");
        if let Err(err) = f(&mut store) {
            tracing::warn!(swap_id = %swap_id, error = %format!("{err:#}"), "failed to record {what}");
        }
    }
}

/// State shared by both roles: identity, status and the session context.
pub(crate) struct SessionCore {
    pub(crate) id: SwapId,
    pub(crate) role: SwapRole,
    pub(crate) deps: SwapDeps,
    pub(crate) info: InfoFile,
    status_tx: watch::Sender<SwapStatus>,
    cancel_tx: watch::Sender<bool>,
}

impl SessionCore {
    pub(crate) fn new(record: SwapRecord, id: SwapId, deps: SwapDeps) -> Self {
        let info = InfoFile::for_swap(&deps.config.basepath, id);
        let (status_tx, _) = watch::channel(record.status);
        let (cancel_tx, _) = watch::channel(false);
        deps.record(id, "swap", |s| s.insert_swap(&record));
        Self {
            id,
            role: record.role,
            deps,
            info,
            status_tx,
            cancel_tx,
        }
    }

    pub(crate) fn status(&self) -> SwapStatus {
        *self.status_tx.borrow()
    }

    pub(crate) fn subscribe_status(&self) -> watch::Receiver<SwapStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn set_status(&self, status: SwapStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous == status {
            return;
        }
        tracing::info!(swap_id = %self.id, role = self.role.as_str(), from = %previous, to = %status, "swap status changed");
        let id = self.id.to_string();
        self.deps.record(self.id, "status", |s| s.update_status(&id, status));
    }

    pub(crate) fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub(crate) fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(crate) fn env(&self) -> Environment {
        self.deps.config.env
    }

    pub(crate) fn wallet_filename(&self, purpose: &str) -> String {
        format!("swap-{}-{purpose}", self.id)
    }
}

/// Rejects any message other than the one the cursor expects.
pub(crate) fn check_message_type(
    expected: Option<MessageType>,
    got: MessageType,
) -> Result<(), SwapError> {
    if expected == Some(got) {
        Ok(())
    } else {
        Err(SwapError::UnexpectedMessage { expected, got })
    }
}

/// Moves the cursor forward; it never goes back.
pub(crate) fn advance(cursor: &mut Option<MessageType>, next: Option<MessageType>) {
    debug_assert!(
        match (*cursor, next) {
            (Some(current), Some(next)) => next > current,
            _ => true,
        },
        "protocol cursor moved backwards"
    );
    *cursor = next;
}

pub(crate) fn duration_until(deadline: SystemTime) -> Duration {
    deadline
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO)
}

/// Sleeps until `deadline` unless the session is cancelled first. A closed
/// context cannot be cancelled any more and just sleeps.
pub(crate) async fn sleep_until(
    deadline: SystemTime,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), SwapError> {
    loop {
        if *cancel.borrow_and_update() {
            return Err(SwapError::Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration_until(deadline)) => return Ok(()),
            changed = cancel.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(duration_until(deadline)).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Reads t0/t1 with bounded backoff. Callers cache the result and never call
/// this again for the same contract.
pub(crate) async fn fetch_timeouts(
    deps: &SwapDeps,
    contract: &dyn SwapContract,
) -> Result<SwapTimeouts, SwapError> {
    let timeouts = retry_with_backoff("fetch swap timeouts", &deps.config.backoff, || {
        contract.timeouts()
    })
    .await
    .map_err(SwapError::ChainIo)?;
    if timeouts.t0 >= timeouts.t1 {
        return Err(SwapError::ProtocolViolation(format!(
            "contract deadlines out of order: t0={} t1={}",
            timeouts.t0, timeouts.t1
        )));
    }
    Ok(timeouts)
}

/// Counterparty keys as written to the info file before funds moved.
#[derive(Debug, Clone)]
pub(crate) struct StoredPeerKeys {
    pub spend: PublicKey,
    pub view: PrivateViewKey,
}

pub(crate) fn load_peer_keys(info: &InfoFile) -> Result<Option<StoredPeerKeys>, SwapError> {
    Ok(info
        .counterparty_keys()
        .map_err(SwapError::Persistence)?
        .map(|(spend, view)| StoredPeerKeys { spend, view }))
}

/// Joint key pair from our keys and the counterparty's revealed secret.
/// The view share comes from the stored keys; without them it is derived
/// from the secret, which only matches a counterparty that derives its view
/// key the same way.
pub(crate) fn recovered_joint_keys(
    swap: impl std::fmt::Display,
    own: &PrivateKeyPair,
    secret: [u8; 32],
    stored: Option<&StoredPeerKeys>,
) -> Result<PrivateKeyPair, SwapError> {
    let peer_spend = PrivateSpendKey::from_contract_secret(secret).map_err(|e| {
        SwapError::ProtocolViolation(format!("revealed secret is not a spend key: {e}"))
    })?;
    let peer_view = match stored {
        Some(peer) if peer_spend.public() != peer.spend => {
            return Err(SwapError::ProtocolViolation(
                "revealed secret does not match the stored counterparty spend key".to_string(),
            ));
        }
        Some(peer) => peer.view.clone(),
        None => {
            tracing::warn!(swap = %swap, "no stored counterparty keys; deriving the view key from the secret");
            peer_spend.view()
        }
    };
    Ok(PrivateKeyPair {
        spend: sum_private_spend_keys(&own.spend, &peer_spend),
        view: sum_private_view_keys(&own.view, &peer_view),
    })
}

/// Stores `joint` in the info file, then opens a spendable wallet for it,
/// optionally sweeping the funds to the primary wallet.
pub(crate) async fn open_joint_wallet(
    deps: &SwapDeps,
    info: &InfoFile,
    filename: &str,
    joint: &PrivateKeyPair,
    sweep: bool,
) -> Result<monero::Address, SwapError> {
    let env = deps.config.env;
    info.write_shared_swap_private_key(joint, env)
        .map_err(SwapError::Persistence)?;

    let address = joint
        .address(deps.network())
        .map_err(|e| SwapError::ProtocolViolation(format!("derive joint address: {e}")))?;

    let destination = if sweep {
        deps.wallet
            .open_wallet(&deps.config.xmr_wallet_file)
            .await
            .chain_io("open primary monero wallet")?;
        Some(
            deps.wallet
                .get_address()
                .await
                .chain_io("get primary monero address")?,
        )
    } else {
        None
    };

    deps.wallet
        .generate_from_keys(filename, joint, &address)
        .await
        .chain_io("create joint monero wallet")?;
    deps.wallet.refresh().await.chain_io("refresh joint monero wallet")?;

    if let Some(destination) = destination {
        let balance = deps.wallet.get_balance().await.chain_io("get joint balance")?;
        if env == Environment::Development && balance.blocks_to_unlock > 0 {
            deps.wallet
                .generate_blocks(&destination, balance.blocks_to_unlock)
                .await
                .chain_io("mine unlock blocks")?;
        }
        wallet::wait_until_balance_unlocks(
            deps.wallet.as_ref(),
            deps.config.confirmation_poll_interval,
            deps.config.swap_timeout,
        )
        .await
        .chain_io("wait for joint balance to unlock")?;
        let receipts = deps
            .wallet
            .sweep_all(&destination)
            .await
            .chain_io("sweep joint wallet")?;
        for receipt in &receipts {
            tracing::info!(tx_id = %receipt.tx_id, amount = %receipt.amount, to = %destination, "swept joint monero");
        }
    }

    deps.wallet.close_wallet().await.chain_io("close joint monero wallet")?;
    Ok(address)
}

/// Cached deadlines, fetched on first use. The slot is written once.
pub(crate) async fn cached_timeouts(
    deps: &SwapDeps,
    slot: &mut Option<SwapTimeouts>,
    contract: &dyn SwapContract,
) -> Result<SwapTimeouts, SwapError> {
    if let Some(timeouts) = *slot {
        return Ok(timeouts);
    }
    let timeouts = fetch_timeouts(deps, contract).await?;
    *slot = Some(timeouts);
    Ok(timeouts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::error::ErrorKind;

    fn stored(peer: &PrivateSpendKey, view: PrivateViewKey) -> StoredPeerKeys {
        StoredPeerKeys {
            spend: peer.public(),
            view,
        }
    }

    #[test]
    fn recovered_keys_use_the_stored_view_key() {
        let own = PrivateSpendKey::random().key_pair();
        let peer = PrivateSpendKey::random();
        let sent_view = PrivateSpendKey::random().view();

        let joint = recovered_joint_keys(
            "swap",
            &own,
            peer.to_contract_secret(),
            Some(&stored(&peer, sent_view.clone())),
        )
        .unwrap();
        assert_eq!(joint.spend, sum_private_spend_keys(&own.spend, &peer));
        assert_eq!(joint.view, sum_private_view_keys(&own.view, &sent_view));
        assert_ne!(joint.view, sum_private_view_keys(&own.view, &peer.view()));
    }

    #[test]
    fn recovered_keys_reject_a_secret_for_another_spend_key() {
        let own = PrivateSpendKey::random().key_pair();
        let peer = PrivateSpendKey::random();
        let other = PrivateSpendKey::random();

        let err = recovered_joint_keys(
            "swap",
            &own,
            other.to_contract_secret(),
            Some(&stored(&peer, peer.view())),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn recovered_keys_without_stored_keys_derive_the_view_key() {
        let own = PrivateSpendKey::random().key_pair();
        let peer = PrivateSpendKey::random();

        let joint = recovered_joint_keys("swap", &own, peer.to_contract_secret(), None).unwrap();
        assert_eq!(joint.view, sum_private_view_keys(&own.view, &peer.view()));
    }
}
