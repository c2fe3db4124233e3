pub mod error;
pub mod eth_side;
pub mod info_file;
pub mod keys;
pub mod offer;
pub mod session;
pub mod store;
pub mod watcher;
pub mod xmr_side;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::coins::{EtherAmount, MoneroAmount};
use crate::net::Message;

pub use error::{ErrorKind, SwapError};
pub use session::SwapDeps;

pub type SwapId = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    ExpectingKeys,
    KeysExchanged,
    EthLocked,
    XmrLocked,
    ContractReady,
    Success,
    Refunded,
    /// Abandoned before any funds were locked.
    Aborted,
}

impl SwapStatus {
    pub fn is_ongoing(self) -> bool {
        !matches!(
            self,
            SwapStatus::Success | SwapStatus::Refunded | SwapStatus::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapStatus::ExpectingKeys => "expecting_keys",
            SwapStatus::KeysExchanged => "keys_exchanged",
            SwapStatus::EthLocked => "eth_locked",
            SwapStatus::XmrLocked => "xmr_locked",
            SwapStatus::ContractReady => "contract_ready",
            SwapStatus::Success => "success",
            SwapStatus::Refunded => "refunded",
            SwapStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "expecting_keys" => SwapStatus::ExpectingKeys,
            "keys_exchanged" => SwapStatus::KeysExchanged,
            "eth_locked" => SwapStatus::EthLocked,
            "xmr_locked" => SwapStatus::XmrLocked,
            "contract_ready" => SwapStatus::ContractReady,
            "success" => SwapStatus::Success,
            "refunded" => SwapStatus::Refunded,
            "aborted" => SwapStatus::Aborted,
            other => anyhow::bail!("unknown swap status: {other}"),
        })
    }
}

/// Which asset this party locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapRole {
    /// Locks ETH in the swap contract.
    AssetLocker,
    /// Locks XMR to the joint address.
    CurrencyLocker,
}

impl SwapRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapRole::AssetLocker => "asset_locker",
            SwapRole::CurrencyLocker => "currency_locker",
        }
    }
}

impl FromStr for SwapRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "asset_locker" => Ok(SwapRole::AssetLocker),
            "currency_locker" => Ok(SwapRole::CurrencyLocker),
            other => anyhow::bail!("unknown swap role: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub swap_id: String,
    pub role: SwapRole,
    pub offer_id: Option<String>,

    pub eth_amount: EtherAmount,
    pub xmr_amount: MoneroAmount,

    pub contract_address: Option<String>,
    pub lock_tx: Option<String>,
    pub xmr_lock_address: Option<String>,
    pub settle_tx: Option<String>,

    pub created_at: u64,
    pub status: SwapStatus,
}

/// Result of delivering one protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleOutcome {
    pub response: Option<Message>,
    /// The session expects no further messages.
    pub done: bool,
}

impl HandleOutcome {
    pub fn respond(message: Message) -> Self {
        Self {
            response: Some(message),
            done: false,
        }
    }

    pub fn finished(response: Option<Message>) -> Self {
        Self {
            response,
            done: true,
        }
    }
}

/// A running swap, driven by the transport.
#[async_trait]
pub trait SwapSession: Send + Sync {
    fn id(&self) -> SwapId;

    fn role(&self) -> SwapRole;

    fn status(&self) -> SwapStatus;

    fn subscribe_status(&self) -> watch::Receiver<SwapStatus>;

    /// Processes one inbound message. Every `Err` means the session is done;
    /// the caller should follow up with `protocol_exited`.
    async fn handle_protocol_message(&self, message: Message) -> Result<HandleOutcome, SwapError>;

    /// The message stream closed. Refunds or claims as needed so that no
    /// locked funds are left behind.
    async fn protocol_exited(&self) -> Result<(), SwapError>;

    /// Stops watchers without touching funds, as a crash would.
    fn shutdown(&self);
}

/// Waits until `status` leaves the ongoing states.
pub async fn wait_for_terminal(mut status: watch::Receiver<SwapStatus>) -> SwapStatus {
    loop {
        let current = *status.borrow_and_update();
        if !current.is_ongoing() {
            return current;
        }
        if status.changed().await.is_err() {
            return *status.borrow();
        }
    }
}
