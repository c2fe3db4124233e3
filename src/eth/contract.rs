//! Swap contract adapter.
//!
//! One contract instance holds one swap. The asset-locker deploys it with
//! the ETH value, the claimer's address and two commitments: `claim`
//! (currency-locker's secp256k1 key) and `refund` (asset-locker's key).
//! Rules enforced on-chain:
//!
//! * `set_ready` by the owner, before t0;
//! * `claim(s)` by the claimer, when ready and before t1, or after t0 and
//!   before t1; `s` must open the claim commitment;
//! * `refund(s)` by the owner, before t0 while not ready, or after t1; `s`
//!   must open the refund commitment;
//! * once claimed or refunded, every further call reverts.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::secp256k1::Commitment;
use super::{Address, TxHash};
use crate::coins::EtherAmount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractEventKind {
    New,
    Ready,
    Claimed,
    Refunded,
}

impl fmt::Display for ContractEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContractEventKind::New => "New",
            ContractEventKind::Ready => "Ready",
            ContractEventKind::Claimed => "Claimed",
            ContractEventKind::Refunded => "Refunded",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractEvent {
    New {
        claim_commitment: Commitment,
        refund_commitment: Commitment,
    },
    Ready,
    /// Carries the claimer's big-endian secret.
    Claimed { secret: [u8; 32] },
    /// Carries the owner's big-endian secret.
    Refunded { secret: [u8; 32] },
}

impl ContractEvent {
    pub fn kind(&self) -> ContractEventKind {
        match self {
            ContractEvent::New { .. } => ContractEventKind::New,
            ContractEvent::Ready => ContractEventKind::Ready,
            ContractEvent::Claimed { .. } => ContractEventKind::Claimed,
            ContractEvent::Refunded { .. } => ContractEventKind::Refunded,
        }
    }

    pub fn secret(&self) -> Option<[u8; 32]> {
        match self {
            ContractEvent::Claimed { secret } | ContractEvent::Refunded { secret } => Some(*secret),
            ContractEvent::New { .. } | ContractEvent::Ready => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractLog {
    pub contract: Address,
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub event: ContractEvent,
}

/// Contract deadlines as unix timestamps in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTimeouts {
    pub t0: u64,
    pub t1: u64,
}

impl SwapTimeouts {
    pub fn t0_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.t0)
    }

    pub fn t1_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.t1)
    }
}

#[derive(Debug, Clone)]
pub struct NewSwap {
    pub claimer: Address,
    pub claim_commitment: Commitment,
    pub refund_commitment: Commitment,
    pub timeout: Duration,
    pub value: EtherAmount,
}

/// Reasons the contract rejects a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractRevert {
    #[error("swap is already completed")]
    SwapCompleted,
    #[error("too early to {0}")]
    TooEarly(&'static str),
    #[error("too late to {0}")]
    TooLate(&'static str),
    #[error("secret does not match the {0} commitment")]
    InvalidSecret(&'static str),
    #[error("sender is not allowed to {0}")]
    Unauthorized(&'static str),
    #[error("insufficient balance for {0}")]
    InsufficientBalance(&'static str),
}

impl ContractRevert {
    pub fn from_error(err: &anyhow::Error) -> Option<&ContractRevert> {
        err.downcast_ref::<ContractRevert>()
    }
}

pub fn is_swap_completed(err: &anyhow::Error) -> bool {
    matches!(
        ContractRevert::from_error(err),
        Some(ContractRevert::SwapCompleted)
    )
}

/// Deploys new swap contracts and binds to existing ones on behalf of one
/// account.
#[async_trait]
pub trait SwapContractFactory: Send + Sync {
    /// Account that signs transactions.
    fn account(&self) -> Address;

    /// Spendable balance of `account`.
    async fn balance(&self) -> Result<EtherAmount>;

    async fn deploy(&self, params: NewSwap) -> Result<(Arc<dyn SwapContract>, TxHash)>;

    fn attach(&self, address: Address) -> Result<Arc<dyn SwapContract>>;
}

#[async_trait]
pub trait SwapContract: Send + Sync {
    fn address(&self) -> Address;

    async fn timeouts(&self) -> Result<SwapTimeouts>;

    async fn is_ready(&self) -> Result<bool>;

    async fn balance(&self) -> Result<EtherAmount>;

    async fn claimer(&self) -> Result<Address>;

    /// `(claim, refund)` commitments.
    async fn commitments(&self) -> Result<(Commitment, Commitment)>;

    async fn set_ready(&self) -> Result<TxHash>;

    async fn claim(&self, secret: &[u8; 32]) -> Result<TxHash>;

    async fn refund(&self, secret: &[u8; 32]) -> Result<TxHash>;

    async fn transaction_logs(&self, tx_hash: TxHash) -> Result<Vec<ContractLog>>;

    async fn filter_logs(&self, kind: ContractEventKind) -> Result<Vec<ContractLog>>;

    /// Live events emitted after the call.
    fn subscribe(&self) -> broadcast::Receiver<ContractLog>;
}

/// First revealed secret of `kind` among `logs`.
pub fn find_secret(logs: &[ContractLog], kind: ContractEventKind) -> Option<(TxHash, [u8; 32])> {
    logs.iter()
        .filter(|log| log.event.kind() == kind)
        .find_map(|log| log.event.secret().map(|secret| (log.tx_hash, secret)))
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
