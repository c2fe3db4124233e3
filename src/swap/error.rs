use crate::coins::{EtherAmount, MoneroAmount};
use crate::dleq::DleqError;
use crate::eth::contract::ContractEventKind;
use crate::net::MessageType;
use crate::xmr::keys::KeyError;

/// Coarse classification used by callers to decide between aborting,
/// retrying and waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal to the session; nothing new was put at risk by this error.
    ProtocolViolation,
    /// Counterparty cryptography failed verification.
    ProofInvalid,
    ChainIo,
    InsufficientFunds,
    /// Informational; wait for the counterparty or a later deadline.
    DeadlinePassed,
    /// Nothing to act on yet; retry later.
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error("dleq verification failed: {0}")]
    Dleq(#[from] DleqError),
    #[error("malformed key in handshake: {0}")]
    Key(#[from] KeyError),
    #[error("malformed secp256k1 key in handshake")]
    Secp256k1Key,
    #[error("malformed dleq proof encoding")]
    Encoding,
    #[error("secp256k1 key does not match the one proven")]
    Secp256k1Mismatch,
    #[error("ed25519 key does not match the one proven")]
    Ed25519Mismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("unexpected message {got}, expected {}", expected_str(.expected))]
    UnexpectedMessage {
        expected: Option<MessageType>,
        got: MessageType,
    },
    #[error("{message} is missing required field {field}")]
    MissingField {
        message: MessageType,
        field: &'static str,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("monero lock address mismatch: expected {expected}, got {got}")]
    AddressMismatch { expected: String, got: String },
    #[error("locked monero too low: expected {expected}, got {actual}")]
    LockedAmountTooLow {
        expected: MoneroAmount,
        actual: MoneroAmount,
    },
    #[error("counterparty offered {offered}, expected at least {expected}")]
    AmountTooLow { expected: String, offered: String },
    #[error("swap is already completed")]
    AlreadyCompleted,
    #[error("invalid counterparty proof: {0}")]
    ProofInvalid(#[from] ProofError),
    #[error("chain i/o: {0:#}")]
    ChainIo(anyhow::Error),
    #[error("persist swap info: {0:#}")]
    Persistence(anyhow::Error),
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: String, available: String },
    #[error("deadline passed: {0}")]
    DeadlinePassed(&'static str),
    #[error("past the claim window; wait for the counterparty to refund")]
    PastClaimWindow,
    #[error("no {0} logs found")]
    NoLogsFound(ContractEventKind),
    #[error("generate swap keys: {0}")]
    KeyGeneration(String),
    #[error("swap session was shut down")]
    Cancelled,
}

fn expected_str(expected: &Option<MessageType>) -> String {
    match expected {
        Some(t) => t.to_string(),
        None => "nothing (swap finished)".to_string(),
    }
}

impl SwapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SwapError::UnexpectedMessage { .. }
            | SwapError::MissingField { .. }
            | SwapError::ProtocolViolation(_)
            | SwapError::AddressMismatch { .. }
            | SwapError::LockedAmountTooLow { .. }
            | SwapError::AmountTooLow { .. }
            | SwapError::AlreadyCompleted
            | SwapError::KeyGeneration(_)
            | SwapError::Cancelled => ErrorKind::ProtocolViolation,
            SwapError::ProofInvalid(_) => ErrorKind::ProofInvalid,
            SwapError::ChainIo(_) | SwapError::Persistence(_) => ErrorKind::ChainIo,
            SwapError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            SwapError::DeadlinePassed(_) | SwapError::PastClaimWindow => ErrorKind::DeadlinePassed,
            SwapError::NoLogsFound(_) => ErrorKind::Pending,
        }
    }

    pub(crate) fn insufficient_ether(needed: EtherAmount, available: EtherAmount) -> Self {
        SwapError::InsufficientFunds {
            needed: needed.to_string(),
            available: available.to_string(),
        }
    }

    pub(crate) fn insufficient_monero(needed: MoneroAmount, available: MoneroAmount) -> Self {
        SwapError::InsufficientFunds {
            needed: needed.to_string(),
            available: available.to_string(),
        }
    }
}

/// Tags chain and wallet failures for `?` in session code.
pub(crate) trait ChainIoExt<T> {
    fn chain_io(self, context: &'static str) -> Result<T, SwapError>;
}

impl<T> ChainIoExt<T> for anyhow::Result<T> {
    fn chain_io(self, context: &'static str) -> Result<T, SwapError> {
        self.map_err(|e| SwapError::ChainIo(e.context(context)))
    }
}
