use std::fmt;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::coins::{EtherAmount, MoneroAmount};
use crate::eth::{Address, TxHash};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SendKeys,
    NotifyEthLocked,
    NotifyXmrLock,
    NotifyReady,
    NotifyClaimed,
    NotifyRefund,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::SendKeys => "SendKeys",
            MessageType::NotifyEthLocked => "NotifyETHLocked",
            MessageType::NotifyXmrLock => "NotifyXMRLock",
            MessageType::NotifyReady => "NotifyReady",
            MessageType::NotifyClaimed => "NotifyClaimed",
            MessageType::NotifyRefund => "NotifyRefund",
        })
    }
}

/// Key handshake. Both roles send one, including their private view key:
/// the joint view key is the sum of both, and each side needs it to scan the
/// joint address. Key fields are hex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provided_wei: Option<EtherAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provided_piconero: Option<MoneroAmount>,
    pub public_spend_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_view_key: Option<String>,
    pub secp256k1_public_key: String,
    pub dleq_proof: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_address: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    SendKeys(SendKeys),
    /// Contract deployed and funded.
    NotifyEthLocked { address: Address, tx_hash: TxHash },
    /// XMR sent to the joint address.
    NotifyXmrLock {
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_id: Option<String>,
    },
    NotifyReady,
    NotifyClaimed { tx_hash: TxHash },
    NotifyRefund { tx_hash: TxHash },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::SendKeys(_) => MessageType::SendKeys,
            Message::NotifyEthLocked { .. } => MessageType::NotifyEthLocked,
            Message::NotifyXmrLock { .. } => MessageType::NotifyXmrLock,
            Message::NotifyReady => MessageType::NotifyReady,
            Message::NotifyClaimed { .. } => MessageType::NotifyClaimed,
            Message::NotifyRefund { .. } => MessageType::NotifyRefund,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    message: Message,
}

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(&Envelope {
        version: PROTOCOL_VERSION,
        message: message.clone(),
    })
    .context("encode swap message")
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
    let envelope: Envelope = serde_json::from_slice(bytes).context("decode swap message")?;
    anyhow::ensure!(
        envelope.version == PROTOCOL_VERSION,
        "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
        envelope.version
    );
    Ok(envelope.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_type_tag() {
        let message = Message::NotifyClaimed {
            tx_hash: TxHash::from_bytes([0xab; 32]),
        };
        let bytes = encode(&message).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["version"], PROTOCOL_VERSION);
        assert_eq!(json["message"]["type"], "notify_claimed");
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn rejects_other_versions() {
        let bytes = br#"{"version":99,"message":{"type":"notify_ready"}}"#;
        let err = decode(bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported protocol version 99"));
    }
}
