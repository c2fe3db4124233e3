pub mod message;

use anyhow::Result;
use async_trait::async_trait;

pub use message::{Message, MessageType, SendKeys};

/// Outbound half of the transport. Responses to inbound messages are returned
/// from `handle_protocol_message`; this carries unsolicited notifications
/// such as a watcher-triggered refund.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_swap_message(&self, message: Message) -> Result<()>;
}
