//! In-process message transport between two sessions.
//!
//! `pump` feeds one session's inbox into `handle_protocol_message`, forwards
//! the responses, and calls `protocol_exited` once the stream ends. Faults
//! can drop message types or crash the session when one is delivered.

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::net::{Message, MessageSender, MessageType};
use crate::swap::{SwapError, SwapSession};

/// Sending half of a one-way message stream. Closing it ends the stream for
/// the receiver.
#[derive(Clone)]
pub struct Link {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
}

pub fn link() -> (Link, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Link {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        rx,
    )
}

impl Link {
    pub fn close(&self) {
        self.tx.lock().expect("link mutex poisoned").take();
    }
}

#[async_trait]
impl MessageSender for Link {
    async fn send_swap_message(&self, message: Message) -> Result<()> {
        let kind = message.message_type();
        let tx = self.tx.lock().expect("link mutex poisoned").clone();
        let tx = tx.ok_or_else(|| anyhow!("link closed; cannot send {kind}"))?;
        tx.send(message)
            .map_err(|_| anyhow!("peer stopped reading; cannot send {kind}"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Message types lost in transit.
    pub drop: Vec<MessageType>,
    /// Delivering this type crashes the session instead.
    pub crash_on: Option<MessageType>,
}

pub async fn pump(
    session: Arc<dyn SwapSession>,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    outbox: Link,
    faults: Faults,
) -> Result<(), SwapError> {
    let swap_id = session.id();
    let role = session.role().as_str();

    let result = loop {
        let Some(message) = inbox.recv().await else {
            tracing::info!(swap_id = %swap_id, role, "message stream closed");
            break Ok(());
        };
        let kind = message.message_type();
        if faults.drop.contains(&kind) {
            tracing::warn!(swap_id = %swap_id, role, message = %kind, "dropping message");
            continue;
        }
        if faults.crash_on == Some(kind) {
            tracing::warn!(swap_id = %swap_id, role, message = %kind, "simulating crash");
            session.shutdown();
            outbox.close();
            return Ok(());
        }

        match session.handle_protocol_message(message).await {
            Ok(outcome) => {
                if let Some(response) = outcome.response
                    && let Err(err) = outbox.send_swap_message(response).await
                {
                    tracing::warn!(swap_id = %swap_id, role, error = %format!("{err:#}"), "failed to forward response");
                }
                if outcome.done {
                    break Ok(());
                }
            }
            // A watcher settled the swap while this message was in flight.
            Err(err) if !session.status().is_ongoing() => {
                tracing::debug!(swap_id = %swap_id, role, error = %err, "swap already settled");
                break Ok(());
            }
            Err(err) => {
                tracing::warn!(swap_id = %swap_id, role, error = %err, kind = ?err.kind(), "protocol message failed");
                break Err(err);
            }
        }
    };

    let exited = session.protocol_exited().await;
    outbox.close();
    result.and(exited)
}
