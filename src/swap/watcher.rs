//! Deadline watchers.
//!
//! A watcher races a wall-clock deadline against a completion signal, the
//! session context and, optionally, a contract event. It never touches
//! session state itself: whatever fires first is turned into a command for
//! the session's driver task, which re-checks the protocol stage under the
//! session lock before acting.

use std::time::SystemTime;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::SwapId;
use super::session::duration_until;
use crate::eth::contract::{ContractEventKind, ContractLog};

pub(crate) struct EventTrigger<C> {
    pub(crate) events: broadcast::Receiver<ContractLog>,
    pub(crate) kind: ContractEventKind,
    pub(crate) command: fn(ContractLog) -> C,
}

pub(crate) struct Watcher<C> {
    pub(crate) name: &'static str,
    pub(crate) swap_id: SwapId,
    pub(crate) fire_at: SystemTime,
    pub(crate) on_deadline: C,
    /// Closed by the session once the awaited step happened.
    pub(crate) done: oneshot::Receiver<()>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) event: Option<EventTrigger<C>>,
}

impl<C: Send + 'static> Watcher<C> {
    pub(crate) fn spawn(self, commands: mpsc::UnboundedSender<C>) -> JoinHandle<()> {
        tokio::spawn(self.run(commands))
    }

    async fn run(self, commands: mpsc::UnboundedSender<C>) {
        let Watcher {
            name,
            swap_id,
            fire_at,
            on_deadline,
            mut done,
            mut cancel,
            mut event,
        } = self;
        tracing::debug!(swap_id = %swap_id, watcher = name, "watcher armed");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(duration_until(fire_at)) => {
                    tracing::info!(swap_id = %swap_id, watcher = name, "deadline reached");
                    if commands.send(on_deadline).is_err() {
                        tracing::debug!(swap_id = %swap_id, watcher = name, "session gone");
                    }
                    return;
                }
                _ = &mut done => {
                    tracing::debug!(swap_id = %swap_id, watcher = name, "step completed; watcher stopped");
                    return;
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        tracing::debug!(swap_id = %swap_id, watcher = name, "session cancelled; watcher stopped");
                        return;
                    }
                }
                log = next_event(&mut event) => match log {
                    Some(log) => {
                        let Some(trigger) = &event else {
                            continue;
                        };
                        if log.event.kind() != trigger.kind {
                            continue;
                        }
                        tracing::info!(swap_id = %swap_id, watcher = name, event = %trigger.kind, tx_hash = %log.tx_hash, "contract event observed");
                        let _ = commands.send((trigger.command)(log));
                        return;
                    }
                    None => event = None,
                },
            }
        }
    }
}

async fn next_event<C>(event: &mut Option<EventTrigger<C>>) -> Option<ContractLog> {
    let Some(trigger) = event else {
        return std::future::pending().await;
    };
    loop {
        match trigger.events.recv().await {
            Ok(log) => return Some(log),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "contract event stream lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::eth::contract::ContractEvent;
    use crate::eth::{Address, TxHash};

    #[derive(Debug, PartialEq)]
    enum Cmd {
        Deadline,
        Event(TxHash),
    }

    fn watcher(
        fire_in: Duration,
        event: Option<EventTrigger<Cmd>>,
    ) -> (Watcher<Cmd>, oneshot::Sender<()>, watch::Sender<bool>) {
        let (done_tx, done) = oneshot::channel();
        let (cancel_tx, cancel) = watch::channel(false);
        let w = Watcher {
            name: "test",
            swap_id: SwapId::new_v4(),
            fire_at: SystemTime::now() + fire_in,
            on_deadline: Cmd::Deadline,
            done,
            cancel,
            event,
        };
        (w, done_tx, cancel_tx)
    }

    #[tokio::test]
    async fn fires_at_deadline() {
        let (w, _done, _cancel) = watcher(Duration::from_millis(20), None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        w.spawn(tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(Cmd::Deadline));
    }

    #[tokio::test]
    async fn completion_disarms() {
        let (w, done, _cancel) = watcher(Duration::from_millis(50), None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = w.spawn(tx);
        done.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn cancellation_disarms() {
        let (w, _done, cancel) = watcher(Duration::from_millis(50), None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = w.spawn(tx);
        cancel.send_replace(true);
        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn matching_event_wins_over_deadline() {
        let (events_tx, events) = broadcast::channel(8);
        let trigger = EventTrigger {
            events,
            kind: ContractEventKind::Claimed,
            command: |log: ContractLog| Cmd::Event(log.tx_hash),
        };
        let (w, _done, _cancel) = watcher(Duration::from_secs(60), Some(trigger));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = w.spawn(tx);

        let contract = Address::random();
        events_tx
            .send(ContractLog {
                contract,
                tx_hash: TxHash::random(),
                block_number: 1,
                event: ContractEvent::Ready,
            })
            .unwrap();
        let claim_tx = TxHash::random();
        events_tx
            .send(ContractLog {
                contract,
                tx_hash: claim_tx,
                block_number: 2,
                event: ContractEvent::Claimed { secret: [7; 32] },
            })
            .unwrap();

        handle.await.unwrap();
        assert_eq!(rx.recv().await, Some(Cmd::Event(claim_tx)));
    }
}
