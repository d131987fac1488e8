//! In-memory receipt cache task.
//!
//! Single writer for the receipt map. Readers get snapshots over oneshot
//! reply channels. The registry is password-agnostic: bcrypt filtering
//! happens at the caller holding the query password.

use crate::error::{Error, Result};
use crate::swap::{ReceiptUpdate, SwapId, SwapReceipt};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};

/// Messages accepted by the status registry.
#[derive(Debug)]
pub enum StatusMessage {
    /// Insert or replace a receipt.
    Receipt(SwapReceipt),
    /// Apply a mutation to an existing receipt.
    Update(ReceiptUpdate),
    /// Snapshot all receipts.
    Query(oneshot::Sender<HashMap<SwapId, SwapReceipt>>),
}

/// Handle to a spawned registry task.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    tx: mpsc::Sender<StatusMessage>,
}

impl StatusHandle {
    pub async fn send(&self, msg: StatusMessage) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| Error::ShuttingDown)
    }

    /// Snapshot all receipts.
    pub async fn receipts(&self) -> Result<HashMap<SwapId, SwapReceipt>> {
        let (tx, rx) = oneshot::channel();
        self.send(StatusMessage::Query(tx)).await?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }
}

/// Spawn the registry task.
pub fn spawn(cap: usize, mut done: watch::Receiver<bool>) -> StatusHandle {
    let (tx, mut rx) = mpsc::channel(cap);
    tokio::spawn(async move {
        let mut receipts: HashMap<SwapId, SwapReceipt> = HashMap::new();
        loop {
            tokio::select! {
                _ = done.changed() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    handle(&mut receipts, msg);
                }
            }
        }
        log::debug!("status registry shut down");
    });
    StatusHandle { tx }
}

fn handle(receipts: &mut HashMap<SwapId, SwapReceipt>, msg: StatusMessage) {
    match msg {
        StatusMessage::Receipt(receipt) => {
            receipts.insert(receipt.id.clone(), receipt);
        }
        StatusMessage::Update(update) => match receipts.get_mut(update.id()) {
            Some(receipt) => update.apply(receipt),
            None => log::warn!("receipt update for unknown swap {}", update.id()),
        },
        StatusMessage::Query(responder) => {
            let _ = responder.send(receipts.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{SwapBlob, SwapStatus};

    fn receipt(id: &str) -> SwapReceipt {
        let blob = SwapBlob {
            id: SwapId::from(id),
            send_token: "BTC".to_string(),
            receive_token: "ETH".to_string(),
            ..SwapBlob::default()
        };
        SwapReceipt::new(&blob, 1_000_000)
    }

    #[tokio::test]
    async fn test_put_update_query() {
        let (_done_tx, done) = watch::channel(false);
        let registry = spawn(8, done);

        registry
            .send(StatusMessage::Receipt(receipt("a")))
            .await
            .unwrap();
        registry
            .send(StatusMessage::Update(ReceiptUpdate::status(
                SwapId::from("a"),
                SwapStatus::Initiated,
            )))
            .await
            .unwrap();

        let snapshot = registry.receipts().await.unwrap();
        assert_eq!(snapshot[&SwapId::from("a")].status, SwapStatus::Initiated);
    }

    #[tokio::test]
    async fn test_updates_stay_monotonic() {
        let (_done_tx, done) = watch::channel(false);
        let registry = spawn(8, done);

        registry
            .send(StatusMessage::Receipt(receipt("b")))
            .await
            .unwrap();
        for status in [
            SwapStatus::Initiated,
            SwapStatus::Audited,
            SwapStatus::Redeemed,
            // late refund must not override the terminal state
            SwapStatus::Refunded,
        ] {
            registry
                .send(StatusMessage::Update(ReceiptUpdate::status(
                    SwapId::from("b"),
                    status,
                )))
                .await
                .unwrap();
        }

        let snapshot = registry.receipts().await.unwrap();
        assert_eq!(snapshot[&SwapId::from("b")].status, SwapStatus::Redeemed);
    }

    #[tokio::test]
    async fn test_update_for_unknown_swap_is_ignored() {
        let (_done_tx, done) = watch::channel(false);
        let registry = spawn(8, done);

        registry
            .send(StatusMessage::Update(ReceiptUpdate::status(
                SwapId::from("ghost"),
                SwapStatus::Initiated,
            )))
            .await
            .unwrap();

        assert!(registry.receipts().await.unwrap().is_empty());
    }
}
