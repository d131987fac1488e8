//! The swapper supervisor.
//!
//! Owns the status registry, the delayed-swap resolver and one
//! orchestrator task per live swap; routes typed messages between them
//! and serializes persistence. For every accepted swap the order is
//! fixed: the pending blob is stored first, then the receipt, and only
//! then does the swap reach the registry and an orchestrator. A failure
//! in the first step means the swap does not exist.

use crate::atom::AtomBuilder;
use crate::backoff::RetryConfig;
use crate::callback::DelayCallback;
use crate::error::{Error, Result};
use crate::orchestrator::{self, SwapMessage, SwapRequest};
use crate::registry::{self, StatusHandle, StatusMessage};
use crate::resolver::{self, ResolverMessage};
use crate::storage::Storage;
use crate::swap::{ReceiptUpdate, SwapBlob, SwapId, SwapReceipt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

/// Bounded capacity of every task inbox.
pub const INBOX_CAPACITY: usize = 128;

/// Messages accepted by the supervisor.
#[derive(Debug)]
pub enum Message {
    /// Replay pending swaps whose stored bcrypt hash matches `password`.
    Bootload { password: String },
    /// A newly accepted swap (immediate or promoted).
    SwapRequest(SwapBlob),
    /// Receipt mutation from a running task.
    ReceiptUpdate(ReceiptUpdate),
    /// Terminal notification: drop the pending-swap entry.
    DeleteSwap(SwapId),
    /// Snapshot of all receipts.
    ReceiptQuery(oneshot::Sender<HashMap<SwapId, SwapReceipt>>),
    /// Scheduler heartbeat, fanned out to every live task.
    Tick { now: i64 },
    /// Non-fatal error surfaced by a task.
    Error(Error),
}

/// Handle used by the embedding layer to talk to a running supervisor.
#[derive(Debug, Clone)]
pub struct SwapperHandle {
    tx: mpsc::Sender<Message>,
}

impl SwapperHandle {
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| Error::ShuttingDown)
    }

    /// Snapshot all receipts. Callers filter by bcrypt before exposing
    /// them.
    pub async fn receipts(&self) -> Result<HashMap<SwapId, SwapReceipt>> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::ReceiptQuery(tx)).await?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }
}

struct Swapper<S, B> {
    storage: Arc<S>,
    builder: Arc<B>,
    registry: StatusHandle,
    resolver: mpsc::Sender<ResolverMessage>,
    swaps: HashMap<SwapId, mpsc::Sender<SwapMessage>>,
    self_tx: mpsc::Sender<Message>,
    retry: RetryConfig,
    done: watch::Receiver<bool>,
    cap: usize,
}

/// Spawn the supervisor and its child tasks.
pub fn spawn<S, B, C>(
    cap: usize,
    storage: Arc<S>,
    builder: Arc<B>,
    callback: Arc<C>,
    retry: RetryConfig,
    mut done: watch::Receiver<bool>,
) -> SwapperHandle
where
    S: Storage + 'static,
    B: AtomBuilder + 'static,
    C: DelayCallback + 'static,
{
    let (tx, mut rx) = mpsc::channel(cap);
    let registry = registry::spawn(cap, done.clone());
    let resolver = resolver::spawn(cap, callback, tx.clone(), done.clone());

    let mut swapper = Swapper {
        storage,
        builder,
        registry,
        resolver,
        swaps: HashMap::new(),
        self_tx: tx.clone(),
        retry,
        done: done.clone(),
        cap,
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = done.changed() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(err) = swapper.handle(msg).await {
                        log::error!("swapper: {}", err);
                    }
                }
            }
        }
        log::debug!("swapper supervisor shut down");
    });

    SwapperHandle { tx }
}

impl<S, B> Swapper<S, B>
where
    S: Storage + 'static,
    B: AtomBuilder + 'static,
{
    async fn handle(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::Bootload { password } => self.handle_bootload(&password).await,
            Message::SwapRequest(blob) => self.handle_swap_request(blob).await,
            Message::ReceiptUpdate(update) => self.handle_receipt_update(update).await,
            Message::DeleteSwap(id) => self.handle_delete_swap(id).await,
            Message::ReceiptQuery(responder) => {
                self.registry.send(StatusMessage::Query(responder)).await
            }
            Message::Tick { now } => self.handle_tick(now).await,
            Message::Error(err) => {
                log::warn!("swapper: task error: {}", err);
                Ok(())
            }
        }
    }

    /// Persistence order is the invariant here: no orphan receipts, no
    /// pending swaps without receipts.
    async fn handle_swap_request(&mut self, blob: SwapBlob) -> Result<()> {
        self.storage.put_swap(&blob.sanitized()).await?;

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let receipt = SwapReceipt::new(&blob, now);
        self.storage.put_receipt(&receipt).await?;
        self.registry.send(StatusMessage::Receipt(receipt)).await?;

        self.dispatch(blob).await
    }

    /// Route a persisted swap to the resolver or to an orchestrator.
    async fn dispatch(&mut self, blob: SwapBlob) -> Result<()> {
        if blob.delay {
            self.resolver
                .send(ResolverMessage::Swap(blob))
                .await
                .map_err(|_| Error::ShuttingDown)?;
            return Ok(());
        }

        let (send_cost, receive_cost) = self.storage.load_costs(&blob.id).await?;
        let id = blob.id.clone();
        if self.swaps.contains_key(&id) {
            log::warn!("swap {}: already running; ignoring duplicate", id);
            return Ok(());
        }

        let ticks = orchestrator::spawn(
            SwapRequest::new(blob, send_cost, receive_cost),
            self.builder.as_ref(),
            self.self_tx.clone(),
            self.retry.clone(),
            self.cap,
            self.done.clone(),
        )?;
        self.swaps.insert(id, ticks);
        Ok(())
    }

    async fn handle_receipt_update(&mut self, update: ReceiptUpdate) -> Result<()> {
        self.registry
            .send(StatusMessage::Update(update.clone()))
            .await?;
        self.storage.update_receipt(&update).await
    }

    async fn handle_delete_swap(&mut self, id: SwapId) -> Result<()> {
        self.swaps.remove(&id);
        self.storage.delete_pending_swap(&id).await
    }

    /// Replay pending swaps for the account whose password just showed
    /// up, and warm the registry with all historical receipts.
    async fn handle_bootload(&mut self, password: &str) -> Result<()> {
        for receipt in self.storage.receipts().await? {
            self.registry.send(StatusMessage::Receipt(receipt)).await?;
        }

        for mut blob in self.storage.pending_swaps().await? {
            if !blob.password_hash.is_empty() {
                match bcrypt::verify(password, &blob.password_hash) {
                    Ok(true) => {}
                    // Wrong password or corrupt hash: the swap belongs to
                    // another account; leave it pending.
                    Ok(false) | Err(_) => continue,
                }
            }

            log::info!("swap {}: resuming from storage", blob.id);
            let id = blob.id.clone();
            blob.password = password.to_string();
            self.handle_receipt_update(ReceiptUpdate::new(id.clone(), |r| {
                r.active = true;
            }))
            .await?;
            if let Err(err) = self.dispatch(blob).await {
                // One unresumable swap must not block the rest of the
                // account's replay; it stays pending for the next bootload.
                log::error!("swap {}: failed to resume: {}", id, err);
            }
        }
        Ok(())
    }

    /// Fan the tick out without blocking: a stalled task misses a tick
    /// rather than stalling the supervisor.
    async fn handle_tick(&mut self, now: i64) -> Result<()> {
        if let Err(TrySendError::Full(_)) = self.resolver.try_send(ResolverMessage::Tick { now }) {
            log::debug!("resolver inbox full; tick dropped");
        }

        self.swaps.retain(|id, ticks| {
            match ticks.try_send(SwapMessage::Tick { now }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::debug!("swap {}: inbox full; tick dropped", id);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }
}

/// Drive a supervisor with wall-clock ticks until `done` closes.
pub async fn run_ticker(
    handle: SwapperHandle,
    interval: Duration,
    mut done: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = done.changed() => break,
            _ = ticker.tick() => {
                let now = time::OffsetDateTime::now_utc().unix_timestamp();
                if handle.send(Message::Tick { now }).await.is_err() {
                    break;
                }
            }
        }
    }
}
