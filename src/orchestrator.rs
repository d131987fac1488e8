//! The per-swap HTLC state machine.
//!
//! One orchestrator task drives one swap to a terminal state. The
//! machine is tick-driven: it advances at most one step per tick so a
//! slow chain never starves the scheduler, and every step maps to an
//! idempotent chain call so replaying after a crash is safe.
//!
//! Both roles run the same machine; the [`Role`] tag only governs step
//! ordering. The safety rule is asymmetric by construction: a party
//! refunds its own lock only after its own timelock, and the initiator's
//! timelock trails the responder's by one expiry unit, so the secret can
//! never be extracted without paying out both sides.

use crate::atom::{Atom, AtomBuilder, AtomError};
use crate::backoff::{self, RetryConfig};
use crate::error::{Error, Result};
use crate::supervisor::Message;
use crate::swap::{
    EXPIRY_UNIT, Htlc, ReceiptUpdate, Role, SwapBlob, SwapId, SwapStatus, derive_secret,
    hash_secret,
};
use crate::types::{Cost, merge_costs};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A swap accepted for execution, together with the costs it has already
/// accrued (non-empty when resuming after a restart).
#[derive(Debug, Clone)]
pub struct SwapRequest {
    pub blob: SwapBlob,
    pub send_cost: Cost,
    pub receive_cost: Cost,
}

impl SwapRequest {
    pub fn new(blob: SwapBlob, send_cost: Cost, receive_cost: Cost) -> Self {
        SwapRequest {
            blob,
            send_cost,
            receive_cost,
        }
    }
}

/// Messages an orchestrator consumes.
#[derive(Debug)]
pub enum SwapMessage {
    Tick { now: i64 },
}

/// Progress through the machine. Which steps are visited, and in which
/// order, depends on the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Lock our own funds.
    Initiate,
    /// Wait for the counterparty's lock to appear and match.
    Audit,
    /// Watch our own lock for the secret the counterparty revealed.
    AuditSecret,
    /// Spend the counterparty's lock.
    Redeem,
    /// Sweep redeemed funds to the withdraw address.
    Complete,
    /// Reclaim our own expired lock.
    Refund,
    Done,
}

pub struct Orchestrator {
    role: Role,
    id: SwapId,
    send: Htlc,
    receive: Htlc,
    send_atom: Arc<dyn Atom>,
    receive_atom: Arc<dyn Atom>,
    secret: Option<[u8; 32]>,
    step: Step,
    /// Whether our own lock made it on chain.
    initiated: bool,
    retry: RetryConfig,
    send_cost: Cost,
    receive_cost: Cost,
    out: mpsc::Sender<Message>,
}

impl Orchestrator {
    pub fn new(
        req: SwapRequest,
        builder: &dyn AtomBuilder,
        out: mpsc::Sender<Message>,
        retry: RetryConfig,
    ) -> Result<Orchestrator> {
        let role = req.blob.role();
        let (send, receive) = req.blob.htlc_sides()?;
        let (send_atom, receive_atom) = builder.build_atoms(&send, &receive)?;

        let secret = match role {
            Role::Initiator => {
                let secret = derive_secret(&req.blob.password, &req.blob.id);
                // The stored hash is canonical; a mismatch means the swap
                // was accepted under a different password and the secret
                // cannot be regenerated.
                if hash_secret(&secret) != send.secret_hash {
                    return Err(Error::InvalidSecretHash);
                }
                Some(secret)
            }
            Role::Responder => None,
        };
        let step = match role {
            Role::Initiator => Step::Initiate,
            Role::Responder => Step::Audit,
        };

        Ok(Orchestrator {
            role,
            id: req.blob.id,
            send,
            receive,
            send_atom,
            receive_atom,
            secret,
            step,
            initiated: false,
            retry,
            send_cost: req.send_cost,
            receive_cost: req.receive_cost,
            out,
        })
    }

    pub fn is_done(&self) -> bool {
        self.step == Step::Done
    }

    /// Advance the machine by at most one step.
    pub async fn step(&mut self, now: i64) {
        // The refund fallback dominates forward progress: past our own
        // timelock, with the counterparty's funds not yet redeemed, the
        // only safe move is reclaiming our lock.
        if self.past_own_timelock(now) {
            self.step = Step::Refund;
        }

        match self.step {
            Step::Initiate => self.step_initiate().await,
            Step::Audit => self.step_audit(now).await,
            Step::AuditSecret => self.step_audit_secret().await,
            Step::Redeem => self.step_redeem().await,
            Step::Complete => self.step_complete().await,
            Step::Refund => self.step_refund(now).await,
            Step::Done => {}
        }
    }

    fn past_own_timelock(&self, now: i64) -> bool {
        matches!(
            self.step,
            Step::Initiate | Step::Audit | Step::AuditSecret | Step::Redeem
        ) && now >= self.send.time_lock
    }

    async fn step_initiate(&mut self) {
        let atom = Arc::clone(&self.send_atom);
        let result = backoff::retry(&self.retry, move || {
            let atom = Arc::clone(&atom);
            async move { atom.initiate().await }
        })
        .await;

        match result {
            Ok(()) => {
                self.initiated = true;
                log::info!(
                    "swap {}: locked {} {} until {}",
                    self.id,
                    self.send.value,
                    self.send.token,
                    self.send.time_lock
                );
                let fee = self.send.token.transaction_cost(&self.send.value);
                merge_costs(&mut self.send_cost, &fee);
                self.emit(ReceiptUpdate::new(self.id.clone(), move |r| {
                    r.advance(SwapStatus::Initiated);
                    merge_costs(&mut r.send_cost, &fee);
                }))
                .await;
                self.step = match self.role {
                    Role::Initiator => Step::Audit,
                    Role::Responder => Step::AuditSecret,
                };
            }
            Err(err) if err.is_retryable() => {
                log::debug!("swap {}: initiate not yet confirmed: {}", self.id, err);
            }
            Err(err) => self.fail(err).await,
        }
    }

    async fn step_audit(&mut self, now: i64) {
        match self.role {
            Role::Initiator => {
                // Once the responder's own refund window opens there is no
                // point redeeming what they can reclaim.
                if now >= self.receive.time_lock {
                    log::warn!(
                        "swap {}: counterparty lock never matched before {}; falling back to refund",
                        self.id,
                        self.receive.time_lock
                    );
                    self.step = Step::Refund;
                    return;
                }
            }
            Role::Responder => {
                // Accepting this late would leave less than two expiry
                // units between the locks.
                if self.receive.time_lock < now + 2 * EXPIRY_UNIT {
                    self.expire("counterparty never initiated in time").await;
                    return;
                }
            }
        }

        // Polling op: the tick cadence is the retry loop.
        match self.receive_atom.audit().await {
            Ok(()) => {
                log::info!("swap {}: counterparty lock matches", self.id);
                self.emit(ReceiptUpdate::status(self.id.clone(), SwapStatus::Audited))
                    .await;
                self.step = match self.role {
                    Role::Initiator => Step::Redeem,
                    Role::Responder => Step::Initiate,
                };
            }
            Err(err) if err.is_retryable() => {
                log::debug!("swap {}: audit pending: {}", self.id, err);
            }
            Err(err) => match self.role {
                // Our funds are locked; the mismatch only means we must
                // not redeem. Reclaim once our timelock passes.
                Role::Initiator => {
                    log::error!("swap {}: audit failed: {}; will refund", self.id, err);
                    self.step = Step::Refund;
                }
                // Nothing locked on our side yet.
                Role::Responder => self.fail(err).await,
            },
        }
    }

    async fn step_audit_secret(&mut self) {
        // Polling op, like audit.
        match self.send_atom.audit_secret().await {
            Ok(secret) => {
                if hash_secret(&secret) != self.send.secret_hash {
                    log::error!(
                        "swap {}: revealed secret does not hash to the lock",
                        self.id
                    );
                    return;
                }
                log::info!("swap {}: counterparty revealed the secret", self.id);
                self.secret = Some(secret);
                self.step = Step::Redeem;
            }
            Err(err) if err.is_retryable() => {
                log::debug!("swap {}: secret not yet revealed: {}", self.id, err);
            }
            Err(err) => {
                log::error!("swap {}: audit_secret failed: {}; will refund", self.id, err);
                self.step = Step::Refund;
            }
        }
    }

    async fn step_redeem(&mut self) {
        let Some(secret) = self.secret else {
            // Unreachable by construction; bail out through the refund
            // path rather than spend without a secret.
            log::error!("swap {}: redeem reached without a secret", self.id);
            self.step = Step::Refund;
            return;
        };

        let atom = Arc::clone(&self.receive_atom);
        let result = backoff::retry(&self.retry, move || {
            let atom = Arc::clone(&atom);
            async move { atom.redeem(secret).await }
        })
        .await;

        match result {
            Ok(()) => {
                let status = match self.role {
                    Role::Initiator => SwapStatus::Redeemed,
                    Role::Responder => SwapStatus::RedeemedBySecret,
                };
                log::info!(
                    "swap {}: redeemed {} {}",
                    self.id,
                    self.receive.value,
                    self.receive.token
                );
                let fee = self.receive.token.transaction_cost(&self.receive.value);
                merge_costs(&mut self.receive_cost, &fee);
                self.emit(ReceiptUpdate::new(self.id.clone(), move |r| {
                    r.advance(status);
                    merge_costs(&mut r.receive_cost, &fee);
                }))
                .await;
                self.step = Step::Complete;
            }
            Err(err) if err.is_retryable() => {
                log::debug!("swap {}: redeem not yet confirmed: {}", self.id, err);
            }
            Err(err) => {
                log::error!("swap {}: redeem failed: {}; will refund", self.id, err);
                self.step = Step::Refund;
            }
        }
    }

    async fn step_complete(&mut self) {
        let atom = Arc::clone(&self.receive_atom);
        let result = backoff::retry(&self.retry, move || {
            let atom = Arc::clone(&atom);
            async move { atom.complete().await }
        })
        .await;

        match result {
            Ok(()) => self.finish().await,
            Err(err) if err.is_retryable() => {
                log::debug!("swap {}: withdraw sweep pending: {}", self.id, err);
            }
            Err(err) => {
                // The swap itself succeeded; the sweep is a convenience.
                log::error!("swap {}: withdraw sweep failed: {}", self.id, err);
                self.finish().await;
            }
        }
    }

    async fn step_refund(&mut self, now: i64) {
        if !self.initiated {
            if now >= self.send.time_lock {
                self.expire("counterparty never appeared and nothing was locked")
                    .await;
            }
            return;
        }

        let atom = Arc::clone(&self.send_atom);
        let result = backoff::retry(&self.retry, move || {
            let atom = Arc::clone(&atom);
            async move { atom.refund().await }
        })
        .await;

        match result {
            Ok(()) => {
                log::info!(
                    "swap {}: refunded {} {}",
                    self.id,
                    self.send.value,
                    self.send.token
                );
                let fee = self.send.token.transaction_cost(&self.send.value);
                merge_costs(&mut self.send_cost, &fee);
                self.emit(ReceiptUpdate::new(self.id.clone(), move |r| {
                    r.advance(SwapStatus::Refunded);
                    r.active = false;
                    merge_costs(&mut r.send_cost, &fee);
                }))
                .await;
                self.emit_delete().await;
                self.step = Step::Done;
            }
            Err(AtomError::TooEarly) => {
                log::debug!("swap {}: refund window not open yet", self.id);
            }
            Err(err) if err.is_retryable() => {
                log::debug!("swap {}: refund not yet confirmed: {}", self.id, err);
            }
            Err(err) => {
                // On an honest chain our own refund cannot fail for good
                // unless the lock was already spent, which for a responder
                // means the secret is on chain. Try to come out ahead
                // before declaring failure.
                if self.role == Role::Responder && self.try_late_redeem().await {
                    return;
                }
                log::error!("swap {}: refund failed for good: {}", self.id, err);
                self.fail(err).await;
            }
        }
    }

    /// Last-chance responder path: our lock was spent, so the secret is
    /// observable; redeem the counterparty's lock if it is still live.
    async fn try_late_redeem(&mut self) -> bool {
        let secret = match self.send_atom.audit_secret().await {
            Ok(secret) if hash_secret(&secret) == self.send.secret_hash => secret,
            _ => return false,
        };
        if self.receive_atom.redeem(secret).await.is_err() {
            return false;
        }
        log::info!("swap {}: redeemed with the late-revealed secret", self.id);
        self.secret = Some(secret);
        let fee = self.receive.token.transaction_cost(&self.receive.value);
        merge_costs(&mut self.receive_cost, &fee);
        self.emit(ReceiptUpdate::new(self.id.clone(), move |r| {
            r.advance(SwapStatus::RedeemedBySecret);
            merge_costs(&mut r.receive_cost, &fee);
        }))
        .await;
        self.step = Step::Complete;
        true
    }

    async fn finish(&mut self) {
        self.emit(ReceiptUpdate::new(self.id.clone(), |r| {
            r.active = false;
        }))
        .await;
        self.emit_delete().await;
        self.step = Step::Done;
    }

    async fn expire(&mut self, reason: &str) {
        log::warn!("swap {}: expired: {}", self.id, reason);
        self.emit(ReceiptUpdate::new(self.id.clone(), |r| {
            r.advance(SwapStatus::Expired);
            r.active = false;
        }))
        .await;
        self.emit_delete().await;
        self.step = Step::Done;
    }

    async fn fail(&mut self, err: AtomError) {
        log::error!("swap {}: failed: {}", self.id, err);
        let _ = self.out.send(Message::Error(Error::Atom(err))).await;
        self.emit(ReceiptUpdate::new(self.id.clone(), |r| {
            r.advance(SwapStatus::Failed);
            r.active = false;
        }))
        .await;
        self.emit_delete().await;
        self.step = Step::Done;
    }

    async fn emit(&self, update: ReceiptUpdate) {
        if self
            .out
            .send(Message::ReceiptUpdate(update))
            .await
            .is_err()
        {
            log::warn!("swap {}: supervisor gone; receipt update dropped", self.id);
        }
    }

    async fn emit_delete(&self) {
        if self
            .out
            .send(Message::DeleteSwap(self.id.clone()))
            .await
            .is_err()
        {
            log::warn!("swap {}: supervisor gone; delete dropped", self.id);
        }
    }
}

/// Spawn an orchestrator task; returns the sender its ticks arrive on.
pub fn spawn(
    req: SwapRequest,
    builder: &dyn AtomBuilder,
    out: mpsc::Sender<Message>,
    retry: RetryConfig,
    cap: usize,
    mut done: watch::Receiver<bool>,
) -> Result<mpsc::Sender<SwapMessage>> {
    let mut machine = Orchestrator::new(req, builder, out, retry)?;
    let (tx, mut rx) = mpsc::channel(cap);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = done.changed() => break,
                msg = rx.recv() => match msg {
                    Some(SwapMessage::Tick { now }) => {
                        machine.step(now).await;
                        if machine.is_done() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        log::debug!("orchestrator for swap {} exited", machine.id);
    });

    Ok(tx)
}
