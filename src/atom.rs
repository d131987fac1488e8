//! Per-chain HTLC capability port.
//!
//! The orchestrator drives swaps exclusively through this capability set;
//! the concrete chain adapters (Bitcoin script, Ethereum contract, ERC-20
//! contract) implement it behind an [`AtomBuilder`] factory supplied by
//! the embedding daemon.

use crate::error::Result;
use crate::swap::Htlc;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Result type for chain adapter calls.
pub type AtomResult<T> = std::result::Result<T, AtomError>;

/// Chain-level failure taxonomy. The orchestrator's retry policy keys
/// off these variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AtomError {
    /// Network or node trouble; safe to retry until the deadline.
    #[error("transient chain error: {0}")]
    Transient(String),

    /// The operation can never succeed: invalid script, double spend,
    /// insufficient funds at initiate time.
    #[error("permanent chain error: {0}")]
    Permanent(String),

    /// The audited contract is not on chain yet; keep polling.
    #[error("contract not found")]
    NotFound,

    /// The counterparty locked funds that do not match the expected
    /// amount, hash, timelock or recipient.
    #[error("contract mismatch: {0}")]
    Mismatch(String),

    /// Refund attempted before the lock's timelock expired.
    #[error("timelock has not expired")]
    TooEarly,
}

impl AtomError {
    /// Whether retrying the same call later can still succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AtomError::Transient(_) | AtomError::NotFound | AtomError::TooEarly
        )
    }
}

/// One party's HTLC operations on a single chain.
///
/// An atom is constructed for one side of one swap, with the [`Htlc`]
/// terms baked in. Every state-changing operation is idempotent per
/// (secret hash, party), so a crashed daemon can blindly replay its last
/// step after restart.
#[async_trait]
pub trait Atom: Send + Sync {
    /// Lock the side's value under the secret hash, spendable by the
    /// counterparty until the absolute timelock, refundable afterwards.
    async fn initiate(&self) -> AtomResult<()>;

    /// Verify the counterparty locked funds matching the side's amount,
    /// secret hash, timelock and recipient.
    async fn audit(&self) -> AtomResult<()>;

    /// Spend the counterparty's lock with the secret.
    async fn redeem(&self, secret: [u8; 32]) -> AtomResult<()>;

    /// Observe the secret the counterparty revealed when redeeming our
    /// lock.
    async fn audit_secret(&self) -> AtomResult<[u8; 32]>;

    /// Reclaim our own lock after its timelock expired.
    async fn refund(&self) -> AtomResult<()>;

    /// Sweep redeemed funds to the side's withdraw address; a no-op when
    /// none was supplied.
    async fn complete(&self) -> AtomResult<()>;
}

/// Factory for the two chain adapters of a swap.
pub trait AtomBuilder: Send + Sync {
    /// Build the `(send, receive)` atoms for the derived HTLC sides.
    fn build_atoms(&self, send: &Htlc, receive: &Htlc) -> Result<(Arc<dyn Atom>, Arc<dyn Atom>)>;
}
