//! Async storage port for durable swap state.
//!
//! Two logical keyspaces back the daemon: `swap/<id>` holds pending
//! blobs until their swap reaches a terminal state, `receipt/<id>` holds
//! receipts forever. Deleting a pending entry never deletes its receipt.
//!
//! Implementations must be safe for concurrent use; storage is the only
//! object shared across tasks.

use crate::error::Result;
use crate::swap::{ReceiptUpdate, SwapBlob, SwapId, SwapReceipt};
use crate::types::Cost;
use std::future::Future;
use std::pin::Pin;

/// Type alias for storage futures.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence port consumed by the supervisor.
pub trait Storage: Send + Sync {
    /// Persist a pending swap. Atomic: either the blob is durable after
    /// this returns, or it errors and the swap does not exist.
    ///
    /// Callers pass sanitized blobs; the clear password never reaches
    /// storage.
    fn put_swap(&self, blob: &SwapBlob) -> StorageFuture<'_, ()>;

    /// Remove a pending swap once it reaches a terminal state.
    fn delete_pending_swap(&self, id: &SwapId) -> StorageFuture<'_, ()>;

    /// All pending swaps, for bootload replay.
    fn pending_swaps(&self) -> StorageFuture<'_, Vec<SwapBlob>>;

    /// Persist a fresh receipt.
    fn put_receipt(&self, receipt: &SwapReceipt) -> StorageFuture<'_, ()>;

    /// Apply a receipt mutation under the per-id lock.
    fn update_receipt(&self, update: &ReceiptUpdate) -> StorageFuture<'_, ()>;

    /// All receipts, historical and live.
    fn receipts(&self) -> StorageFuture<'_, Vec<SwapReceipt>>;

    /// Costs a pending swap has already accrued, for resumption after a
    /// restart.
    fn load_costs(&self, id: &SwapId) -> StorageFuture<'_, (Cost, Cost)>;
}
