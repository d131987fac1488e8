//! Atomswapd - Core Library
//!
//! The core of a long-running, self-custodial daemon that executes
//! cross-chain atomic swaps via Hash Time-Locked Contracts. This crate
//! owns the swap state machines, the supervisor that schedules them, the
//! delayed-swap resolver and request preparation; chain adapters,
//! storage backends, the wallet and the HTTP surface are injected
//! through traits.
//!
//! # Example
//!
//! ```rust,ignore
//! use atomswapd_core::{supervisor, Message};
//! use std::sync::Arc;
//!
//! let (done_tx, done) = tokio::sync::watch::channel(false);
//! let handle = supervisor::spawn(
//!     supervisor::INBOX_CAPACITY,
//!     Arc::new(my_storage),
//!     Arc::new(my_atom_builder),
//!     Arc::new(atomswapd_core::HttpDelayCallback::new()),
//!     Default::default(),
//!     done.clone(),
//! );
//!
//! // First authenticated request after startup replays pending swaps.
//! handle.send(Message::Bootload { password }).await?;
//! handle.send(Message::SwapRequest(prepared_blob)).await?;
//! ```

pub mod atom;
pub mod backoff;
pub mod callback;
pub mod error;
pub mod orchestrator;
pub mod prepare;
pub mod registry;
pub mod resolver;
pub mod storage;
pub mod supervisor;
pub mod swap;
pub mod types;
pub mod wallet;

pub use atom::{Atom, AtomBuilder, AtomError, AtomResult};
pub use backoff::RetryConfig;
pub use callback::{DelayCallback, HttpDelayCallback};
pub use error::{Error, Result};
pub use prepare::{Preparer, SwapResponse};
pub use storage::{Storage, StorageFuture};
pub use supervisor::{Message, SwapperHandle};
pub use swap::{
    EXPIRY_UNIT, Htlc, ReceiptUpdate, Role, SwapBlob, SwapId, SwapReceipt, SwapStatus,
};
pub use types::{Blockchain, Cost, Token, TokenKind};
pub use wallet::{Signer, Wallet};
