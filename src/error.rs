//! Error types for the atomswapd core.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the atomswapd core.
#[derive(Error, Debug)]
pub enum Error {
    /// Token name did not normalize to a supported token.
    #[error("unsupported token: {0}")]
    UnsupportedToken(String),

    /// Address is not valid for the token's blockchain.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Amount is not a non-negative decimal integer.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Wallet balance does not cover the requested amount.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Secret hash is missing or not 32 bytes.
    #[error("invalid secret hash")]
    InvalidSecretHash,

    /// Responder margin check failed.
    #[error("not enough time to do the atomic swap")]
    NotEnoughTime,

    /// Request failed validation before reaching the supervisor.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A delayed-swap oracle answer that must not be executed.
    #[error("invalid delayed-swap promotion: {0}")]
    Promotion(String),

    /// Password hashing or verification failed.
    #[error("password error: {0}")]
    Password(String),

    /// Storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Chain adapter error.
    #[error("chain error: {0}")]
    Atom(#[from] crate::atom::AtomError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Parse error.
    #[error("parse error: {0}")]
    Parse(String),

    /// Network/HTTP error.
    #[error("network error: {0}")]
    Network(String),

    /// Signing failed.
    #[error("signing error: {0}")]
    Signing(String),

    /// Key derivation error.
    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    /// The daemon is shutting down; the message was not delivered.
    #[error("shutting down")]
    ShuttingDown,

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(format!("{:#}", err))
    }
}

impl From<bcrypt::BcryptError> for Error {
    fn from(err: bcrypt::BcryptError) -> Self {
        Error::Password(format!("{}", err))
    }
}
