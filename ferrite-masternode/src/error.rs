//! Error types for the masternode coordination core.

use ferrite_shared_types::OutPoint;
use thiserror::Error;

/// Main error type for masternode operations.
///
/// Recoverable conditions are absorbed and logged by the handlers.
/// Protocol violations never surface here; they are emitted as
/// `NetEvent::Misbehave` on the outbound queue.
#[derive(Error, Debug)]
pub enum MasternodeError {
    /// The chain or masternode list is not usable yet; the operation defers.
    #[error("masternode data not synced")]
    NotSynced,

    /// No known block hash at the requested height. Retryable at the next
    /// tip update, never answered with a partial result.
    #[error("no known block at height {0}")]
    UnknownBlock(u64),

    /// Outpoint not present in the registry; triggers a targeted ask.
    #[error("unknown masternode {0}")]
    UnknownMasternode(OutPoint),

    /// Cryptographic check failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Vote or broadcast outside the acceptance window; dropped silently.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Same content hash already processed.
    #[error("duplicate object")]
    Duplicate,

    /// Peer requested too frequently.
    #[error("rate limited")]
    RateLimited,

    /// Collateral is spent, insufficient or unconfirmed.
    #[error("collateral mismatch: {0}")]
    UtxoMismatch(String),

    /// Malformed or inconsistent record.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Persisted state could not be read back; caller should re-sync.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for masternode operations.
pub type Result<T> = std::result::Result<T, MasternodeError>;
