//! Error types for the notary protocol driver.
//!
//! Display strings are the stable error kinds the RPC layer and retry
//! logic match on. `no-notary` and `stale-block` are retryable; the rest
//! are not.

use thiserror::Error;

use concord_notary::NotaryError;

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors surfaced by the notary protocol driver.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No notary chain configured, no controlled notary identity, or the
    /// peer RPC failed.
    #[error("no-notary")]
    NoNotary,

    /// The local tip moved while the peer RPC was in flight. Retryable.
    #[error("stale-block")]
    StaleBlock,

    /// This node may not notarize in the current notary block period, or
    /// has already signed everything it can.
    #[error("ineligible")]
    Ineligible,

    /// The peer found no proof root it agrees with.
    #[error("no-matching-proof-roots-found")]
    NoMatchingProofRoots,

    /// The peer returned no valid unconfirmed notarizations.
    #[error("no-valid-unconfirmed")]
    NoValidUnconfirmed,

    /// An earned notarization failed acceptance validation.
    #[error("invalid-earned-notarization: {0}")]
    InvalidEarnedNotarization(String),

    /// Error from the notarization state machine.
    #[error(transparent)]
    Notary(#[from] NotaryError),

    /// Error from the core primitives.
    #[error(transparent)]
    Core(#[from] concord_core::Error),

    /// Internal invariant violation.
    #[error("internal-error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Whether the operation is safe to retry on the next block.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::NoNotary | ProtocolError::StaleBlock)
    }
}
