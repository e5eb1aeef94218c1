//! Error types for the notarization state machine.
//!
//! Display strings are the stable kinds callers and RPC layers match on.

use concord_core::{CurrencyId, IdentityId};
use thiserror::Error;

/// Result type for notarization operations.
pub type Result<T> = std::result::Result<T, NotaryError>;

/// Errors surfaced by the notarization state machine.
#[derive(Debug, Error)]
pub enum NotaryError {
    /// A notarization record failed validation.
    #[error("invalid-notarization: {0}")]
    InvalidNotarization(String),

    /// An earned notarization failed validation during acceptance.
    #[error("invalid-earned-notarization: {0}")]
    InvalidEarnedNotarization(String),

    /// A finalization record failed validation.
    #[error("invalid-finalization: {0}")]
    InvalidFinalization(String),

    /// The finalization is already in a terminal state.
    #[error("already-finalized")]
    AlreadyFinalized,

    /// A spending transaction carried more than one finalization of the same output.
    #[error("duplicate-finalization")]
    DuplicateFinalization,

    /// Cited evidence does not reach the confirmation threshold.
    #[error("insufficient-evidence: have {have}, need {need}")]
    InsufficientEvidence {
        /// Distinct complete notary signatures found.
        have: usize,
        /// Threshold required.
        need: usize,
    },

    /// A signer is not in the authorized notary set.
    #[error("unauthorized-notary: {0}")]
    UnauthorizedNotary(IdentityId),

    /// A signature failed to verify, or its polarity conflicts with the record.
    #[error("invalid-or-incomplete-signature: {0}")]
    InvalidSignature(String),

    /// The reserve-transfer pass rejected the export.
    #[error("invalid-export: {0}")]
    InvalidExport(String),

    /// An attested currency state disagrees with the locally recomputed one.
    #[error("currency-state-mismatch: {0}")]
    CurrencyStateMismatch(CurrencyId),

    /// An attested proof root disagrees with the locally recomputed one.
    #[error("proof-root-mismatch")]
    ProofRootMismatch,

    /// Attempt to mirror a record that is already mirrored.
    #[error("mirror-already-mirrored")]
    MirrorAlreadyMirrored,

    /// Internal invariant violation.
    #[error("internal-error: {0}")]
    Internal(String),

    /// Error from the core primitives.
    #[error(transparent)]
    Core(#[from] concord_core::Error),
}
