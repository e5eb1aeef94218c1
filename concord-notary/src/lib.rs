//! Concord Notary - The cross-chain notarization state machine.
//!
//! A home chain and its notary chains periodically attest to each other's
//! state. This crate holds everything that decides whether such an
//! attestation is consistent and when it becomes final:
//!
//! - [`proof_root`] - Height-pinned commitments to a chain's state
//! - [`currency`] - Currency definitions and the launch-aware currency state
//! - [`notarization`] - The notarization record and its mirror orientation
//! - [`chain_data`] - The DAG of competing notarization forks
//! - [`transition`] - The transfer-driven transition function
//! - [`evidence`] - Polarity-safe notary signature evidence
//! - [`finalization`] - The pending → confirmed | rejected state machine
//!
//! Chain access, wallets, and peer RPC are collaborators of the
//! `concord-protocol` crate; everything here is pure over its inputs.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod chain_data;
pub mod currency;
pub mod errors;
pub mod evidence;
pub mod finalization;
pub mod keys;
pub mod notarization;
pub mod proof_root;
pub mod transfer;
pub mod transition;

pub use chain_data::ChainNotarizationData;
pub use currency::{CurrencyDefinition, CurrencyState, CurrencyValueMap, NotarizationProtocol};
pub use errors::{NotaryError, Result};
pub use evidence::{NotaryEvidence, NotarySignatures, PartialTransactionProof, DEFAULT_OUTPUT_VALUE};
pub use finalization::{validate_finalization_spend, Finalization, FinalizationKind};
pub use keys::{
    condition_id, finalization_confirmed_key, notary_confirmed_key, notary_notarization_key,
    notary_rejected_key,
};
pub use notarization::{NodeData, Notarization};
pub use proof_root::{ProofRoot, ProofRootKind};
pub use transfer::{calculate_conversion_fee, ReserveTransfer};
pub use transition::{
    BasicTransferExecutor, ReserveTransferExecutor, TransferImport, TransitionResult,
};
