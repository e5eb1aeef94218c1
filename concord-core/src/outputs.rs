//! Transaction outputs and references.
//!
//! Concord records live inside tagged transaction outputs. The tag (an
//! evaluation code) says what kind of record the payload bytes decode to;
//! the payload itself is the record's canonical binary form. Hashing a
//! record always hashes exactly those payload bytes, with no length prefix.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::{hash, Hash};
use crate::error::Result;

/// Evaluation code tagging an output payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalCode {
    /// Attestation emitted by our block producer about a peer chain.
    EarnedNotarization,
    /// Attestation originating on a peer chain, ingested here.
    AcceptedNotarization,
    /// Finalization record for a notarization output.
    FinalizeNotarization,
    /// Collected notary signatures and proof artifacts.
    NotaryEvidence,
    /// Any output this subsystem does not interpret.
    Other,
}

/// Reference to a transaction output: transaction id plus output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UtxoRef {
    /// Transaction id; the zero hash means "same transaction".
    pub txid: Hash,
    /// Output index.
    pub index: u32,
}

impl UtxoRef {
    /// Create a reference.
    pub fn new(txid: Hash, index: u32) -> Self {
        Self { txid, index }
    }

    /// A null reference (no transaction).
    pub fn null() -> Self {
        Self {
            txid: Hash::ZERO,
            index: 0,
        }
    }

    /// Whether this reference is null.
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == 0
    }

    /// Whether the reference points at an output on its own transaction.
    pub fn is_on_same_transaction(&self) -> bool {
        self.txid.is_zero()
    }
}

impl fmt::Display for UtxoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction output carrying a tagged payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Value carried by the output.
    pub value: u64,
    /// What the payload decodes to.
    pub eval: EvalCode,
    /// Canonical binary form of the record, empty for `Other`.
    pub payload: Vec<u8>,
}

impl Output {
    /// Build an output from a serializable record.
    pub fn with_payload<T: Serialize>(value: u64, eval: EvalCode, record: &T) -> Result<Self> {
        Ok(Self {
            value,
            eval,
            payload: canonical_bytes(record)?,
        })
    }

    /// Decode the payload as a record of type `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Hash of the raw payload bytes. This is what notaries sign.
    pub fn payload_hash(&self) -> Hash {
        hash(&self.payload)
    }
}

/// A transaction: spent references in, tagged outputs out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Outputs spent by this transaction.
    pub inputs: Vec<UtxoRef>,
    /// Outputs created by this transaction.
    pub outputs: Vec<Output>,
}

impl Transaction {
    /// Create an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction id: hash of the canonical form.
    pub fn txid(&self) -> Hash {
        hash(&canonical_bytes(self).expect("transaction serialization is infallible"))
    }

    /// Indices of outputs carrying the given evaluation code.
    pub fn outputs_with_eval(&self, eval: EvalCode) -> Vec<usize> {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.eval == eval)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Deterministic binary form of a record, with no outer length prefix.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Hash a record's canonical binary form.
pub fn object_hash<T: Serialize>(value: &T) -> Result<Hash> {
    Ok(hash(&canonical_bytes(value)?))
}
