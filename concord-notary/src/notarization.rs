//! The notarization record: one proposed or confirmed attestation linking
//! two chains.
//!
//! A record carries the proposer, the attested currency state, currency
//! states for other currencies the source system hosts, proof roots for
//! every involved system, and a reference plus hash of the prior record it
//! extends. Records are immutable snapshots; evolution happens by deriving
//! the next record through the transition function.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use concord_core::{
    object_hash, CurrencyId, EvalCode, Hash, IdentityId, Output, SystemId, Transaction, UtxoRef,
};

use crate::currency::CurrencyState;
use crate::errors::{NotaryError, Result};
use crate::proof_root::ProofRoot;

// Notarization flag bits.
const FLAG_DEFINITION: u32 = 1;
const FLAG_BLOCK_ONE: u32 = 1 << 1;
const FLAG_PRELAUNCH: u32 = 1 << 2;
const FLAG_LAUNCH_CLEARED: u32 = 1 << 3;
const FLAG_REFUNDING: u32 = 1 << 4;
const FLAG_LAUNCH_CONFIRMED: u32 = 1 << 5;
const FLAG_MIRROR: u32 = 1 << 6;
const FLAG_SAME_CHAIN: u32 = 1 << 7;

/// A peer hint carried in a notarization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    /// Network address of the node.
    #[serde(rename = "networkaddress")]
    pub network_address: String,
    /// Identity the node operates under.
    #[serde(rename = "nodeidentity")]
    pub node_identity: String,
}

/// One attestation about the state of another chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notarization {
    /// Record version.
    pub version: u32,
    /// Flag bits.
    pub flags: u32,
    /// Identity that proposed the record (block producer or relayer).
    pub proposer: IdentityId,
    /// Currency whose system this record attests to.
    #[serde(rename = "currencyid")]
    pub currency_id: CurrencyId,
    /// Height of this record on the chain that created it.
    #[serde(rename = "notarizationheight")]
    pub notarization_height: u32,
    /// Height of the prior record.
    #[serde(rename = "prevheight")]
    pub prev_height: u32,
    /// Reference to the prior record's output, if any.
    #[serde(rename = "prevnotarization")]
    pub prev_notarization: Option<UtxoRef>,
    /// Hash of the prior record's canonical form.
    #[serde(rename = "hashprevnotarization")]
    pub hash_prev_notarization: Hash,
    /// State of `currency_id` as attested.
    #[serde(rename = "currencystate")]
    pub currency_state: CurrencyState,
    /// States of other currencies, keyed by currency. Never contains
    /// `currency_id`.
    #[serde(rename = "currencystates")]
    pub currency_states: BTreeMap<CurrencyId, CurrencyState>,
    /// Proof roots of every involved system, keyed by system.
    #[serde(rename = "proofroots")]
    pub proof_roots: BTreeMap<SystemId, ProofRoot>,
    /// Optional peer hints.
    pub nodes: Vec<NodeData>,
}

impl Notarization {
    /// Version marking an unusable record.
    pub const VERSION_INVALID: u32 = 0;
    /// First accepted version.
    pub const VERSION_FIRST: u32 = 1;
    /// Current version.
    pub const VERSION_CURRENT: u32 = 1;
    /// Last accepted version.
    pub const VERSION_LAST: u32 = 1;

    /// Create a definition notarization for a newly defined currency.
    pub fn definition(
        proposer: IdentityId,
        currency_id: CurrencyId,
        currency_state: CurrencyState,
        height: u32,
    ) -> Self {
        Self {
            version: Self::VERSION_CURRENT,
            flags: FLAG_DEFINITION,
            proposer,
            currency_id,
            notarization_height: height,
            prev_height: 0,
            prev_notarization: None,
            hash_prev_notarization: Hash::ZERO,
            currency_state,
            currency_states: BTreeMap::new(),
            proof_roots: BTreeMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Decode a notarization from an output payload.
    pub fn from_output(output: &Output) -> Result<Self> {
        if !matches!(
            output.eval,
            EvalCode::EarnedNotarization | EvalCode::AcceptedNotarization
        ) {
            return Err(NotaryError::InvalidNotarization(
                "output is not a notarization".into(),
            ));
        }
        let notarization: Notarization = output.decode()?;
        if !notarization.is_valid() {
            return Err(NotaryError::InvalidNotarization(
                "decoded record fails validation".into(),
            ));
        }
        Ok(notarization)
    }

    /// Find the single notarization output on a transaction.
    ///
    /// A transaction with zero or more than one notarization output is
    /// rejected.
    pub fn from_transaction(tx: &Transaction) -> Result<(Self, usize)> {
        let mut found: Option<(Self, usize)> = None;
        for (i, output) in tx.outputs.iter().enumerate() {
            if matches!(
                output.eval,
                EvalCode::EarnedNotarization | EvalCode::AcceptedNotarization
            ) {
                if found.is_some() {
                    return Err(NotaryError::InvalidNotarization(
                        "multiple notarization outputs on one transaction".into(),
                    ));
                }
                found = Some((Self::from_output(output)?, i));
            }
        }
        found.ok_or_else(|| {
            NotaryError::InvalidNotarization("no notarization output on transaction".into())
        })
    }

    /// Decode from the JSON form.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let notarization: Notarization =
            serde_json::from_value(value.clone()).map_err(concord_core::Error::from)?;
        if !notarization.is_valid() {
            return Err(NotaryError::InvalidNotarization(
                "JSON record fails validation".into(),
            ));
        }
        Ok(notarization)
    }

    /// Structural validity of the record.
    pub fn is_valid(&self) -> bool {
        self.version >= Self::VERSION_FIRST
            && self.version <= Self::VERSION_LAST
            && !self.currency_id.is_zero()
            && self.prev_height <= self.notarization_height
            && !self.currency_states.contains_key(&self.currency_id)
            && self.currency_state.is_valid()
            && self.currency_states.values().all(|s| s.is_valid())
    }

    /// Hash of this record's canonical form.
    pub fn object_hash(&self) -> Hash {
        object_hash(self).expect("notarization serialization is infallible")
    }

    /// Whether this is the notarization created with the currency definition.
    pub fn is_definition(&self) -> bool {
        self.flags & FLAG_DEFINITION != 0
    }

    /// Set or clear the definition flag.
    pub fn set_definition(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_DEFINITION;
        } else {
            self.flags &= !FLAG_DEFINITION;
        }
    }

    /// Whether this is a block-one notarization.
    pub fn is_block_one(&self) -> bool {
        self.flags & FLAG_BLOCK_ONE != 0
    }

    /// Whether the attested currency is still in pre-launch.
    pub fn is_prelaunch(&self) -> bool {
        self.flags & FLAG_PRELAUNCH != 0
    }

    /// Set or clear the pre-launch flag.
    pub fn set_prelaunch(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_PRELAUNCH;
        } else {
            self.flags &= !FLAG_PRELAUNCH;
        }
    }

    /// Whether the launch-cleared pass has run.
    pub fn is_launch_cleared(&self) -> bool {
        self.flags & FLAG_LAUNCH_CLEARED != 0
    }

    /// Mark the launch-cleared pass as run.
    pub fn set_launch_cleared(&mut self) {
        self.flags |= FLAG_LAUNCH_CLEARED;
    }

    /// Whether the record marks the currency refunding.
    pub fn is_refunding(&self) -> bool {
        self.flags & FLAG_REFUNDING != 0
    }

    /// Mark the record refunding.
    pub fn set_refunding(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_REFUNDING;
            self.flags &= !FLAG_LAUNCH_CONFIRMED;
        } else {
            self.flags &= !FLAG_REFUNDING;
        }
    }

    /// Whether the record marks the launch confirmed.
    pub fn is_launch_confirmed(&self) -> bool {
        self.flags & FLAG_LAUNCH_CONFIRMED != 0
    }

    /// Mark the launch confirmed.
    pub fn set_launch_confirmed(&mut self) {
        self.flags |= FLAG_LAUNCH_CONFIRMED;
        self.flags &= !FLAG_REFUNDING;
    }

    /// Whether the record is in its mirrored orientation.
    pub fn is_mirror(&self) -> bool {
        self.flags & FLAG_MIRROR != 0
    }

    /// Whether source and destination live on the same chain.
    pub fn is_same_chain(&self) -> bool {
        self.flags & FLAG_SAME_CHAIN != 0
    }

    /// Set or clear the same-chain flag.
    pub fn set_same_chain(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_SAME_CHAIN;
        } else {
            self.flags &= !FLAG_SAME_CHAIN;
        }
    }

    /// Produce the mirrored orientation of this record, swapping the
    /// perspective so `other_system` becomes the attested currency.
    ///
    /// The record must carry a currency state for `other_system`, and a
    /// record already in mirrored orientation cannot be mirrored again.
    pub fn mirrored(&self, other_system: SystemId) -> Result<Notarization> {
        if self.is_mirror() {
            return Err(NotaryError::MirrorAlreadyMirrored);
        }
        let mut mirrored = self.clone();
        let Some(new_primary) = mirrored.currency_states.remove(&other_system) else {
            return Err(NotaryError::InvalidNotarization(format!(
                "no currency state for mirror target {other_system}"
            )));
        };
        let old_primary = std::mem::replace(&mut mirrored.currency_state, new_primary);
        mirrored
            .currency_states
            .insert(mirrored.currency_id, old_primary);
        mirrored.currency_id = other_system;
        mirrored.flags |= FLAG_MIRROR;
        Ok(mirrored)
    }
}
