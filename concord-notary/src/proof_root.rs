//! Height-pinned proof roots.
//!
//! A proof root commits to a chain's state at one height: the MMR root over
//! blocks `[0, height]`, the block hash at that height, and the compact
//! chain-power representation. For a given `(system, height)` exactly one
//! valid root exists on a canonical chain; two roots at the same height with
//! different state roots indicate a fork.

use serde::{Deserialize, Serialize};

use concord_core::{Hash, SystemId};

/// Kind of chain a proof root commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofRootKind {
    /// A Concord-style chain with an MMR state root.
    Native,
    /// An Ethereum-style chain.
    Ethereum,
}

/// Cryptographic commitment to a chain's state at a height. Immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRoot {
    /// Chain the root belongs to.
    #[serde(rename = "systemid")]
    pub system_id: SystemId,
    /// Height the root is pinned to.
    #[serde(rename = "height")]
    pub root_height: u32,
    /// MMR root over blocks `[0, root_height]`.
    #[serde(rename = "stateroot")]
    pub state_root: Hash,
    /// Block hash at `root_height`.
    #[serde(rename = "blockhash")]
    pub block_hash: Hash,
    /// Compact representation of accumulated chain power.
    #[serde(rename = "power")]
    pub compact_power: u128,
    /// Kind of chain this root commits to.
    #[serde(rename = "type")]
    pub kind: ProofRootKind,
}

impl ProofRoot {
    /// Create a native proof root.
    pub fn new(
        system_id: SystemId,
        root_height: u32,
        state_root: Hash,
        block_hash: Hash,
        compact_power: u128,
    ) -> Self {
        Self {
            system_id,
            root_height,
            state_root,
            block_hash,
            compact_power,
            kind: ProofRootKind::Native,
        }
    }

    /// Whether the root refers to a real system.
    pub fn is_valid(&self) -> bool {
        !self.system_id.is_zero()
    }
}
