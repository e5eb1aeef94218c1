//! Concord Core - Fundamental types for the Concord notarization protocol.
//!
//! This crate provides the data structures and cryptographic primitives
//! shared by every layer of the Concord system:
//!
//! - [`crypto`] - Hashing (BLAKE3) and signatures (Ed25519)
//! - [`identity`] - Notary identities, identity signatures, and the key store
//! - [`outputs`] - Tagged transaction outputs and output references
//! - [`mmr`] - Merkle mountain range used for height-pinned state roots
//!
//! # Example
//!
//! ```rust
//! use concord_core::{hash, mmr::MountainRange, Hash};
//!
//! let mut mmr = MountainRange::new();
//! mmr.append(hash(b"block 0"));
//! mmr.append(hash(b"block 1"));
//!
//! // Roots are pinned to a leaf count, so earlier roots stay reproducible.
//! let root_at_genesis = mmr.root_at(1).unwrap();
//! assert_ne!(root_at_genesis, mmr.root());
//! ```

pub mod crypto;
pub mod error;
pub mod identity;
pub mod mmr;
pub mod outputs;

#[cfg(test)]
mod proptest;

// Re-exports for convenience
pub use crypto::{hash, hash_pair, Hash, PublicKey, SecretKey, Signature};
pub use error::{Error, Result};
pub use identity::{
    Identity, IdentityId, IdentitySignature, KeySignature, KeyStore, NotarySet, SignatureResult,
};
pub use outputs::{canonical_bytes, object_hash, EvalCode, Output, Transaction, UtxoRef};

/// Identifier of a chain/system. Derived from the hash of its definition name.
pub type SystemId = Hash;

/// Identifier of a currency. Derived the same way as [`SystemId`].
pub type CurrencyId = Hash;
