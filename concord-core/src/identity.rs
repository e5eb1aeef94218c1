//! Notary identities and identity signatures.
//!
//! An identity is a named signer with one or more primary keys and a
//! signature threshold. Identity signatures bind a message hash to a
//! purpose key, a system, and a height, so a signature produced for one
//! context can never be replayed in another.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::crypto::{hash, Hash, PublicKey, SecretKey, Signature};
use crate::error::{Error, Result};

/// Identifier of an identity, derived from its registered name.
pub type IdentityId = Hash;

/// Outcome of producing or checking an identity signature.
///
/// `Partial` means some but fewer than `min_sigs` of the identity's keys
/// have signed; `Complete` means the threshold is met. Invalid signatures
/// are reported as errors, never as a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureResult {
    /// Below the identity's signature threshold.
    Partial,
    /// At or above the identity's signature threshold.
    Complete,
}

/// A registered identity that may appear in a notary set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable identifier.
    pub id: IdentityId,
    /// Human-readable name the identifier was derived from.
    pub name: String,
    /// Keys that may sign on behalf of this identity.
    pub primary_keys: Vec<PublicKey>,
    /// How many distinct primary keys must sign for a complete signature.
    pub min_sigs: usize,
    /// Whether the identity has been revoked.
    pub revoked: bool,
}

impl Identity {
    /// Create an identity from a name and its keys.
    pub fn new(name: impl Into<String>, primary_keys: Vec<PublicKey>, min_sigs: usize) -> Self {
        let name = name.into();
        Self {
            id: hash(name.as_bytes()),
            name,
            primary_keys,
            min_sigs,
            revoked: false,
        }
    }

    /// Check that the identity is usable as a signer.
    pub fn is_valid_unrevoked(&self) -> bool {
        !self.revoked && !self.primary_keys.is_empty() && self.min_sigs >= 1
    }
}

/// One key's contribution to an identity signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySignature {
    /// The primary key that signed.
    pub pubkey: PublicKey,
    /// Its signature over the identity signature hash.
    pub signature: Signature,
}

/// A (possibly partial) signature by one identity over a purpose-bound hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignature {
    /// Height the signature was produced at.
    pub height: u32,
    /// Signatures from the identity's primary keys.
    pub signatures: Vec<KeySignature>,
}

impl IdentitySignature {
    /// Compute the hash that primary keys actually sign.
    ///
    /// Binds the message hash to purpose keys, optional statements, the
    /// system, the height, and a prefix, in that order.
    pub fn signature_hash(
        purpose_keys: &[Hash],
        statements: &[Hash],
        system_id: Hash,
        height: u32,
        prefix: &str,
        msg_hash: Hash,
    ) -> Hash {
        let mut hasher = blake3::Hasher::new();
        for key in purpose_keys {
            hasher.update(key.as_bytes());
        }
        for statement in statements {
            hasher.update(statement.as_bytes());
        }
        hasher.update(system_id.as_bytes());
        hasher.update(&height.to_le_bytes());
        hasher.update(prefix.as_bytes());
        hasher.update(msg_hash.as_bytes());
        Hash::from_bytes(*hasher.finalize().as_bytes())
    }

    /// Verify this signature against an identity for the given signature hash.
    ///
    /// Every contained key must belong to the identity and verify; duplicate
    /// key use is rejected. Returns whether the identity's threshold is met.
    pub fn check(&self, identity: &Identity, sig_hash: Hash) -> Result<SignatureResult> {
        if !identity.is_valid_unrevoked() {
            return Err(Error::invalid_key(format!(
                "identity {} is revoked or malformed",
                identity.name
            )));
        }

        let mut verified: Vec<[u8; 32]> = Vec::new();
        for key_sig in &self.signatures {
            if !identity.primary_keys.contains(&key_sig.pubkey) {
                return Err(Error::invalid_signature());
            }
            let key_bytes = key_sig.pubkey.as_bytes();
            if verified.contains(&key_bytes) {
                return Err(Error::invalid_signature());
            }
            key_sig
                .pubkey
                .verify(sig_hash.as_bytes(), &key_sig.signature)?;
            verified.push(key_bytes);
        }

        if verified.is_empty() {
            return Err(Error::invalid_signature());
        }

        if verified.len() >= identity.min_sigs {
            Ok(SignatureResult::Complete)
        } else {
            Ok(SignatureResult::Partial)
        }
    }
}

/// In-memory key store mapping identities to the secret keys this node controls.
///
/// Mirrors the wallet's view: an identity may be registered without any of
/// its keys being controllable here.
#[derive(Default)]
pub struct KeyStore {
    identities: HashMap<IdentityId, Identity>,
    /// Secret keys by public key bytes.
    keys: HashMap<[u8; 32], SecretKey>,
}

impl KeyStore {
    /// Create an empty key store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity (with or without controlling its keys).
    pub fn add_identity(&mut self, identity: Identity) {
        self.identities.insert(identity.id, identity);
    }

    /// Add a secret key this node controls.
    pub fn add_key(&mut self, key: SecretKey) {
        self.keys.insert(key.public_key().as_bytes(), key);
    }

    /// Look up a registered identity.
    pub fn identity(&self, id: &IdentityId) -> Option<&Identity> {
        self.identities.get(id)
    }

    /// Identities from `candidates` for which this store controls enough keys
    /// to produce a complete signature.
    pub fn controlled_identities(&self, candidates: &[IdentityId]) -> Vec<IdentityId> {
        candidates
            .iter()
            .filter(|id| self.can_sign(id))
            .copied()
            .collect()
    }

    /// Whether this store can produce a complete signature for the identity.
    pub fn can_sign(&self, id: &IdentityId) -> bool {
        let Some(identity) = self.identities.get(id) else {
            return false;
        };
        if !identity.is_valid_unrevoked() {
            return false;
        }
        let controlled = identity
            .primary_keys
            .iter()
            .filter(|pk| self.keys.contains_key(&pk.as_bytes()))
            .count();
        controlled >= identity.min_sigs
    }

    /// Sign a purpose-bound hash with all controlled keys of an identity.
    pub fn sign(
        &self,
        id: &IdentityId,
        purpose_keys: &[Hash],
        system_id: Hash,
        height: u32,
        msg_hash: Hash,
    ) -> Result<(IdentitySignature, SignatureResult)> {
        let identity = self
            .identities
            .get(id)
            .ok_or_else(|| Error::not_found(format!("identity {id}")))?;
        if !identity.is_valid_unrevoked() {
            return Err(Error::invalid_key(format!(
                "identity {} is revoked or malformed",
                identity.name
            )));
        }

        let sig_hash =
            IdentitySignature::signature_hash(purpose_keys, &[], system_id, height, "", msg_hash);

        let mut signatures = Vec::new();
        for pubkey in &identity.primary_keys {
            if let Some(secret) = self.keys.get(&pubkey.as_bytes()) {
                signatures.push(KeySignature {
                    pubkey: pubkey.clone(),
                    signature: secret.sign(sig_hash.as_bytes()),
                });
            }
        }

        if signatures.is_empty() {
            return Err(Error::invalid_key(format!(
                "no controlled keys for identity {}",
                identity.name
            )));
        }

        let result = if signatures.len() >= identity.min_sigs {
            SignatureResult::Complete
        } else {
            SignatureResult::Partial
        };

        Ok((IdentitySignature { height, signatures }, result))
    }
}

/// A notary set with its confirmation threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotarySet {
    /// Authorized notary identities.
    pub notaries: Vec<IdentityId>,
    /// Distinct notaries required to confirm.
    pub min_notaries_confirm: usize,
}

impl NotarySet {
    /// Check membership.
    pub fn contains(&self, id: &IdentityId) -> bool {
        self.notaries.contains(id)
    }

    /// Count distinct authorized signers in a signature map.
    pub fn count_authorized<V>(&self, signatures: &BTreeMap<IdentityId, V>) -> usize {
        signatures.keys().filter(|id| self.contains(id)).count()
    }
}
