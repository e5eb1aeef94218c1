//! Notary evidence: collected signatures and proof artifacts for one output.
//!
//! All signatures in one evidence record share a polarity: they either all
//! confirm or all reject the referenced output. The polarity is a property
//! of the record, represented as a sum type so a mixed record cannot be
//! constructed at all.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use concord_core::{
    EvalCode, Hash, IdentityId, IdentitySignature, KeyStore, SignatureResult, SystemId,
    Transaction, UtxoRef,
};

use crate::currency::CurrencyDefinition;
use crate::errors::{NotaryError, Result};
use crate::keys::{notary_confirmed_key, notary_rejected_key};

/// Value carried by a notary evidence output.
pub const DEFAULT_OUTPUT_VALUE: u64 = 10_000;

/// A partial proof of a transaction on another chain, carried as evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialTransactionProof {
    /// Output the proof concerns.
    pub output: UtxoRef,
    /// Root the proof commits into.
    pub subject: Hash,
    /// Sibling hashes on the proof path.
    pub proof: Vec<Hash>,
}

/// Signatures of uniform polarity, keyed by signing identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotarySignatures {
    /// Every signature confirms the referenced output.
    Confirming(BTreeMap<IdentityId, IdentitySignature>),
    /// Every signature rejects the referenced output.
    Rejecting(BTreeMap<IdentityId, IdentitySignature>),
}

impl NotarySignatures {
    /// The signature map regardless of polarity.
    pub fn map(&self) -> &BTreeMap<IdentityId, IdentitySignature> {
        match self {
            NotarySignatures::Confirming(map) | NotarySignatures::Rejecting(map) => map,
        }
    }

    /// Number of identities that signed.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    /// Whether no identity has signed yet.
    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

/// Evidence collected for one notarization (or export) output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotaryEvidence {
    /// Record version.
    pub version: u32,
    /// System the evidence was gathered on.
    #[serde(rename = "systemid")]
    pub system_id: SystemId,
    /// Output the evidence concerns.
    pub output: UtxoRef,
    /// Signatures, uniform in polarity.
    pub signatures: NotarySignatures,
    /// Proof artifacts accompanying the signatures.
    pub evidence: Vec<PartialTransactionProof>,
}

impl NotaryEvidence {
    /// Current version.
    pub const VERSION_CURRENT: u32 = 1;

    /// Fresh evidence for an output. Polarity is fixed by the first signer.
    pub fn new(system_id: SystemId, output: UtxoRef) -> Self {
        Self {
            version: Self::VERSION_CURRENT,
            system_id,
            output,
            signatures: NotarySignatures::Confirming(BTreeMap::new()),
            evidence: Vec::new(),
        }
    }

    /// Decode from the JSON form.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let evidence: NotaryEvidence =
            serde_json::from_value(value.clone()).map_err(concord_core::Error::from)?;
        if !evidence.is_valid() {
            return Err(NotaryError::InvalidSignature(
                "JSON evidence fails validation".into(),
            ));
        }
        Ok(evidence)
    }

    /// Structural validity.
    pub fn is_valid(&self) -> bool {
        self.version == Self::VERSION_CURRENT && !self.system_id.is_zero()
    }

    /// Whether the record's polarity is confirming.
    pub fn confirmed(&self) -> bool {
        matches!(self.signatures, NotarySignatures::Confirming(_))
    }

    /// Whether the record carries at least one notary signature.
    pub fn is_notary_signature(&self) -> bool {
        !self.signatures.is_empty()
    }

    /// Sign the referenced output as confirmed with `sign_with`.
    ///
    /// Fails without mutating the record if any rejecting signature is
    /// already present, if the key store does not control `sign_with`, or if
    /// the referenced output does not decode to a signable payload.
    pub fn sign_confirmed(
        &mut self,
        key_store: &KeyStore,
        tx_to_confirm: &Transaction,
        sign_with: IdentityId,
        height: u32,
    ) -> Result<SignatureResult> {
        if let NotarySignatures::Rejecting(map) = &self.signatures {
            if !map.is_empty() {
                warn!("attempt to change existing signature from rejected to confirmed");
                return Err(NotaryError::InvalidSignature(
                    "evidence polarity is rejecting".into(),
                ));
            }
        }

        let (signature, result) = self.make_signature(
            key_store,
            tx_to_confirm,
            sign_with,
            height,
            notary_confirmed_key(),
        )?;
        // Nothing was mutated before this point; a failed attempt leaves
        // the record untouched.
        if let NotarySignatures::Rejecting(_) = &self.signatures {
            self.signatures = NotarySignatures::Confirming(BTreeMap::new());
        }
        if let NotarySignatures::Confirming(map) = &mut self.signatures {
            map.insert(sign_with, signature);
        }
        Ok(result)
    }

    /// Sign the referenced output as rejected with `sign_with`.
    pub fn sign_rejected(
        &mut self,
        key_store: &KeyStore,
        tx_to_confirm: &Transaction,
        sign_with: IdentityId,
        height: u32,
    ) -> Result<SignatureResult> {
        if let NotarySignatures::Confirming(map) = &self.signatures {
            if !map.is_empty() {
                warn!("attempt to change existing signature from confirmed to rejected");
                return Err(NotaryError::InvalidSignature(
                    "evidence polarity is confirming".into(),
                ));
            }
        }

        let (signature, result) = self.make_signature(
            key_store,
            tx_to_confirm,
            sign_with,
            height,
            notary_rejected_key(),
        )?;
        if let NotarySignatures::Confirming(_) = &self.signatures {
            self.signatures = NotarySignatures::Rejecting(BTreeMap::new());
        }
        if let NotarySignatures::Rejecting(map) = &mut self.signatures {
            map.insert(sign_with, signature);
        }
        Ok(result)
    }

    /// Build one identity signature over the target output's payload hash.
    fn make_signature(
        &self,
        key_store: &KeyStore,
        tx_to_confirm: &Transaction,
        sign_with: IdentityId,
        height: u32,
        purpose_key: Hash,
    ) -> Result<(IdentitySignature, SignatureResult)> {
        if !key_store.can_sign(&sign_with) {
            warn!(%sign_with, "attempt to sign with an uncontrolled notary identity");
            return Err(NotaryError::InvalidSignature(
                "identity is not controlled by this key store".into(),
            ));
        }

        let msg_hash = self.target_payload_hash(tx_to_confirm)?;
        let (signature, result) = key_store
            .sign(&sign_with, &[purpose_key], self.system_id, height, msg_hash)
            .map_err(|e| NotaryError::InvalidSignature(e.to_string()))?;
        Ok((signature, result))
    }

    /// Hash of the raw payload bytes of the referenced output.
    ///
    /// The referenced output must exist on the given transaction, be a
    /// tagged output, and carry a non-empty payload.
    pub fn target_payload_hash(&self, tx: &Transaction) -> Result<Hash> {
        if tx.txid() != self.output.txid {
            return Err(NotaryError::InvalidSignature(
                "transaction does not match the referenced output".into(),
            ));
        }
        let output = tx.outputs.get(self.output.index as usize).ok_or_else(|| {
            NotaryError::InvalidSignature("referenced output index out of range".into())
        })?;
        if output.eval == EvalCode::Other || output.payload.is_empty() {
            return Err(NotaryError::InvalidSignature(
                "referenced output has no signable payload".into(),
            ));
        }
        Ok(output.payload_hash())
    }

    /// Verify every contained signature against the authorized notary set
    /// and return the identities whose signatures are complete.
    ///
    /// Any signer outside the notary set is an error; a verification failure
    /// on any signature is an error. Identities are resolved from the key
    /// store's registry.
    pub fn complete_signers(
        &self,
        currency: &CurrencyDefinition,
        key_store: &KeyStore,
        msg_hash: Hash,
    ) -> Result<std::collections::BTreeSet<IdentityId>> {
        let purpose_key = if self.confirmed() {
            notary_confirmed_key()
        } else {
            notary_rejected_key()
        };

        let mut complete = std::collections::BTreeSet::new();
        for (id, signature) in self.signatures.map() {
            if !currency.notaries.contains(id) {
                return Err(NotaryError::UnauthorizedNotary(*id));
            }
            let identity = key_store.identity(id).ok_or_else(|| {
                NotaryError::InvalidSignature(format!("unknown signing identity {id}"))
            })?;
            let sig_hash = IdentitySignature::signature_hash(
                &[purpose_key],
                &[],
                self.system_id,
                signature.height,
                "",
                msg_hash,
            );
            match signature.check(identity, sig_hash) {
                Ok(SignatureResult::Complete) => {
                    complete.insert(*id);
                }
                Ok(SignatureResult::Partial) => {}
                Err(e) => return Err(NotaryError::InvalidSignature(e.to_string())),
            }
        }
        Ok(complete)
    }

    /// Number of distinct identities with complete signatures.
    pub fn count_complete_signatures(
        &self,
        currency: &CurrencyDefinition,
        key_store: &KeyStore,
        msg_hash: Hash,
    ) -> Result<usize> {
        Ok(self.complete_signers(currency, key_store, msg_hash)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::NotarizationProtocol;
    use concord_core::{hash, Identity, Output, SecretKey};

    fn signable_tx() -> Transaction {
        let mut tx = Transaction::new();
        tx.outputs.push(
            Output::with_payload(0, EvalCode::EarnedNotarization, &("record", 7u32)).unwrap(),
        );
        tx
    }

    fn notary(name: &str) -> (Identity, SecretKey) {
        let key = SecretKey::generate();
        let identity = Identity::new(name, vec![key.public_key()], 1);
        (identity, key)
    }

    fn store_with(notaries: &[(Identity, SecretKey)]) -> KeyStore {
        let mut store = KeyStore::new();
        for (identity, key) in notaries {
            store.add_identity(identity.clone());
            store.add_key(key.clone());
        }
        store
    }

    fn currency_with_notaries(ids: Vec<IdentityId>, min: usize) -> CurrencyDefinition {
        CurrencyDefinition {
            currency_id: hash(b"peer-chain"),
            name: "peer".into(),
            system_id: hash(b"peer-chain"),
            launch_system_id: hash(b"peer-chain"),
            start_block: 1,
            currencies: vec![],
            min_preconvert: vec![],
            max_preconvert: vec![],
            contributions: vec![],
            initial_supply: 0,
            fractional: false,
            notarization_protocol: NotarizationProtocol::NotaryConfirm,
            notaries: ids,
            min_notaries_confirm: min,
        }
    }

    #[test]
    fn test_sign_confirmed_inserts_signature() {
        let tx = signable_tx();
        let n1 = notary("n1");
        let store = store_with(std::slice::from_ref(&n1));
        let mut evidence = NotaryEvidence::new(hash(b"peer-chain"), UtxoRef::new(tx.txid(), 0));

        let result = evidence.sign_confirmed(&store, &tx, n1.0.id, 100).unwrap();
        assert_eq!(result, SignatureResult::Complete);
        assert!(evidence.confirmed());
        assert_eq!(evidence.signatures.len(), 1);
    }

    #[test]
    fn test_polarity_guard_rejects_mixing() {
        let tx = signable_tx();
        let n1 = notary("n1");
        let n2 = notary("n2");
        let store = store_with(&[n1.clone(), n2.clone()]);
        let mut evidence = NotaryEvidence::new(hash(b"peer-chain"), UtxoRef::new(tx.txid(), 0));

        evidence.sign_confirmed(&store, &tx, n1.0.id, 100).unwrap();
        let err = evidence.sign_rejected(&store, &tx, n2.0.id, 100).unwrap_err();
        assert!(matches!(err, NotaryError::InvalidSignature(_)));
        // The failed attempt did not mutate the record.
        assert!(evidence.confirmed());
        assert_eq!(evidence.signatures.len(), 1);
    }

    #[test]
    fn test_rejecting_polarity_symmetric_guard() {
        let tx = signable_tx();
        let n1 = notary("n1");
        let n2 = notary("n2");
        let store = store_with(&[n1.clone(), n2.clone()]);
        let mut evidence = NotaryEvidence::new(hash(b"peer-chain"), UtxoRef::new(tx.txid(), 0));

        evidence.sign_rejected(&store, &tx, n1.0.id, 100).unwrap();
        assert!(!evidence.confirmed());
        assert!(evidence.sign_confirmed(&store, &tx, n2.0.id, 100).is_err());
    }

    #[test]
    fn test_sign_requires_controlled_identity() {
        let tx = signable_tx();
        let n1 = notary("n1");
        let stranger = notary("stranger");
        let store = store_with(std::slice::from_ref(&n1));
        let mut evidence = NotaryEvidence::new(hash(b"peer-chain"), UtxoRef::new(tx.txid(), 0));
        assert!(evidence
            .sign_confirmed(&store, &tx, stranger.0.id, 100)
            .is_err());
    }

    #[test]
    fn test_sign_rejects_wrong_transaction() {
        let tx = signable_tx();
        let n1 = notary("n1");
        let store = store_with(std::slice::from_ref(&n1));
        let mut evidence =
            NotaryEvidence::new(hash(b"peer-chain"), UtxoRef::new(hash(b"other-tx"), 0));
        assert!(evidence.sign_confirmed(&store, &tx, n1.0.id, 100).is_err());
    }

    #[test]
    fn test_sign_rejects_untagged_output() {
        let mut tx = Transaction::new();
        tx.outputs
            .push(Output::with_payload(0, EvalCode::Other, &1u8).unwrap());
        let n1 = notary("n1");
        let store = store_with(std::slice::from_ref(&n1));
        let mut evidence = NotaryEvidence::new(hash(b"peer-chain"), UtxoRef::new(tx.txid(), 0));
        assert!(evidence.sign_confirmed(&store, &tx, n1.0.id, 100).is_err());
    }

    #[test]
    fn test_count_complete_signatures() {
        let tx = signable_tx();
        let notaries: Vec<_> = ["n1", "n2", "n3"].iter().map(|n| notary(n)).collect();
        let store = store_with(&notaries);
        let currency =
            currency_with_notaries(notaries.iter().map(|(i, _)| i.id).collect(), 2);
        let mut evidence = NotaryEvidence::new(hash(b"peer-chain"), UtxoRef::new(tx.txid(), 0));

        for (identity, _) in notaries.iter().take(2) {
            evidence.sign_confirmed(&store, &tx, identity.id, 100).unwrap();
        }

        let msg_hash = evidence.target_payload_hash(&tx).unwrap();
        let complete = evidence
            .count_complete_signatures(&currency, &store, msg_hash)
            .unwrap();
        assert_eq!(complete, 2);
    }

    #[test]
    fn test_unauthorized_signer_is_error() {
        let tx = signable_tx();
        let n1 = notary("n1");
        let outsider = notary("outsider");
        let store = store_with(&[n1.clone(), outsider.clone()]);
        // Notary set contains only n1.
        let currency = currency_with_notaries(vec![n1.0.id], 1);
        let mut evidence = NotaryEvidence::new(hash(b"peer-chain"), UtxoRef::new(tx.txid(), 0));
        evidence
            .sign_confirmed(&store, &tx, outsider.0.id, 100)
            .unwrap();

        let msg_hash = evidence.target_payload_hash(&tx).unwrap();
        assert!(matches!(
            evidence.count_complete_signatures(&currency, &store, msg_hash),
            Err(NotaryError::UnauthorizedNotary(_))
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let tx = signable_tx();
        let n1 = notary("n1");
        let store = store_with(std::slice::from_ref(&n1));
        let mut evidence = NotaryEvidence::new(hash(b"peer-chain"), UtxoRef::new(tx.txid(), 0));
        evidence.sign_confirmed(&store, &tx, n1.0.id, 100).unwrap();

        let value = serde_json::to_value(&evidence).unwrap();
        let back = NotaryEvidence::from_json(&value).unwrap();
        assert_eq!(evidence, back);
    }
}
