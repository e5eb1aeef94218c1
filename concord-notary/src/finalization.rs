//! Finalization records: the state machine that confirms or rejects a
//! notarization.
//!
//! A finalization starts `PENDING` and is spent into exactly one successor
//! that either stays pending (accumulating evidence) or reaches a terminal
//! `CONFIRMED` or `REJECTED` state. Terminal states never transition again.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use concord_core::{
    CurrencyId, EvalCode, IdentityId, KeyStore, Output, Transaction, UtxoRef,
};

use crate::currency::{CurrencyDefinition, NotarizationProtocol};
use crate::errors::{NotaryError, Result};
use crate::evidence::NotaryEvidence;

// Finalization flag bits. At most one may be set.
const FINALIZE_CONFIRMED: u32 = 1;
const FINALIZE_REJECTED: u32 = 1 << 1;

/// What kind of object a finalization finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizationKind {
    /// Finalizes a notarization output.
    Notarization,
    /// Finalizes an export output.
    Export,
}

/// A finalization record for one output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalization {
    /// Record version.
    pub version: u32,
    /// Kind of object finalized.
    #[serde(rename = "finalizationtype")]
    pub kind: FinalizationKind,
    /// State flag bits.
    pub flags: u32,
    /// Currency whose notarization chain this belongs to.
    #[serde(rename = "currencyid")]
    pub currency_id: CurrencyId,
    /// The output being finalized. A zero txid means "on this transaction".
    pub output: UtxoRef,
    /// Height before which this finalization may not be advanced.
    #[serde(rename = "minimumheight")]
    pub min_height: u32,
    /// Spending-transaction input indices citing evidence.
    #[serde(rename = "evidenceinputs")]
    pub evidence_inputs: Vec<u32>,
    /// Spending-transaction output indices citing evidence.
    #[serde(rename = "evidenceoutputs")]
    pub evidence_outputs: Vec<u32>,
}

impl Finalization {
    /// Current version.
    pub const VERSION_CURRENT: u32 = 1;

    /// A fresh pending finalization.
    pub fn pending(
        kind: FinalizationKind,
        currency_id: CurrencyId,
        output: UtxoRef,
        min_height: u32,
    ) -> Self {
        Self {
            version: Self::VERSION_CURRENT,
            kind,
            flags: 0,
            currency_id,
            output,
            min_height,
            evidence_inputs: Vec::new(),
            evidence_outputs: Vec::new(),
        }
    }

    /// Structural validity: version and exclusive state flags.
    pub fn is_valid(&self) -> bool {
        self.version == Self::VERSION_CURRENT
            && !(self.is_confirmed() && self.is_rejected())
            && !self.currency_id.is_zero()
    }

    /// Whether the record is confirmed.
    pub fn is_confirmed(&self) -> bool {
        self.flags & FINALIZE_CONFIRMED != 0
    }

    /// Whether the record is rejected.
    pub fn is_rejected(&self) -> bool {
        self.flags & FINALIZE_REJECTED != 0
    }

    /// Whether the record is still pending.
    pub fn is_pending(&self) -> bool {
        !self.is_confirmed() && !self.is_rejected()
    }

    /// Move to `CONFIRMED`. Fails from any terminal state.
    pub fn set_confirmed(&mut self) -> Result<()> {
        if !self.is_pending() {
            return Err(NotaryError::AlreadyFinalized);
        }
        self.flags |= FINALIZE_CONFIRMED;
        Ok(())
    }

    /// Move to `REJECTED`. Fails from any terminal state.
    pub fn set_rejected(&mut self) -> Result<()> {
        if !self.is_pending() {
            return Err(NotaryError::AlreadyFinalized);
        }
        self.flags |= FINALIZE_REJECTED;
        Ok(())
    }

    /// Find the single notarization finalization on a transaction.
    ///
    /// More than one finalization output of this kind invalidates the
    /// transaction for finalization purposes.
    pub fn from_transaction(tx: &Transaction) -> Result<(Self, usize)> {
        let mut found: Option<(Self, usize)> = None;
        for (i, output) in tx.outputs.iter().enumerate() {
            if output.eval == EvalCode::FinalizeNotarization {
                if found.is_some() {
                    return Err(NotaryError::DuplicateFinalization);
                }
                let finalization: Finalization = output.decode()?;
                if !finalization.is_valid() {
                    return Err(NotaryError::InvalidFinalization(
                        "decoded record fails validation".into(),
                    ));
                }
                found = Some((finalization, i));
            }
        }
        found.ok_or_else(|| {
            NotaryError::InvalidFinalization("no finalization output on transaction".into())
        })
    }

    /// Resolve the transaction holding the finalized output.
    ///
    /// A zero txid refers to `initial_tx` itself.
    pub fn get_output_transaction(
        &self,
        initial_tx: &Transaction,
        resolve: &dyn Fn(&concord_core::Hash) -> Option<Transaction>,
    ) -> Result<Transaction> {
        if self.output.is_on_same_transaction() {
            return Ok(initial_tx.clone());
        }
        let tx = resolve(&self.output.txid).ok_or_else(|| {
            NotaryError::InvalidFinalization(format!(
                "finalized transaction {} not found",
                self.output.txid
            ))
        })?;
        if tx.outputs.len() <= self.output.index as usize {
            return Err(NotaryError::InvalidFinalization(
                "finalized output index out of range".into(),
            ));
        }
        Ok(tx)
    }

    /// Build fresh evidence confirming the finalized output.
    pub fn sign_confirmed(
        &self,
        key_store: &KeyStore,
        system_id: concord_core::SystemId,
        initial_tx: &Transaction,
        resolve: &dyn Fn(&concord_core::Hash) -> Option<Transaction>,
        sign_with: IdentityId,
        height: u32,
    ) -> Result<NotaryEvidence> {
        let tx = self.get_output_transaction(initial_tx, resolve)?;
        let output = UtxoRef::new(tx.txid(), self.output.index);
        let mut evidence = NotaryEvidence::new(system_id, output);
        evidence.sign_confirmed(key_store, &tx, sign_with, height)?;
        Ok(evidence)
    }

    /// Build fresh evidence rejecting the finalized output.
    pub fn sign_rejected(
        &self,
        key_store: &KeyStore,
        system_id: concord_core::SystemId,
        initial_tx: &Transaction,
        resolve: &dyn Fn(&concord_core::Hash) -> Option<Transaction>,
        sign_with: IdentityId,
        height: u32,
    ) -> Result<NotaryEvidence> {
        let tx = self.get_output_transaction(initial_tx, resolve)?;
        let output = UtxoRef::new(tx.txid(), self.output.index);
        let mut evidence = NotaryEvidence::new(system_id, output);
        evidence.sign_rejected(key_store, &tx, sign_with, height)?;
        Ok(evidence)
    }
}

/// Validate a transaction spending a pending finalization output.
///
/// The spender must carry exactly one successor finalization for the same
/// output. Under `NOTARY_CONFIRM`, a terminal successor must cite evidence
/// carrying complete signatures of matching polarity from at least
/// `min_notaries_confirm` distinct authorized notaries. `AUTO` is rejected
/// outside test mode.
pub fn validate_finalization_spend(
    spending_tx: &Transaction,
    old: &Finalization,
    currency: &CurrencyDefinition,
    key_store: &KeyStore,
    resolve_output: &dyn Fn(&UtxoRef) -> Option<Output>,
    height: u32,
    test_mode: bool,
) -> Result<()> {
    if !old.is_pending() {
        return Err(NotaryError::AlreadyFinalized);
    }

    let (new, _) = Finalization::from_transaction(spending_tx)?;
    if new.output != old.output {
        return Err(NotaryError::InvalidFinalization(
            "successor finalization names a different output".into(),
        ));
    }

    if !new.is_pending() && height < old.min_height {
        return Err(NotaryError::InvalidFinalization(format!(
            "finalization cannot advance before height {}",
            old.min_height
        )));
    }

    match currency.notarization_protocol {
        NotarizationProtocol::NotaryChainId => Ok(()),
        NotarizationProtocol::Auto => {
            if test_mode {
                Ok(())
            } else {
                Err(NotaryError::InvalidFinalization(
                    "auto-notarization not implemented".into(),
                ))
            }
        }
        NotarizationProtocol::NotaryConfirm => {
            if new.is_pending() {
                return Ok(());
            }

            let notarization_output = resolve_output(&old.output).ok_or_else(|| {
                NotaryError::InvalidFinalization("finalized output not found".into())
            })?;
            let msg_hash = notarization_output.payload_hash();

            // Union the evidence cited by outputs on the spender and by its
            // spent inputs.
            let mut cited: Vec<NotaryEvidence> = Vec::new();
            for idx in &new.evidence_outputs {
                let output = spending_tx
                    .outputs
                    .get(*idx as usize)
                    .filter(|o| o.eval == EvalCode::NotaryEvidence)
                    .ok_or_else(|| {
                        NotaryError::InvalidFinalization("cited evidence output missing".into())
                    })?;
                cited.push(output.decode()?);
            }
            for idx in &new.evidence_inputs {
                let input_ref = spending_tx.inputs.get(*idx as usize).ok_or_else(|| {
                    NotaryError::InvalidFinalization("cited evidence input missing".into())
                })?;
                let output = resolve_output(input_ref)
                    .filter(|o| o.eval == EvalCode::NotaryEvidence)
                    .ok_or_else(|| {
                        NotaryError::InvalidFinalization(
                            "cited evidence input unresolvable".into(),
                        )
                    })?;
                cited.push(output.decode()?);
            }

            let want_confirming = new.is_confirmed();
            let mut signers: BTreeSet<IdentityId> = BTreeSet::new();
            for evidence in &cited {
                if evidence.output != old.output {
                    continue;
                }
                if evidence.confirmed() != want_confirming {
                    continue;
                }
                signers.extend(evidence.complete_signers(currency, key_store, msg_hash)?);
            }

            if signers.len() < currency.min_notaries_confirm {
                return Err(NotaryError::InsufficientEvidence {
                    have: signers.len(),
                    need: currency.min_notaries_confirm,
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{hash, Hash, Identity, SecretKey};

    fn currency(protocol: NotarizationProtocol, notaries: Vec<IdentityId>, min: usize) -> CurrencyDefinition {
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
            notarization_protocol: protocol,
            notaries,
            min_notaries_confirm: min,
        }
    }

    fn pending_finalization(output: UtxoRef) -> Finalization {
        Finalization::pending(FinalizationKind::Notarization, hash(b"peer-chain"), output, 25)
    }

    #[test]
    fn test_state_machine_terminal() {
        let mut f = pending_finalization(UtxoRef::new(hash(b"tx"), 0));
        assert!(f.is_pending());
        f.set_confirmed().unwrap();
        assert!(f.is_confirmed());
        assert!(matches!(f.set_rejected(), Err(NotaryError::AlreadyFinalized)));
        assert!(matches!(f.set_confirmed(), Err(NotaryError::AlreadyFinalized)));
    }

    #[test]
    fn test_both_flags_invalid() {
        let mut f = pending_finalization(UtxoRef::new(hash(b"tx"), 0));
        f.flags = FINALIZE_CONFIRMED | FINALIZE_REJECTED;
        assert!(!f.is_valid());
    }

    #[test]
    fn test_from_transaction_rejects_duplicates() {
        let f = pending_finalization(UtxoRef::new(hash(b"tx"), 0));
        let out = Output::with_payload(0, EvalCode::FinalizeNotarization, &f).unwrap();
        let mut tx = Transaction::new();
        tx.outputs.push(out.clone());
        tx.outputs.push(out);
        assert!(matches!(
            Finalization::from_transaction(&tx),
            Err(NotaryError::DuplicateFinalization)
        ));
    }

    fn notarization_tx() -> Transaction {
        let mut tx = Transaction::new();
        tx.outputs.push(
            Output::with_payload(0, EvalCode::EarnedNotarization, &("record", 9u32)).unwrap(),
        );
        tx
    }

    struct Harness {
        notaries: Vec<(Identity, SecretKey)>,
        store: KeyStore,
        target_tx: Transaction,
        target: UtxoRef,
    }

    fn harness(n: usize) -> Harness {
        let notaries: Vec<_> = (0..n)
            .map(|i| {
                let key = SecretKey::generate();
                let identity = Identity::new(format!("notary{i}"), vec![key.public_key()], 1);
                (identity, key)
            })
            .collect();
        let mut store = KeyStore::new();
        for (identity, key) in &notaries {
            store.add_identity(identity.clone());
            store.add_key(key.clone());
        }
        let target_tx = notarization_tx();
        let target = UtxoRef::new(target_tx.txid(), 0);
        Harness {
            notaries,
            store,
            target_tx,
            target,
        }
    }

    fn confirmed_spender(h: &Harness, signer_count: usize, old: &Finalization) -> Transaction {
        let mut evidence = NotaryEvidence::new(hash(b"peer-chain"), h.target);
        for (identity, _) in h.notaries.iter().take(signer_count) {
            evidence
                .sign_confirmed(&h.store, &h.target_tx, identity.id, 40)
                .unwrap();
        }

        let mut new = old.clone();
        new.set_confirmed().unwrap();
        new.evidence_outputs = vec![1];

        let mut tx = Transaction::new();
        tx.outputs
            .push(Output::with_payload(0, EvalCode::FinalizeNotarization, &new).unwrap());
        tx.outputs.push(
            Output::with_payload(
                crate::evidence::DEFAULT_OUTPUT_VALUE,
                EvalCode::NotaryEvidence,
                &evidence,
            )
            .unwrap(),
        );
        tx
    }

    #[test]
    fn test_spend_confirms_with_threshold() {
        let h = harness(3);
        let currency = currency(
            NotarizationProtocol::NotaryConfirm,
            h.notaries.iter().map(|(i, _)| i.id).collect(),
            2,
        );
        let old = pending_finalization(h.target);
        let spender = confirmed_spender(&h, 2, &old);
        let target_tx = h.target_tx.clone();
        let resolve = move |r: &UtxoRef| {
            if r.txid == target_tx.txid() {
                target_tx.outputs.get(r.index as usize).cloned()
            } else {
                None
            }
        };
        validate_finalization_spend(&spender, &old, &currency, &h.store, &resolve, 40, false)
            .unwrap();
    }

    #[test]
    fn test_spend_insufficient_evidence() {
        let h = harness(3);
        let currency = currency(
            NotarizationProtocol::NotaryConfirm,
            h.notaries.iter().map(|(i, _)| i.id).collect(),
            2,
        );
        let old = pending_finalization(h.target);
        let spender = confirmed_spender(&h, 1, &old);
        let target_tx = h.target_tx.clone();
        let resolve = move |r: &UtxoRef| {
            if r.txid == target_tx.txid() {
                target_tx.outputs.get(r.index as usize).cloned()
            } else {
                None
            }
        };
        let err =
            validate_finalization_spend(&spender, &old, &currency, &h.store, &resolve, 40, false)
                .unwrap_err();
        assert!(matches!(err, NotaryError::InsufficientEvidence { have: 1, need: 2 }));
    }

    #[test]
    fn test_spend_before_min_height_rejected() {
        let h = harness(1);
        let currency = currency(
            NotarizationProtocol::NotaryConfirm,
            h.notaries.iter().map(|(i, _)| i.id).collect(),
            1,
        );
        let old = pending_finalization(h.target);
        let spender = confirmed_spender(&h, 1, &old);
        let resolve = |_: &UtxoRef| -> Option<Output> { None };
        // Height 10 is before min_height 25.
        let err =
            validate_finalization_spend(&spender, &old, &currency, &h.store, &resolve, 10, false)
                .unwrap_err();
        assert!(matches!(err, NotaryError::InvalidFinalization(_)));
    }

    #[test]
    fn test_spend_of_terminal_finalization_rejected() {
        let h = harness(1);
        let currency = currency(
            NotarizationProtocol::NotaryConfirm,
            h.notaries.iter().map(|(i, _)| i.id).collect(),
            1,
        );
        let mut old = pending_finalization(h.target);
        old.set_confirmed().unwrap();
        let spender = confirmed_spender(&h, 1, &old);
        let resolve = |_: &UtxoRef| -> Option<Output> { None };
        assert!(matches!(
            validate_finalization_spend(&spender, &old, &currency, &h.store, &resolve, 40, false),
            Err(NotaryError::AlreadyFinalized)
        ));
    }

    #[test]
    fn test_auto_protocol_rejected_outside_test_mode() {
        let h = harness(1);
        let currency = currency(NotarizationProtocol::Auto, vec![], 1);
        let old = pending_finalization(h.target);
        let spender = confirmed_spender(&h, 1, &old);
        let resolve = |_: &UtxoRef| -> Option<Output> { None };
        assert!(
            validate_finalization_spend(&spender, &old, &currency, &h.store, &resolve, 40, false)
                .is_err()
        );
        assert!(
            validate_finalization_spend(&spender, &old, &currency, &h.store, &resolve, 40, true)
                .is_ok()
        );
    }

    #[test]
    fn test_get_output_transaction_same_tx() {
        let tx = notarization_tx();
        let f = pending_finalization(UtxoRef::new(Hash::ZERO, 0));
        let resolve = |_: &Hash| -> Option<Transaction> { None };
        let resolved = f.get_output_transaction(&tx, &resolve).unwrap();
        assert_eq!(resolved, tx);
    }

    #[test]
    fn test_sign_confirmed_builds_evidence() {
        let h = harness(1);
        let f = pending_finalization(h.target);
        let target_tx = h.target_tx.clone();
        let resolve = move |txid: &Hash| {
            if *txid == target_tx.txid() {
                Some(target_tx.clone())
            } else {
                None
            }
        };
        let evidence = f
            .sign_confirmed(
                &h.store,
                hash(b"peer-chain"),
                &h.target_tx,
                &resolve,
                h.notaries[0].0.id,
                40,
            )
            .unwrap();
        assert!(evidence.confirmed());
        assert_eq!(evidence.signatures.len(), 1);
    }

    #[test]
    fn test_sign_rejected_builds_evidence() {
        let h = harness(1);
        let f = pending_finalization(h.target);
        let target_tx = h.target_tx.clone();
        let resolve = move |txid: &Hash| {
            if *txid == target_tx.txid() {
                Some(target_tx.clone())
            } else {
                None
            }
        };
        let evidence = f
            .sign_rejected(
                &h.store,
                hash(b"peer-chain"),
                &h.target_tx,
                &resolve,
                h.notaries[0].0.id,
                40,
            )
            .unwrap();
        assert!(!evidence.confirmed());
        assert!(matches!(
            evidence.signatures,
            crate::evidence::NotarySignatures::Rejecting(_)
        ));
        assert_eq!(evidence.signatures.len(), 1);
    }
}
