//! Acceptance validation: wrapping a peer's earned notarization as an
//! accepted notarization on this chain.
//!
//! Everything locally provable is recomputed and compared against the
//! attested values: our own proof root, the states of home-chain
//! currencies, and the eligibility of every cited proof root. Notary
//! signatures must be complete and come from the peer's declared set.

use concord_core::{
    EvalCode, Hash, IdentitySignature, KeyStore, Output, SignatureResult, UtxoRef,
};
use concord_notary::{
    notary_confirmed_key, CurrencyDefinition, Finalization, FinalizationKind, Notarization,
    NotarizationProtocol, NotaryEvidence, ProofRootKind, NotaryError, DEFAULT_OUTPUT_VALUE,
};

use crate::builder::TransactionBuilder;
use crate::chain::{get_last_unspent_notarization, get_notarization_data, ChainView, HostChain, MempoolView};
use crate::config::ProtocolConfig;
use crate::errors::{ProtocolError, Result};

/// An accepted notarization assembled into a spending transaction.
#[derive(Debug, Clone)]
pub struct AcceptedNotarization {
    /// The mirrored record as stored on this chain.
    pub notarization: Notarization,
    /// The transaction consuming the prior accepted notarization and
    /// emitting the new record, its evidence, and (usually) a finalization.
    pub transaction: concord_core::Transaction,
    /// Whether the emitted finalization is already confirmed.
    pub confirmed: bool,
}

/// Validate and wrap an earned notarization from `external_system`.
pub fn create_accepted_notarization<C: ChainView, M: MempoolView>(
    host: &HostChain<C, M>,
    external_system: &CurrencyDefinition,
    earned: &Notarization,
    evidence: &NotaryEvidence,
    key_store: &KeyStore,
    config: &ProtocolConfig,
) -> Result<AcceptedNotarization> {
    let peer_id = external_system.currency_id;

    if evidence.signatures.is_empty() {
        return Err(NotaryError::InsufficientEvidence { have: 0, need: 1 }.into());
    }
    // Rejects, among other malformations, a record listing the home
    // currency both as primary and in its state map.
    if !earned.is_valid() {
        return Err(ProtocolError::InvalidEarnedNotarization(
            "malformed earned notarization".into(),
        ));
    }

    let guards = host.lock_both();
    let chain = &*guards.chain;
    let home_id = chain.system_id();
    let height = chain.height();

    // The mirror flip must succeed exactly once.
    if earned.is_mirror() {
        return Err(ProtocolError::InvalidEarnedNotarization(
            "earned notarization is already mirrored".into(),
        ));
    }
    let notarization = earned.mirrored(peer_id).map_err(|e| {
        ProtocolError::InvalidEarnedNotarization(format!("mirror flip failed: {e}"))
    })?;

    let (cnd, _txes) = get_notarization_data(chain, peer_id)?;
    let confirmed = cnd.confirmed().ok_or_else(|| {
        ProtocolError::InvalidEarnedNotarization("no confirmed notarization history".into())
    })?;

    // The attested home root must strictly advance past the confirmed one.
    let our_root = notarization
        .proof_roots
        .get(&home_id)
        .cloned()
        .ok_or_else(|| {
            ProtocolError::InvalidEarnedNotarization("no proof root of this chain".into())
        })?;
    let confirmed_root = confirmed.1.proof_roots.get(&home_id).ok_or_else(|| {
        ProtocolError::InvalidEarnedNotarization(
            "confirmed notarization carries no root of this chain".into(),
        )
    })?;
    if our_root.root_height <= confirmed_root.root_height {
        return Err(ProtocolError::InvalidEarnedNotarization(
            "proof root does not advance past last confirmed".into(),
        ));
    }

    // Every signature must be a complete signature by a declared notary
    // over the earned record's canonical hash.
    let earned_hash = earned.object_hash();
    let purpose = [notary_confirmed_key()];
    for (id, signature) in evidence.signatures.map() {
        if !external_system.notaries.contains(id) {
            return Err(NotaryError::UnauthorizedNotary(*id).into());
        }
        let identity = key_store.identity(id).ok_or_else(|| {
            NotaryError::InvalidSignature(format!("unknown notary identity {id}"))
        })?;
        if !identity.is_valid_unrevoked() {
            return Err(NotaryError::InvalidSignature("revoked notary identity".into()).into());
        }
        let sig_hash = IdentitySignature::signature_hash(
            &purpose,
            &[],
            peer_id,
            signature.height,
            "",
            earned_hash,
        );
        match signature.check(identity, sig_hash) {
            Ok(SignatureResult::Complete) => {}
            _ => {
                return Err(NotaryError::InvalidSignature(
                    "incomplete notary signature on accepted notarization".into(),
                )
                .into())
            }
        }
    }

    // The home proof root must match what we recompute locally.
    if !notarization.proof_roots.contains_key(&peer_id) {
        return Err(ProtocolError::InvalidEarnedNotarization(
            "no proof root of the peer system".into(),
        ));
    }
    let recomputed = (our_root.root_height <= height)
        .then(|| chain.proof_root(our_root.root_height))
        .flatten()
        .ok_or(NotaryError::ProofRootMismatch)?;
    if our_root.block_hash != recomputed.block_hash
        || our_root.state_root != recomputed.state_root
        || !matches!(our_root.kind, ProofRootKind::Native | ProofRootKind::Ethereum)
    {
        return Err(NotaryError::ProofRootMismatch.into());
    }

    // Home-chain currency states must match local recomputation; the
    // earned record's primary state attests this chain directly.
    let local_home_state = chain
        .currency_state(&home_id, our_root.root_height)
        .ok_or_else(|| NotaryError::CurrencyStateMismatch(home_id))?;
    if local_home_state != earned.currency_state {
        return Err(NotaryError::CurrencyStateMismatch(home_id).into());
    }

    for (currency_id, state) in &notarization.currency_states {
        if *currency_id == peer_id {
            continue;
        }
        let def = chain.currency_definition(currency_id).ok_or_else(|| {
            ProtocolError::InvalidEarnedNotarization(format!(
                "currency {currency_id} not registered on this chain"
            ))
        })?;
        if def.system_id != home_id {
            // Foreign currency, not locally provable.
            continue;
        }
        let local = chain
            .currency_state(currency_id, our_root.root_height)
            .ok_or_else(|| NotaryError::CurrencyStateMismatch(*currency_id))?;
        if local != *state {
            return Err(NotaryError::CurrencyStateMismatch(*currency_id).into());
        }
    }

    // Proof roots are only carried for registered systems, never tokens.
    for system_id in notarization.proof_roots.keys() {
        if *system_id == peer_id {
            continue;
        }
        let def = chain.currency_definition(system_id).ok_or_else(|| {
            ProtocolError::InvalidEarnedNotarization(format!(
                "proof root system {system_id} not registered on this chain"
            ))
        })?;
        if def.is_token_on(home_id) {
            return Err(ProtocolError::InvalidEarnedNotarization(
                "proof roots are not accepted for token currencies".into(),
            ));
        }
    }

    // Spend the prior unspent accepted notarization, emit the new record,
    // the evidence, and the finalization.
    let (last_ref, last_tx, _last_notarization) =
        get_last_unspent_notarization(chain, peer_id).ok_or_else(|| {
            ProtocolError::InvalidEarnedNotarization("no prior unspent notarization".into())
        })?;

    let mut builder = TransactionBuilder::new();
    builder.add_input(
        last_ref,
        last_tx.outputs[last_ref.index as usize].clone(),
    );

    let notarization_idx = builder.add_output(Output::with_payload(
        0,
        EvalCode::AcceptedNotarization,
        &notarization,
    )?);
    let evidence_idx = builder.add_output(Output::with_payload(
        DEFAULT_OUTPUT_VALUE,
        EvalCode::NotaryEvidence,
        evidence,
    )?);

    let mut fully_confirmed = false;
    if external_system.notarization_protocol != NotarizationProtocol::NotaryChainId {
        let mut finalization = Finalization::pending(
            FinalizationKind::Notarization,
            peer_id,
            UtxoRef::new(Hash::ZERO, notarization_idx as u32),
            height + config.finalization_delay,
        );
        if evidence.signatures.len() >= external_system.notaries.len() {
            finalization.set_confirmed()?;
            finalization.evidence_outputs.push(evidence_idx as u32);
            fully_confirmed = true;
        }
        builder.add_output(Output::with_payload(
            0,
            EvalCode::FinalizeNotarization,
            &finalization,
        )?);
    }

    Ok(AcceptedNotarization {
        notarization,
        transaction: builder.build(),
        confirmed: fully_confirmed,
    })
}
