//! The notary confirm/reject pass.
//!
//! Each run signs at most one eligible notarization: the newest one old
//! enough to finalize. Existing unspent evidence is triaged into outputs
//! already carrying our signatures, third-party evidence, and stale
//! evidence referring to other finalizations, which is spent away. When
//! combined signatures reach the confirmation threshold, a confirmed
//! finalization citing the evidence is emitted.

use std::collections::BTreeSet;

use tracing::debug;

use concord_core::{EvalCode, IdentityId, KeyStore, Output, Transaction, UtxoRef};
use concord_notary::{
    CurrencyDefinition, Finalization, FinalizationKind, NotaryError, NotaryEvidence,
    DEFAULT_OUTPUT_VALUE,
};

use crate::chain::{
    get_notarization_data, get_unspent_notary_evidence, ChainView, HostChain, MempoolView,
};
use crate::config::ProtocolConfig;
use crate::errors::{ProtocolError, Result};
use crate::peer::{BestProofRootRequest, NotaryPeer};

/// Outcome of a confirm/reject pass that changed on-chain state.
#[derive(Debug, Clone)]
pub struct ConfirmationResult {
    /// The assembled transaction: new evidence, spent evidence, and
    /// (when the threshold was reached) the confirmed finalization.
    pub transaction: Transaction,
    /// Whether this pass added any new signature.
    pub signed: bool,
    /// Whether a confirmed finalization was produced.
    pub finalized: bool,
}

/// Sign and possibly finalize the newest eligible notarization of
/// `external_system`. Returns `Ok(None)` when there is nothing to do.
pub async fn confirm_or_reject_notarizations<C: ChainView, M: MempoolView>(
    host: &HostChain<C, M>,
    peer: &dyn NotaryPeer,
    external_system: &CurrencyDefinition,
    key_store: &KeyStore,
    config: &ProtocolConfig,
) -> Result<Option<ConfirmationResult>> {
    let peer_id = external_system.currency_id;

    let mine = key_store.controlled_identities(&external_system.notaries);
    if mine.is_empty() {
        return Err(ProtocolError::NoNotary);
    }

    // Snapshot under both locks, released before the RPC.
    let (height, cnd, txes) = {
        let guards = host.lock_both();
        let height = guards.chain.height();
        let (cnd, txes) = get_notarization_data(&*guards.chain, peer_id)?;
        (height, cnd, txes)
    };

    let mut proof_roots = Vec::new();
    let mut root_to_vtx = Vec::new();
    for (vtx_idx, (_, record)) in cnd.vtx.iter().enumerate() {
        if let Some(root) = record.proof_roots.get(&peer_id) {
            proof_roots.push(root.clone());
            root_to_vtx.push(vtx_idx);
        }
    }
    if proof_roots.is_empty() {
        return Err(ProtocolError::NoMatchingProofRoots);
    }

    let request = BestProofRootRequest {
        proof_roots,
        last_confirmed: cnd.last_confirmed.unwrap_or(0) as u32,
    };

    // Suspension point.
    let response = peer.get_best_proof_root(request).await?;
    if response.best_index < 0 {
        return Err(ProtocolError::NoMatchingProofRoots);
    }
    if response.valid_indices.is_empty() {
        return Err(ProtocolError::NoValidUnconfirmed);
    }

    let guards = host.lock_both();
    if guards.chain.height() != height {
        return Err(ProtocolError::StaleBlock);
    }
    let home_id = guards.chain.system_id();

    let eligible_height = height.saturating_sub(config.min_blocks_before_finalized);

    // Walk the peer-validated records newest-first; only one eligible
    // record is signed per pass.
    for root_idx in response.valid_indices.iter().rev() {
        let Some(&idx) = root_to_vtx.get(*root_idx as usize) else {
            continue;
        };
        if cnd.vtx[idx].1.notarization_height > eligible_height {
            continue;
        }

        let target_ref = cnd.vtx[idx].0;
        let mut finalization = Finalization::pending(
            FinalizationKind::Notarization,
            peer_id,
            target_ref,
            eligible_height,
        );

        let evidence_outs =
            get_unspent_notary_evidence(&*guards.chain, &*guards.mempool, peer_id);

        let mut my_ids: BTreeSet<IdentityId> = mine.iter().copied().collect();
        let mut sig_set: BTreeSet<IdentityId> = BTreeSet::new();
        let mut with_our_sigs: Vec<(UtxoRef, Output, NotaryEvidence)> = Vec::new();
        let mut additional: Vec<(UtxoRef, Output, NotaryEvidence)> = Vec::new();
        let mut to_spend: Vec<(UtxoRef, Output)> = Vec::new();

        for (_, output_ref, output) in evidence_outs {
            let Ok(evidence) = output.decode::<NotaryEvidence>() else {
                continue;
            };
            if !evidence.is_valid() || !evidence.is_notary_signature() {
                continue;
            }
            // A same-transaction reference resolves against the output's own
            // transaction.
            let mut target = evidence.output;
            if target.is_on_same_transaction() {
                target.txid = output_ref.txid;
            }
            if target != finalization.output {
                to_spend.push((output_ref, output));
                continue;
            }
            let mut has_our_sig = false;
            for id in evidence.signatures.map().keys() {
                sig_set.insert(*id);
                if my_ids.remove(id) {
                    has_our_sig = true;
                }
            }
            if has_our_sig {
                with_our_sigs.push((output_ref, output, evidence));
            } else {
                additional.push((output_ref, output, evidence));
            }
        }

        // Every controlled identity has already signed this record.
        if my_ids.is_empty() {
            return Err(ProtocolError::Ineligible);
        }

        let mut new_evidence = NotaryEvidence::new(home_id, target_ref);
        let mut signed = false;
        for id in &my_ids {
            match new_evidence.sign_confirmed(key_store, &txes[idx], *id, height) {
                Ok(_) => {
                    sig_set.insert(*id);
                    signed = true;
                    if sig_set.len() >= external_system.min_notaries_confirm {
                        break;
                    }
                }
                Err(e) => {
                    return Err(NotaryError::InvalidSignature(format!(
                        "identity signature failed: {e}"
                    ))
                    .into())
                }
            }
        }

        let mut builder = crate::builder::TransactionBuilder::new();
        let mut new_evidence_idx = None;
        if new_evidence.is_notary_signature() {
            new_evidence_idx = Some(builder.add_output(Output::with_payload(
                DEFAULT_OUTPUT_VALUE,
                EvalCode::NotaryEvidence,
                &new_evidence,
            )?));
        }

        let mut finalized = false;
        if sig_set.len() >= external_system.min_notaries_confirm {
            // Count distinct signers while citing evidence, our own first.
            let mut remaining = sig_set.clone();
            let mut sig_count = 0usize;
            if let Some(out_idx) = new_evidence_idx {
                finalization.evidence_outputs.push(out_idx as u32);
                for id in new_evidence.signatures.map().keys() {
                    remaining.remove(id);
                    sig_count += 1;
                }
            }

            let mut have_needed = sig_count >= external_system.min_notaries_confirm;
            for (output_ref, output, evidence) in
                with_our_sigs.iter().chain(additional.iter())
            {
                for id in evidence.signatures.map().keys() {
                    if remaining.remove(id) {
                        sig_count += 1;
                    }
                }
                let input_idx = builder.add_input(*output_ref, output.clone());
                if !have_needed {
                    finalization.evidence_inputs.push(input_idx as u32);
                    have_needed = sig_count >= external_system.min_notaries_confirm;
                }
            }

            if !have_needed {
                return Err(ProtocolError::Internal(
                    "signature set did not cover the confirmation threshold".into(),
                ));
            }

            finalization.set_confirmed()?;
            builder.add_output(Output::with_payload(
                0,
                EvalCode::FinalizeNotarization,
                &finalization,
            )?);

            // Clear out stale evidence referring to other finalizations.
            for (output_ref, output) in to_spend {
                builder.add_input(output_ref, output);
            }
            finalized = true;
        }

        if builder.is_empty() {
            return Ok(None);
        }

        debug!(
            record = idx,
            signed, finalized, "confirm pass assembled transaction"
        );
        return Ok(Some(ConfirmationResult {
            transaction: builder.build(),
            signed,
            finalized,
        }));
    }

    Ok(None)
}
