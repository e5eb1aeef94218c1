//! Earned notarization creation at block production time.
//!
//! The block producer asks the peer which of our known proof roots it
//! agrees with, then emits a new earned notarization extending the agreed
//! record, together with a pending finalization. The peer RPC runs with
//! both locks released; if the tip moves meanwhile the call fails
//! `stale-block` and is retried on the next block.

use tracing::debug;

use concord_core::{EvalCode, Hash, IdentityId, Output, UtxoRef};
use concord_notary::{
    CurrencyDefinition, Finalization, FinalizationKind, Notarization, NotarizationProtocol,
    ProofRoot,
};

use crate::chain::{get_notarization_data, ChainView, HostChain, MempoolView};
use crate::config::ProtocolConfig;
use crate::errors::{ProtocolError, Result};
use crate::peer::{BestProofRootRequest, NotaryPeer};

/// An earned notarization ready for inclusion in the block being produced.
#[derive(Debug, Clone)]
pub struct EarnedNotarization {
    /// The new record.
    pub notarization: Notarization,
    /// Outputs to append to the coinbase: the notarization and, unless the
    /// peer runs the notary-chain-id protocol, a pending finalization.
    pub outputs: Vec<Output>,
    /// When the record was assembled.
    pub created_at: i64,
}

/// Create an earned notarization for `external_system` at the current tip.
///
/// Fails `ineligible` when the agreed prior record already notarized this
/// notary block period, and `stale-block` when the tip moves during the
/// peer query.
pub async fn create_earned_notarization<C: ChainView, M: MempoolView>(
    host: &HostChain<C, M>,
    peer: &dyn NotaryPeer,
    external_system: &CurrencyDefinition,
    proposer: IdentityId,
    config: &ProtocolConfig,
) -> Result<EarnedNotarization> {
    let peer_id = external_system.currency_id;

    // Snapshot under both locks, released before the RPC.
    let (height, cnd) = {
        let guards = host.lock_both();
        let height = guards.chain.height();
        let (cnd, _txes) = get_notarization_data(&*guards.chain, peer_id)?;
        (height, cnd)
    };

    // Peer-system proof roots of each known record, with the vtx index each
    // came from.
    let mut proof_roots: Vec<ProofRoot> = Vec::new();
    let mut root_to_vtx: Vec<usize> = Vec::new();
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

    // Suspension point: locks are released while the peer answers.
    let response = peer.get_best_proof_root(request).await?;

    if response.best_index < 0 {
        return Err(ProtocolError::NoMatchingProofRoots);
    }
    let agreed_vtx = *root_to_vtx
        .get(response.best_index as usize)
        .ok_or_else(|| ProtocolError::Internal("peer returned out-of-range index".into()))?;

    let latest_root = response
        .latest_proof_root
        .clone()
        .filter(|r| r.is_valid() && r.system_id == peer_id)
        .ok_or(ProtocolError::NoMatchingProofRoots)?;

    if response.currency_states.is_empty() {
        return Err(ProtocolError::InvalidEarnedNotarization(
            "missing currency state data from notary".into(),
        ));
    }

    // Re-acquire and re-check: the snapshot must still be the tip.
    let guards = host.lock_both();
    if guards.chain.height() != height {
        return Err(ProtocolError::StaleBlock);
    }
    let home_id = guards.chain.system_id();

    let (prior_ref, prior) = &cnd.vtx[agreed_vtx];

    // One earned notarization per notary block period.
    let period = height / config.block_notarization_modulo;
    let prior_period = prior.notarization_height / config.block_notarization_modulo;
    if period <= prior_period {
        return Err(ProtocolError::Ineligible);
    }

    let mut notarization = prior.clone();
    notarization.set_definition(false);
    notarization.proposer = proposer;
    notarization.notarization_height = height;
    notarization.proof_roots.insert(peer_id, latest_root);

    // Route the peer's currency states: the one matching the attested
    // currency becomes primary, other peer-system currencies ride along,
    // anything not registered locally is ignored.
    notarization.currency_states.clear();
    for state in response.currency_states {
        if !state.is_valid() {
            return Err(ProtocolError::InvalidEarnedNotarization(
                "invalid currency state data from notary".into(),
            ));
        }
        let Some(def) = guards.chain.currency_definition(&state.currency_id) else {
            if state.currency_id == peer_id {
                return Err(ProtocolError::Internal(
                    "peer system currency not registered locally".into(),
                ));
            }
            continue;
        };
        if def.system_id != peer_id {
            continue;
        }
        if state.currency_id == notarization.currency_id {
            notarization.currency_state = state;
        } else {
            notarization.currency_states.insert(state.currency_id, state);
        }
    }

    // Our own proof root at the snapshot height.
    let our_root = guards
        .chain
        .proof_root(height)
        .ok_or_else(|| ProtocolError::Internal("no proof root at tip".into()))?;
    notarization.proof_roots.insert(home_id, our_root);

    notarization.prev_notarization = Some(*prior_ref);
    notarization.hash_prev_notarization = prior.object_hash();
    notarization.prev_height = prior.notarization_height;

    debug!(
        height,
        agreed = agreed_vtx,
        "earned notarization extends agreed prior record"
    );

    let mut outputs = vec![Output::with_payload(
        0,
        EvalCode::EarnedNotarization,
        &notarization,
    )?];

    if external_system.notarization_protocol != NotarizationProtocol::NotaryChainId {
        let finalization = Finalization::pending(
            FinalizationKind::Notarization,
            peer_id,
            // The notarization output on this same transaction.
            UtxoRef::new(Hash::ZERO, 0),
            height + config.finalization_delay,
        );
        outputs.push(Output::with_payload(
            0,
            EvalCode::FinalizeNotarization,
            &finalization,
        )?);
    }

    Ok(EarnedNotarization {
        notarization,
        outputs,
        created_at: chrono::Utc::now().timestamp(),
    })
}
