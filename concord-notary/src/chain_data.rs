//! The DAG of competing notarizations for one system.
//!
//! Records reference their predecessor by output, so competing forks of the
//! notarization chain appear naturally. Forks are kept as index chains into
//! `vtx` rather than owning references, and a confirmed tip prunes every
//! fork that conflicts with it.

use serde::{Deserialize, Serialize};
use tracing::warn;

use concord_core::UtxoRef;

use crate::errors::{NotaryError, Result};
use crate::notarization::Notarization;

/// All known notarizations for one system, organized into forks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainNotarizationData {
    /// Record version.
    pub version: u32,
    /// Indexed records in block order: output reference plus decoded record.
    #[serde(rename = "notarizations")]
    pub vtx: Vec<(UtxoRef, Notarization)>,
    /// Each fork is a chain of indices into `vtx`, root first.
    pub forks: Vec<Vec<usize>>,
    /// Index of the last confirmed record, if any.
    #[serde(rename = "lastconfirmed")]
    pub last_confirmed: Option<usize>,
    /// Index into `forks` of the best chain.
    #[serde(rename = "bestchain")]
    pub best_chain: usize,
}

impl ChainNotarizationData {
    /// Current version.
    pub const VERSION_CURRENT: u32 = 1;

    /// Whether a confirmed tip exists.
    pub fn is_confirmed(&self) -> bool {
        self.last_confirmed.is_some()
    }

    /// The confirmed record, if any.
    pub fn confirmed(&self) -> Option<&(UtxoRef, Notarization)> {
        self.last_confirmed.and_then(|i| self.vtx.get(i))
    }

    /// Records of the best chain, root first.
    pub fn best_fork(&self) -> &[usize] {
        self.forks
            .get(self.best_chain)
            .map(|f| f.as_slice())
            .unwrap_or(&[])
    }

    /// Rebuild fork structure from records in block order.
    ///
    /// `confirmed_ref` names the output of the most recently confirmed
    /// record; forks that do not descend from it are pruned. Records whose
    /// parent cannot be resolved are logged and skipped, not fatal.
    pub fn rebuild(
        records: Vec<(UtxoRef, Notarization)>,
        confirmed_ref: Option<UtxoRef>,
    ) -> Result<Self> {
        let mut data = ChainNotarizationData {
            version: Self::VERSION_CURRENT,
            vtx: Vec::with_capacity(records.len()),
            forks: Vec::new(),
            last_confirmed: None,
            best_chain: 0,
        };

        // Parent resolution: a record's prev ref must name an earlier record.
        let mut parent_of: Vec<Option<usize>> = Vec::new();
        for (output_ref, record) in records {
            let parent = match record.prev_notarization {
                None => None,
                Some(prev) => {
                    match data.vtx.iter().position(|(r, _)| *r == prev) {
                        Some(idx) => Some(idx),
                        None => {
                            if record.is_definition() || record.is_block_one() {
                                None
                            } else {
                                warn!(%prev, "notarization parent not found, skipping record");
                                continue;
                            }
                        }
                    }
                }
            };
            data.vtx.push((output_ref, record));
            parent_of.push(parent);
        }

        if data.vtx.is_empty() {
            return Err(NotaryError::InvalidNotarization(
                "no notarization records".into(),
            ));
        }

        data.last_confirmed = match confirmed_ref {
            Some(r) => data.vtx.iter().position(|(o, _)| *o == r),
            // Without finalization evidence the root record stands confirmed.
            None => Some(0),
        };

        data.rebuild_forks(&parent_of);
        data.select_best_chain();
        Ok(data)
    }

    /// Reconstruct `forks` as every path from the confirmed record (or each
    /// root) down to a leaf.
    fn rebuild_forks(&mut self, parent_of: &[Option<usize>]) {
        let n = self.vtx.len();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut roots: Vec<usize> = Vec::new();
        for (idx, parent) in parent_of.iter().enumerate() {
            match parent {
                Some(p) => children[*p].push(idx),
                None => roots.push(idx),
            }
        }

        let starts: Vec<usize> = match self.last_confirmed {
            Some(c) => vec![c],
            None => roots,
        };

        self.forks.clear();
        for start in starts {
            // Depth-first enumeration of root-to-leaf paths.
            let mut stack: Vec<Vec<usize>> = vec![vec![start]];
            while let Some(path) = stack.pop() {
                let tip = *path.last().expect("path is never empty");
                if children[tip].is_empty() {
                    self.forks.push(path);
                } else {
                    for child in &children[tip] {
                        let mut next = path.clone();
                        next.push(*child);
                        stack.push(next);
                    }
                }
            }
        }
        self.forks.sort();
    }

    /// Pick the fork whose tip carries the most chain power; equal-power
    /// forks tie-break on the lower tip index.
    fn select_best_chain(&mut self) {
        let mut best = 0usize;
        let mut best_key: Option<(u128, std::cmp::Reverse<usize>)> = None;
        for (fork_idx, fork) in self.forks.iter().enumerate() {
            let tip = *fork.last().expect("forks are non-empty");
            let record = &self.vtx[tip].1;
            let power = record
                .proof_roots
                .get(&record.currency_id)
                .map(|r| r.compact_power)
                .unwrap_or(0);
            let key = (power, std::cmp::Reverse(tip));
            if best_key.map(|k| key > k).unwrap_or(true) {
                best_key = Some(key);
                best = fork_idx;
            }
        }
        self.best_chain = best;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::{CurrencyDefinition, CurrencyState, NotarizationProtocol};
    use crate::proof_root::ProofRoot;
    use concord_core::{hash, Hash};

    fn peer_id() -> Hash {
        hash(b"peer-chain")
    }

    fn base_state() -> CurrencyState {
        let def = CurrencyDefinition {
            currency_id: peer_id(),
            name: "peer".into(),
            system_id: peer_id(),
            launch_system_id: peer_id(),
            start_block: 1,
            currencies: vec![],
            min_preconvert: vec![],
            max_preconvert: vec![],
            contributions: vec![],
            initial_supply: 0,
            fractional: false,
            notarization_protocol: NotarizationProtocol::NotaryConfirm,
            notaries: vec![],
            min_notaries_confirm: 1,
        };
        CurrencyState::launch_state(&def)
    }

    fn record(height: u32, prev: Option<UtxoRef>, power: u128) -> (UtxoRef, Notarization) {
        let mut n = Notarization::definition(hash(b"proposer"), peer_id(), base_state(), height);
        if prev.is_some() {
            n.set_definition(false);
        }
        n.prev_notarization = prev;
        n.proof_roots.insert(
            peer_id(),
            ProofRoot {
                system_id: peer_id(),
                root_height: height,
                state_root: hash(&height.to_le_bytes()),
                block_hash: hash(b"blk"),
                compact_power: power,
                kind: crate::proof_root::ProofRootKind::Native,
            },
        );
        let output_ref = UtxoRef::new(hash(&(height as u64 * 7919).to_le_bytes()), 0);
        (output_ref, n)
    }

    #[test]
    fn test_linear_chain_single_fork() {
        let (r0, n0) = record(10, None, 100);
        let (r1, n1) = record(20, Some(r0), 200);
        let (r2, n2) = record(30, Some(r1), 300);

        let data =
            ChainNotarizationData::rebuild(vec![(r0, n0), (r1, n1), (r2, n2)], None).unwrap();
        assert_eq!(data.forks, vec![vec![0, 1, 2]]);
        assert_eq!(data.best_chain, 0);
        assert_eq!(data.last_confirmed, Some(0));
    }

    #[test]
    fn test_fork_detection_and_power_selection() {
        let (r0, n0) = record(10, None, 100);
        let (r1, n1) = record(20, Some(r0), 150);
        // Competing fork from the same root with more power.
        let (r2, n2) = record(21, Some(r0), 900);

        let data =
            ChainNotarizationData::rebuild(vec![(r0, n0), (r1, n1), (r2, n2)], None).unwrap();
        assert_eq!(data.forks.len(), 2);
        let best_tip = *data.best_fork().last().unwrap();
        assert_eq!(data.vtx[best_tip].1.notarization_height, 21);
    }

    #[test]
    fn test_equal_power_tie_breaks_lower_index() {
        let (r0, n0) = record(10, None, 100);
        let (r1, n1) = record(20, Some(r0), 500);
        let (r2, n2) = record(21, Some(r0), 500);

        let data =
            ChainNotarizationData::rebuild(vec![(r0, n0), (r1, n1), (r2, n2)], None).unwrap();
        let best_tip = *data.best_fork().last().unwrap();
        assert_eq!(best_tip, 1);
    }

    #[test]
    fn test_confirmed_prunes_conflicting_forks() {
        let (r0, n0) = record(10, None, 100);
        let (r1, n1) = record(20, Some(r0), 200);
        let (r2, n2) = record(21, Some(r0), 900);
        let (r3, n3) = record(30, Some(r1), 250);

        // Confirming r1 prunes the r2 fork even though it has more power.
        let data = ChainNotarizationData::rebuild(
            vec![(r0, n0), (r1, n1), (r2, n2), (r3, n3)],
            Some(r1),
        )
        .unwrap();
        assert_eq!(data.last_confirmed, Some(1));
        assert_eq!(data.forks, vec![vec![1, 3]]);
        assert_eq!(data.best_fork()[0], data.last_confirmed.unwrap());
    }

    #[test]
    fn test_unresolvable_parent_skipped() {
        let (r0, n0) = record(10, None, 100);
        let orphan_parent = UtxoRef::new(hash(b"missing"), 3);
        let (r1, n1) = record(20, Some(orphan_parent), 500);

        let data = ChainNotarizationData::rebuild(vec![(r0, n0), (r1, n1)], None).unwrap();
        assert_eq!(data.vtx.len(), 1);
    }

    #[test]
    fn test_empty_records_error() {
        assert!(ChainNotarizationData::rebuild(vec![], None).is_err());
    }

    #[test]
    fn test_parent_hash_invariant_holds() {
        let (r0, n0) = record(10, None, 100);
        let mut child = record(20, Some(r0), 200);
        child.1.hash_prev_notarization = n0.object_hash();

        let data = ChainNotarizationData::rebuild(vec![(r0, n0), child], None).unwrap();
        for (_, record) in &data.vtx {
            if let Some(prev) = record.prev_notarization {
                let parent = data.vtx.iter().find(|(r, _)| *r == prev).unwrap();
                assert_eq!(record.hash_prev_notarization, parent.1.object_hash());
            }
        }
    }
}
