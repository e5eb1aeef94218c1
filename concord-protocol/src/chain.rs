//! Collaborator handles for the host chain.
//!
//! The driver never touches global state: the active chain, the address
//! index, and the mempool are passed in as explicit handles. [`HostChain`]
//! bundles them behind the two named locks the consensus code shares, in
//! the one permitted order: `main`, then `mempool`, never the reverse.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use concord_core::{CurrencyId, Hash, Output, SystemId, Transaction, UtxoRef};
use concord_notary::{
    condition_id, finalization_confirmed_key, notary_notarization_key, ChainNotarizationData,
    CurrencyDefinition, CurrencyState, Finalization, Notarization, ProofRoot,
};

use crate::errors::{ProtocolError, Result};

/// One address-index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The indexed output.
    pub output_ref: UtxoRef,
    /// Height of the block containing it (0 for mempool entries).
    pub block_height: u32,
    /// Whether the entry records a spend rather than a funding.
    pub spending: bool,
}

/// Read-only view of the active chain and its address index.
pub trait ChainView: Send {
    /// This chain's system id.
    fn system_id(&self) -> SystemId;

    /// Current tip height.
    fn height(&self) -> u32;

    /// Block hash at a height, if on the active chain.
    fn block_hash(&self, height: u32) -> Option<Hash>;

    /// Proof root pinned to `height`. None if `height` is past the tip.
    fn proof_root(&self, height: u32) -> Option<ProofRoot>;

    /// Definition of a locally registered currency.
    fn currency_definition(&self, currency_id: &CurrencyId) -> Option<CurrencyDefinition>;

    /// State of a locally registered currency as of `height`.
    fn currency_state(&self, currency_id: &CurrencyId, height: u32) -> Option<CurrencyState>;

    /// All index entries for a key within a height range, in block order.
    fn get_address_index(&self, key: Hash, start: u32, end: u32) -> Vec<IndexEntry>;

    /// Unspent index entries for a key, in block order.
    fn get_address_unspent(&self, key: Hash) -> Vec<IndexEntry>;

    /// A transaction by id.
    fn transaction(&self, txid: &Hash) -> Option<Transaction>;
}

/// Read-only view of the mempool.
pub trait MempoolView: Send {
    /// Unspent outputs in the mempool filed under an index key.
    fn unspent_with_key(&self, key: Hash) -> Vec<(UtxoRef, Output)>;
}

/// The host chain's shared handles behind their two named locks.
pub struct HostChain<C: ChainView, M: MempoolView> {
    main: Mutex<C>,
    mempool: Mutex<M>,
    /// Relaxes validation rules reserved for test networks.
    pub test_mode: bool,
}

/// Both locks held, in order.
pub struct ChainGuards<'a, C: ChainView, M: MempoolView> {
    /// The chain, under the main lock.
    pub chain: MutexGuard<'a, C>,
    /// The mempool, under the mempool lock.
    pub mempool: MutexGuard<'a, M>,
}

impl<C: ChainView, M: MempoolView> HostChain<C, M> {
    /// Wrap chain and mempool handles.
    pub fn new(chain: C, mempool: M) -> Self {
        Self {
            main: Mutex::new(chain),
            mempool: Mutex::new(mempool),
            test_mode: false,
        }
    }

    /// Run under the main lock only.
    pub fn with_main<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&self.main.lock())
    }

    /// Run with mutable chain access under the main lock.
    pub fn with_main_mut<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.main.lock())
    }

    /// Acquire both locks in the permitted order.
    pub fn lock_both(&self) -> ChainGuards<'_, C, M> {
        let chain = self.main.lock();
        let mempool = self.mempool.lock();
        ChainGuards { chain, mempool }
    }
}

/// Read all indexed notarization outputs for a system and rebuild the fork
/// DAG, together with the transactions holding each record.
///
/// Index entries whose transaction cannot be loaded are logged and skipped.
pub fn get_notarization_data<C: ChainView>(
    chain: &C,
    system_id: SystemId,
) -> Result<(ChainNotarizationData, Vec<Transaction>)> {
    let index_key = condition_id(system_id, notary_notarization_key());
    let entries = chain.get_address_index(index_key, 0, u32::MAX);

    let mut records = Vec::new();
    let mut txes_by_ref: Vec<(UtxoRef, Transaction)> = Vec::new();
    for entry in entries.iter().filter(|e| !e.spending) {
        let Some(tx) = chain.transaction(&entry.output_ref.txid) else {
            warn!(txid = %entry.output_ref.txid, "indexed transaction not found, may need reindexing");
            continue;
        };
        let Some(output) = tx.outputs.get(entry.output_ref.index as usize) else {
            warn!(output = %entry.output_ref, "indexed output out of range, skipping");
            continue;
        };
        match Notarization::from_output(output) {
            Ok(notarization) => {
                records.push((entry.output_ref, notarization));
                txes_by_ref.push((entry.output_ref, tx));
            }
            Err(e) => {
                warn!(output = %entry.output_ref, error = %e, "undecodable notarization output, skipping");
            }
        }
    }

    let confirmed_ref = latest_confirmed_finalization(chain, system_id);
    let data = ChainNotarizationData::rebuild(records, confirmed_ref)?;

    // Transactions parallel to the surviving vtx entries.
    let txes = data
        .vtx
        .iter()
        .map(|(output_ref, _)| {
            txes_by_ref
                .iter()
                .find(|(r, _)| r == output_ref)
                .map(|(_, tx)| tx.clone())
                .ok_or_else(|| ProtocolError::Internal("vtx entry without transaction".into()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((data, txes))
}

/// The output reference finalized by the most recent confirmed
/// finalization for `system_id`, if any.
fn latest_confirmed_finalization<C: ChainView>(
    chain: &C,
    system_id: SystemId,
) -> Option<UtxoRef> {
    let key = condition_id(system_id, finalization_confirmed_key());
    let mut best: Option<(u32, UtxoRef)> = None;
    for entry in chain.get_address_unspent(key) {
        let Some(tx) = chain.transaction(&entry.output_ref.txid) else {
            warn!(txid = %entry.output_ref.txid, "indexed transaction not found, may need reindexing");
            continue;
        };
        let Some(output) = tx.outputs.get(entry.output_ref.index as usize) else {
            continue;
        };
        // Evidence outputs share this index key; only finalizations count.
        if output.eval != concord_core::EvalCode::FinalizeNotarization {
            continue;
        }
        let Ok(finalization) = output.decode::<Finalization>() else {
            continue;
        };
        if !finalization.is_confirmed() {
            continue;
        }
        // A same-transaction reference resolves against its own txid.
        let mut target = finalization.output;
        if target.is_on_same_transaction() {
            target.txid = entry.output_ref.txid;
        }
        if best.map(|(h, _)| entry.block_height >= h).unwrap_or(true) {
            best = Some((entry.block_height, target));
        }
    }
    best.map(|(_, r)| r)
}

/// The last valid notarization for a system within a height range,
/// whether or not its output is spent.
pub fn get_last_notarization<C: ChainView>(
    chain: &C,
    system_id: SystemId,
    start_height: u32,
    end_height: u32,
) -> Option<(UtxoRef, Transaction, Notarization)> {
    let key = condition_id(system_id, notary_notarization_key());
    for entry in chain
        .get_address_index(key, start_height, end_height)
        .into_iter()
        .rev()
    {
        if entry.spending {
            continue;
        }
        let Some(tx) = chain.transaction(&entry.output_ref.txid) else {
            warn!(txid = %entry.output_ref.txid, "indexed transaction not found, may need reindexing");
            continue;
        };
        let Some(output) = tx.outputs.get(entry.output_ref.index as usize) else {
            continue;
        };
        if let Ok(notarization) = Notarization::from_output(output) {
            return Some((entry.output_ref, tx, notarization));
        }
    }
    None
}

/// The last valid, unspent notarization output for a system.
pub fn get_last_unspent_notarization<C: ChainView>(
    chain: &C,
    system_id: SystemId,
) -> Option<(UtxoRef, Transaction, Notarization)> {
    let key = condition_id(system_id, notary_notarization_key());
    for entry in chain.get_address_unspent(key).into_iter().rev() {
        let Some(tx) = chain.transaction(&entry.output_ref.txid) else {
            warn!(txid = %entry.output_ref.txid, "indexed transaction not found, may need reindexing");
            continue;
        };
        let Some(output) = tx.outputs.get(entry.output_ref.index as usize) else {
            continue;
        };
        match Notarization::from_output(output) {
            Ok(notarization) => return Some((entry.output_ref, tx, notarization)),
            Err(_) => continue,
        }
    }
    None
}

/// Union of chain-indexed and mempool unspent notary evidence outputs for a
/// system, with the block height each was found at (0 for mempool).
pub fn get_unspent_notary_evidence<C: ChainView, M: MempoolView>(
    chain: &C,
    mempool: &M,
    system_id: SystemId,
) -> Vec<(u32, UtxoRef, Output)> {
    let key = condition_id(system_id, finalization_confirmed_key());
    let mut result = Vec::new();

    for entry in chain.get_address_unspent(key) {
        let Some(tx) = chain.transaction(&entry.output_ref.txid) else {
            continue;
        };
        if let Some(output) = tx.outputs.get(entry.output_ref.index as usize) {
            if output.eval == concord_core::EvalCode::NotaryEvidence {
                result.push((entry.block_height, entry.output_ref, output.clone()));
            }
        }
    }
    for (output_ref, output) in mempool.unspent_with_key(key) {
        if output.eval == concord_core::EvalCode::NotaryEvidence {
            result.push((0, output_ref, output));
        }
    }
    result
}

// ============================================================================
// In-memory implementations for tests and development
// ============================================================================

/// In-memory chain: blocks backed by an MMR, a transaction store, and an
/// address index.
pub struct MockChain {
    system_id: SystemId,
    mmr: concord_core::mmr::MountainRange,
    block_hashes: Vec<Hash>,
    transactions: HashMap<Hash, Transaction>,
    index: Vec<(Hash, IndexEntry)>,
    currencies: HashMap<CurrencyId, CurrencyDefinition>,
    currency_states: HashMap<CurrencyId, CurrencyState>,
}

impl MockChain {
    /// A chain with `height + 1` deterministic blocks.
    pub fn new(system_id: SystemId, height: u32) -> Self {
        let mut chain = Self {
            system_id,
            mmr: concord_core::mmr::MountainRange::new(),
            block_hashes: Vec::new(),
            transactions: HashMap::new(),
            index: Vec::new(),
            currencies: HashMap::new(),
            currency_states: HashMap::new(),
        };
        for _ in 0..=height {
            chain.add_block();
        }
        chain
    }

    /// Append one block.
    pub fn add_block(&mut self) -> u32 {
        let height = self.block_hashes.len() as u32;
        let block_hash = concord_core::hash(
            &[self.system_id.as_bytes().as_slice(), &height.to_le_bytes()].concat(),
        );
        self.block_hashes.push(block_hash);
        self.mmr.append(block_hash);
        height
    }

    /// Register a currency definition.
    pub fn register_currency(&mut self, def: CurrencyDefinition) {
        self.currencies.insert(def.currency_id, def);
    }

    /// Record the current state of a currency.
    pub fn set_currency_state(&mut self, state: CurrencyState) {
        self.currency_states.insert(state.currency_id, state);
    }

    /// Store a transaction and file the given outputs under index keys.
    /// Returns the transaction id.
    pub fn add_indexed_tx(&mut self, tx: Transaction, keyed_outputs: &[(u32, Hash)]) -> Hash {
        let txid = tx.txid();
        let block_height = self.height();
        for (index, key) in keyed_outputs {
            self.index.push((
                *key,
                IndexEntry {
                    output_ref: UtxoRef::new(txid, *index),
                    block_height,
                    spending: false,
                },
            ));
        }
        self.transactions.insert(txid, tx);
        txid
    }

    /// Mark an indexed output spent.
    pub fn spend(&mut self, output_ref: UtxoRef) {
        let block_height = self.height();
        let keys: Vec<Hash> = self
            .index
            .iter()
            .filter(|(_, e)| e.output_ref == output_ref && !e.spending)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.index.push((
                key,
                IndexEntry {
                    output_ref,
                    block_height,
                    spending: true,
                },
            ));
        }
    }

    /// Resolve an output by reference.
    pub fn output(&self, output_ref: &UtxoRef) -> Option<Output> {
        self.transactions
            .get(&output_ref.txid)
            .and_then(|tx| tx.outputs.get(output_ref.index as usize))
            .cloned()
    }
}

impl ChainView for MockChain {
    fn system_id(&self) -> SystemId {
        self.system_id
    }

    fn height(&self) -> u32 {
        (self.block_hashes.len() as u32).saturating_sub(1)
    }

    fn block_hash(&self, height: u32) -> Option<Hash> {
        self.block_hashes.get(height as usize).copied()
    }

    fn proof_root(&self, height: u32) -> Option<ProofRoot> {
        if height > self.height() {
            return None;
        }
        let state_root = self.mmr.root_at(height as u64 + 1).ok()?;
        Some(ProofRoot::new(
            self.system_id,
            height,
            state_root,
            self.block_hashes[height as usize],
            (height as u128 + 1) * 1000,
        ))
    }

    fn currency_definition(&self, currency_id: &CurrencyId) -> Option<CurrencyDefinition> {
        self.currencies.get(currency_id).cloned()
    }

    fn currency_state(&self, currency_id: &CurrencyId, _height: u32) -> Option<CurrencyState> {
        self.currency_states.get(currency_id).cloned()
    }

    fn get_address_index(&self, key: Hash, start: u32, end: u32) -> Vec<IndexEntry> {
        self.index
            .iter()
            .filter(|(k, e)| *k == key && e.block_height >= start && e.block_height <= end)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn get_address_unspent(&self, key: Hash) -> Vec<IndexEntry> {
        let spent: Vec<UtxoRef> = self
            .index
            .iter()
            .filter(|(k, e)| *k == key && e.spending)
            .map(|(_, e)| e.output_ref)
            .collect();
        self.index
            .iter()
            .filter(|(k, e)| *k == key && !e.spending && !spent.contains(&e.output_ref))
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn transaction(&self, txid: &Hash) -> Option<Transaction> {
        self.transactions.get(txid).cloned()
    }
}

/// In-memory mempool.
#[derive(Default)]
pub struct MockMempool {
    entries: Vec<(Hash, UtxoRef, Output)>,
}

impl MockMempool {
    /// An empty mempool.
    pub fn new() -> Self {
        Self::default()
    }

    /// File an output under an index key.
    pub fn add(&mut self, key: Hash, output_ref: UtxoRef, output: Output) {
        self.entries.push((key, output_ref, output));
    }
}

impl MempoolView for MockMempool {
    fn unspent_with_key(&self, key: Hash) -> Vec<(UtxoRef, Output)> {
        self.entries
            .iter()
            .filter(|(k, _, _)| *k == key)
            .map(|(_, r, o)| (*r, o.clone()))
            .collect()
    }
}
