//! The transfer-driven transition function.
//!
//! `next_notarization_info` derives the next notarization from a prior one
//! plus the export transfers that arrived since. It owns the launch
//! lifecycle (pre-launch accumulation, the two-pass clearing block, refund
//! or confirmation) and the post-launch two-pass fractional import. The
//! actual reserve-transfer execution is a collaborator behind
//! [`ReserveTransferExecutor`]; this module decides when and with which
//! state it runs.

use tracing::warn;

use concord_core::{canonical_bytes, CurrencyId, Hash, Output, SystemId};

use crate::currency::{CurrencyDefinition, CurrencyState, CurrencyValueMap};
use crate::errors::{NotaryError, Result};
use crate::notarization::Notarization;
use crate::transfer::{calculate_conversion_fee, ReserveTransfer};

/// Result of applying reserve transfers to a currency state.
#[derive(Debug, Clone, Default)]
pub struct TransferImport {
    /// Outputs materializing the imported value.
    pub outputs: Vec<Output>,
    /// Value imported into this chain, by currency.
    pub imported_currency: CurrencyValueMap,
    /// Gateway deposits consumed, by currency.
    pub gateway_deposits_used: CurrencyValueMap,
    /// Value leaving the importing transaction, by currency.
    pub spent_currency_out: CurrencyValueMap,
    /// Currency state after the transfers.
    pub new_state: CurrencyState,
}

/// Executes reserve transfers against a currency state.
///
/// Implementations must be deterministic: equal inputs produce equal
/// results. A returned error means the export is invalid as a whole.
pub trait ReserveTransferExecutor {
    /// Apply `transfers` to `initial_state`, producing import outputs and
    /// the successor state.
    fn apply_reserve_transfers(
        &self,
        source_system: &CurrencyDefinition,
        dest_currency: &CurrencyDefinition,
        initial_state: &CurrencyState,
        transfers: &[ReserveTransfer],
    ) -> Result<TransferImport>;
}

/// Everything `next_notarization_info` produces.
#[derive(Debug, Clone)]
pub struct TransitionResult {
    /// Hash over the pre-mutation export transfers.
    pub transfer_hash: Hash,
    /// The derived notarization.
    pub new_notarization: Notarization,
    /// Outputs materializing the imported value.
    pub import_outputs: Vec<Output>,
    /// Value imported into this chain, by currency.
    pub imported_currency: CurrencyValueMap,
    /// Gateway deposits consumed, by currency.
    pub gateway_deposits_used: CurrencyValueMap,
    /// Value leaving the importing transaction, by currency.
    pub spent_currency_out: CurrencyValueMap,
}

impl TransitionResult {
    fn economically_empty(transfer_hash: Hash, new_notarization: Notarization) -> Self {
        Self {
            transfer_hash,
            new_notarization,
            import_outputs: Vec::new(),
            imported_currency: CurrencyValueMap::new(),
            gateway_deposits_used: CurrencyValueMap::new(),
            spent_currency_out: CurrencyValueMap::new(),
        }
    }
}

impl Notarization {
    /// Derive the next notarization from this one and the export transfers
    /// since `last_export_height`.
    ///
    /// `export_transfers` is in/out: invalid pre-conversions and premature
    /// conversions are replaced by their refund forms in place, preserving
    /// order. The returned transfer hash covers the pre-mutation values.
    #[allow(clippy::too_many_arguments)]
    pub fn next_notarization_info(
        &self,
        source_system: &CurrencyDefinition,
        dest_currency: &CurrencyDefinition,
        last_export_height: u32,
        current_height: u32,
        export_transfers: &mut [ReserveTransfer],
        executor: &dyn ReserveTransferExecutor,
        home_chain: SystemId,
    ) -> Result<TransitionResult> {
        let source_system_id = source_system.currency_id;

        let mut new = self.clone();
        new.set_definition(false);
        new.prev_notarization = None;
        new.prev_height = new.notarization_height;
        new.notarization_height = current_height;
        new.hash_prev_notarization = self.object_hash();

        // A refunding currency no longer changes economically.
        if self.currency_state.is_refunding() {
            return Ok(TransitionResult::economically_empty(Hash::ZERO, new));
        }

        let transfer_hash = self.validate_transfers(
            dest_currency,
            last_export_height,
            &mut new,
            export_transfers,
        );

        if dest_currency.launch_system_id == source_system_id
            && current_height <= dest_currency.start_block.saturating_sub(1)
        {
            self.launch_window_pass(dest_currency, current_height, &mut new);

            let import = executor.apply_reserve_transfers(
                source_system,
                dest_currency,
                &new.currency_state,
                export_transfers,
            )?;
            new.currency_state = import.new_state;
            Ok(TransitionResult {
                transfer_hash,
                new_notarization: new,
                import_outputs: import.outputs,
                imported_currency: import.imported_currency,
                gateway_deposits_used: import.gateway_deposits_used,
                spent_currency_out: import.spent_currency_out,
            })
        } else {
            self.post_launch_pass(
                source_system,
                dest_currency,
                export_transfers,
                executor,
                home_chain,
                transfer_hash,
                new,
            )
        }
    }

    /// Hash every transfer pre-mutation, then substitute refunds for
    /// pre-conversions past the start block or over the cap, and for
    /// conversions before launch completion.
    fn validate_transfers(
        &self,
        dest_currency: &CurrencyDefinition,
        last_export_height: u32,
        new: &mut Notarization,
        export_transfers: &mut [ReserveTransfer],
    ) -> Hash {
        let mut hasher = blake3::Hasher::new();

        for transfer in export_transfers.iter_mut() {
            hasher.update(
                &canonical_bytes(transfer).expect("transfer serialization is infallible"),
            );

            if transfer.is_pre_conversion() {
                if last_export_height >= dest_currency.start_block {
                    warn!("pre-conversion exported after start block, refunding");
                    *transfer = transfer.refund_transfer();
                } else {
                    let reserve_in =
                        transfer.first_value - calculate_conversion_fee(transfer.first_value);
                    let mut new_total = new.currency_state.reserves_map();
                    new_total.add(transfer.first_currency, reserve_in);
                    if let Some(max) = dest_currency.max_preconvert_map() {
                        if new_total.exceeds_any(&max) {
                            warn!("pre-conversion over maximum, refunding");
                            *transfer = transfer.refund_transfer();
                        }
                    }
                }
            } else if transfer.is_conversion()
                && !new.currency_state.is_launch_complete()
            {
                warn!("conversion before launch completion, refunding");
                *transfer = transfer.refund_transfer();
            }
        }

        if export_transfers.is_empty() {
            Hash::ZERO
        } else {
            Hash::from_bytes(*hasher.finalize().as_bytes())
        }
    }

    /// Launch-window handling: pre-launch accumulation and the clearing
    /// block, which is traversed twice (export then import).
    fn launch_window_pass(
        &self,
        dest_currency: &CurrencyDefinition,
        current_height: u32,
        new: &mut Notarization,
    ) {
        let clearing_height = dest_currency.start_block - 1;

        if current_height == clearing_height && new.is_prelaunch() {
            if new.is_launch_cleared() {
                // Second traversal of the clearing block.
                new.set_prelaunch(false);
                new.currency_state.set_launch_clear(true);
                new.currency_state.revert_reserves_and_supply();
                new.currency_state.set_prelaunch(false);
            } else {
                // First traversal: decide launch or refund.
                new.set_launch_cleared();
                new.currency_state.set_launch_clear(true);
                new.currency_state.revert_reserves_and_supply();
                new.currency_state.set_prelaunch(false);

                let pre_converted = new.currency_state.reserves_map().canonical();
                let min_pre = dest_currency.min_preconvert_map();

                match min_pre {
                    Some(min) if !pre_converted.meets_minimums(&min) => {
                        // Below minimum participation: force supply to zero
                        // and refund everything.
                        new.currency_state.supply = 0;
                        new.currency_state.set_refunding(true);
                        new.set_refunding(true);
                    }
                    _ => {
                        new.set_launch_confirmed();
                        new.currency_state.set_launch_confirmed();
                    }
                }
            }
        } else if current_height < clearing_height {
            new.currency_state.set_prelaunch(true);
            // The record after the definition notarization removes the
            // definition's initial contributions before accumulating.
            if self.is_definition() {
                for (i, contribution) in dest_currency.contributions.iter().enumerate() {
                    if let Some(reserve) = new.currency_state.reserves.get_mut(i) {
                        *reserve -= contribution;
                    }
                }
            }
        }
    }

    /// Post-launch path: one pass to establish the new state and prices,
    /// and for fractional currencies a second pass over the old state with
    /// the new prices so import outputs carry no rounding drift.
    #[allow(clippy::too_many_arguments)]
    fn post_launch_pass(
        &self,
        source_system: &CurrencyDefinition,
        dest_currency: &CurrencyDefinition,
        export_transfers: &[ReserveTransfer],
        executor: &dyn ReserveTransferExecutor,
        home_chain: SystemId,
        transfer_hash: Hash,
        mut new: Notarization,
    ) -> Result<TransitionResult> {
        new.currency_state.set_launch_complete_marker();
        new.currency_state.set_launch_clear(false);
        if dest_currency.system_id != home_chain {
            new.set_same_chain(false);
        }

        // First pass establishes the post-transfer state and prices;
        // outputs are discarded.
        let first = executor.apply_reserve_transfers(
            source_system,
            dest_currency,
            &self.currency_state,
            export_transfers,
        )?;
        new.currency_state = first.new_state;
        new.currency_state.set_launch_complete_marker();
        new.currency_state.set_launch_clear(false);

        if !new.currency_state.is_prelaunch() && dest_currency.fractional {
            // Second pass: the new prices over the old state.
            let mut temp_state = self.currency_state.clone();
            temp_state.conversion_price = new.currency_state.conversion_price.clone();
            temp_state.via_conversion_price = new.currency_state.via_conversion_price.clone();

            let second = executor.apply_reserve_transfers(
                source_system,
                dest_currency,
                &temp_state,
                export_transfers,
            )?;

            new.currency_state = second.new_state;
            new.currency_state.set_launch_complete_marker();
            new.currency_state.set_launch_clear(false);
            new.currency_state.conversion_price = temp_state.conversion_price;
            new.currency_state.via_conversion_price = temp_state.via_conversion_price;

            return Ok(TransitionResult {
                transfer_hash,
                new_notarization: new,
                import_outputs: second.outputs,
                imported_currency: second.imported_currency,
                gateway_deposits_used: second.gateway_deposits_used,
                spent_currency_out: second.spent_currency_out,
            });
        }

        Ok(TransitionResult {
            transfer_hash,
            new_notarization: new,
            import_outputs: Vec::new(),
            imported_currency: first.imported_currency,
            gateway_deposits_used: first.gateway_deposits_used,
            spent_currency_out: first.spent_currency_out,
        })
    }
}

/// Reference executor: deterministic par-and-price conversion semantics.
///
/// Production deployments supply the full reserve engine; this executor
/// covers launches, refunds, conversions at the state's posted prices, and
/// plain pass-through transfers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicTransferExecutor;

impl BasicTransferExecutor {
    fn payment(value: i64, currency: CurrencyId, destination: Hash) -> Result<Output> {
        Ok(Output::with_payload(
            value.max(0) as u64,
            concord_core::EvalCode::Other,
            &(currency, destination),
        )?)
    }
}

impl ReserveTransferExecutor for BasicTransferExecutor {
    fn apply_reserve_transfers(
        &self,
        _source_system: &CurrencyDefinition,
        dest_currency: &CurrencyDefinition,
        initial_state: &CurrencyState,
        transfers: &[ReserveTransfer],
    ) -> Result<TransferImport> {
        let mut state = initial_state.clone();
        let mut import = TransferImport::default();

        for transfer in transfers {
            if transfer.first_value <= 0 {
                return Err(NotaryError::InvalidExport(
                    "non-positive transfer value".into(),
                ));
            }

            if transfer.is_refund() {
                import.outputs.push(Self::payment(
                    transfer.first_value,
                    transfer.first_currency,
                    transfer.destination,
                )?);
                import
                    .spent_currency_out
                    .add(transfer.first_currency, transfer.first_value);
                continue;
            }

            if transfer.is_pre_conversion() {
                let idx = dest_currency
                    .reserve_index(&transfer.first_currency)
                    .ok_or_else(|| {
                        NotaryError::InvalidExport("pre-conversion in unknown reserve".into())
                    })?;
                let reserve_in =
                    transfer.first_value - calculate_conversion_fee(transfer.first_value);
                state.reserves[idx] += reserve_in;
                // Pre-launch minting at par; reverted at launch clear.
                state.supply += reserve_in;
                state.emitted += reserve_in;
                import.outputs.push(Self::payment(
                    reserve_in,
                    dest_currency.currency_id,
                    transfer.destination,
                )?);
                continue;
            }

            if transfer.is_conversion() {
                let idx = dest_currency
                    .reserve_index(&transfer.first_currency)
                    .ok_or_else(|| {
                        NotaryError::InvalidExport("conversion in unknown reserve".into())
                    })?;
                let value_in =
                    transfer.first_value - calculate_conversion_fee(transfer.first_value);
                let price = state.conversion_price[idx].max(1);
                let minted = ((value_in as i128) * (CurrencyState::PRICE_SCALE as i128)
                    / (price as i128)) as i64;
                state.reserves[idx] += value_in;
                state.supply += minted;
                state.emitted += minted;
                import.outputs.push(Self::payment(
                    minted,
                    dest_currency.currency_id,
                    transfer.destination,
                )?);
                import.imported_currency.add(dest_currency.currency_id, minted);
                continue;
            }

            // Plain pass-through transfer.
            import.outputs.push(Self::payment(
                transfer.first_value,
                transfer.first_currency,
                transfer.destination,
            )?);
            import
                .imported_currency
                .add(transfer.first_currency, transfer.first_value);
            import
                .spent_currency_out
                .add(transfer.first_currency, transfer.first_value);
        }

        if dest_currency.fractional && !state.is_prelaunch() {
            state.recalculate_prices();
        }

        if !state.is_valid() {
            return Err(NotaryError::InvalidExport(
                "transfers drove currency state invalid".into(),
            ));
        }

        import.new_state = state;
        Ok(import)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::NotarizationProtocol;
    use concord_core::hash;

    fn home_chain() -> Hash {
        hash(b"home-chain")
    }

    fn reserve_x() -> CurrencyId {
        hash(b"reserve-x")
    }

    fn system_def(id: Hash) -> CurrencyDefinition {
        CurrencyDefinition {
            currency_id: id,
            name: "system".into(),
            system_id: id,
            launch_system_id: id,
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
        }
    }

    fn launch_def() -> CurrencyDefinition {
        CurrencyDefinition {
            currency_id: hash(b"basket"),
            name: "basket".into(),
            system_id: home_chain(),
            launch_system_id: home_chain(),
            start_block: 100,
            currencies: vec![reserve_x()],
            min_preconvert: vec![1000],
            max_preconvert: vec![10000],
            contributions: vec![0],
            initial_supply: 0,
            fractional: true,
            notarization_protocol: NotarizationProtocol::NotaryConfirm,
            notaries: vec![],
            min_notaries_confirm: 1,
        }
    }

    fn prelaunch_notarization(def: &CurrencyDefinition, height: u32, reserves: i64) -> Notarization {
        let mut state = CurrencyState::launch_state(def);
        state.reserves[0] = reserves;
        let mut n = Notarization::definition(hash(b"proposer"), def.currency_id, state, height);
        n.set_definition(false);
        n.set_prelaunch(true);
        n
    }

    fn preconvert(value: i64) -> ReserveTransfer {
        ReserveTransfer::new(
            reserve_x(),
            value,
            hash(b"basket"),
            hash(b"alice"),
            hash(b"alice-return"),
        )
        .pre_conversion()
    }

    #[test]
    fn test_copy_and_reparent() {
        let def = launch_def();
        let prior = prelaunch_notarization(&def, 50, 500);
        let mut transfers = vec![];
        let result = prior
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                50,
                60,
                &mut transfers,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap();

        let new = &result.new_notarization;
        assert_eq!(new.prev_height, 50);
        assert_eq!(new.notarization_height, 60);
        assert_eq!(new.prev_notarization, None);
        assert_eq!(new.hash_prev_notarization, prior.object_hash());
        assert!(!new.is_definition());
        assert_eq!(result.transfer_hash, Hash::ZERO);
    }

    #[test]
    fn test_refunding_short_circuit() {
        let def = launch_def();
        let mut prior = prelaunch_notarization(&def, 50, 500);
        prior.currency_state.set_refunding(true);
        let reserves_before = prior.currency_state.reserves.clone();

        let mut transfers = vec![preconvert(100)];
        let result = prior
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                50,
                60,
                &mut transfers,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap();

        assert_eq!(result.new_notarization.currency_state.reserves, reserves_before);
        assert!(result.import_outputs.is_empty());
        // Transfers stay untouched on the refund path.
        assert!(transfers[0].is_pre_conversion());
    }

    #[test]
    fn test_launch_under_minimum_refunds() {
        // S1: reserves after transfers at height 99 are 500 < min 1000.
        let def = launch_def();
        let prior = prelaunch_notarization(&def, 98, 500);
        let mut transfers = vec![];
        let result = prior
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                98,
                99,
                &mut transfers,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap();

        let state = &result.new_notarization.currency_state;
        assert!(state.is_refunding());
        assert!(!state.is_launch_confirmed());
        assert_eq!(state.supply, 0);
        assert!(result.new_notarization.is_refunding());
    }

    #[test]
    fn test_launch_meeting_minimum_confirms() {
        // S2: reserves 1500 >= min 1000.
        let def = launch_def();
        let prior = prelaunch_notarization(&def, 98, 1500);
        let mut transfers = vec![];
        let result = prior
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                98,
                99,
                &mut transfers,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap();

        let state = &result.new_notarization.currency_state;
        assert!(state.is_launch_confirmed());
        assert!(!state.is_refunding());
        assert!(result.new_notarization.is_launch_confirmed());
    }

    #[test]
    fn test_second_clearing_pass_keeps_decision() {
        let def = launch_def();
        let prior = prelaunch_notarization(&def, 98, 1500);
        let mut transfers = vec![];
        let first = prior
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                98,
                99,
                &mut transfers,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap()
            .new_notarization;
        assert!(first.is_launch_cleared());
        assert!(first.is_prelaunch() || first.is_launch_confirmed());

        let second = first
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                98,
                99,
                &mut transfers,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap()
            .new_notarization;
        assert!(!second.is_prelaunch());
        assert!(second.is_launch_confirmed());
    }

    #[test]
    fn test_over_cap_preconversion_refunded() {
        // S3: existing reserves 9900, transfer 200 with 1% fee nets 198,
        // total 10098 > cap 10000. Only the offending transfer refunds.
        let def = launch_def();
        let prior = prelaunch_notarization(&def, 50, 9900);
        let mut transfers = vec![preconvert(50), preconvert(200)];
        let result = prior
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                50,
                60,
                &mut transfers,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap();

        assert!(transfers[0].is_pre_conversion());
        assert!(transfers[1].is_refund());
        assert_ne!(result.transfer_hash, Hash::ZERO);
    }

    #[test]
    fn test_preconversion_after_start_block_refunded() {
        let def = launch_def();
        let prior = prelaunch_notarization(&def, 98, 500);
        let mut transfers = vec![preconvert(50)];
        prior
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                100,
                101,
                &mut transfers,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap();
        assert!(transfers[0].is_refund());
    }

    #[test]
    fn test_transfer_hash_covers_pre_mutation_values() {
        let def = launch_def();
        let prior = prelaunch_notarization(&def, 50, 9900);

        // Run once with a transfer that will be refunded.
        let mut mutated = vec![preconvert(200)];
        let r1 = prior
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                50,
                60,
                &mut mutated,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap();
        assert!(mutated[0].is_refund());

        // Hash must match a run over the same original transfer values.
        let mut hasher = blake3::Hasher::new();
        hasher.update(&canonical_bytes(&preconvert(200)).unwrap());
        assert_eq!(
            r1.transfer_hash,
            Hash::from_bytes(*hasher.finalize().as_bytes())
        );
    }

    #[test]
    fn test_deterministic_serialization() {
        let def = launch_def();
        let prior = prelaunch_notarization(&def, 50, 500);
        let run = || {
            let mut transfers = vec![preconvert(100)];
            prior
                .next_notarization_info(
                    &system_def(home_chain()),
                    &def,
                    50,
                    60,
                    &mut transfers,
                    &BasicTransferExecutor,
                    home_chain(),
                )
                .unwrap()
        };
        let a = canonical_bytes(&run().new_notarization).unwrap();
        let b = canonical_bytes(&run().new_notarization).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_post_launch_fractional_two_pass() {
        let def = launch_def();
        let mut state = CurrencyState::launch_state(&def);
        state.set_prelaunch(false);
        state.set_launch_clear(true);
        state.set_launch_confirmed();
        state.reserves[0] = 5000;
        state.supply = 5000;
        state.set_launch_complete_marker();
        let mut prior =
            Notarization::definition(hash(b"proposer"), def.currency_id, state, 100);
        prior.set_definition(false);

        let mut transfers = vec![ReserveTransfer::new(
            reserve_x(),
            1000,
            def.currency_id,
            hash(b"bob"),
            hash(b"bob-return"),
        )
        .conversion()];

        let result = prior
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                100,
                110,
                &mut transfers,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap();

        let state = &result.new_notarization.currency_state;
        assert!(state.is_launch_complete());
        assert!(!state.is_launch_clear());
        // Conversion was not refunded and materialized outputs.
        assert!(!transfers[0].is_refund());
        assert_eq!(result.import_outputs.len(), 1);
        assert!(result.imported_currency.get(&def.currency_id) > 0);
    }

    #[test]
    fn test_post_launch_invalid_export_fails() {
        let def = launch_def();
        let mut state = CurrencyState::launch_state(&def);
        state.set_prelaunch(false);
        state.set_launch_complete_marker();
        let mut prior =
            Notarization::definition(hash(b"proposer"), def.currency_id, state, 100);
        prior.set_definition(false);

        let mut transfers = vec![ReserveTransfer::new(
            reserve_x(),
            -5,
            def.currency_id,
            hash(b"bob"),
            hash(b"bob-return"),
        )];
        let err = prior
            .next_notarization_info(
                &system_def(home_chain()),
                &def,
                100,
                110,
                &mut transfers,
                &BasicTransferExecutor,
                home_chain(),
            )
            .unwrap_err();
        assert!(matches!(err, NotaryError::InvalidExport(_)));
    }
}
