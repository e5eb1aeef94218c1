//! Currency definitions, value maps, and the launch-aware currency state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use concord_core::{CurrencyId, IdentityId, SystemId};

/// How notarizations of a currency's system reach finality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotarizationProtocol {
    /// A designated notary set signs confirmations up to a threshold.
    NotaryConfirm,
    /// Automatic finalization; not implemented outside test mode.
    Auto,
    /// The notary chain's identity itself controls notarization outputs.
    NotaryChainId,
}

/// A sparse map from currency to amount.
///
/// Amounts are signed so the same type can express both balances and deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyValueMap(pub BTreeMap<CurrencyId, i64>);

impl CurrencyValueMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from parallel currency/value vectors.
    pub fn from_pairs(currencies: &[CurrencyId], values: &[i64]) -> Self {
        Self(
            currencies
                .iter()
                .copied()
                .zip(values.iter().copied())
                .collect(),
        )
    }

    /// Value for a currency, zero if absent.
    pub fn get(&self, currency: &CurrencyId) -> i64 {
        self.0.get(currency).copied().unwrap_or(0)
    }

    /// Add an amount for a currency.
    pub fn add(&mut self, currency: CurrencyId, amount: i64) {
        *self.0.entry(currency).or_insert(0) += amount;
    }

    /// Merge another map into this one.
    pub fn add_map(&mut self, other: &CurrencyValueMap) {
        for (currency, amount) in &other.0 {
            self.add(*currency, *amount);
        }
    }

    /// Drop zero entries, producing the canonical form.
    pub fn canonical(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(_, v)| **v != 0)
                .map(|(k, v)| (*k, *v))
                .collect(),
        )
    }

    /// Whether the canonical form is empty.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    /// Whether any component exceeds the corresponding bound.
    pub fn exceeds_any(&self, bound: &CurrencyValueMap) -> bool {
        self.0.iter().any(|(k, v)| *v > bound.get(k))
    }

    /// Whether every minimum in `minimums` is met.
    pub fn meets_minimums(&self, minimums: &CurrencyValueMap) -> bool {
        minimums.0.iter().all(|(k, min)| self.get(k) >= *min)
    }
}

/// Definition of a currency: its launch window, reserve basket, and the
/// notary arrangement of the system it lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyDefinition {
    /// Stable identifier.
    #[serde(rename = "currencyid")]
    pub currency_id: CurrencyId,
    /// Registered name.
    pub name: String,
    /// System the currency lives on.
    #[serde(rename = "systemid")]
    pub system_id: SystemId,
    /// System the launch runs on.
    #[serde(rename = "launchsystemid")]
    pub launch_system_id: SystemId,
    /// First block of normal operation; the launch clears at `start_block - 1`.
    #[serde(rename = "startblock")]
    pub start_block: u32,
    /// Reserve currencies, parallel to the per-currency vectors below.
    pub currencies: Vec<CurrencyId>,
    /// Minimum pre-conversion per reserve currency for the launch to confirm.
    #[serde(rename = "minpreconversion")]
    pub min_preconvert: Vec<i64>,
    /// Maximum pre-conversion accepted per reserve currency.
    #[serde(rename = "maxpreconversion")]
    pub max_preconvert: Vec<i64>,
    /// Initial contributions per reserve currency.
    pub contributions: Vec<i64>,
    /// Supply at definition time.
    #[serde(rename = "initialsupply")]
    pub initial_supply: i64,
    /// Whether the currency is a fractional-reserve basket.
    pub fractional: bool,
    /// How notarizations for this currency's system are finalized.
    #[serde(rename = "notarizationprotocol")]
    pub notarization_protocol: NotarizationProtocol,
    /// Authorized notary identities.
    pub notaries: Vec<IdentityId>,
    /// Distinct notary signatures required to confirm.
    #[serde(rename = "minnotariesconfirm")]
    pub min_notaries_confirm: usize,
}

impl CurrencyDefinition {
    /// Minimum pre-conversion bounds as a value map, if defined.
    pub fn min_preconvert_map(&self) -> Option<CurrencyValueMap> {
        if self.min_preconvert.is_empty() || self.min_preconvert.len() != self.currencies.len() {
            return None;
        }
        Some(CurrencyValueMap::from_pairs(&self.currencies, &self.min_preconvert).canonical())
    }

    /// Maximum pre-conversion bounds as a value map, if defined.
    pub fn max_preconvert_map(&self) -> Option<CurrencyValueMap> {
        if self.max_preconvert.is_empty() {
            return None;
        }
        Some(CurrencyValueMap::from_pairs(&self.currencies, &self.max_preconvert))
    }

    /// Whether this currency is a token hosted on `chain` rather than the
    /// chain currency itself. Proof roots are not accepted for tokens.
    pub fn is_token_on(&self, chain: SystemId) -> bool {
        self.system_id == chain && self.currency_id != chain
    }

    /// Index of a currency in the reserve basket.
    pub fn reserve_index(&self, currency: &CurrencyId) -> Option<usize> {
        self.currencies.iter().position(|c| c == currency)
    }
}

// CurrencyState launch flags. LAUNCH_COMPLETE is never cleared once set.
const STATE_PRELAUNCH: u32 = 1;
const STATE_LAUNCH_CLEAR: u32 = 1 << 1;
const STATE_LAUNCH_CONFIRMED: u32 = 1 << 2;
const STATE_REFUNDING: u32 = 1 << 3;
const STATE_LAUNCH_COMPLETE: u32 = 1 << 4;

/// Economic snapshot of a currency: reserves, supply, prices, and launch flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyState {
    /// Currency this state describes.
    #[serde(rename = "currencyid")]
    pub currency_id: CurrencyId,
    /// Reserve currencies, parallel with `reserves` and the price vectors.
    pub currencies: Vec<CurrencyId>,
    /// Current reserves per reserve currency.
    pub reserves: Vec<i64>,
    /// Current supply.
    pub supply: i64,
    /// Supply at definition time.
    #[serde(rename = "initialsupply")]
    pub initial_supply: i64,
    /// Supply emitted beyond the initial supply.
    pub emitted: i64,
    /// Conversion price per reserve currency (1e8 fixed point).
    #[serde(rename = "conversionprice")]
    pub conversion_price: Vec<i64>,
    /// Conversion price when routing via the basket (1e8 fixed point).
    #[serde(rename = "viaconversionprice")]
    pub via_conversion_price: Vec<i64>,
    /// Launch flag bits.
    pub flags: u32,
}

impl CurrencyState {
    /// Fixed-point scale for conversion prices.
    pub const PRICE_SCALE: i64 = 100_000_000;

    /// Initial state for a currency definition, in pre-launch.
    pub fn launch_state(def: &CurrencyDefinition) -> Self {
        let n = def.currencies.len();
        Self {
            currency_id: def.currency_id,
            currencies: def.currencies.clone(),
            reserves: def.contributions.clone(),
            supply: def.initial_supply,
            initial_supply: def.initial_supply,
            emitted: 0,
            conversion_price: vec![Self::PRICE_SCALE; n],
            via_conversion_price: vec![Self::PRICE_SCALE; n],
            flags: STATE_PRELAUNCH,
        }
    }

    /// Parallel-vector and sign invariants.
    pub fn is_valid(&self) -> bool {
        let n = self.currencies.len();
        self.reserves.len() == n
            && self.conversion_price.len() == n
            && self.via_conversion_price.len() == n
            && self.supply >= 0
            && self.reserves.iter().all(|r| *r >= 0)
    }

    /// Whether the currency is still in pre-launch.
    pub fn is_prelaunch(&self) -> bool {
        self.flags & STATE_PRELAUNCH != 0
    }

    /// Whether the launch has been cleared.
    pub fn is_launch_clear(&self) -> bool {
        self.flags & STATE_LAUNCH_CLEAR != 0
    }

    /// Whether the launch confirmed.
    pub fn is_launch_confirmed(&self) -> bool {
        self.flags & STATE_LAUNCH_CONFIRMED != 0
    }

    /// Whether the currency is refunding.
    pub fn is_refunding(&self) -> bool {
        self.flags & STATE_REFUNDING != 0
    }

    /// Whether normal post-launch operation has begun.
    pub fn is_launch_complete(&self) -> bool {
        self.flags & STATE_LAUNCH_COMPLETE != 0
    }

    /// Set or clear the pre-launch flag.
    pub fn set_prelaunch(&mut self, on: bool) {
        if on {
            self.flags |= STATE_PRELAUNCH;
        } else {
            self.flags &= !STATE_PRELAUNCH;
        }
    }

    /// Set or clear the launch-clear flag.
    pub fn set_launch_clear(&mut self, on: bool) {
        if on {
            self.flags |= STATE_LAUNCH_CLEAR;
        } else {
            self.flags &= !STATE_LAUNCH_CLEAR;
        }
    }

    /// Mark the launch confirmed. Clears refunding; the two are exclusive.
    pub fn set_launch_confirmed(&mut self) {
        self.flags |= STATE_LAUNCH_CONFIRMED;
        self.flags &= !STATE_REFUNDING;
    }

    /// Mark the currency refunding. Clears launch-confirmed.
    pub fn set_refunding(&mut self, on: bool) {
        if on {
            self.flags |= STATE_REFUNDING;
            self.flags &= !STATE_LAUNCH_CONFIRMED;
        } else {
            self.flags &= !STATE_REFUNDING;
        }
    }

    /// Mark normal operation as begun. There is no way to clear this.
    pub fn set_launch_complete_marker(&mut self) {
        self.flags |= STATE_LAUNCH_COMPLETE;
    }

    /// Restore the canonical pre-launch baseline: supply back to the initial
    /// supply and nothing emitted. Accumulated pre-conversion reserves stay,
    /// so launch minimums and maximums are judged on contributed totals
    /// regardless of the order transfers were processed in.
    pub fn revert_reserves_and_supply(&mut self) {
        self.supply = self.initial_supply;
        self.emitted = 0;
    }

    /// Current reserves as a value map.
    pub fn reserves_map(&self) -> CurrencyValueMap {
        CurrencyValueMap::from_pairs(&self.currencies, &self.reserves)
    }

    /// Recompute conversion prices from reserves and supply.
    ///
    /// Only meaningful for fractional currencies with positive supply.
    pub fn recalculate_prices(&mut self) {
        if self.supply <= 0 {
            return;
        }
        for (i, reserve) in self.reserves.iter().enumerate() {
            let price = ((*reserve as i128) * (Self::PRICE_SCALE as i128) / (self.supply as i128))
                .max(1) as i64;
            self.conversion_price[i] = price;
            self.via_conversion_price[i] = price;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::hash;

    fn basket_def() -> CurrencyDefinition {
        CurrencyDefinition {
            currency_id: hash(b"basket"),
            name: "basket".into(),
            system_id: hash(b"home"),
            launch_system_id: hash(b"home"),
            start_block: 100,
            currencies: vec![hash(b"reserve-x")],
            min_preconvert: vec![1000],
            max_preconvert: vec![10000],
            contributions: vec![0],
            initial_supply: 100_000,
            fractional: true,
            notarization_protocol: NotarizationProtocol::NotaryConfirm,
            notaries: vec![],
            min_notaries_confirm: 1,
        }
    }

    #[test]
    fn test_value_map_exceeds() {
        let bound = CurrencyValueMap::from_pairs(&[hash(b"x")], &[10000]);
        let under = CurrencyValueMap::from_pairs(&[hash(b"x")], &[9999]);
        let over = CurrencyValueMap::from_pairs(&[hash(b"x")], &[10098]);
        assert!(!under.exceeds_any(&bound));
        assert!(over.exceeds_any(&bound));
    }

    #[test]
    fn test_value_map_minimums() {
        let min = CurrencyValueMap::from_pairs(&[hash(b"x")], &[1000]);
        assert!(!CurrencyValueMap::from_pairs(&[hash(b"x")], &[500]).meets_minimums(&min));
        assert!(CurrencyValueMap::from_pairs(&[hash(b"x")], &[1500]).meets_minimums(&min));
    }

    #[test]
    fn test_value_map_canonical_drops_zeros() {
        let mut map = CurrencyValueMap::new();
        map.add(hash(b"x"), 5);
        map.add(hash(b"y"), 0);
        assert_eq!(map.canonical().0.len(), 1);
    }

    #[test]
    fn test_launch_state_valid() {
        let state = CurrencyState::launch_state(&basket_def());
        assert!(state.is_valid());
        assert!(state.is_prelaunch());
        assert!(!state.is_launch_complete());
    }

    #[test]
    fn test_refunding_and_confirmed_exclusive() {
        let mut state = CurrencyState::launch_state(&basket_def());
        state.set_launch_clear(true);
        state.set_launch_confirmed();
        state.set_refunding(true);
        assert!(state.is_refunding());
        assert!(!state.is_launch_confirmed());
        state.set_launch_confirmed();
        assert!(!state.is_refunding());
    }

    #[test]
    fn test_revert_restores_supply_keeps_reserves() {
        let mut state = CurrencyState::launch_state(&basket_def());
        state.reserves[0] = 1500;
        state.supply += 777;
        state.emitted = 777;
        state.revert_reserves_and_supply();
        assert_eq!(state.supply, state.initial_supply);
        assert_eq!(state.emitted, 0);
        assert_eq!(state.reserves[0], 1500);
    }

    #[test]
    fn test_recalculate_prices() {
        let mut state = CurrencyState::launch_state(&basket_def());
        state.reserves[0] = 50_000;
        state.recalculate_prices();
        // 50_000 reserve over 100_000 supply = 0.5 in fixed point.
        assert_eq!(state.conversion_price[0], CurrencyState::PRICE_SCALE / 2);
    }

    #[test]
    fn test_token_detection() {
        let mut def = basket_def();
        assert!(def.is_token_on(hash(b"home")));
        def.system_id = hash(b"elsewhere");
        assert!(!def.is_token_on(hash(b"home")));
    }
}
