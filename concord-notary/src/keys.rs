//! Purpose keys and index key derivation.
//!
//! Purpose keys are stable, domain-tagged hashes mixed into every identity
//! signature so a signature over one object for one purpose can never stand
//! in for another. Index keys address on-chain outputs in the address index.

use concord_core::{hash, hash_pair, CurrencyId, Hash};

/// Purpose key for a confirming notary signature.
pub fn notary_confirmed_key() -> Hash {
    hash(b"concord::notary.signature.confirmed")
}

/// Purpose key for a rejecting notary signature.
pub fn notary_rejected_key() -> Hash {
    hash(b"concord::notary.signature.rejected")
}

/// Index key under which notarization outputs for a currency are filed.
pub fn notary_notarization_key() -> Hash {
    hash(b"concord::notary.notarization")
}

/// Index key under which pending finalization evidence is filed.
pub fn finalization_confirmed_key() -> Hash {
    hash(b"concord::finalization.confirmed")
}

/// Derive the address-index key for a currency and purpose.
pub fn condition_id(currency_id: CurrencyId, key: Hash) -> Hash {
    hash_pair(currency_id, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purpose_keys_distinct() {
        assert_ne!(notary_confirmed_key(), notary_rejected_key());
        assert_ne!(notary_notarization_key(), finalization_confirmed_key());
    }

    #[test]
    fn test_condition_id_binds_currency() {
        let key = notary_notarization_key();
        assert_ne!(
            condition_id(hash(b"currency-a"), key),
            condition_id(hash(b"currency-b"), key)
        );
    }
}
