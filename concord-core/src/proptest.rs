//! Property-based tests for core serialization.

use proptest::prelude::*;

use crate::crypto::Hash;
use crate::outputs::{canonical_bytes, EvalCode, Output, Transaction, UtxoRef};

fn arb_hash() -> impl Strategy<Value = Hash> {
    any::<[u8; 32]>().prop_map(Hash::from_bytes)
}

fn arb_utxo_ref() -> impl Strategy<Value = UtxoRef> {
    (arb_hash(), any::<u32>()).prop_map(|(txid, index)| UtxoRef { txid, index })
}

fn arb_eval() -> impl Strategy<Value = EvalCode> {
    prop_oneof![
        Just(EvalCode::EarnedNotarization),
        Just(EvalCode::AcceptedNotarization),
        Just(EvalCode::FinalizeNotarization),
        Just(EvalCode::NotaryEvidence),
        Just(EvalCode::Other),
    ]
}

fn arb_output() -> impl Strategy<Value = Output> {
    (any::<u64>(), arb_eval(), proptest::collection::vec(any::<u8>(), 0..128))
        .prop_map(|(value, eval, payload)| Output { value, eval, payload })
}

proptest! {
    #[test]
    fn hash_roundtrip(h in arb_hash()) {
        let bytes = canonical_bytes(&h).unwrap();
        let back: Hash = bincode::deserialize(&bytes).unwrap();
        prop_assert_eq!(h, back);
    }

    #[test]
    fn utxo_ref_roundtrip(r in arb_utxo_ref()) {
        let bytes = canonical_bytes(&r).unwrap();
        let back: UtxoRef = bincode::deserialize(&bytes).unwrap();
        prop_assert_eq!(r, back);
    }

    #[test]
    fn transaction_roundtrip(
        inputs in proptest::collection::vec(arb_utxo_ref(), 0..4),
        outputs in proptest::collection::vec(arb_output(), 0..4),
    ) {
        let tx = Transaction { inputs, outputs };
        let bytes = canonical_bytes(&tx).unwrap();
        let back: Transaction = bincode::deserialize(&bytes).unwrap();
        prop_assert_eq!(tx.txid(), back.txid());
        prop_assert_eq!(tx, back);
    }

    #[test]
    fn txid_is_deterministic(
        outputs in proptest::collection::vec(arb_output(), 0..4),
    ) {
        let tx = Transaction { inputs: vec![], outputs };
        prop_assert_eq!(tx.txid(), tx.clone().txid());
    }
}
