//! Property tests for the layered store.

use proptest::prelude::*;
use replisync_engine::{
    entry::flatten_operations, KvRead, KvUpdate, Mutation, Operation, Patch, PendingMutation,
    ReadTransaction, ScanOptions, Store,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn key() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "a/1", "a/2", "b", "b/1", "c"]).prop_map(str::to_string)
}

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z]{0,6}".prop_map(Value::String),
    ]
}

fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        (key(), value()).prop_map(|(k, v)| Operation::set(k, v)),
        key().prop_map(Operation::del),
    ]
}

fn patch() -> impl Strategy<Value = Patch> {
    prop_oneof![
        (key(), value(), 1u64..100).prop_map(|(k, v, id)| Patch::set(k, v, id)),
        (key(), 1u64..100).prop_map(|(k, id)| Patch::del(k, id)),
    ]
}

fn pending(id: u64, operations: Vec<Operation>) -> PendingMutation {
    PendingMutation::new(Mutation {
        id,
        name: "prop".into(),
        args: Value::Null,
        operations,
    })
}

fn visible(store: &Store) -> BTreeMap<String, Value> {
    store
        .all_keys()
        .into_iter()
        .filter_map(|k| store.get(&k).cloned().map(|v| (k, v)))
        .collect()
}

proptest! {
    #[test]
    fn reapplying_patches_is_a_no_op(patches in prop::collection::vec(patch(), 0..20)) {
        let mut once = Store::new();
        once.apply_patches(&patches);

        let mut twice = once.clone();
        twice.apply_patches(&patches);

        prop_assert_eq!(visible(&once), visible(&twice));
    }

    #[test]
    fn flattening_keeps_the_last_write(ops in prop::collection::vec(operation(), 0..20)) {
        let flat = flatten_operations(&ops);

        for (key, update) in &flat {
            let last = ops.iter().rev().find(|op| op.key() == key).unwrap();
            match (last, update) {
                (Operation::Set { value, .. }, KvUpdate::Set(flat_value)) => {
                    prop_assert_eq!(value, flat_value);
                }
                (Operation::Del { .. }, KvUpdate::Delete) => {}
                _ => {
                    prop_assert!(false, "flattened update does not match last op");
                }
            }
        }
        let touched: std::collections::BTreeSet<_> = ops.iter().map(|op| op.key().clone()).collect();
        prop_assert_eq!(flat.len(), touched.len());
    }

    #[test]
    fn overlays_then_confirmation_match_server_state(
        base in prop::collection::vec(patch(), 0..10),
        ops in prop::collection::vec(operation(), 1..10),
    ) {
        // Applying the mutation's operations as server patches and dropping
        // the overlay must show exactly what the overlay showed.
        let mut store = Store::new();
        store.apply_patches(&base);
        store.push_pending(pending(1, ops.clone()));
        let optimistic = visible(&store);

        let patches: Vec<Patch> = ops.into_iter().map(|op| op.into_patch(1000)).collect();
        store.apply_server_update(&patches, &[1]);

        prop_assert_eq!(optimistic, visible(&store));
        prop_assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn scan_is_sorted_and_bounded(
        base in prop::collection::vec(patch(), 0..20),
        prefix in prop::sample::select(vec!["", "a", "a/", "b", "z"]),
        limit in 0usize..5,
    ) {
        let mut store = Store::new();
        store.apply_patches(&base);
        let tx = ReadTransaction::new(store.snapshot(), "prop");

        let keys = tx.scan(ScanOptions::new().prefix(prefix).limit(limit)).keys().to_array();

        prop_assert!(keys.len() <= limit);
        prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(keys.iter().all(|k| k.starts_with(prefix)));
        prop_assert_eq!(tx.scanned_keys().len(), keys.len());
    }
}
