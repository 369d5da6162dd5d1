use std::sync::{Arc, Mutex};

use folio_engine::crdt::{merge_into_snapshot, CrdtDoc};
use proptest::prelude::*;

const UPDATE_COUNT: usize = 6;

/// One client's edits to `content`, captured as individual updates.
fn captured_edits(client_id: u64, chunks: &[&str]) -> Vec<Vec<u8>> {
    let doc = CrdtDoc::with_client_id(client_id);
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let _subscription = doc
        .on_update(move |update| sink.lock().expect("capture lock").push(update))
        .expect("observer should register");
    for chunk in chunks {
        doc.insert_text("content", 0, chunk);
    }
    let updates = captured.lock().expect("capture lock").clone();
    updates
}

/// A fixed set of six updates from three independent clients.
fn update_set() -> Vec<Vec<u8>> {
    let mut updates = Vec::new();
    updates.extend(captured_edits(1, &["alpha ", "beta "]));
    updates.extend(captured_edits(2, &["gamma "]));
    updates.extend(captured_edits(3, &["delta ", "epsilon "]));
    assert_eq!(updates.len(), UPDATE_COUNT);
    updates
}

fn fold(snapshot: Option<&[u8]>, updates: &[Vec<u8>]) -> Vec<u8> {
    merge_into_snapshot(snapshot, updates).expect("updates should merge")
}

fn text_of(state: &[u8]) -> String {
    let doc = CrdtDoc::from_state(state).expect("merged state should load");
    doc.get_text_string("content")
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn any_permutation_folds_to_the_same_state(
        order in Just((0..UPDATE_COUNT).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let updates = update_set();
        let baseline = fold(None, &updates);

        let permuted: Vec<Vec<u8>> = order.iter().map(|&i| updates[i].clone()).collect();
        let folded = fold(None, &permuted);

        prop_assert_eq!(&folded, &baseline);
        prop_assert_eq!(text_of(&folded), text_of(&baseline));
    }

    #[test]
    fn staged_folds_match_a_single_fold(
        order in Just((0..UPDATE_COUNT).collect::<Vec<_>>()).prop_shuffle(),
        split in 0..=UPDATE_COUNT,
    ) {
        let updates = update_set();
        let baseline = fold(None, &updates);

        // Fold a prefix into a snapshot first, then the rest on top of it,
        // the way compaction interleaves with later pushes.
        let permuted: Vec<Vec<u8>> = order.iter().map(|&i| updates[i].clone()).collect();
        let snapshot = fold(None, &permuted[..split]);
        let folded = fold(Some(&snapshot), &permuted[split..]);

        prop_assert_eq!(&folded, &baseline);
        prop_assert_eq!(text_of(&folded), text_of(&baseline));
    }

    #[test]
    fn re_applying_updates_is_idempotent(
        duplicated in proptest::sample::subsequence((0..UPDATE_COUNT).collect::<Vec<_>>(), 1..=UPDATE_COUNT),
    ) {
        let updates = update_set();
        let baseline = fold(None, &updates);

        // Apply the full set, then a subset again.
        let mut with_duplicates = updates.clone();
        with_duplicates.extend(duplicated.iter().map(|&i| updates[i].clone()));
        let folded = fold(None, &with_duplicates);

        prop_assert_eq!(&folded, &baseline);
    }
}
