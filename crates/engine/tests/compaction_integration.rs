use std::sync::{Arc, Mutex};

use folio_engine::crdt::{merge_into_snapshot, CrdtDoc};
use folio_engine::store::{DocDb, DocStorage};
use folio_engine::store::doc::{CompactionOutcome, CompactionResult};
use tempfile::tempdir;

const DOC_ID: &str = "page-1";

fn open_storage(path: &std::path::Path) -> DocStorage {
    let db = Arc::new(DocDb::new(path));
    let storage = DocStorage::new("space", db);
    storage.connect().expect("storage should connect");
    storage
}

/// Capture each edit to `content` as one encoded update.
fn updates_for_edits(edits: &[(u32, &str)]) -> Vec<Vec<u8>> {
    let doc = CrdtDoc::with_client_id(1);
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let _subscription = doc
        .on_update(move |update| sink.lock().expect("capture lock").push(update))
        .expect("observer should register");
    for (index, content) in edits {
        doc.insert_text("content", *index, content);
    }
    let updates = captured.lock().expect("capture lock").clone();
    assert_eq!(updates.len(), edits.len(), "each edit should produce one update");
    updates
}

#[test]
fn compacted_snapshot_equals_a_direct_merge_of_the_update_log() {
    let dir = tempdir().expect("temp dir should be created");
    let storage = open_storage(&dir.path().join("space.db"));

    let updates = updates_for_edits(&[(0, "hello"), (5, " world"), (11, "!")]);
    storage.push_updates(DOC_ID, &updates).expect("updates should persist");

    let result = storage.compact_doc(DOC_ID).expect("compaction should succeed");
    let CompactionResult::Compacted(CompactionOutcome { folded_updates, .. }) = result else {
        panic!("compaction should fold the pending log, got {result:?}");
    };
    assert_eq!(folded_updates, 3);

    // The on-disk snapshot is exactly what folding the raw updates yields.
    let snapshot = storage
        .latest_snapshot(DOC_ID)
        .expect("snapshot read should succeed")
        .expect("snapshot should exist after compaction");
    let direct = merge_into_snapshot(None, &updates).expect("direct merge should succeed");
    assert_eq!(snapshot.bin, direct);

    assert!(
        storage.pending_updates(DOC_ID).expect("log read should succeed").is_empty(),
        "folded updates should leave the pending log"
    );

    let doc = storage
        .load_doc(DOC_ID)
        .expect("doc should load")
        .expect("doc should have state");
    assert_eq!(doc.get_text_string("content"), "hello world!");
}

#[test]
fn state_survives_compaction_cycles_and_reconnects() {
    let dir = tempdir().expect("temp dir should be created");
    let path = dir.path().join("space.db");

    let updates = updates_for_edits(&[(0, "draft"), (5, " one"), (9, ", revised")]);
    {
        let storage = open_storage(&path);
        storage.push_updates(DOC_ID, &updates[..2]).expect("updates should persist");
        storage.compact_doc(DOC_ID).expect("compaction should succeed");
        storage
            .push_updates(DOC_ID, &updates[2..])
            .expect("post-compaction update should persist");
        storage.disconnect();
    }

    // A fresh connection sees snapshot ⊕ remaining log.
    let storage = open_storage(&path);
    let doc = storage
        .load_doc(DOC_ID)
        .expect("doc should load")
        .expect("doc should have state");
    assert_eq!(doc.get_text_string("content"), "draft one, revised");

    let pending = storage.pending_updates(DOC_ID).expect("log read should succeed");
    assert_eq!(pending.len(), 1, "only the post-compaction update should remain pending");
}

#[test]
fn stale_snapshot_writes_are_refused() {
    let dir = tempdir().expect("temp dir should be created");
    let storage = open_storage(&dir.path().join("space.db"));

    let updates = updates_for_edits(&[(0, "kept")]);
    storage.push_updates(DOC_ID, &updates).expect("updates should persist");
    storage.compact_doc(DOC_ID).expect("compaction should succeed");

    let current = storage
        .latest_snapshot(DOC_ID)
        .expect("snapshot read should succeed")
        .expect("snapshot should exist");

    let applied = storage
        .replace_doc_state(DOC_ID, b"stale bytes", current.timestamp - 1_000, &[])
        .expect("replacement attempt should not error");
    assert!(!applied, "an older snapshot must never replace a newer one");

    let after = storage
        .latest_snapshot(DOC_ID)
        .expect("snapshot read should succeed")
        .expect("snapshot should still exist");
    assert_eq!(after.bin, current.bin);
    assert_eq!(after.timestamp, current.timestamp);
}
