use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use folio_common::WorkspaceFlavour;
use folio_engine::{FactoryRegistry, Schema, WorkspaceList, WorkspaceManager};
use tempfile::tempdir;

fn manager(dir: &Path) -> WorkspaceManager {
    let schema = Arc::new(Schema::builtin());
    let list = WorkspaceList::open(dir.join("meta.db")).expect("workspace list should open");
    let registry = FactoryRegistry::standard(dir.join("workspaces"), Arc::clone(&schema));
    WorkspaceManager::new(list, registry, schema)
}

#[tokio::test]
async fn transform_copies_the_full_graph_byte_identically() {
    let dir = tempdir().expect("temp dir should be created");
    let manager = manager(dir.path());

    let source_meta = manager
        .create_workspace(WorkspaceFlavour::Local, |root, blobs| {
            root.set_meta_name("Expedition");
            blobs.put("map", b"tile bytes")?;
            Ok(())
        })
        .expect("create should succeed");

    let source = manager.use_workspace(source_meta).expect("source should open");
    let log = source.create_doc("log").expect("doc should be created");
    log.insert_block("b1", "note");
    log.set_block_text("b1", "text", "day one: set off at dawn");
    let gear = source.create_doc("gear").expect("doc should be created");
    gear.insert_block("b1", "todo");
    gear.set_block_field("b1", "done", false);
    source.flush().expect("edits should persist");

    let cloud_meta = manager
        .transform_local_to_cloud(&source)
        .await
        .expect("transform should succeed");
    assert_eq!(cloud_meta.flavour, WorkspaceFlavour::Cloud);
    assert_ne!(cloud_meta.id, source_meta.id);

    let cloud = manager.use_workspace(cloud_meta).expect("cloud workspace should open");
    assert_eq!(cloud.name().as_deref(), Some("Expedition"));

    let mut doc_ids = cloud.doc_ids();
    doc_ids.sort();
    assert_eq!(doc_ids, vec!["gear".to_string(), "log".to_string()]);

    // Copied documents carry the exact encoded state of the source.
    for doc_id in ["log", "gear"] {
        let original = source
            .doc(doc_id)
            .expect("source doc lookup should succeed")
            .expect("source doc should exist");
        let copied = cloud
            .doc(doc_id)
            .expect("cloud doc lookup should succeed")
            .expect("cloud doc should exist");
        assert_eq!(copied.encode_state(), original.encode_state());
    }
    assert_eq!(
        cloud.blobs().get("map").expect("blob read should succeed").as_deref(),
        Some(b"tile bytes".as_slice())
    );

    // The local listing is retired; the cloud workspace replaces it.
    assert!(manager.list().get(source_meta.id).expect("list read should succeed").is_none());
    let listed = manager
        .list()
        .get(cloud_meta.id)
        .expect("list read should succeed")
        .expect("cloud workspace should be listed");
    assert_eq!(listed.metadata.flavour, WorkspaceFlavour::Cloud);
}

#[tokio::test]
async fn transform_blocks_on_the_sync_barrier_until_timed_out() {
    let dir = tempdir().expect("temp dir should be created");
    let manager = manager(dir.path());

    let source_meta = manager
        .create_workspace(WorkspaceFlavour::Local, |root, _blobs| {
            root.set_meta_name("Pending");
            Ok(())
        })
        .expect("create should succeed");
    let source = manager.use_workspace(source_meta).expect("source should open");

    // An attached sync engine reports in-flight work; the barrier holds.
    source.sync_controller().mark_syncing();
    let timed_out = tokio::time::timeout(
        Duration::from_millis(50),
        manager.transform_local_to_cloud(&source),
    )
    .await;
    assert!(timed_out.is_err(), "the transform should still be waiting on the barrier");

    // Nothing destructive ran before the barrier.
    assert!(
        manager.list().get(source_meta.id).expect("list read should succeed").is_some(),
        "a cancelled transform must leave the source listed"
    );
    assert_eq!(
        manager.list().all().expect("list read should succeed").len(),
        1,
        "no cloud workspace should have been registered"
    );

    // Once the sync engine settles, the same call goes through.
    source.sync_controller().mark_synced();
    let cloud_meta = manager
        .transform_local_to_cloud(&source)
        .await
        .expect("transform should succeed after the barrier clears");
    assert!(manager.list().get(cloud_meta.id).expect("list read should succeed").is_some());
    assert!(manager.list().get(source_meta.id).expect("list read should succeed").is_none());
}
