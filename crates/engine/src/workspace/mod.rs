// Workspace lifecycle: live instances, flavour factories, the registry,
// pooling, and sync state.

pub mod factory;
pub mod list;
pub mod manager;
pub mod pool;
pub mod sync;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use folio_common::WorkspaceMetadata;
use tracing::warn;
use uuid::Uuid;
use yrs::Subscription;

use self::sync::{SyncController, SyncHandle};
use crate::crdt::CrdtDoc;
use crate::store::{BlobStore, DocStorage};

/// A live, connected workspace: the root document, its materialized
/// sub-documents, persistence handles, and sync state.
///
/// Instances are shared through the pool; edits observed on any attached
/// document are queued in memory and written out by `flush` (and on close).
pub struct Workspace {
    metadata: WorkspaceMetadata,
    storage: DocStorage,
    blobs: BlobStore,
    root: CrdtDoc,
    /// Sub-documents already hydrated from storage, by doc id.
    docs: Mutex<HashMap<String, CrdtDoc>>,
    /// Observed updates awaiting a flush, in arrival order.
    pending: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    sync: SyncHandle,
    sync_controller: SyncController,
    closed: AtomicBool,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace").field("metadata", &self.metadata).finish_non_exhaustive()
    }
}

impl Workspace {
    pub(crate) fn new(
        metadata: WorkspaceMetadata,
        storage: DocStorage,
        blobs: BlobStore,
        root: CrdtDoc,
        sync_controller: SyncController,
        sync: SyncHandle,
    ) -> Self {
        Self {
            metadata,
            storage,
            blobs,
            root,
            docs: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Mutex::new(Vec::new()),
            sync,
            sync_controller,
            closed: AtomicBool::new(false),
        }
    }

    /// Start queueing the root document's updates for persistence.
    pub(crate) fn attach(&self) -> Result<()> {
        let subscription = self.observe_doc(&self.root)?;
        self.subscriptions
            .lock()
            .expect("workspace subscription lock should not be poisoned")
            .push(subscription);
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.metadata.id
    }

    pub fn metadata(&self) -> &WorkspaceMetadata {
        &self.metadata
    }

    pub fn root(&self) -> &CrdtDoc {
        &self.root
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub(crate) fn storage(&self) -> &DocStorage {
        &self.storage
    }

    pub fn sync(&self) -> &SyncHandle {
        &self.sync
    }

    /// Handle for whatever sync engine drives this workspace's status.
    pub fn sync_controller(&self) -> &SyncController {
        &self.sync_controller
    }

    /// Display name from the root document's meta, if one was ever set.
    pub fn name(&self) -> Option<String> {
        self.root.meta_name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ids of every sub-document referenced by the root, hydrated or not.
    pub fn doc_ids(&self) -> Vec<String> {
        self.root.subdoc_ids()
    }

    /// Create a new sub-document and start persisting its edits.
    pub fn create_doc(&self, doc_id: &str) -> Result<CrdtDoc> {
        let mut docs =
            self.docs.lock().expect("workspace doc registry lock should not be poisoned");
        if docs.contains_key(doc_id) || self.root.subdoc(doc_id).is_some() {
            bail!("document `{doc_id}` already exists in workspace `{}`", self.metadata.id);
        }

        let doc = self.root.insert_subdoc(doc_id);
        let subscription = self.observe_doc(&doc)?;
        self.subscriptions
            .lock()
            .expect("workspace subscription lock should not be poisoned")
            .push(subscription);
        docs.insert(doc_id.to_string(), doc.clone());
        Ok(doc)
    }

    /// Fetch a sub-document, hydrating it from storage on first access.
    /// Returns `None` when the root references no such document.
    pub fn doc(&self, doc_id: &str) -> Result<Option<CrdtDoc>> {
        let mut docs =
            self.docs.lock().expect("workspace doc registry lock should not be poisoned");
        if let Some(doc) = docs.get(doc_id) {
            return Ok(Some(doc.clone()));
        }

        let Some(doc) = self.root.subdoc(doc_id) else {
            return Ok(None);
        };

        // Persisted state is applied before the observer is wired so a load
        // does not feed back into the pending queue.
        if let Some(state) = self.storage.load_doc_state(doc_id)? {
            doc.apply_update(&state)
                .with_context(|| format!("failed to hydrate doc `{doc_id}`"))?;
        }
        self.storage.maybe_compact(doc_id)?;

        let subscription = self.observe_doc(&doc)?;
        self.subscriptions
            .lock()
            .expect("workspace subscription lock should not be poisoned")
            .push(subscription);
        docs.insert(doc_id.to_string(), doc.clone());
        Ok(Some(doc))
    }

    /// Drop a sub-document from the root and purge its persisted rows.
    /// Returns whether the root referenced it.
    pub fn delete_doc(&self, doc_id: &str) -> Result<bool> {
        self.docs
            .lock()
            .expect("workspace doc registry lock should not be poisoned")
            .remove(doc_id);
        let removed = self.root.remove_subdoc(doc_id);
        self.storage.delete_doc(doc_id)?;
        Ok(removed)
    }

    /// Write every queued update out to storage, batched per document in
    /// arrival order. On failure the unwritten updates go back to the front
    /// of the queue.
    pub fn flush(&self) -> Result<()> {
        let drained: Vec<(String, Vec<u8>)> = {
            let mut queue =
                self.pending.lock().expect("workspace update queue lock should not be poisoned");
            std::mem::take(&mut *queue)
        };
        if drained.is_empty() {
            return Ok(());
        }

        let mut batches: VecDeque<(String, Vec<Vec<u8>>)> = VecDeque::new();
        for (doc_id, update) in drained {
            match batches.iter_mut().find(|(id, _)| *id == doc_id) {
                Some((_, batch)) => batch.push(update),
                None => batches.push_back((doc_id, vec![update])),
            }
        }

        while let Some((doc_id, batch)) = batches.pop_front() {
            if let Err(error) = self.storage.push_updates(&doc_id, &batch) {
                batches.push_front((doc_id, batch));
                let mut queue = self
                    .pending
                    .lock()
                    .expect("workspace update queue lock should not be poisoned");
                let mut restored: Vec<(String, Vec<u8>)> = batches
                    .into_iter()
                    .flat_map(|(id, updates)| {
                        updates.into_iter().map(move |update| (id.clone(), update))
                    })
                    .collect();
                restored.extend(queue.drain(..));
                *queue = restored;
                return Err(error);
            }
        }
        Ok(())
    }

    /// Push the full encoded state of the root and every sub-document.
    /// Used to seed storage for a freshly created workspace; full states
    /// subsume whatever the observers have queued so far.
    pub(crate) fn persist_all(&self) -> Result<()> {
        self.pending
            .lock()
            .expect("workspace update queue lock should not be poisoned")
            .clear();

        let root_id = self.root.guid();
        self.storage.push_updates(&root_id, &[self.root.encode_state()])?;
        for (doc_id, doc) in self.root.subdocs() {
            self.storage.push_updates(&doc_id, &[doc.encode_state()])?;
        }
        Ok(())
    }

    /// Tear the workspace down: stop observing, flush what is queued, and
    /// release the store handle. Safe to call more than once; never panics
    /// past the first call.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Observers go first so the queue cannot grow mid-teardown.
        self.subscriptions
            .lock()
            .expect("workspace subscription lock should not be poisoned")
            .clear();
        if let Err(error) = self.flush() {
            warn!(
                workspace = %self.metadata.id,
                error = %error,
                "failed to flush pending updates during teardown"
            );
        }
        self.storage.disconnect();
    }

    fn observe_doc(&self, doc: &CrdtDoc) -> Result<Subscription> {
        let queue = Arc::clone(&self.pending);
        let doc_id = doc.guid();
        doc.on_update(move |update| {
            let mut queue =
                queue.lock().expect("workspace update queue lock should not be poisoned");
            queue.push((doc_id.clone(), update));
        })
    }
}

#[cfg(test)]
mod tests {
    use folio_common::WorkspaceFlavour;
    use tempfile::tempdir;
    use uuid::Uuid;

    use super::sync::{sync_channel, SyncStatus};
    use super::*;
    use crate::store::DocDb;

    fn assemble(dir: &std::path::Path, metadata: &WorkspaceMetadata) -> Workspace {
        let db = Arc::new(DocDb::new(dir.join(format!("{}.db", metadata.id))));
        let storage = DocStorage::new(metadata.id.to_string(), Arc::clone(&db));
        storage.connect().expect("storage should connect");
        let blobs = BlobStore::new(db);

        let root_id = metadata.id.to_string();
        let root = storage
            .load_doc(&root_id)
            .expect("root load should succeed")
            .unwrap_or_else(|| CrdtDoc::with_guid(&root_id));

        let (controller, handle) = sync_channel(SyncStatus::Synced);
        let workspace = Workspace::new(metadata.clone(), storage, blobs, root, controller, handle);
        workspace.attach().expect("observers should attach");
        workspace
    }

    #[test]
    fn create_doc_queues_and_flushes_updates() {
        let dir = tempdir().expect("temp dir should be created");
        let metadata = WorkspaceMetadata::new(Uuid::new_v4(), WorkspaceFlavour::Local);
        let workspace = assemble(dir.path(), &metadata);

        let doc = workspace.create_doc("page-1").expect("doc should be created");
        doc.insert_text("body", 0, "hello");
        workspace.flush().expect("flush should succeed");

        let storage = workspace.storage();
        assert!(
            !storage.pending_updates("page-1").expect("pending should be readable").is_empty(),
            "the sub-document's edits should be persisted under its own id"
        );
        assert!(
            !storage
                .pending_updates(&metadata.id.to_string())
                .expect("pending should be readable")
                .is_empty(),
            "adding a sub-document should persist a root update"
        );
    }

    #[test]
    fn doc_hydrates_persisted_content_after_reopen() {
        let dir = tempdir().expect("temp dir should be created");
        let metadata = WorkspaceMetadata::new(Uuid::new_v4(), WorkspaceFlavour::Local);

        {
            let workspace = assemble(dir.path(), &metadata);
            let doc = workspace.create_doc("page-1").expect("doc should be created");
            doc.insert_text("body", 0, "persisted across sessions");
            workspace.close();
        }

        let reopened = assemble(dir.path(), &metadata);
        assert_eq!(reopened.doc_ids(), vec!["page-1".to_string()]);
        let doc = reopened
            .doc("page-1")
            .expect("doc lookup should succeed")
            .expect("sub-document should exist");
        assert_eq!(doc.get_text_string("body"), "persisted across sessions");
        assert!(reopened.doc("missing").expect("lookup should succeed").is_none());
    }

    #[test]
    fn create_doc_rejects_duplicate_ids() {
        let dir = tempdir().expect("temp dir should be created");
        let metadata = WorkspaceMetadata::new(Uuid::new_v4(), WorkspaceFlavour::Local);
        let workspace = assemble(dir.path(), &metadata);

        workspace.create_doc("page-1").expect("doc should be created");
        assert!(workspace.create_doc("page-1").is_err());
    }

    #[test]
    fn delete_doc_removes_reference_and_rows() {
        let dir = tempdir().expect("temp dir should be created");
        let metadata = WorkspaceMetadata::new(Uuid::new_v4(), WorkspaceFlavour::Local);
        let workspace = assemble(dir.path(), &metadata);

        let doc = workspace.create_doc("page-1").expect("doc should be created");
        doc.insert_text("body", 0, "gone soon");
        workspace.flush().expect("flush should succeed");

        assert!(workspace.delete_doc("page-1").expect("delete should succeed"));
        assert!(workspace.doc_ids().is_empty());
        assert!(workspace
            .storage()
            .pending_updates("page-1")
            .expect("pending should be readable")
            .is_empty());
        assert!(!workspace.delete_doc("page-1").expect("repeat delete should succeed"));
    }

    #[test]
    fn close_flushes_and_is_idempotent() {
        let dir = tempdir().expect("temp dir should be created");
        let metadata = WorkspaceMetadata::new(Uuid::new_v4(), WorkspaceFlavour::Local);

        {
            let workspace = assemble(dir.path(), &metadata);
            let doc = workspace.create_doc("page-1").expect("doc should be created");
            doc.insert_text("body", 0, "unflushed edit");
            workspace.close();
            workspace.close();
            assert!(workspace.is_closed());
        }

        let reopened = assemble(dir.path(), &metadata);
        let doc = reopened
            .doc("page-1")
            .expect("doc lookup should succeed")
            .expect("sub-document should exist");
        assert_eq!(doc.get_text_string("body"), "unflushed edit", "close should flush the queue");
    }

    #[test]
    fn name_reads_root_meta() {
        let dir = tempdir().expect("temp dir should be created");
        let metadata = WorkspaceMetadata::new(Uuid::new_v4(), WorkspaceFlavour::Local);
        let workspace = assemble(dir.path(), &metadata);

        assert_eq!(workspace.name(), None);
        workspace.root().set_meta_name("Field Notes");
        assert_eq!(workspace.name().as_deref(), Some("Field Notes"));
    }
}
