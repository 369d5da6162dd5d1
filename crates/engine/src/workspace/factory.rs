// Flavour factories: how each workspace flavour opens, seeds, and destroys
// its on-disk store. Factories are resolved through a registry keyed by the
// closed flavour enum, so adding a flavour means adding a factory here.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use folio_common::{EngineError, WorkspaceFlavour, WorkspaceMetadata};
use uuid::Uuid;

use super::sync::{sync_channel, SyncStatus};
use super::Workspace;
use crate::crdt::CrdtDoc;
use crate::migration::Schema;
use crate::store::{BlobStore, CompactionPolicy, DocDb, DocStorage};

/// File extension for per-workspace stores under the workspaces directory.
pub const STORE_EXTENSION: &str = "db";

/// Opens, creates, and destroys workspaces of one flavour.
pub trait WorkspaceFactory: Send + Sync {
    fn flavour(&self) -> WorkspaceFlavour;

    /// Open an existing workspace store and load its root document. The
    /// returned workspace is not yet observing edits; callers attach it
    /// once migration has settled.
    fn open(&self, metadata: &WorkspaceMetadata) -> Result<Workspace>;

    /// Create a brand-new workspace store with a scaffolded root.
    fn create(&self, metadata: &WorkspaceMetadata) -> Result<Workspace>;

    /// Blob access without loading documents or running migration.
    fn blob_store(&self, id: Uuid) -> Result<BlobStore>;

    /// Remove the workspace's files from disk. Removing an absent store is
    /// not an error.
    fn destroy(&self, id: Uuid) -> Result<()>;
}

impl std::fmt::Debug for dyn WorkspaceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceFactory").field("flavour", &self.flavour()).finish_non_exhaustive()
    }
}

/// Workspaces that live entirely on this machine.
pub struct LocalFactory {
    layout: StoreLayout,
}

impl LocalFactory {
    pub fn new(workspaces_dir: impl Into<PathBuf>, schema: Arc<Schema>) -> Self {
        Self { layout: StoreLayout::new(workspaces_dir, schema) }
    }

    pub fn with_policy(
        workspaces_dir: impl Into<PathBuf>,
        schema: Arc<Schema>,
        compaction: CompactionPolicy,
    ) -> Self {
        Self { layout: StoreLayout::with_policy(workspaces_dir, schema, compaction) }
    }
}

impl WorkspaceFactory for LocalFactory {
    fn flavour(&self) -> WorkspaceFlavour {
        WorkspaceFlavour::Local
    }

    fn open(&self, metadata: &WorkspaceMetadata) -> Result<Workspace> {
        // Nothing to converge with; local workspaces are born synced.
        self.layout.open(metadata, SyncStatus::Synced)
    }

    fn create(&self, metadata: &WorkspaceMetadata) -> Result<Workspace> {
        self.layout.create(metadata, SyncStatus::Synced)
    }

    fn blob_store(&self, id: Uuid) -> Result<BlobStore> {
        self.layout.blob_store(id)
    }

    fn destroy(&self, id: Uuid) -> Result<()> {
        self.layout.destroy(id)
    }
}

/// Workspaces mirrored to a remote server. The store layout matches the
/// local flavour; the difference is that an external sync engine owns the
/// sync status and the workspace starts out unsynced.
pub struct CloudFactory {
    layout: StoreLayout,
}

impl CloudFactory {
    pub fn new(workspaces_dir: impl Into<PathBuf>, schema: Arc<Schema>) -> Self {
        Self { layout: StoreLayout::new(workspaces_dir, schema) }
    }

    pub fn with_policy(
        workspaces_dir: impl Into<PathBuf>,
        schema: Arc<Schema>,
        compaction: CompactionPolicy,
    ) -> Self {
        Self { layout: StoreLayout::with_policy(workspaces_dir, schema, compaction) }
    }
}

impl WorkspaceFactory for CloudFactory {
    fn flavour(&self) -> WorkspaceFlavour {
        WorkspaceFlavour::Cloud
    }

    fn open(&self, metadata: &WorkspaceMetadata) -> Result<Workspace> {
        self.layout.open(metadata, SyncStatus::Syncing)
    }

    fn create(&self, metadata: &WorkspaceMetadata) -> Result<Workspace> {
        self.layout.create(metadata, SyncStatus::Syncing)
    }

    fn blob_store(&self, id: Uuid) -> Result<BlobStore> {
        self.layout.blob_store(id)
    }

    fn destroy(&self, id: Uuid) -> Result<()> {
        self.layout.destroy(id)
    }
}

/// Shared store plumbing: one SQLite file per workspace id.
struct StoreLayout {
    workspaces_dir: PathBuf,
    schema: Arc<Schema>,
    compaction: CompactionPolicy,
}

impl StoreLayout {
    fn new(workspaces_dir: impl Into<PathBuf>, schema: Arc<Schema>) -> Self {
        Self::with_policy(workspaces_dir, schema, CompactionPolicy::default())
    }

    fn with_policy(
        workspaces_dir: impl Into<PathBuf>,
        schema: Arc<Schema>,
        compaction: CompactionPolicy,
    ) -> Self {
        Self { workspaces_dir: workspaces_dir.into(), schema, compaction }
    }

    fn store_path(&self, id: Uuid) -> PathBuf {
        self.workspaces_dir.join(format!("{id}.{STORE_EXTENSION}"))
    }

    fn open(&self, metadata: &WorkspaceMetadata, initial: SyncStatus) -> Result<Workspace> {
        let path = self.store_path(metadata.id);
        if !path.exists() {
            return Err(EngineError::workspace_not_found(metadata.id.to_string()).into());
        }

        let db = Arc::new(DocDb::new(&path));
        let storage =
            DocStorage::with_policy(metadata.id.to_string(), Arc::clone(&db), self.compaction);
        storage.connect()?;
        let blobs = BlobStore::new(db);

        let root_id = metadata.id.to_string();
        let root = storage
            .load_doc(&root_id)?
            .unwrap_or_else(|| CrdtDoc::with_guid(&root_id));
        storage.maybe_compact(&root_id)?;

        let (controller, handle) = sync_channel(initial);
        Ok(Workspace::new(metadata.clone(), storage, blobs, root, controller, handle))
    }

    fn create(&self, metadata: &WorkspaceMetadata, initial: SyncStatus) -> Result<Workspace> {
        fs::create_dir_all(&self.workspaces_dir).with_context(|| {
            format!(
                "failed to create workspaces directory `{}`",
                self.workspaces_dir.display()
            )
        })?;

        let db = Arc::new(DocDb::new(self.store_path(metadata.id)));
        let storage =
            DocStorage::with_policy(metadata.id.to_string(), Arc::clone(&db), self.compaction);
        storage.connect()?;
        let blobs = BlobStore::new(db);

        let root = scaffold_root(&metadata.id.to_string(), &self.schema);
        let (controller, handle) = sync_channel(initial);
        Ok(Workspace::new(metadata.clone(), storage, blobs, root, controller, handle))
    }

    fn blob_store(&self, id: Uuid) -> Result<BlobStore> {
        let path = self.store_path(id);
        if !path.exists() {
            return Err(EngineError::workspace_not_found(id.to_string()).into());
        }
        let db = Arc::new(DocDb::new(&path));
        db.connect()?;
        Ok(BlobStore::new(db))
    }

    fn destroy(&self, id: Uuid) -> Result<()> {
        let path = self.store_path(id);
        if !path.exists() {
            return Ok(());
        }
        DocDb::new(&path).destroy()
    }
}

/// Build the root document a new workspace starts from: empty meta and
/// document maps, with every content type recorded at its current version.
pub(crate) fn scaffold_root(root_id: &str, schema: &Schema) -> CrdtDoc {
    let root = CrdtDoc::with_guid(root_id);
    root.get_or_insert_map(crate::crdt::META_MAP);
    root.get_or_insert_map(crate::crdt::DOCUMENTS_MAP);
    for (flavour, version) in schema.current_versions() {
        root.set_schema_version(&flavour, version);
    }
    root
}

/// Factory lookup by flavour. Registered once at engine construction; an
/// unregistered flavour surfaces as `EngineError::UnknownFlavour` at the
/// call sites that resolve through it.
pub struct FactoryRegistry {
    factories: HashMap<WorkspaceFlavour, Arc<dyn WorkspaceFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    /// Registry with both built-in flavours over one workspaces directory.
    pub fn standard(workspaces_dir: impl AsRef<Path>, schema: Arc<Schema>) -> Self {
        Self::standard_with_policy(workspaces_dir, schema, CompactionPolicy::default())
    }

    /// Same as [`standard`](Self::standard), with explicit compaction
    /// thresholds for every store.
    pub fn standard_with_policy(
        workspaces_dir: impl AsRef<Path>,
        schema: Arc<Schema>,
        compaction: CompactionPolicy,
    ) -> Self {
        let dir = workspaces_dir.as_ref();
        let mut registry = Self::new();
        registry.register(Arc::new(LocalFactory::with_policy(dir, Arc::clone(&schema), compaction)));
        registry.register(Arc::new(CloudFactory::with_policy(dir, schema, compaction)));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn WorkspaceFactory>) {
        self.factories.insert(factory.flavour(), factory);
    }

    pub fn get(&self, flavour: WorkspaceFlavour) -> Option<&Arc<dyn WorkspaceFactory>> {
        self.factories.get(&flavour)
    }

    pub fn resolve(&self, flavour: WorkspaceFlavour) -> Result<&Arc<dyn WorkspaceFactory>> {
        self.get(flavour).ok_or_else(|| EngineError::UnknownFlavour(flavour).into())
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
