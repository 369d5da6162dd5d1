// Workspace lifecycle front door: list-backed registration, factory
// dispatch by flavour, pooled opens with migration-on-open, and the
// local-to-cloud transform.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use folio_common::{EngineError, MigrationPoint, WorkspaceFlavour, WorkspaceMetadata};
use tracing::{info, warn};

use super::factory::{scaffold_root, FactoryRegistry, WorkspaceFactory};
use super::list::WorkspaceList;
use super::pool::{WorkspacePool, WorkspaceRef};
use super::Workspace;
use crate::config::EngineConfig;
use crate::crdt::CrdtDoc;
use crate::migration::{check_compatibility, migrate_workspace, MigrationContext, Schema};
use crate::store::BlobStore;

/// Owns the workspace list, the flavour factories, and the shared pool.
/// Every open funnels through here, so no caller can observe a workspace
/// whose store predates the current document layout.
pub struct WorkspaceManager {
    list: WorkspaceList,
    registry: FactoryRegistry,
    pool: WorkspacePool,
    schema: Arc<Schema>,
}

impl WorkspaceManager {
    pub fn new(list: WorkspaceList, registry: FactoryRegistry, schema: Arc<Schema>) -> Self {
        Self { list, registry, pool: WorkspacePool::new(), schema }
    }

    /// Manager over the standard layout beneath `config.data_dir`.
    pub fn with_config(config: &EngineConfig) -> Result<Self> {
        let schema = Arc::new(Schema::builtin());
        let list = WorkspaceList::open(config.meta_db_path())?;
        let registry = FactoryRegistry::standard_with_policy(
            config.workspaces_dir(),
            Arc::clone(&schema),
            config.compaction_policy(),
        );
        Ok(Self::new(list, registry, schema))
    }

    pub fn list(&self) -> &WorkspaceList {
        &self.list
    }

    pub fn pool(&self) -> &WorkspacePool {
        &self.pool
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Borrow a workspace, opening it on first use. Opening migrates the
    /// store when needed; concurrent callers for the same id share one open.
    pub fn use_workspace(&self, metadata: WorkspaceMetadata) -> Result<WorkspaceRef> {
        self.pool.get_or_open(metadata.id, || self.open_and_migrate(&metadata))
    }

    /// Register and seed a new workspace. The initializer runs exactly once
    /// against the scaffolded root before anything is persisted; when it
    /// fails, the listing and the store are rolled back.
    pub fn create_workspace(
        &self,
        flavour: WorkspaceFlavour,
        init: impl FnOnce(&CrdtDoc, &BlobStore) -> Result<()>,
    ) -> Result<WorkspaceMetadata> {
        let factory = self.registry.resolve(flavour)?;
        let metadata = self.list.create(flavour)?;

        if let Err(error) = self.seed_workspace(factory.as_ref(), &metadata, init) {
            if let Err(cleanup) = self.list.delete(metadata.id) {
                warn!(workspace = %metadata.id, error = %cleanup, "failed to unlist workspace after seeding error");
            }
            if let Err(cleanup) = factory.destroy(metadata.id) {
                warn!(workspace = %metadata.id, error = %cleanup, "failed to remove workspace store after seeding error");
            }
            return Err(error);
        }

        info!(workspace = %metadata.id, %flavour, "created workspace");
        Ok(metadata)
    }

    /// Scaffold the store, run the initializer against the empty root, and
    /// persist the seeded document graph. The workspace is closed afterwards;
    /// callers reopen through the pool.
    fn seed_workspace(
        &self,
        factory: &dyn WorkspaceFactory,
        metadata: &WorkspaceMetadata,
        init: impl FnOnce(&CrdtDoc, &BlobStore) -> Result<()>,
    ) -> Result<()> {
        let workspace = factory.create(metadata)?;
        let seeded =
            init(workspace.root(), workspace.blobs()).and_then(|()| workspace.persist_all());
        workspace.close();
        seeded
    }

    /// Remove a workspace's listing and its on-disk store. The workspace
    /// does not need to be open.
    pub fn delete_workspace(&self, metadata: &WorkspaceMetadata) -> Result<()> {
        let factory = self.registry.resolve(metadata.flavour)?;
        self.list.delete(metadata.id)?;
        factory.destroy(metadata.id)?;
        info!(workspace = %metadata.id, "deleted workspace");
        Ok(())
    }

    /// Promote a local workspace to a cloud one: wait until everything
    /// local is acknowledged, copy the full document graph and every blob
    /// into a freshly created cloud workspace, and only then retire the
    /// local listing. Store files stay behind for the local flavour's
    /// cleanup. Callers bound the wait by wrapping the future in a timeout.
    pub async fn transform_local_to_cloud(
        &self,
        source: &WorkspaceRef,
    ) -> Result<WorkspaceMetadata> {
        if source.metadata().flavour != WorkspaceFlavour::Local {
            bail!("workspace `{}` is not a local workspace", source.id());
        }

        source.sync().wait_for_synced().await?;

        let metadata = self.create_workspace(WorkspaceFlavour::Cloud, |root, blobs| {
            root.apply_update(&source.root().encode_state())
                .context("failed to copy the root document")?;

            for doc_id in source.doc_ids() {
                let Some(doc) = source.doc(&doc_id)? else {
                    continue;
                };
                let Some(target) = root.subdoc(&doc_id) else {
                    warn!(%doc_id, "copied root carries no reference for document");
                    continue;
                };
                target
                    .apply_update(&doc.encode_state())
                    .with_context(|| format!("failed to copy document `{doc_id}`"))?;
            }

            for key in source.blobs().keys()? {
                if let Some(blob) = source.blobs().get(&key)? {
                    blobs.put(&key, &blob)?;
                }
            }
            Ok(())
        })?;

        self.list.delete(source.id())?;
        info!(source = %source.id(), cloud = %metadata.id, "transformed local workspace to cloud");
        Ok(metadata)
    }

    /// Read one blob without opening (or migrating) the workspace.
    pub fn workspace_blob(
        &self,
        metadata: &WorkspaceMetadata,
        key: &str,
    ) -> Result<Option<Vec<u8>>> {
        let factory = self.registry.resolve(metadata.flavour)?;
        let blobs = factory.blob_store(metadata.id)?;
        let blob = blobs.get(key)?;
        blobs.disconnect();
        Ok(blob)
    }

    fn open_and_migrate(&self, metadata: &WorkspaceMetadata) -> Result<Workspace> {
        let factory = self.registry.resolve(metadata.flavour)?;
        let workspace = factory.open(metadata)?;

        let workspace = match check_compatibility(workspace.root(), &self.schema) {
            Some(point) => {
                info!(workspace = %metadata.id, from = %point, "workspace store lags the current layout");
                self.migrate_and_reopen(factory.as_ref(), metadata, workspace, point)?
            }
            None => workspace,
        };

        workspace.attach()?;
        self.refresh_listed_name(&workspace);
        Ok(workspace)
    }

    /// Run the migration pipeline against the in-memory graph, commit the
    /// result as fresh snapshots, and reopen from disk. Nothing durable
    /// changes unless the whole pipeline succeeds.
    fn migrate_and_reopen(
        &self,
        factory: &dyn WorkspaceFactory,
        metadata: &WorkspaceMetadata,
        workspace: Workspace,
        point: MigrationPoint,
    ) -> Result<Workspace> {
        let root_id = metadata.id.to_string();
        let scaffold = || -> Result<CrdtDoc> { Ok(scaffold_root(&root_id, &self.schema)) };
        let storage = workspace.storage();
        let load_state =
            |doc_id: &str| -> Result<Option<Vec<u8>>> { storage.load_doc_state(doc_id) };
        let ctx = MigrationContext {
            schema: &self.schema,
            scaffold: &scaffold,
            load_doc: &load_state,
        };

        let migrated = migrate_workspace(point, workspace.root(), &ctx)?;

        // Commit: every document's rewritten state becomes its snapshot,
        // retiring the updates that were pending while the pipeline ran.
        let now = Utc::now().timestamp_millis();
        let mut documents = vec![(root_id.clone(), migrated.clone())];
        documents.extend(migrated.subdocs());
        for (doc_id, doc) in &documents {
            let folded: Vec<i64> = storage
                .pending_updates(doc_id)?
                .iter()
                .map(|update| update.timestamp)
                .collect();
            if !storage.replace_doc_state(doc_id, &doc.encode_state(), now, &folded)? {
                warn!(workspace = %metadata.id, %doc_id, "migrated snapshot write did not take effect");
            }
        }
        workspace.close();

        let reopened = factory.open(metadata)?;
        if let Some(stuck) = check_compatibility(reopened.root(), &self.schema) {
            reopened.close();
            return Err(EngineError::migration(
                stuck,
                anyhow!("workspace is still incompatible after migration"),
            )
            .into());
        }
        info!(workspace = %metadata.id, from = %point, "workspace migrated");
        Ok(reopened)
    }

    /// Mirror the document-held display name into the workspace list, so
    /// listings don't require opening every store.
    fn refresh_listed_name(&self, workspace: &Workspace) {
        let Some(name) = workspace.name() else {
            return;
        };
        if let Err(error) = self.list.update_name(workspace.id(), &name) {
            warn!(workspace = %workspace.id(), error = %error, "failed to refresh listed workspace name");
        }
    }
}
