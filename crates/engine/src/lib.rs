// folio-engine: CRDT document storage and workspace lifecycle for Folio.

pub mod config;
pub mod crdt;
pub mod migration;
pub mod store;
pub mod workspace;

pub use config::EngineConfig;
pub use crdt::CrdtDoc;
pub use migration::Schema;
pub use store::{BlobStore, CompactionPolicy, DocStorage};
pub use workspace::factory::{FactoryRegistry, WorkspaceFactory};
pub use workspace::list::{WorkspaceEntry, WorkspaceList};
pub use workspace::manager::WorkspaceManager;
pub use workspace::pool::{WorkspacePool, WorkspaceRef};
pub use workspace::sync::{SyncHandle, SyncStatus};
pub use workspace::Workspace;
