// folio-common: shared types and the error taxonomy for the Folio engine

pub mod error;
pub mod types;

pub use error::{EngineError, ResourceKind};
pub use types::{
    DocClock, DocRecord, DocUpdate, MigrationPoint, WorkspaceFlavour, WorkspaceMetadata,
};
