// Engine error taxonomy. Snapshot conflicts are deliberately absent: a
// rejected conditional snapshot write is an outcome, not an error.

use std::fmt;

use thiserror::Error;

use crate::types::{MigrationPoint, WorkspaceFlavour};

/// What kind of resource a [`EngineError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Workspace,
    Document,
    Blob,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workspace => f.write_str("workspace"),
            Self::Document => f.write_str("document"),
            Self::Blob => f.write_str("blob"),
        }
    }
}

/// Typed failures surfaced at the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The backing store could not be reached or opened. Fatal to the
    /// current open attempt; the caller may retry a fresh one.
    #[error("workspace store connection failed: {source}")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// No factory is registered for the requested flavour.
    #[error("no factory registered for workspace flavour `{0}`")]
    UnknownFlavour(WorkspaceFlavour),

    /// A migration step failed. Durable storage is unchanged: steps run
    /// against the in-memory document graph and commit only on full success.
    #[error("workspace migration failed at {point}: {source}")]
    Migration {
        point: MigrationPoint,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A resource the contract requires to exist was missing.
    #[error("{kind} `{id}` not found")]
    NotFound { kind: ResourceKind, id: String },
}

impl EngineError {
    pub fn connection(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Connection { source: source.into() }
    }

    pub fn migration(
        point: MigrationPoint,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Migration { point, source: source.into() }
    }

    pub fn workspace_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: ResourceKind::Workspace, id: id.into() }
    }

    pub fn document_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: ResourceKind::Document, id: id.into() }
    }

    pub fn blob_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: ResourceKind::Blob, id: id.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_failing_resource() {
        let err = EngineError::workspace_not_found("ws-1");
        assert_eq!(err.to_string(), "workspace `ws-1` not found");

        let err = EngineError::UnknownFlavour(WorkspaceFlavour::Cloud);
        assert_eq!(err.to_string(), "no factory registered for workspace flavour `cloud`");
    }

    #[test]
    fn migration_error_carries_the_failing_point() {
        let err = EngineError::migration(
            MigrationPoint::SchemaVersionUpgrade,
            std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        );
        let rendered = err.to_string();
        assert!(
            rendered.contains("schema-version-upgrade"),
            "migration error should name its queue point, got: {rendered}"
        );
    }
}
