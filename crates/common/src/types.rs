// Core domain types shared across all Folio crates.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted CRDT document state: one snapshot (or full state) for one doc.
///
/// `timestamp` is UTC milliseconds and carries the monotonicity guard for
/// snapshot writes: a stored snapshot is only ever replaced by one whose
/// timestamp is not older.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRecord {
    pub space_id: String,
    pub doc_id: String,
    pub bin: Vec<u8>,
    pub timestamp: i64,
}

/// One pending update in a document's append-only log.
///
/// Within a doc, `timestamp` is unique and strictly increasing in push order,
/// so `(doc_id, timestamp)` identifies the row for merge bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdate {
    pub bin: Vec<u8>,
    pub timestamp: i64,
}

/// Latest-write digest for one document, as reported by the storage binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocClock {
    pub doc_id: String,
    pub timestamp: i64,
}

/// Which backend family a workspace belongs to.
///
/// The set is closed: dispatch is an exhaustive match, not a string registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceFlavour {
    Local,
    Cloud,
}

impl WorkspaceFlavour {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "cloud" => Some(Self::Cloud),
            _ => None,
        }
    }
}

impl fmt::Display for WorkspaceFlavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a workspace as registered in the workspace list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceMetadata {
    pub id: Uuid,
    pub flavour: WorkspaceFlavour,
}

impl WorkspaceMetadata {
    pub fn new(id: Uuid, flavour: WorkspaceFlavour) -> Self {
        Self { id, flavour }
    }
}

/// Entry points of the workspace migration queue, in execution order.
///
/// A detected point means "run the queue from here to the end"; later steps
/// always follow earlier ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationPoint {
    /// Flat single-doc layout must be split into root + subdocuments.
    SubdocRestructure = 1,
    /// Recorded block schema versions lag the current schema.
    SchemaVersionUpgrade = 2,
}

impl MigrationPoint {
    /// Position of this point in the migration queue (1-based).
    pub const fn queue_index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MigrationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubdocRestructure => f.write_str("subdoc-restructure"),
            Self::SchemaVersionUpgrade => f.write_str("schema-version-upgrade"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flavour_round_trips_through_str() {
        for flavour in [WorkspaceFlavour::Local, WorkspaceFlavour::Cloud] {
            assert_eq!(
                WorkspaceFlavour::parse(flavour.as_str()),
                Some(flavour),
                "flavour string form should parse back to itself"
            );
        }
        assert_eq!(WorkspaceFlavour::parse("peer-to-peer"), None);
    }

    #[test]
    fn migration_points_are_ordered_by_queue_position() {
        assert!(MigrationPoint::SubdocRestructure < MigrationPoint::SchemaVersionUpgrade);
        assert_eq!(MigrationPoint::SubdocRestructure.queue_index(), 1);
        assert_eq!(MigrationPoint::SchemaVersionUpgrade.queue_index(), 2);
    }
}
