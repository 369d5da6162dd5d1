// Migration-on-open: a workspace whose document structure lags the current
// build is brought forward by an ordered step queue before anyone sees it.
// Steps mutate the in-memory graph only; committing the result back into
// storage is the caller's job, so a failed pipeline changes nothing durable.

pub mod schema;
mod subdoc;

use anyhow::Result;
use folio_common::{EngineError, MigrationPoint};
use tracing::{debug, info};

pub use self::schema::{FlavourSchema, Schema, UpgradeFn};
use crate::crdt::{CrdtDoc, LEGACY_DOC_PREFIX};

/// Everything a pipeline run needs from its caller: the schema registry, a
/// constructor for a blank current-layout root, and a loader for persisted
/// subdocument state.
pub struct MigrationContext<'a> {
    pub schema: &'a Schema,
    pub scaffold: &'a dyn Fn() -> Result<CrdtDoc>,
    pub load_doc: &'a dyn Fn(&str) -> Result<Option<Vec<u8>>>,
}

/// The step queue, oldest point first.
const STEPS: [MigrationPoint; 2] =
    [MigrationPoint::SubdocRestructure, MigrationPoint::SchemaVersionUpgrade];

/// Decide whether a workspace needs migration, and from which point.
///
/// Legacy single-document markers trump everything; otherwise the recorded
/// per-flavour versions must match the schema registry exactly.
pub fn check_compatibility(root: &CrdtDoc, schema: &Schema) -> Option<MigrationPoint> {
    let has_legacy_markers =
        root.root_type_names().iter().any(|name| name.starts_with(LEGACY_DOC_PREFIX));
    if has_legacy_markers {
        return Some(MigrationPoint::SubdocRestructure);
    }

    if root.schema_versions() != schema.current_versions() {
        return Some(MigrationPoint::SchemaVersionUpgrade);
    }
    None
}

/// Run the step queue from `point`, each step's output feeding the next.
/// Returns the migrated root document; the input is never mutated when the
/// first step is the restructure.
pub fn migrate_workspace(
    point: MigrationPoint,
    root: &CrdtDoc,
    ctx: &MigrationContext<'_>,
) -> Result<CrdtDoc> {
    let mut doc = root.clone();
    for step in STEPS.into_iter().filter(|step| *step >= point) {
        debug!(%step, "running workspace migration step");
        doc = run_step(step, &doc, ctx)
            .map_err(|source| EngineError::migration(step, source))?;
    }
    info!(from = %point, "workspace migration pipeline finished");
    Ok(doc)
}

fn run_step(
    step: MigrationPoint,
    doc: &CrdtDoc,
    ctx: &MigrationContext<'_>,
) -> Result<CrdtDoc> {
    match step {
        MigrationPoint::SubdocRestructure => subdoc::restructure(doc, ctx),
        MigrationPoint::SchemaVersionUpgrade => {
            schema::upgrade_workspace(doc, ctx)?;
            Ok(doc.clone())
        }
    }
}
