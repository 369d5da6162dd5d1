// Step one of the pipeline: restructure the flat pre-subdocument layout
// (`doc:meta` / `doc:<id>` root types) into a root document embedding one
// subdocument per document id.

use anyhow::Result;
use tracing::warn;
use yrs::{Any, Map, MapRef, Out, ReadTxn, Transact};

use super::MigrationContext;
use crate::crdt::{CrdtDoc, BLOCK_FLAVOUR_KEY, LEGACY_DOC_PREFIX, LEGACY_META_TYPE};

/// Restructure a legacy workspace document. Documents already in the
/// current layout pass through unchanged, so re-running the step is a
/// no-op.
pub(super) fn restructure(root: &CrdtDoc, ctx: &MigrationContext<'_>) -> Result<CrdtDoc> {
    let legacy = legacy_doc_maps(root);
    if legacy.is_empty() {
        return Ok(root.clone());
    }

    let fresh = (ctx.scaffold)()?;
    // Carried blocks keep their pre-versioning shape, so the rebuilt root
    // must not record any schema version; the upgrade step decides those.
    for flavour in fresh.schema_versions().keys() {
        fresh.remove_schema_version(flavour);
    }
    if let Some(name) = legacy_meta_name(root, &legacy) {
        fresh.set_meta_name(&name);
    }

    for (type_name, map) in &legacy {
        if type_name == LEGACY_META_TYPE {
            continue;
        }
        let doc_id = &type_name[LEGACY_DOC_PREFIX.len()..];
        if doc_id.is_empty() {
            warn!(root_type = %type_name, "skipping legacy root type without a document id");
            continue;
        }
        let child = fresh.insert_subdoc(doc_id);
        copy_legacy_blocks(root, map, &child);
    }

    Ok(fresh)
}

/// Every `doc:`-prefixed root map of the legacy layout, with its name.
fn legacy_doc_maps(root: &CrdtDoc) -> Vec<(String, MapRef)> {
    let txn = root.inner().transact();
    let mut maps: Vec<(String, MapRef)> = txn
        .root_refs()
        .filter_map(|(name, out)| match out {
            Out::YMap(map) if name.starts_with(LEGACY_DOC_PREFIX) => {
                Some((name.to_string(), map))
            }
            _ => None,
        })
        .collect();
    maps.sort_by(|a, b| a.0.cmp(&b.0));
    maps
}

fn legacy_meta_name(root: &CrdtDoc, legacy: &[(String, MapRef)]) -> Option<String> {
    let (_, meta) = legacy.iter().find(|(name, _)| name == LEGACY_META_TYPE)?;
    let txn = root.inner().transact();
    match meta.get(&txn, crate::crdt::META_NAME_KEY)? {
        Out::Any(Any::String(name)) => Some(name.to_string()),
        _ => None,
    }
}

/// Copy the legacy map's block entries into the child's block table. The
/// legacy layout stored each block as a plain attribute map; unknown shapes
/// are dropped with a warning rather than failing the whole restructure.
fn copy_legacy_blocks(root: &CrdtDoc, legacy: &MapRef, child: &CrdtDoc) {
    let txn = root.inner().transact();
    for (block_id, value) in legacy.iter(&txn) {
        let Out::Any(Any::Map(fields)) = value else {
            warn!(block = %block_id, "skipping legacy block with an unexpected shape");
            continue;
        };
        let Some(Any::String(flavour)) = fields.get(BLOCK_FLAVOUR_KEY) else {
            warn!(block = %block_id, "skipping legacy block without a flavour");
            continue;
        };

        child.insert_block(block_id, flavour);
        for (key, field) in fields.iter() {
            if key == BLOCK_FLAVOUR_KEY {
                continue;
            }
            child.set_block_field(block_id, key, field.clone());
        }
    }
}
