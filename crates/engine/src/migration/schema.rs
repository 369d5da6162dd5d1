// Content schemas: the version each block flavour is currently written at,
// plus the upgrade routines that bring older blocks up to date.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use yrs::Any;

use crate::crdt::CrdtDoc;

/// Upgrade one block from version `from` to the current version of its
/// flavour. Fields the routine does not touch carry over unchanged.
pub type UpgradeFn = fn(doc: &CrdtDoc, block_id: &str, from: i64) -> Result<()>;

pub struct FlavourSchema {
    pub version: i64,
    pub upgrade: UpgradeFn,
}

/// Registry of every content flavour this build understands.
///
/// Workspaces record, per flavour, the version their blocks were written
/// at; divergence from this registry is what flags a workspace for a
/// schema upgrade on open.
pub struct Schema {
    entries: BTreeMap<&'static str, FlavourSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// The built-in content types.
    pub fn builtin() -> Self {
        let mut schema = Self::new();
        schema.register("note", FlavourSchema { version: 2, upgrade: upgrade_note });
        schema.register("todo", FlavourSchema { version: 2, upgrade: upgrade_todo });
        schema
    }

    pub fn register(&mut self, flavour: &'static str, entry: FlavourSchema) {
        self.entries.insert(flavour, entry);
    }

    pub fn contains(&self, flavour: &str) -> bool {
        self.entries.contains_key(flavour)
    }

    pub fn version_of(&self, flavour: &str) -> Option<i64> {
        self.entries.get(flavour).map(|entry| entry.version)
    }

    /// The full flavour → version set a current workspace records.
    pub fn current_versions(&self) -> BTreeMap<String, i64> {
        self.entries
            .iter()
            .map(|(flavour, entry)| (flavour.to_string(), entry.version))
            .collect()
    }

    /// Bring every block of `doc` up to current. `recorded` is the
    /// per-flavour version set the workspace was written at; flavours this
    /// registry does not know are left untouched.
    pub(crate) fn upgrade_doc_blocks(
        &self,
        doc: &CrdtDoc,
        recorded: &BTreeMap<String, i64>,
    ) -> Result<()> {
        for block_id in doc.block_ids() {
            let Some(flavour) = doc.block_flavour(&block_id) else {
                continue;
            };
            let Some(entry) = self.entries.get(flavour.as_str()) else {
                continue;
            };
            // No recorded version means the block predates versioning.
            let from = recorded.get(&flavour).copied().unwrap_or(0);
            if from >= entry.version {
                continue;
            }
            (entry.upgrade)(doc, &block_id, from)
                .with_context(|| format!("failed to upgrade `{flavour}` block `{block_id}`"))?;
        }
        Ok(())
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Step two of the pipeline: hydrate every subdocument, upgrade its blocks,
/// and rewrite the recorded version set to exactly the registry's current
/// one. Versions for flavours the registry no longer knows are dropped;
/// their content stays as written.
pub(super) fn upgrade_workspace(root: &CrdtDoc, ctx: &super::MigrationContext<'_>) -> Result<()> {
    let recorded = root.schema_versions();

    for (doc_id, doc) in root.subdocs() {
        if let Some(state) = (ctx.load_doc)(&doc_id)? {
            doc.apply_update(&state)
                .with_context(|| format!("failed to hydrate doc `{doc_id}` for upgrade"))?;
        }
        ctx.schema.upgrade_doc_blocks(&doc, &recorded)?;
    }

    for flavour in recorded.keys() {
        if !ctx.schema.contains(flavour) {
            root.remove_schema_version(flavour);
        }
    }
    for (flavour, version) in ctx.schema.current_versions() {
        root.set_schema_version(&flavour, version);
    }
    Ok(())
}

/// v1 kept a note's body as a plain string field; v2 moves it into a
/// collaborative text.
fn upgrade_note(doc: &CrdtDoc, block_id: &str, _from: i64) -> Result<()> {
    if let Some(Any::String(content)) = doc.block_field(block_id, "content") {
        doc.set_block_text(block_id, "text", &content);
        doc.remove_block_field(block_id, "content");
    } else if doc.block_text_string(block_id, "text").is_none() {
        doc.set_block_text(block_id, "text", "");
    }
    Ok(())
}

/// v1 recorded completion as 0/1; v2 stores a real boolean.
fn upgrade_todo(doc: &CrdtDoc, block_id: &str, _from: i64) -> Result<()> {
    match doc.block_field(block_id, "done") {
        Some(Any::BigInt(done)) => doc.set_block_field(block_id, "done", done != 0),
        Some(Any::Number(done)) => doc.set_block_field(block_id, "done", done != 0.0),
        Some(Any::Bool(_)) => {}
        _ => doc.set_block_field(block_id, "done", false),
    }
    Ok(())
}
