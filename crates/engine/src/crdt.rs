// CRDT document wrapper over yrs (y-crdt Rust bindings).
// Also defines the document layout names: root `meta` and `documents` maps,
// per-document `blocks` map, and the legacy `doc:` namespace markers.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector, Subscription, Text,
    TextPrelim, TextRef, Transact, Update,
};

/// Root map holding workspace metadata (`name`, `version:*` entries).
pub const META_MAP: &str = "meta";
/// Root map embedding one subdocument per document id.
pub const DOCUMENTS_MAP: &str = "documents";
/// Per-document root map holding block id → block map.
pub const BLOCKS_MAP: &str = "blocks";
/// Block map key naming the block's content flavour.
pub const BLOCK_FLAVOUR_KEY: &str = "flavour";
/// Metadata key for the workspace display name.
pub const META_NAME_KEY: &str = "name";
/// Metadata key prefix recording the stored schema version per block flavour.
pub const META_VERSION_PREFIX: &str = "version:";
/// Root-type namespace used by the pre-subdocument layout.
pub const LEGACY_DOC_PREFIX: &str = "doc:";
/// Root type holding workspace metadata in the pre-subdocument layout.
pub const LEGACY_META_TYPE: &str = "doc:meta";

/// Wrapper around a Yjs document.
///
/// Cloning is cheap and yields a handle to the same underlying document.
#[derive(Clone, Debug)]
pub struct CrdtDoc {
    doc: Doc,
}

impl CrdtDoc {
    /// Create a new empty document with a random guid.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create a document with a fixed guid (workspace or document id).
    pub fn with_guid(guid: &str) -> Self {
        let options = yrs::Options { guid: guid.into(), ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Load a document from a binary state (full snapshot).
    pub fn from_state(data: &[u8]) -> Result<Self> {
        let doc = Self::new();
        doc.apply_update(data)?;
        Ok(doc)
    }

    /// Load a document with a fixed guid from a binary state.
    pub fn from_state_with_guid(guid: &str, data: &[u8]) -> Result<Self> {
        let doc = Self::with_guid(guid);
        doc.apply_update(data)?;
        Ok(doc)
    }

    /// The document guid. Subdocument guids equal their document id.
    pub fn guid(&self) -> String {
        self.doc.guid().to_string()
    }

    /// Apply an incremental binary update to the document.
    pub fn apply_update(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode Yjs update")?;
        self.doc.transact_mut().apply_update(update).context("failed to apply Yjs update")?;
        Ok(())
    }

    /// Encode the full document state as a binary blob.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the state vector (logical timestamp) for sync comparisons.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Compute a diff (update) containing all changes since the given state vector.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).context("failed to decode state vector")?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Register a callback invoked with the encoded v1 update after every
    /// commit. The returned subscription must be kept alive.
    pub fn on_update(
        &self,
        callback: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.doc
            .observe_update_v1(move |_txn, event| callback(event.update.clone()))
            .map_err(|err| anyhow!("failed to register update observer: {err}"))
    }

    // ── shared types ──

    /// Get or create a `Map` shared type by name.
    pub fn get_or_insert_map(&self, name: &str) -> MapRef {
        self.doc.get_or_insert_map(name)
    }

    /// Get or create a `Text` shared type by name.
    pub fn get_or_insert_text(&self, name: &str) -> TextRef {
        self.doc.get_or_insert_text(name)
    }

    /// Read the string content of a named text type.
    pub fn get_text_string(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        text.get_string(&self.doc.transact())
    }

    /// Insert text at position in a named text type.
    pub fn insert_text(&self, name: &str, index: u32, content: &str) {
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, content);
    }

    /// Names of all integrated root-level shared types.
    pub fn root_type_names(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let mut names: Vec<String> = txn.root_refs().map(|(name, _)| name.to_string()).collect();
        names.sort();
        names
    }

    // ── workspace metadata ──

    pub fn meta_name(&self) -> Option<String> {
        let meta = self.doc.get_or_insert_map(META_MAP);
        let txn = self.doc.transact();
        match meta.get(&txn, META_NAME_KEY) {
            Some(Out::Any(Any::String(value))) => Some(value.to_string()),
            _ => None,
        }
    }

    pub fn set_meta_name(&self, name: &str) {
        let meta = self.doc.get_or_insert_map(META_MAP);
        let mut txn = self.doc.transact_mut();
        meta.insert(&mut txn, META_NAME_KEY, name);
    }

    /// Recorded schema version per block flavour, from `version:<flavour>`
    /// metadata entries.
    pub fn schema_versions(&self) -> BTreeMap<String, i64> {
        let meta = self.doc.get_or_insert_map(META_MAP);
        let txn = self.doc.transact();
        let mut versions = BTreeMap::new();
        for (key, value) in meta.iter(&txn) {
            let Some(flavour) = key.strip_prefix(META_VERSION_PREFIX) else {
                continue;
            };
            if let Out::Any(any) = value {
                if let Some(version) = any_to_i64(&any) {
                    versions.insert(flavour.to_string(), version);
                }
            }
        }
        versions
    }

    pub fn set_schema_version(&self, flavour: &str, version: i64) {
        let meta = self.doc.get_or_insert_map(META_MAP);
        let mut txn = self.doc.transact_mut();
        meta.insert(&mut txn, format!("{META_VERSION_PREFIX}{flavour}"), version);
    }

    pub fn remove_schema_version(&self, flavour: &str) {
        let meta = self.doc.get_or_insert_map(META_MAP);
        let mut txn = self.doc.transact_mut();
        meta.remove(&mut txn, &format!("{META_VERSION_PREFIX}{flavour}"));
    }

    // ── subdocuments ──

    /// Embed a fresh empty subdocument under `documents[doc_id]`, with the
    /// subdocument guid equal to the document id.
    pub fn insert_subdoc(&self, doc_id: &str) -> CrdtDoc {
        let documents = self.doc.get_or_insert_map(DOCUMENTS_MAP);
        let child = Doc::with_options(yrs::Options { guid: doc_id.into(), ..Default::default() });
        let mut txn = self.doc.transact_mut();
        let integrated = documents.insert(&mut txn, doc_id, child);
        CrdtDoc { doc: integrated }
    }

    /// Look up the subdocument embedded under `documents[doc_id]`.
    pub fn subdoc(&self, doc_id: &str) -> Option<CrdtDoc> {
        let documents = self.doc.get_or_insert_map(DOCUMENTS_MAP);
        let txn = self.doc.transact();
        match documents.get(&txn, doc_id) {
            Some(Out::YDoc(child)) => Some(CrdtDoc { doc: child }),
            _ => None,
        }
    }

    /// Ids of all embedded documents, sorted.
    pub fn subdoc_ids(&self) -> Vec<String> {
        let documents = self.doc.get_or_insert_map(DOCUMENTS_MAP);
        let txn = self.doc.transact();
        let mut ids: Vec<String> = documents
            .iter(&txn)
            .filter_map(|(key, value)| match value {
                Out::YDoc(_) => Some(key.to_string()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    /// All embedded documents with their ids, sorted by id.
    pub fn subdocs(&self) -> Vec<(String, CrdtDoc)> {
        let documents = self.doc.get_or_insert_map(DOCUMENTS_MAP);
        let txn = self.doc.transact();
        let mut children: Vec<(String, CrdtDoc)> = documents
            .iter(&txn)
            .filter_map(|(key, value)| match value {
                Out::YDoc(child) => Some((key.to_string(), CrdtDoc { doc: child })),
                _ => None,
            })
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    /// Remove the subdocument entry for `doc_id`. Returns whether it existed.
    pub fn remove_subdoc(&self, doc_id: &str) -> bool {
        let documents = self.doc.get_or_insert_map(DOCUMENTS_MAP);
        let mut txn = self.doc.transact_mut();
        documents.remove(&mut txn, doc_id).is_some()
    }

    // ── blocks ──

    /// Create an empty block of the given flavour under `blocks[block_id]`.
    /// Replaces any existing block with that id.
    pub fn insert_block(&self, block_id: &str, flavour: &str) {
        let blocks = self.doc.get_or_insert_map(BLOCKS_MAP);
        let mut txn = self.doc.transact_mut();
        let block = blocks.insert(&mut txn, block_id, MapPrelim::default());
        block.insert(&mut txn, BLOCK_FLAVOUR_KEY, flavour);
    }

    /// Ids of every block in this document, sorted.
    pub fn block_ids(&self) -> Vec<String> {
        let blocks = self.doc.get_or_insert_map(BLOCKS_MAP);
        let txn = self.doc.transact();
        let mut ids: Vec<String> = blocks.iter(&txn).map(|(key, _)| key.to_string()).collect();
        ids.sort();
        ids
    }

    pub fn block_flavour(&self, block_id: &str) -> Option<String> {
        match self.block_field(block_id, BLOCK_FLAVOUR_KEY)? {
            Any::String(flavour) => Some(flavour.to_string()),
            _ => None,
        }
    }

    /// Read a primitive field of a block.
    pub fn block_field(&self, block_id: &str, key: &str) -> Option<Any> {
        let blocks = self.doc.get_or_insert_map(BLOCKS_MAP);
        let txn = self.doc.transact();
        let Some(Out::YMap(block)) = blocks.get(&txn, block_id) else {
            return None;
        };
        match block.get(&txn, key)? {
            Out::Any(any) => Some(any),
            _ => None,
        }
    }

    /// Set a primitive field of a block. Absent blocks are left alone.
    pub fn set_block_field(&self, block_id: &str, key: &str, value: impl Into<Any>) {
        let blocks = self.doc.get_or_insert_map(BLOCKS_MAP);
        let mut txn = self.doc.transact_mut();
        if let Some(Out::YMap(block)) = blocks.get(&txn, block_id) {
            block.insert(&mut txn, key, value.into());
        }
    }

    pub fn remove_block_field(&self, block_id: &str, key: &str) {
        let blocks = self.doc.get_or_insert_map(BLOCKS_MAP);
        let mut txn = self.doc.transact_mut();
        if let Some(Out::YMap(block)) = blocks.get(&txn, block_id) {
            block.remove(&mut txn, key);
        }
    }

    /// Replace a block field with a collaborative text seeded from `content`.
    pub fn set_block_text(&self, block_id: &str, key: &str, content: &str) {
        let blocks = self.doc.get_or_insert_map(BLOCKS_MAP);
        let mut txn = self.doc.transact_mut();
        if let Some(Out::YMap(block)) = blocks.get(&txn, block_id) {
            block.insert(&mut txn, key, TextPrelim::new(content));
        }
    }

    /// Read a block's collaborative text field as a plain string.
    pub fn block_text_string(&self, block_id: &str, key: &str) -> Option<String> {
        let blocks = self.doc.get_or_insert_map(BLOCKS_MAP);
        let txn = self.doc.transact();
        let Some(Out::YMap(block)) = blocks.get(&txn, block_id) else {
            return None;
        };
        match block.get(&txn, key)? {
            Out::YText(text) => Some(text.get_string(&txn)),
            _ => None,
        }
    }

    /// Get the underlying Doc reference (for advanced operations).
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl Default for CrdtDoc {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn any_to_i64(any: &Any) -> Option<i64> {
    match any {
        Any::BigInt(value) => Some(*value),
        Any::Number(value) => Some(*value as i64),
        _ => None,
    }
}

/// Fold a base snapshot and a sequence of updates into one full state.
///
/// Updates commute and re-application is a no-op, so the result is the same
/// for any arrival order of the same update set.
pub fn merge_into_snapshot(base: Option<&[u8]>, updates: &[Vec<u8>]) -> Result<Vec<u8>> {
    let doc = match base {
        Some(state) => CrdtDoc::from_state(state).context("failed to load base snapshot")?,
        None => CrdtDoc::new(),
    };
    for (index, update) in updates.iter().enumerate() {
        doc.apply_update(update)
            .with_context(|| format!("failed to fold update at position {index}"))?;
    }
    Ok(doc.encode_state())
}
