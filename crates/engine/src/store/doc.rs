// Per-space storage adapter: update push, state materialization, and snapshot
// compaction behind a count-or-age policy gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use folio_common::{DocRecord, DocUpdate};
use tracing::debug;

use crate::crdt::{self, CrdtDoc};
use crate::store::db::DocDb;

pub const COMPACTION_PENDING_UPDATES: usize = 100;
pub const COMPACTION_INTERVAL_MINUTES: i64 = 10;

/// When a doc's pending update log is worth folding into its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub pending_updates: usize,
    pub interval: Duration,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            pending_updates: COMPACTION_PENDING_UPDATES,
            interval: Duration::from_secs((COMPACTION_INTERVAL_MINUTES * 60) as u64),
        }
    }
}

impl CompactionPolicy {
    pub fn should_compact(
        &self,
        pending_updates: usize,
        last_snapshot_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if pending_updates == 0 {
            return false;
        }

        if pending_updates >= self.pending_updates {
            return true;
        }

        // Without a snapshot there is no age to compare; count decides alone.
        let Some(last_snapshot_at) = last_snapshot_at else {
            return false;
        };

        let Ok(interval) = ChronoDuration::from_std(self.interval) else {
            return false;
        };

        now.signed_duration_since(last_snapshot_at) >= interval
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionSkipReason {
    /// Nothing pending in the update log.
    NothingPending,
    /// Pending work exists but the policy thresholds are not met.
    PolicyNotSatisfied,
    /// A newer snapshot landed first; the fold was abandoned and the pending
    /// updates stay in the log for the next attempt.
    SnapshotConflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub folded_updates: usize,
    pub snapshot_timestamp: i64,
    pub snapshot_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionResult {
    Skipped(CompactionSkipReason),
    Compacted(CompactionOutcome),
}

/// Storage facade for one space (workspace): all doc rows live in the
/// space's own store file.
///
/// The authoritative state of a doc is always `snapshot ⊕ pending updates`;
/// compaction only moves bytes between those two forms.
pub struct DocStorage {
    space_id: String,
    db: Arc<DocDb>,
    policy: CompactionPolicy,
}

impl DocStorage {
    pub fn new(space_id: impl Into<String>, db: Arc<DocDb>) -> Self {
        Self::with_policy(space_id, db, CompactionPolicy::default())
    }

    pub fn with_policy(
        space_id: impl Into<String>,
        db: Arc<DocDb>,
        policy: CompactionPolicy,
    ) -> Self {
        Self { space_id: space_id.into(), db, policy }
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    pub fn policy(&self) -> CompactionPolicy {
        self.policy
    }

    pub(crate) fn db(&self) -> &Arc<DocDb> {
        &self.db
    }

    pub fn connect(&self) -> Result<()> {
        self.db.connect()
    }

    /// Release the underlying store connection. Safe to repeat.
    pub fn disconnect(&self) {
        self.db.close();
    }

    pub fn push_updates(&self, doc_id: &str, updates: &[Vec<u8>]) -> Result<usize> {
        self.db.push_updates(doc_id, updates)
    }

    pub fn pending_updates(&self, doc_id: &str) -> Result<Vec<DocUpdate>> {
        self.db.get_doc_updates(doc_id)
    }

    pub fn latest_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        Ok(self.db.get_doc_snapshot(doc_id)?.map(|(bin, timestamp)| DocRecord {
            space_id: self.space_id.clone(),
            doc_id: doc_id.to_string(),
            bin,
            timestamp,
        }))
    }

    /// Per-doc latest-write timestamps, optionally only for docs touched
    /// strictly after `after`.
    pub fn space_doc_timestamps(&self, after: Option<i64>) -> Result<HashMap<String, i64>> {
        let clocks = self.db.get_doc_clocks(after)?;
        Ok(clocks.into_iter().map(|clock| (clock.doc_id, clock.timestamp)).collect())
    }

    pub fn delete_doc(&self, doc_id: &str) -> Result<()> {
        self.db.delete_doc(doc_id)
    }

    /// Remove the whole space store from disk.
    pub fn delete_space(&self) -> Result<()> {
        self.db.destroy()
    }

    /// Materialize a doc's authoritative state: snapshot ⊕ pending updates,
    /// folded oldest-first. Read-only; writes nothing back.
    pub fn load_doc_state(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        let snapshot = self.db.get_doc_snapshot(doc_id)?;
        let updates = self.db.get_doc_updates(doc_id)?;
        if snapshot.is_none() && updates.is_empty() {
            return Ok(None);
        }

        let bins: Vec<Vec<u8>> = updates.into_iter().map(|update| update.bin).collect();
        let merged =
            crdt::merge_into_snapshot(snapshot.as_ref().map(|(bin, _)| bin.as_slice()), &bins)
                .with_context(|| format!("failed to materialize doc `{doc_id}`"))?;
        Ok(Some(merged))
    }

    /// Materialize a doc as a live CRDT handle with its guid set to `doc_id`.
    pub fn load_doc(&self, doc_id: &str) -> Result<Option<CrdtDoc>> {
        match self.load_doc_state(doc_id)? {
            Some(state) => {
                let doc = CrdtDoc::from_state_with_guid(doc_id, &state)
                    .with_context(|| format!("failed to load doc `{doc_id}`"))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Fold pending updates into the doc snapshot.
    ///
    /// The snapshot is stamped with the newest folded update's timestamp and
    /// written conditionally; only when the write takes effect are exactly
    /// the folded rows marked merged. A rejected write abandons the fold,
    /// which is safe to retry because updates commute and re-apply cleanly.
    pub fn compact_doc(&self, doc_id: &str) -> Result<CompactionResult> {
        let pending = self.db.get_doc_updates(doc_id)?;
        let Some(newest) = pending.last() else {
            return Ok(CompactionResult::Skipped(CompactionSkipReason::NothingPending));
        };
        let snapshot_timestamp = newest.timestamp;

        let base = self.db.get_doc_snapshot(doc_id)?;
        let bins: Vec<Vec<u8>> = pending.iter().map(|update| update.bin.clone()).collect();
        let merged = crdt::merge_into_snapshot(base.as_ref().map(|(bin, _)| bin.as_slice()), &bins)
            .with_context(|| format!("failed to fold updates for doc `{doc_id}`"))?;

        let applied = self.db.set_doc_snapshot(doc_id, &merged, snapshot_timestamp)?;
        if !applied {
            debug!(space_id = %self.space_id, %doc_id, "snapshot write lost to a newer one; updates stay pending");
            return Ok(CompactionResult::Skipped(CompactionSkipReason::SnapshotConflict));
        }

        let timestamps: Vec<i64> = pending.iter().map(|update| update.timestamp).collect();
        let folded_updates = self.db.mark_updates_merged(doc_id, &timestamps)?;
        debug!(space_id = %self.space_id, %doc_id, folded = folded_updates, "compacted doc");

        Ok(CompactionResult::Compacted(CompactionOutcome {
            folded_updates,
            snapshot_timestamp,
            snapshot_bytes: merged.len(),
        }))
    }

    /// Overwrite a doc's snapshot with an externally produced state,
    /// retiring the given pending rows. Subject to the same conditional
    /// write as compaction; returns whether the write took effect.
    pub fn replace_doc_state(
        &self,
        doc_id: &str,
        state: &[u8],
        timestamp: i64,
        folded: &[i64],
    ) -> Result<bool> {
        let applied = self.db.set_doc_snapshot(doc_id, state, timestamp)?;
        if !applied {
            debug!(space_id = %self.space_id, %doc_id, "snapshot write lost to a newer one; replacement abandoned");
            return Ok(false);
        }
        if !folded.is_empty() {
            self.db.mark_updates_merged(doc_id, folded)?;
        }
        Ok(true)
    }

    /// Compact only when the policy says the log is worth folding.
    pub fn maybe_compact(&self, doc_id: &str) -> Result<CompactionResult> {
        let pending = self.db.pending_update_count(doc_id)?;
        let last_snapshot_at = self
            .db
            .get_doc_snapshot(doc_id)?
            .and_then(|(_, timestamp)| Utc.timestamp_millis_opt(timestamp).single());

        if !self.policy.should_compact(pending, last_snapshot_at, Utc::now()) {
            return Ok(CompactionResult::Skipped(CompactionSkipReason::PolicyNotSatisfied));
        }
        self.compact_doc(doc_id)
    }
}
