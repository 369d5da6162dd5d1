// Per-workspace SQLite store: append-only update log, compacted snapshots,
// per-doc clocks, and the blob table. One file per workspace id.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use folio_common::{DocClock, DocUpdate, EngineError};
use rusqlite::{params, Connection, OptionalExtension};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE updates (
    doc_id      TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    data        BLOB NOT NULL,
    PRIMARY KEY (doc_id, created_at)
);

CREATE TABLE snapshots (
    doc_id      TEXT PRIMARY KEY,
    data        BLOB NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE clocks (
    doc_id      TEXT PRIMARY KEY,
    ts          INTEGER NOT NULL
);
"#;

const MIGRATION_V2_SQL: &str = r#"
CREATE TABLE blobs (
    key         TEXT PRIMARY KEY,
    data        BLOB NOT NULL,
    size        INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

/// Storage engine binding for one workspace store.
///
/// The connection is held behind a mutex so `connect`/`close` bracket every
/// other method; calling any data method while disconnected is a connection
/// error. Update rows are keyed `(doc_id, created_at)` with per-doc strictly
/// increasing timestamps, so a timestamp list identifies rows exactly.
#[derive(Debug)]
pub struct DocDb {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl DocDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), conn: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.conn.lock().expect("doc db lock should not be poisoned").is_some()
    }

    /// Open the store file and bring its schema up to date. Idempotent.
    pub fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().expect("doc db lock should not be poisoned");
        if guard.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store parent directory `{}`", parent.display())
            })?;
        }

        let mut conn = Connection::open(&self.path)
            .map_err(EngineError::connection)
            .with_context(|| format!("failed to open doc store at `{}`", self.path.display()))?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            ",
        )
        .map_err(EngineError::connection)
        .context("failed to configure sqlite pragmas for doc store")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        *guard = Some(conn);
        Ok(())
    }

    /// Drop the connection, releasing all file handles. Safe when already closed.
    pub fn close(&self) {
        let mut guard = self.conn.lock().expect("doc db lock should not be poisoned");
        *guard = None;
    }

    /// Close and delete the store file along with its WAL siblings.
    pub fn destroy(&self) -> Result<()> {
        self.close();
        if self.path.exists() {
            fs::remove_file(&self.path).with_context(|| {
                format!("failed to remove doc store `{}`", self.path.display())
            })?;
        }
        let path_str = self.path.display().to_string();
        let _ = fs::remove_file(format!("{path_str}-wal"));
        let _ = fs::remove_file(format!("{path_str}-shm"));
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.with_conn(|conn| current_schema_version(conn))
    }

    // ── update log ──

    /// Append updates for a doc, assigning each a timestamp strictly greater
    /// than every earlier write to that doc. Returns the resulting pending
    /// count for the doc.
    pub fn push_updates(&self, doc_id: &str, updates: &[Vec<u8>]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start update push transaction")?;
            let mut next_ts = next_timestamp(&tx, doc_id)?;
            for update in updates {
                tx.execute(
                    "INSERT INTO updates (doc_id, created_at, data) VALUES (?1, ?2, ?3)",
                    params![doc_id, next_ts, update],
                )
                .with_context(|| format!("failed to append update for doc `{doc_id}`"))?;
                advance_clock(&tx, doc_id, next_ts)?;
                next_ts += 1;
            }
            let pending: i64 = tx
                .query_row("SELECT COUNT(*) FROM updates WHERE doc_id = ?1", [doc_id], |row| {
                    row.get(0)
                })
                .context("failed to count pending updates")?;
            tx.commit().context("failed to commit update push")?;
            Ok(pending as usize)
        })
    }

    /// Pending updates for a doc, oldest first.
    pub fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocUpdate>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT data, created_at FROM updates
                     WHERE doc_id = ?1 ORDER BY created_at ASC",
                )
                .context("failed to prepare pending update query")?;
            let rows = stmt
                .query_map([doc_id], |row| {
                    Ok(DocUpdate { bin: row.get(0)?, timestamp: row.get(1)? })
                })
                .context("failed to query pending updates")?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to read pending update rows")
        })
    }

    pub fn pending_update_count(&self, doc_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM updates WHERE doc_id = ?1", [doc_id], |row| {
                    row.get(0)
                })
                .context("failed to count pending updates")?;
            Ok(count as usize)
        })
    }

    /// Delete the identified update rows. Rows already gone are a no-op, so
    /// repeating a call cannot over-delete. Returns how many rows went away.
    pub fn mark_updates_merged(&self, doc_id: &str, timestamps: &[i64]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start merge bookkeeping")?;
            let mut removed = 0usize;
            for ts in timestamps {
                removed += tx
                    .execute(
                        "DELETE FROM updates WHERE doc_id = ?1 AND created_at = ?2",
                        params![doc_id, ts],
                    )
                    .with_context(|| format!("failed to remove merged update for doc `{doc_id}`"))?;
            }
            tx.commit().context("failed to commit merge bookkeeping")?;
            Ok(removed)
        })
    }

    // ── snapshots ──

    pub fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<(Vec<u8>, i64)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT data, updated_at FROM snapshots WHERE doc_id = ?1",
                [doc_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read doc snapshot")
        })
    }

    /// Conditionally replace the doc snapshot: the write takes effect only
    /// when `timestamp` is not older than the stored one. Returns whether it
    /// was applied. A rejected write is a normal outcome, not an error.
    pub fn set_doc_snapshot(&self, doc_id: &str, data: &[u8], timestamp: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let applied = conn
                .execute(
                    "INSERT INTO snapshots (doc_id, data, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(doc_id) DO UPDATE
                     SET data = excluded.data, updated_at = excluded.updated_at
                     WHERE excluded.updated_at >= snapshots.updated_at",
                    params![doc_id, data, timestamp],
                )
                .with_context(|| format!("failed to write snapshot for doc `{doc_id}`"))?;
            if applied > 0 {
                advance_clock(conn, doc_id, timestamp)?;
            }
            Ok(applied > 0)
        })
    }

    // ── clocks ──

    /// Latest-write digest per doc, optionally restricted to docs touched
    /// strictly after `after`.
    pub fn get_doc_clocks(&self, after: Option<i64>) -> Result<Vec<DocClock>> {
        self.with_conn(|conn| {
            let mut clocks = Vec::new();
            match after {
                Some(after) => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT doc_id, ts FROM clocks WHERE ts > ?1 ORDER BY doc_id ASC",
                        )
                        .context("failed to prepare clock query")?;
                    let rows = stmt
                        .query_map([after], |row| {
                            Ok(DocClock { doc_id: row.get(0)?, timestamp: row.get(1)? })
                        })
                        .context("failed to query doc clocks")?;
                    for row in rows {
                        clocks.push(row.context("failed to read doc clock row")?);
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare("SELECT doc_id, ts FROM clocks ORDER BY doc_id ASC")
                        .context("failed to prepare clock query")?;
                    let rows = stmt
                        .query_map([], |row| {
                            Ok(DocClock { doc_id: row.get(0)?, timestamp: row.get(1)? })
                        })
                        .context("failed to query doc clocks")?;
                    for row in rows {
                        clocks.push(row.context("failed to read doc clock row")?);
                    }
                }
            }
            Ok(clocks)
        })
    }

    /// Drop every trace of a doc: pending updates, snapshot, clock.
    pub fn delete_doc(&self, doc_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start doc deletion")?;
            tx.execute("DELETE FROM updates WHERE doc_id = ?1", [doc_id])
                .context("failed to delete doc updates")?;
            tx.execute("DELETE FROM snapshots WHERE doc_id = ?1", [doc_id])
                .context("failed to delete doc snapshot")?;
            tx.execute("DELETE FROM clocks WHERE doc_id = ?1", [doc_id])
                .context("failed to delete doc clock")?;
            tx.commit().context("failed to commit doc deletion")?;
            Ok(())
        })
    }

    // ── blobs ──

    pub fn put_blob(&self, key: &str, data: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO blobs (key, data, size, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, data, data.len() as i64, now_ms()],
            )
            .with_context(|| format!("failed to store blob `{key}`"))?;
            Ok(())
        })
    }

    pub fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT data FROM blobs WHERE key = ?1", [key], |row| row.get(0))
                .optional()
                .with_context(|| format!("failed to read blob `{key}`"))
        })
    }

    pub fn blob_keys(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key FROM blobs ORDER BY key ASC")
                .context("failed to prepare blob listing")?;
            let rows =
                stmt.query_map([], |row| row.get(0)).context("failed to query blob keys")?;
            rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to read blob keys")
        })
    }

    pub fn delete_blob(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn
                .execute("DELETE FROM blobs WHERE key = ?1", [key])
                .with_context(|| format!("failed to delete blob `{key}`"))?;
            Ok(removed > 0)
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().expect("doc db lock should not be poisoned");
        let conn = guard
            .as_mut()
            .ok_or_else(|| EngineError::connection("doc store is not connected"))?;
        f(conn)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// First timestamp for a new batch: later than both wall clock and every
/// earlier write to the doc.
fn next_timestamp(conn: &Connection, doc_id: &str) -> Result<i64> {
    let clock: Option<i64> = conn
        .query_row("SELECT ts FROM clocks WHERE doc_id = ?1", [doc_id], |row| row.get(0))
        .optional()
        .context("failed to read doc clock")?;
    let now = now_ms();
    Ok(match clock {
        Some(ts) => now.max(ts + 1),
        None => now,
    })
}

fn advance_clock(conn: &Connection, doc_id: &str, ts: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO clocks (doc_id, ts) VALUES (?1, ?2)
         ON CONFLICT(doc_id) DO UPDATE SET ts = excluded.ts WHERE excluded.ts > clocks.ts",
        params![doc_id, ts],
    )
    .with_context(|| format!("failed to advance clock for doc `{doc_id}`"))?;
    Ok(())
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply doc store migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    const EXPECTED_TABLES: &[&str] = &["schema_migrations", "updates", "snapshots", "clocks", "blobs"];

    fn open_db(dir: &tempfile::TempDir) -> DocDb {
        let db = DocDb::new(dir.path().join("ws-test.db"));
        db.connect().expect("doc db should connect");
        db
    }

    #[test]
    fn connect_creates_schema_and_records_latest_migration() {
        let dir = tempdir().expect("temp dir should be created");
        let db = open_db(&dir);

        for table in EXPECTED_TABLES {
            let exists = db
                .with_conn(|conn| {
                    conn.query_row(
                        "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                        [table],
                        |row| row.get::<_, i64>(0),
                    )
                    .context("table existence query should succeed")
                })
                .expect("table existence query should succeed");
            assert_eq!(exists, 1, "expected `{table}` table to exist");
        }

        assert_eq!(db.schema_version().expect("schema version should be readable"), 2);
    }

    #[test]
    fn connect_twice_is_idempotent() {
        let dir = tempdir().expect("temp dir should be created");
        let db = open_db(&dir);
        db.connect().expect("second connect should be a no-op");
        assert!(db.is_connected());
    }

    #[test]
    fn data_methods_require_a_connection() {
        let dir = tempdir().expect("temp dir should be created");
        let db = DocDb::new(dir.path().join("ws-test.db"));
        assert!(db.push_updates("d1", &[vec![1]]).is_err());

        db.connect().expect("doc db should connect");
        db.push_updates("d1", &[vec![1]]).expect("push should succeed while connected");

        db.close();
        assert!(db.get_doc_updates("d1").is_err());
    }

    #[test]
    fn push_assigns_strictly_increasing_timestamps() {
        let dir = tempdir().expect("temp dir should be created");
        let db = open_db(&dir);

        assert_eq!(db.push_updates("d1", &[vec![1], vec![2]]).expect("push should succeed"), 2);
        assert_eq!(db.push_updates("d1", &[vec![3]]).expect("push should succeed"), 3);

        let updates = db.get_doc_updates("d1").expect("pending updates should be readable");
        assert_eq!(updates.len(), 3);
        assert_eq!(
            updates.iter().map(|u| u.bin.clone()).collect::<Vec<_>>(),
            vec![vec![1], vec![2], vec![3]],
            "updates should come back in push order"
        );
        for pair in updates.windows(2) {
            assert!(
                pair[0].timestamp < pair[1].timestamp,
                "timestamps should be strictly increasing"
            );
        }
    }

    #[test]
    fn snapshot_guard_rejects_older_timestamps() {
        let dir = tempdir().expect("temp dir should be created");
        let db = open_db(&dir);

        assert!(db.set_doc_snapshot("d1", b"newer", 100).expect("write should succeed"));
        assert!(
            !db.set_doc_snapshot("d1", b"older", 99).expect("rejected write should not error"),
            "older timestamp should be rejected"
        );

        let (data, ts) = db
            .get_doc_snapshot("d1")
            .expect("snapshot should be readable")
            .expect("snapshot should exist");
        assert_eq!(data, b"newer");
        assert_eq!(ts, 100);

        // Equal timestamps are "not older" and re-apply.
        assert!(db.set_doc_snapshot("d1", b"same-ts", 100).expect("write should succeed"));
    }

    #[test]
    fn mark_updates_merged_is_idempotent() {
        let dir = tempdir().expect("temp dir should be created");
        let db = open_db(&dir);

        db.push_updates("d1", &[vec![1], vec![2]]).expect("push should succeed");
        let timestamps: Vec<i64> = db
            .get_doc_updates("d1")
            .expect("pending updates should be readable")
            .iter()
            .map(|u| u.timestamp)
            .collect();

        assert_eq!(db.mark_updates_merged("d1", &timestamps).expect("merge should succeed"), 2);
        assert_eq!(
            db.mark_updates_merged("d1", &timestamps).expect("repeat merge should succeed"),
            0,
            "second merge of the same rows should remove nothing"
        );
        assert_eq!(db.pending_update_count("d1").expect("count should be readable"), 0);
    }

    #[test]
    fn clocks_filter_docs_touched_after() {
        let dir = tempdir().expect("temp dir should be created");
        let db = open_db(&dir);

        db.set_doc_snapshot("a", b"a", 1_000).expect("write should succeed");
        db.set_doc_snapshot("b", b"b", 2_000).expect("write should succeed");

        let all = db.get_doc_clocks(None).expect("clocks should be readable");
        assert_eq!(all.len(), 2);

        let recent = db.get_doc_clocks(Some(1_500)).expect("clocks should be readable");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].doc_id, "b");

        let none = db.get_doc_clocks(Some(2_000)).expect("clocks should be readable");
        assert!(none.is_empty(), "filter is strictly-after");
    }

    #[test]
    fn delete_doc_removes_all_rows() {
        let dir = tempdir().expect("temp dir should be created");
        let db = open_db(&dir);

        db.push_updates("d1", &[vec![1]]).expect("push should succeed");
        db.set_doc_snapshot("d1", b"snap", 100).expect("write should succeed");
        db.delete_doc("d1").expect("delete should succeed");

        assert!(db.get_doc_updates("d1").expect("query should succeed").is_empty());
        assert!(db.get_doc_snapshot("d1").expect("query should succeed").is_none());
        assert!(db.get_doc_clocks(None).expect("query should succeed").is_empty());
    }

    #[test]
    fn blob_round_trip_and_listing() {
        let dir = tempdir().expect("temp dir should be created");
        let db = open_db(&dir);

        db.put_blob("k2", b"beta").expect("blob write should succeed");
        db.put_blob("k1", b"alpha").expect("blob write should succeed");

        assert_eq!(
            db.get_blob("k1").expect("blob should be readable").as_deref(),
            Some(b"alpha".as_slice())
        );
        assert_eq!(db.blob_keys().expect("keys should be readable"), vec!["k1", "k2"]);
        assert!(db.delete_blob("k1").expect("delete should succeed"));
        assert!(!db.delete_blob("k1").expect("repeat delete should succeed"));
    }

    #[test]
    fn destroy_removes_store_files() {
        let dir = tempdir().expect("temp dir should be created");
        let db = open_db(&dir);
        db.push_updates("d1", &[vec![1]]).expect("push should succeed");

        let path = db.path().to_path_buf();
        assert!(path.exists());
        db.destroy().expect("destroy should succeed");
        assert!(!path.exists(), "store file should be gone after destroy");
    }
}
