// Workspace registry: the global meta.db listing every known workspace.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use folio_common::{WorkspaceFlavour, WorkspaceMetadata};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE workspaces (
    id          TEXT PRIMARY KEY,
    flavour     TEXT NOT NULL,
    name        TEXT NULL,
    created_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// One row of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    pub metadata: WorkspaceMetadata,
    /// Display name, refreshed from the workspace's root document on open.
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The workspace list. Rows are identity only; workspace content lives in
/// each workspace's own store.
#[derive(Debug)]
pub struct WorkspaceList {
    conn: Mutex<Connection>,
}

impl WorkspaceList {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create meta.db parent directory `{}`", parent.display())
            })?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open meta.db at `{}`", path.display()))?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            ",
        )
        .context("failed to configure sqlite pragmas for meta.db")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Allocate an id and persist a new workspace row. The caller is
    /// responsible for initializing the workspace's own store afterwards.
    pub fn create(&self, flavour: WorkspaceFlavour) -> Result<WorkspaceMetadata> {
        let metadata = WorkspaceMetadata::new(Uuid::new_v4(), flavour);
        let conn = self.conn.lock().expect("workspace list lock should not be poisoned");
        conn.execute(
            "INSERT INTO workspaces (id, flavour, name, created_at) VALUES (?1, ?2, NULL, ?3)",
            params![metadata.id.to_string(), flavour.as_str(), Utc::now().to_rfc3339()],
        )
        .context("failed to insert workspace row")?;
        Ok(metadata)
    }

    /// Remove a workspace row. Returns whether it existed.
    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().expect("workspace list lock should not be poisoned");
        let removed = conn
            .execute("DELETE FROM workspaces WHERE id = ?1", [id.to_string()])
            .context("failed to delete workspace row")?;
        Ok(removed > 0)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<WorkspaceEntry>> {
        let conn = self.conn.lock().expect("workspace list lock should not be poisoned");
        let row = conn
            .query_row(
                "SELECT id, flavour, name, created_at FROM workspaces WHERE id = ?1",
                [id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to read workspace row")?;
        row.map(parse_entry).transpose()
    }

    /// Every registered workspace, oldest first.
    pub fn all(&self) -> Result<Vec<WorkspaceEntry>> {
        let conn = self.conn.lock().expect("workspace list lock should not be poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, flavour, name, created_at FROM workspaces
                 ORDER BY created_at ASC, id ASC",
            )
            .context("failed to prepare workspace listing")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("failed to query workspace rows")?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(parse_entry(row.context("failed to read workspace row")?)?);
        }
        Ok(entries)
    }

    /// Refresh the display name shown in listings. Returns whether the row
    /// exists.
    pub fn update_name(&self, id: Uuid, name: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("workspace list lock should not be poisoned");
        let updated = conn
            .execute(
                "UPDATE workspaces SET name = ?1 WHERE id = ?2",
                params![name, id.to_string()],
            )
            .context("failed to update workspace name")?;
        Ok(updated > 0)
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("workspace list lock should not be poisoned");
        current_schema_version(&conn)
    }
}

fn parse_entry(
    (id, flavour, name, created_at): (String, String, Option<String>, String),
) -> Result<WorkspaceEntry> {
    let id = Uuid::parse_str(&id).with_context(|| format!("invalid workspace id `{id}`"))?;
    let flavour = WorkspaceFlavour::parse(&flavour)
        .ok_or_else(|| anyhow!("unknown workspace flavour `{flavour}` in list"))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .with_context(|| format!("invalid workspace created_at `{created_at}`"))?
        .with_timezone(&Utc);
    Ok(WorkspaceEntry { metadata: WorkspaceMetadata::new(id, flavour), name, created_at })
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
            .with_context(|| format!("failed to apply meta.db migration v{version}"))?;
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
