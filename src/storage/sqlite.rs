//! `SQLite` backend: schema, pragmas, and migrations.

use crate::model::types::{DATETIME_FORMAT, DemoMetadata};
use crate::storage::MetadataStore;
use anyhow::{Context, Result, anyhow};
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

const SCHEMA_VERSION: i64 = 2;

const MIGRATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS demos (
    demo_id TEXT PRIMARY KEY,
    server TEXT NOT NULL,
    filepath TEXT NOT NULL,
    map TEXT NOT NULL,
    datetime TEXT NOT NULL
);
";

// Filename becomes a first-class column so (server, filename) can be unique.
// Databases written before this version get it backfilled from filepath.
const MIGRATION_V2: &str = r"
ALTER TABLE demos ADD COLUMN filename TEXT NOT NULL DEFAULT '';
ALTER TABLE demos ADD COLUMN created_at INTEGER NOT NULL DEFAULT 0;
";

const MIGRATION_V2_INDEXES: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_demos_server_filename ON demos(server, filename);
CREATE INDEX IF NOT EXISTS idx_demos_datetime ON demos(datetime DESC);
";

const DEMO_COLUMNS: &str = "demo_id, server, filename, filepath, map, datetime";

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating db directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path.display()))?;

        apply_pragmas(&mut conn)?;
        init_meta(&mut conn)?;
        migrate(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT value FROM meta WHERE key='schema_version'",
                [],
                |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
            )
            .optional()?
            .ok_or_else(|| anyhow!("schema_version missing"))
    }

    pub fn get_demo(&self, demo_id: &str) -> Result<Option<DemoMetadata>> {
        let sql = format!("SELECT {DEMO_COLUMNS} FROM demos WHERE demo_id = ?");
        Ok(self
            .conn
            .query_row(&sql, params![demo_id], demo_from_row)
            .optional()?)
    }

    pub fn list_demos_for_server(&self, server: &str) -> Result<Vec<DemoMetadata>> {
        let sql = format!(
            "SELECT {DEMO_COLUMNS} FROM demos WHERE server = ? ORDER BY datetime DESC, filename"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![server], demo_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_demos(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM demos", [], |r| r.get(0))?)
    }

    pub fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

impl MetadataStore for SqliteStorage {
    /// A demo whose (server, filename) is already indexed keeps its row
    /// and existing id.
    fn insert_batch(&mut self, demos: &[DemoMetadata]) -> Result<Vec<String>> {
        if demos.is_empty() {
            return Ok(Vec::new());
        }

        let now = Self::now_millis();
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(demos.len());
        {
            let mut insert = tx.prepare(
                "INSERT INTO demos(demo_id, server, filename, filepath, map, datetime, created_at)
                 VALUES(?,?,?,?,?,?,?)
                 ON CONFLICT(server, filename) DO NOTHING",
            )?;
            let mut existing = tx.prepare(
                "SELECT demo_id FROM demos WHERE server = ? AND filename = ?",
            )?;

            for demo in demos {
                let demo_id = uuid::Uuid::new_v4().to_string();
                let inserted = insert.execute(params![
                    &demo_id,
                    &demo.server,
                    &demo.filename,
                    demo.filepath.to_string_lossy(),
                    &demo.map,
                    demo.datetime(),
                    now,
                ])?;
                if inserted == 1 {
                    ids.push(demo_id);
                } else {
                    let id: String = existing
                        .query_row(params![&demo.server, &demo.filename], |r| r.get(0))?;
                    tracing::debug!(
                        server = %demo.server,
                        file = %demo.filename,
                        demo_id = %id,
                        "demo already indexed"
                    );
                    ids.push(id);
                }
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    fn list_demos(&self) -> Result<Vec<DemoMetadata>> {
        let sql = format!(
            "SELECT {DEMO_COLUMNS} FROM demos ORDER BY datetime DESC, server, filename"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], demo_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn demo_from_row(row: &Row<'_>) -> rusqlite::Result<DemoMetadata> {
    let filepath = PathBuf::from(row.get::<_, String>(3)?);
    let mut filename: String = row.get(2)?;
    if filename.is_empty() {
        filename = basename_of(&filepath);
    }
    let datetime: String = row.get(5)?;
    let captured_at = NaiveDateTime::parse_from_str(&datetime, DATETIME_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(DemoMetadata {
        id: Some(row.get(0)?),
        server: row.get(1)?,
        filename,
        filepath,
        map: row.get(4)?,
        captured_at,
    })
}

fn basename_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn apply_pragmas(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        ",
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

fn init_meta(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?;

    if existing.is_none() {
        // A demos table without a meta row predates schema tracking and
        // has the V1 layout.
        let legacy: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='demos')",
            [],
            |r| r.get(0),
        )?;
        let start = if legacy { "1" } else { "0" };
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', ?)",
            params![start],
        )?;
    }

    Ok(())
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let current: i64 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?
        .unwrap_or(0);

    if current == SCHEMA_VERSION {
        return Ok(());
    }
    if current > SCHEMA_VERSION {
        return Err(anyhow!(
            "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
        ));
    }

    let tx = conn.transaction()?;

    if current < 1 {
        tx.execute_batch(MIGRATION_V1)?;
    }
    if current < 2 {
        tx.execute_batch(MIGRATION_V2)?;
        backfill_filenames(&tx)?;
        drop_duplicate_demos(&tx)?;
        tx.execute_batch(MIGRATION_V2_INDEXES)?;
    }

    tx.execute(
        "UPDATE meta SET value = ? WHERE key = 'schema_version'",
        params![SCHEMA_VERSION.to_string()],
    )?;
    tx.commit()?;

    info!(from = current, to = SCHEMA_VERSION, "migrated demo database");
    Ok(())
}

fn backfill_filenames(tx: &rusqlite::Transaction<'_>) -> Result<()> {
    let rows: Vec<(String, String)> = {
        let mut stmt = tx.prepare("SELECT demo_id, filepath FROM demos WHERE filename = ''")?;
        let mapped = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        mapped.collect::<rusqlite::Result<Vec<_>>>()?
    };
    let mut update = tx.prepare("UPDATE demos SET filename = ? WHERE demo_id = ?")?;
    for (demo_id, filepath) in rows {
        update.execute(params![basename_of(Path::new(&filepath)), demo_id])?;
    }
    Ok(())
}

/// Keep the first row per (server, filename) so the unique index can be
/// built over tables written without it.
fn drop_duplicate_demos(tx: &rusqlite::Transaction<'_>) -> Result<()> {
    let dropped = tx.execute(
        "DELETE FROM demos WHERE rowid NOT IN (
             SELECT MIN(rowid) FROM demos GROUP BY server, filename
         )",
        [],
    )?;
    if dropped > 0 {
        tracing::warn!(dropped, "removed duplicate demo rows before indexing");
    }
    Ok(())
}
