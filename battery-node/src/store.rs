//! Durable node store.
//!
//! One SQLite file per database name holding three things: the append-only
//! operation log keyed by version string, a single slot for the latest
//! binary database snapshot, and a small meta map. SQLite's binary TEXT
//! collation gives the log its order for free; version strings are built to
//! sort correctly under it.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::Result;
use crate::op::Operation;

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store for `name` under `dir`.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.db"));
        let conn = Connection::open(&path)?;
        info!(path = %path.display(), "store opened");
        Self::init(conn)
    }

    /// Ephemeral store for tests and throwaway nodes.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS operations (
                 version TEXT PRIMARY KEY,
                 payload TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS snapshot (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 data BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS meta (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }

    /// Append one operation under its version key. Re-appending the same
    /// version overwrites the identical payload, so replays are harmless.
    pub fn append(&self, op: &Operation) -> Result<()> {
        let payload = serde_json::to_string(op)?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO operations (version, payload) VALUES (?1, ?2)
             ON CONFLICT(version) DO UPDATE SET payload = excluded.payload",
        )?;
        stmt.execute(params![op.version(), payload])?;
        Ok(())
    }

    /// Every operation with version strictly greater than `cursor`, in
    /// version order. `None` yields the whole log.
    pub fn since(&self, cursor: Option<&str>) -> Result<Vec<Operation>> {
        let mut out = Vec::new();
        match cursor {
            Some(cursor) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT payload FROM operations WHERE version > ?1 ORDER BY version",
                )?;
                let mut rows = stmt.query(params![cursor])?;
                while let Some(row) = rows.next()? {
                    let payload: String = row.get(0)?;
                    out.push(serde_json::from_str(&payload)?);
                }
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare_cached("SELECT payload FROM operations ORDER BY version")?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    let payload: String = row.get(0)?;
                    out.push(serde_json::from_str(&payload)?);
                }
            }
        }
        Ok(out)
    }

    /// Whether a version key is present in the log.
    pub fn contains(&self, version: &str) -> Result<bool> {
        let n: u64 = self.conn.query_row(
            "SELECT count(*) FROM operations WHERE version = ?1",
            params![version],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn count(&self) -> Result<u64> {
        let n: u64 = self
            .conn
            .query_row("SELECT count(*) FROM operations", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Greatest version key in the log.
    pub fn latest_version(&self) -> Result<Option<String>> {
        let v: Option<String> =
            self.conn
                .query_row("SELECT max(version) FROM operations", [], |row| row.get(0))?;
        Ok(v)
    }

    pub fn put_snapshot(&self, bytes: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO snapshot (id, data) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            params![bytes],
        )?;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Option<Vec<u8>>> {
        let data = self
            .conn
            .query_row("SELECT data FROM snapshot WHERE id = 1", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(data)
    }

    pub fn put_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }
}
