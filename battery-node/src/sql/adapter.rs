//! SQLite adapter.
//!
//! Owns the node's working database (in memory; durability comes from the
//! snapshot slot in the store) and everything that touches it: statement
//! execution, schema introspection, binary snapshot/load, and deterministic
//! application of remote operations.
//!
//! The adapter is strictly single-threaded; the engine serializes access.

use std::collections::HashMap;
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::error::Result;
use crate::op::Operation;
use crate::sql::SqlValue;

/// Introspected shape of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub columns: Vec<String>,
    /// Declared primary-key columns in key order. Empty means the table
    /// cannot be replicated.
    pub pk_columns: Vec<String>,
}

/// Result of one statement execution.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub changes: u64,
}

pub struct SqlAdapter {
    conn: Connection,
    /// Lazily built table map, dropped on DDL.
    schema: Option<HashMap<String, TableSchema>>,
}

impl SqlAdapter {
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            schema: None,
        })
    }

    /// Run one statement. Statements that produce columns are read fully;
    /// everything else reports its change count.
    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<ExecResult> {
        let mut stmt = self.conn.prepare(sql)?;
        let bound = params_from_iter(params.iter().map(rusqlite::types::Value::from));
        if stmt.column_count() > 0 {
            let columns: Vec<String> =
                stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut out = Vec::new();
            let mut rows = stmt.query(bound)?;
            while let Some(row) = rows.next()? {
                let mut record = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    record.push(SqlValue::from(row.get_ref(i)?));
                }
                out.push(record);
            }
            Ok(ExecResult {
                columns,
                rows: out,
                changes: 0,
            })
        } else {
            let changes = stmt.execute(bound)? as u64;
            Ok(ExecResult {
                columns: Vec::new(),
                rows: Vec::new(),
                changes,
            })
        }
    }

    /// Drop the cached schema; the next lookup re-introspects.
    pub fn invalidate_schema(&mut self) {
        self.schema = None;
    }

    pub fn table_schema(&mut self, table: &str) -> Result<Option<TableSchema>> {
        Ok(self.schema()?.get(table).cloned())
    }

    pub fn schema(&mut self) -> Result<&HashMap<String, TableSchema>> {
        if self.schema.is_none() {
            self.schema = Some(self.introspect()?);
        }
        Ok(self.schema.as_ref().expect("schema cache just populated"))
    }

    fn introspect(&self) -> Result<HashMap<String, TableSchema>> {
        let mut tables = HashMap::new();
        let names: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for name in names {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA table_info({})", quote_ident(&name)))?;
            let mut columns = Vec::new();
            // (pk position, column) pairs; position 0 means not part of the key
            let mut pk = Vec::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let column: String = row.get("name")?;
                let pk_pos: i64 = row.get("pk")?;
                if pk_pos > 0 {
                    pk.push((pk_pos, column.clone()));
                }
                columns.push(column);
            }
            pk.sort_by_key(|(pos, _)| *pos);
            tables.insert(
                name,
                TableSchema {
                    columns,
                    pk_columns: pk.into_iter().map(|(_, c)| c).collect(),
                },
            );
        }
        Ok(tables)
    }

    /// Serialize the full database to a binary SQLite image.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let tmp = tempfile::NamedTempFile::new()?;
        {
            let mut dst = Connection::open(tmp.path())?;
            let backup = Backup::new(&self.conn, &mut dst)?;
            backup.run_to_completion(64, Duration::from_millis(0), None)?;
        }
        Ok(std::fs::read(tmp.path())?)
    }

    /// Replace the database contents with a previously taken snapshot.
    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        std::fs::write(tmp.path(), bytes)?;
        let src = Connection::open(tmp.path())?;
        {
            let backup = Backup::new(&src, &mut self.conn)?;
            backup.run_to_completion(64, Duration::from_millis(0), None)?;
        }
        self.schema = None;
        Ok(())
    }

    /// Reflect a replicated operation into the database.
    ///
    /// Inserts use `INSERT OR REPLACE` so replays and resurrections are a
    /// plain upsert. Updates are upserts too: when the target row exists
    /// only the updated columns change, and when it does not the row is
    /// re-created from its key and the updated columns. Deletes address
    /// the row by its full key.
    pub fn apply(&mut self, op: &Operation) -> Result<()> {
        match op {
            Operation::Insert { table, values, .. } => {
                let cols: Vec<&str> = values.keys().map(String::as_str).collect();
                let sql = format!(
                    "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                    quote_ident(table),
                    cols.iter()
                        .map(|c| quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", "),
                    vec!["?"; cols.len()].join(", "),
                );
                let bound: Vec<rusqlite::types::Value> =
                    values.values().map(rusqlite::types::Value::from).collect();
                debug!(table, changes = 1, "apply insert");
                self.conn.execute(&sql, params_from_iter(bound))?;
            }
            Operation::Update {
                table, pk, values, ..
            } => {
                if values.is_empty() {
                    return Ok(());
                }
                // Updates arrive for rows the sender had but the receiver
                // may have deleted concurrently. A plain UPDATE would miss
                // silently and the peers would disagree on whether the row
                // exists, so an absent row is re-created from the key plus
                // the updated columns.
                let mut columns: Vec<&String> = pk.keys().collect();
                columns.extend(values.keys().filter(|c| !pk.contains_key(*c)));
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
                    quote_ident(table),
                    columns
                        .iter()
                        .map(|c| quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", "),
                    vec!["?"; columns.len()].join(", "),
                    pk.keys()
                        .map(|c| quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", "),
                    values
                        .keys()
                        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
                        .collect::<Vec<_>>()
                        .join(", "),
                );
                let bound: Vec<rusqlite::types::Value> = columns
                    .iter()
                    .map(|c| {
                        pk.get(*c)
                            .unwrap_or_else(|| &values[*c])
                            .into()
                    })
                    .collect();
                self.conn.execute(&sql, params_from_iter(bound))?;
            }
            Operation::Delete { table, pk, .. } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {}",
                    quote_ident(table),
                    pk.keys()
                        .map(|c| format!("{} = ?", quote_ident(c)))
                        .collect::<Vec<_>>()
                        .join(" AND "),
                );
                let bound: Vec<rusqlite::types::Value> =
                    pk.values().map(rusqlite::types::Value::from).collect();
                self.conn.execute(&sql, params_from_iter(bound))?;
            }
        }
        Ok(())
    }
}

/// Double-quote an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
