//! Operation extraction from SQL mutations.
//!
//! Only the statement prefix is parsed: `INSERT [OR ...] INTO t (cols)`,
//! `UPDATE t SET ... [WHERE ...]`, `DELETE FROM t [WHERE ...]`. Anything the
//! prefix grammar does not recognize executes locally without producing
//! operations; replication is best effort by design here, local execution
//! never is.
//!
//! Parameter slicing is positional: an UPDATE's first `|SET|` parameters are
//! the new values, the remainder bind the WHERE clause.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::hlc::HlcClock;
use crate::op::{Operation, Row};
use crate::sql::adapter::{quote_ident, SqlAdapter};
use crate::sql::SqlValue;

/// Coarse statement classification by leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    Insert,
    Update,
    Delete,
    /// Schema-changing statement; invalidates the schema cache.
    Ddl,
    /// Reads and everything else; never replicated.
    Other,
}

pub fn classify(sql: &str) -> StatementClass {
    let first = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match first.as_str() {
        "insert" => StatementClass::Insert,
        "update" => StatementClass::Update,
        "delete" => StatementClass::Delete,
        "create" | "alter" | "drop" => StatementClass::Ddl,
        _ => StatementClass::Other,
    }
}

fn insert_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)^\s*INSERT\s+(?:OR\s+[A-Za-z]+\s+)?INTO\s+["`]?([A-Za-z_][A-Za-z0-9_]*)["`]?\s*\(([^)]*)\)"#)
            .expect("insert pattern compiles")
    })
}

fn update_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)^\s*UPDATE\s+["`]?([A-Za-z_][A-Za-z0-9_]*)["`]?\s+SET\s+(.*?)(?:\s+WHERE\s+(.*?))?\s*;?\s*$"#)
            .expect("update pattern compiles")
    })
}

fn delete_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)^\s*DELETE\s+FROM\s+["`]?([A-Za-z_][A-Za-z0-9_]*)["`]?(?:\s+WHERE\s+(.*?))?\s*;?\s*$"#)
            .expect("delete pattern compiles")
    })
}

fn set_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Only bare placeholders are extractable; `col = col + ?` would make
        // the positional values map silently wrong, so it disables extraction.
        Regex::new(r#"(?is)^\s*["`]?([A-Za-z_][A-Za-z0-9_]*)["`]?\s*=\s*\?\s*$"#)
            .expect("set item pattern compiles")
    })
}

/// Derive the operations a mutation implies, before the mutation runs.
///
/// Runs against the pre-state: UPDATE and DELETE enumerate the rows their
/// WHERE clause currently matches and emit one operation per row. Row
/// operations are stamped with successive clock readings taken back to
/// back, so a multi-row statement occupies one contiguous block of the log
/// while every entry keeps a unique key. Returns an empty vector for
/// anything that cannot or must not be replicated.
pub fn extract_ops(
    sql_adapter: &mut SqlAdapter,
    synced_tables: &HashSet<String>,
    sql: &str,
    params: &[SqlValue],
    clock: &mut HlcClock,
) -> Result<Vec<Operation>> {
    match classify(sql) {
        StatementClass::Insert => extract_insert(sql_adapter, synced_tables, sql, params, clock),
        StatementClass::Update => extract_update(sql_adapter, synced_tables, sql, params, clock),
        StatementClass::Delete => extract_delete(sql_adapter, synced_tables, sql, params, clock),
        _ => Ok(Vec::new()),
    }
}

/// Primary-key columns of `table`, or None when the table is not synced,
/// unknown, or keyless.
fn replicable_pk(
    sql_adapter: &mut SqlAdapter,
    synced_tables: &HashSet<String>,
    table: &str,
) -> Result<Option<Vec<String>>> {
    if !synced_tables.contains(table) {
        return Ok(None);
    }
    match sql_adapter.table_schema(table)? {
        Some(schema) if !schema.pk_columns.is_empty() => Ok(Some(schema.pk_columns)),
        _ => Ok(None),
    }
}

fn extract_insert(
    sql_adapter: &mut SqlAdapter,
    synced_tables: &HashSet<String>,
    sql: &str,
    params: &[SqlValue],
    clock: &mut HlcClock,
) -> Result<Vec<Operation>> {
    let Some(caps) = insert_re().captures(sql) else {
        debug!("insert does not match the extractable prefix form");
        return Ok(Vec::new());
    };
    let table = caps[1].to_owned();
    let Some(pk_columns) = replicable_pk(sql_adapter, synced_tables, &table)? else {
        return Ok(Vec::new());
    };

    let columns: Vec<String> = caps[2]
        .split(',')
        .map(|c| c.trim().trim_matches(['"', '`']).to_owned())
        .filter(|c| !c.is_empty())
        .collect();
    if columns.is_empty() || columns.len() != params.len() {
        // Literal VALUES or a partial bind; the positions cannot be trusted.
        debug!(table, "insert columns and parameters do not line up");
        return Ok(Vec::new());
    }

    let values: Row = columns
        .iter()
        .cloned()
        .zip(params.iter().cloned())
        .collect();
    // Every key column must be present, otherwise the row has no identity
    // to replicate under.
    if !pk_columns.iter().all(|c| values.contains_key(c)) {
        debug!(table, "insert omits part of the primary key");
        return Ok(Vec::new());
    }
    let pk: Row = pk_columns
        .iter()
        .map(|c| (c.clone(), values[c].clone()))
        .collect();

    Ok(vec![Operation::Insert {
        hlc: clock.now(),
        table,
        pk,
        values,
    }])
}

fn extract_update(
    sql_adapter: &mut SqlAdapter,
    synced_tables: &HashSet<String>,
    sql: &str,
    params: &[SqlValue],
    clock: &mut HlcClock,
) -> Result<Vec<Operation>> {
    let Some(caps) = update_re().captures(sql) else {
        debug!("update does not match the extractable prefix form");
        return Ok(Vec::new());
    };
    let table = caps[1].to_owned();
    let Some(pk_columns) = replicable_pk(sql_adapter, synced_tables, &table)? else {
        return Ok(Vec::new());
    };

    let mut set_columns = Vec::new();
    for item in caps[2].split(',') {
        match set_item_re().captures(item) {
            Some(c) => set_columns.push(c[1].to_owned()),
            None => {
                debug!(table, item, "SET expression is not a bare placeholder");
                return Ok(Vec::new());
            }
        }
    }
    if set_columns.len() > params.len() {
        debug!(table, "fewer parameters than SET columns");
        return Ok(Vec::new());
    }
    let (set_params, where_params) = params.split_at(set_columns.len());
    let where_clause = caps.get(3).map_or("1=1", |m| m.as_str());

    let rows = affected_rows(sql_adapter, &table, &pk_columns, where_clause, where_params)?;
    Ok(rows
        .into_iter()
        .map(|pk| Operation::Update {
            hlc: clock.now(),
            table: table.clone(),
            pk,
            values: set_columns
                .iter()
                .cloned()
                .zip(set_params.iter().cloned())
                .collect(),
        })
        .collect())
}

fn extract_delete(
    sql_adapter: &mut SqlAdapter,
    synced_tables: &HashSet<String>,
    sql: &str,
    params: &[SqlValue],
    clock: &mut HlcClock,
) -> Result<Vec<Operation>> {
    let Some(caps) = delete_re().captures(sql) else {
        debug!("delete does not match the extractable prefix form");
        return Ok(Vec::new());
    };
    let table = caps[1].to_owned();
    let Some(pk_columns) = replicable_pk(sql_adapter, synced_tables, &table)? else {
        return Ok(Vec::new());
    };
    let where_clause = caps.get(2).map_or("1=1", |m| m.as_str());

    let rows = affected_rows(sql_adapter, &table, &pk_columns, where_clause, params)?;
    Ok(rows
        .into_iter()
        .map(|pk| Operation::Delete {
            hlc: clock.now(),
            table: table.clone(),
            pk,
        })
        .collect())
}

/// Enumerate the key columns of every row the WHERE clause matches today.
fn affected_rows(
    sql_adapter: &mut SqlAdapter,
    table: &str,
    pk_columns: &[String],
    where_clause: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>> {
    let select = format!(
        "SELECT {} FROM {} WHERE {}",
        pk_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        quote_ident(table),
        where_clause,
    );
    let result = sql_adapter.execute(&select, params)?;
    Ok(result
        .rows
        .into_iter()
        .map(|row| {
            pk_columns
                .iter()
                .cloned()
                .zip(row.into_iter())
                .collect::<Row>()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (SqlAdapter, HashSet<String>, HlcClock) {
        let mut sql = SqlAdapter::open_in_memory().unwrap();
        sql.execute(
            "CREATE TABLE notes (id TEXT PRIMARY KEY, content TEXT, pinned INTEGER)",
            &[],
        )
        .unwrap();
        sql.execute("CREATE TABLE journal (line TEXT)", &[]).unwrap();
        let synced = HashSet::from(["notes".to_owned(), "journal".to_owned()]);
        (sql, synced, HlcClock::new("n1"))
    }

    #[test]
    fn insert_produces_one_op_with_pk_subset() {
        let (mut sql, synced, mut clock) = fixture();
        let ops = extract_ops(
            &mut sql,
            &synced,
            "INSERT INTO notes (id, content) VALUES (?, ?)",
            &[SqlValue::from("n1"), SqlValue::from("hello")],
            &mut clock,
        )
        .unwrap();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            Operation::Insert { table, pk, values, .. } => {
                assert_eq!(table, "notes");
                assert_eq!(pk.len(), 1);
                assert_eq!(pk["id"], SqlValue::from("n1"));
                assert_eq!(values["content"], SqlValue::from("hello"));
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn insert_or_replace_is_recognized() {
        let (mut sql, synced, mut clock) = fixture();
        let ops = extract_ops(
            &mut sql,
            &synced,
            "insert or replace into notes (id, content) values (?, ?)",
            &[SqlValue::from("n1"), SqlValue::from("x")],
            &mut clock,
        )
        .unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn insert_missing_pk_column_is_skipped() {
        let (mut sql, synced, mut clock) = fixture();
        let ops = extract_ops(
            &mut sql,
            &synced,
            "INSERT INTO notes (content) VALUES (?)",
            &[SqlValue::from("orphan")],
            &mut clock,
        )
        .unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn keyless_table_is_never_replicated() {
        let (mut sql, synced, mut clock) = fixture();
        let ops = extract_ops(
            &mut sql,
            &synced,
            "INSERT INTO journal (line) VALUES (?)",
            &[SqlValue::from("x")],
            &mut clock,
        )
        .unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn unsynced_table_is_skipped() {
        let (mut sql, _, mut clock) = fixture();
        let ops = extract_ops(
            &mut sql,
            &HashSet::new(),
            "INSERT INTO notes (id, content) VALUES (?, ?)",
            &[SqlValue::from("n1"), SqlValue::from("x")],
            &mut clock,
        )
        .unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn update_emits_one_op_per_matched_row() {
        let (mut sql, synced, mut clock) = fixture();
        for id in ["a", "b", "c"] {
            sql.execute(
                "INSERT INTO notes (id, content, pinned) VALUES (?, ?, ?)",
                &[SqlValue::from(id), SqlValue::from("v0"), SqlValue::Integer(1)],
            )
            .unwrap();
        }
        let ops = extract_ops(
            &mut sql,
            &synced,
            "UPDATE notes SET content = ? WHERE pinned = ?",
            &[SqlValue::from("v1"), SqlValue::Integer(1)],
            &mut clock,
        )
        .unwrap();
        assert_eq!(ops.len(), 3);
        // Readings are taken back to back: strictly increasing, unique keys.
        let versions: Vec<String> = ops.iter().map(Operation::version).collect();
        for pair in versions.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for op in &ops {
            match op {
                Operation::Update { values, .. } => {
                    assert_eq!(values.len(), 1);
                    assert_eq!(values["content"], SqlValue::from("v1"));
                }
                other => panic!("unexpected op {other:?}"),
            }
        }
    }

    #[test]
    fn update_without_where_touches_every_row() {
        let (mut sql, synced, mut clock) = fixture();
        for id in ["a", "b"] {
            sql.execute(
                "INSERT INTO notes (id, content) VALUES (?, ?)",
                &[SqlValue::from(id), SqlValue::from("v0")],
            )
            .unwrap();
        }
        let ops = extract_ops(
            &mut sql,
            &synced,
            "UPDATE notes SET content = ?",
            &[SqlValue::from("all")],
            &mut clock,
        )
        .unwrap();
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn computed_set_expression_disables_extraction() {
        let (mut sql, synced, mut clock) = fixture();
        sql.execute(
            "INSERT INTO notes (id, content, pinned) VALUES (?, ?, ?)",
            &[SqlValue::from("a"), SqlValue::from("v"), SqlValue::Integer(0)],
        )
        .unwrap();
        let ops = extract_ops(
            &mut sql,
            &synced,
            "UPDATE notes SET pinned = pinned + ? WHERE id = ?",
            &[SqlValue::Integer(1), SqlValue::from("a")],
            &mut clock,
        )
        .unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn delete_enumerates_rows_before_execution() {
        let (mut sql, synced, mut clock) = fixture();
        for id in ["a", "b"] {
            sql.execute(
                "INSERT INTO notes (id, content) VALUES (?, ?)",
                &[SqlValue::from(id), SqlValue::from("v")],
            )
            .unwrap();
        }
        let ops = extract_ops(
            &mut sql,
            &synced,
            "DELETE FROM notes WHERE id = ?",
            &[SqlValue::from("a")],
            &mut clock,
        )
        .unwrap();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            Operation::Delete { pk, .. } => assert_eq!(pk["id"], SqlValue::from("a")),
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn select_and_ddl_yield_nothing() {
        let (mut sql, synced, mut clock) = fixture();
        for stmt in ["SELECT * FROM notes", "CREATE TABLE other (id TEXT PRIMARY KEY)"] {
            let ops = extract_ops(&mut sql, &synced, stmt, &[], &mut clock).unwrap();
            assert!(ops.is_empty(), "{stmt} should not produce operations");
        }
    }

    #[test]
    fn classification_is_prefix_only() {
        assert_eq!(classify("  insert into t (a) values (?)"), StatementClass::Insert);
        assert_eq!(classify("UPDATE t SET a = ?"), StatementClass::Update);
        assert_eq!(classify("Delete from t"), StatementClass::Delete);
        assert_eq!(classify("CREATE TABLE t (a)"), StatementClass::Ddl);
        assert_eq!(classify("select 1"), StatementClass::Other);
        assert_eq!(classify(""), StatementClass::Other);
    }
}
