//! Replicated operation model.
//!
//! Every synced mutation is captured as a row-scoped operation tagged with
//! the clock reading that produced it. Operations are the unit of exchange
//! between peers; replaying the same set in any order converges because
//! application is guarded by last-write-wins on the clock.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;
use crate::sql::SqlValue;

/// Column name -> value, ordered so serialization is canonical.
pub type Row = BTreeMap<String, SqlValue>;

/// One row-scoped mutation.
///
/// `pk` always holds exactly the table's primary-key columns. For updates,
/// `values` holds only the SET columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Insert {
        hlc: Hlc,
        table: String,
        pk: Row,
        values: Row,
    },
    Update {
        hlc: Hlc,
        table: String,
        pk: Row,
        values: Row,
    },
    Delete {
        hlc: Hlc,
        table: String,
        pk: Row,
    },
}

impl Operation {
    pub fn hlc(&self) -> &Hlc {
        match self {
            Operation::Insert { hlc, .. }
            | Operation::Update { hlc, .. }
            | Operation::Delete { hlc, .. } => hlc,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Operation::Insert { table, .. }
            | Operation::Update { table, .. }
            | Operation::Delete { table, .. } => table,
        }
    }

    pub fn pk(&self) -> &Row {
        match self {
            Operation::Insert { pk, .. }
            | Operation::Update { pk, .. }
            | Operation::Delete { pk, .. } => pk,
        }
    }

    /// Sortable log key: the string form of the operation's clock reading.
    pub fn version(&self) -> String {
        self.hlc().to_string()
    }

    /// Identity of the row this operation targets, canonical across peers.
    ///
    /// `pk` is a BTreeMap, so the JSON key order is deterministic.
    pub fn row_key(&self) -> String {
        let pk = serde_json::to_string(self.pk()).unwrap_or_default();
        format!("{}\u{1f}{}", self.table(), pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hlc(ts: u64) -> Hlc {
        Hlc {
            ts,
            counter: 0,
            node_id: "n1".into(),
        }
    }

    #[test]
    fn wire_shape_is_type_tagged() {
        let op = Operation::Delete {
            hlc: hlc(5),
            table: "notes".into(),
            pk: Row::from([("id".to_owned(), SqlValue::from("n1"))]),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["table"], "notes");
        assert_eq!(json["pk"]["id"], "n1");
        assert_eq!(json["hlc"]["nodeId"], "n1");
    }

    #[test]
    fn row_key_ignores_operation_kind_and_clock() {
        let pk = Row::from([("id".to_owned(), SqlValue::from("x"))]);
        let a = Operation::Insert {
            hlc: hlc(1),
            table: "t".into(),
            pk: pk.clone(),
            values: Row::new(),
        };
        let b = Operation::Delete {
            hlc: hlc(9),
            table: "t".into(),
            pk,
        };
        assert_eq!(a.row_key(), b.row_key());
    }

    #[test]
    fn row_key_separates_tables() {
        let pk = Row::from([("id".to_owned(), SqlValue::from("x"))]);
        let a = Operation::Delete {
            hlc: hlc(1),
            table: "t1".into(),
            pk: pk.clone(),
        };
        let b = Operation::Delete {
            hlc: hlc(1),
            table: "t2".into(),
            pk,
        };
        assert_ne!(a.row_key(), b.row_key());
    }
}
