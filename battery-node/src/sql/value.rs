//! SQL-typed payload values.
//!
//! The JSON forms map straight onto SQL types: `null`, booleans, integers,
//! reals, and strings carry themselves; blobs travel as `{"$base64": "..."}`
//! so they survive the UTF-8 JSON framing.

use serde::{Deserialize, Serialize};

/// One column value inside an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Bytes {
        #[serde(rename = "$base64", with = "base64_str")]
        bytes: Vec<u8>,
    },
}

impl SqlValue {
    pub fn blob(bytes: impl Into<Vec<u8>>) -> SqlValue {
        SqlValue::Bytes {
            bytes: bytes.into(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_owned())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<rusqlite::types::ValueRef<'_>> for SqlValue {
    fn from(v: rusqlite::types::ValueRef<'_>) -> Self {
        use rusqlite::types::ValueRef;
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(r) => SqlValue::Real(r),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::blob(b),
        }
    }
}

impl From<&SqlValue> for rusqlite::types::Value {
    fn from(v: &SqlValue) -> Self {
        use rusqlite::types::Value;
        match v {
            SqlValue::Null => Value::Null,
            // SQLite has no boolean affinity; 0/1 is its convention.
            SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
            SqlValue::Integer(i) => Value::Integer(*i),
            SqlValue::Real(r) => Value::Real(*r),
            SqlValue::Text(t) => Value::Text(t.clone()),
            SqlValue::Bytes { bytes } => Value::Blob(bytes.clone()),
        }
    }
}

mod base64_str {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_json_forms() {
        assert_eq!(serde_json::to_string(&SqlValue::Null).unwrap(), "null");
        assert_eq!(serde_json::to_string(&SqlValue::Bool(true)).unwrap(), "true");
        assert_eq!(serde_json::to_string(&SqlValue::Integer(-3)).unwrap(), "-3");
        assert_eq!(
            serde_json::to_string(&SqlValue::Text("hi".into())).unwrap(),
            "\"hi\""
        );
    }

    #[test]
    fn blob_round_trips_through_base64() {
        let v = SqlValue::blob(vec![0u8, 1, 2, 255]);
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("$base64"));
        let back: SqlValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn string_stays_text_not_blob() {
        let back: SqlValue = serde_json::from_str("\"AAEC\"").unwrap();
        assert_eq!(back, SqlValue::Text("AAEC".into()));
    }
}
