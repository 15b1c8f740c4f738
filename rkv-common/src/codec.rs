//! # Row Codec
//!
//! Purpose: Convert between caller column maps and wire mutations/rows.
//!
//! ## Rules
//! - Column keys are normalized to `family:qualifier` (family defaults to `d`).
//! - String values are stored as UTF-8; any other JSON value is stored as its
//!   JSON text. `null` and `""` are "empty" and produce no mutation.
//! - On decode, `inc` family cells are big-endian `i64` counters rendered in
//!   decimal; everything else is decoded as lossy UTF-8.
//! - Without `include_families`, decoded keys are bare qualifiers.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::types::{split_column, ColumnName, Mutation, Row, WireRow, COUNTER_FAMILY};

/// Returns true when a caller value should not be written.
pub fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Renders a caller value as stored bytes.
pub fn encode_value(value: &JsonValue) -> Vec<u8> {
    match value {
        JsonValue::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}

/// Builds one put mutation for a column.
pub fn encode_column(key: &str, value: &JsonValue) -> Mutation {
    Mutation::put(ColumnName::parse(key).to_string(), encode_value(value))
}

/// Builds put mutations for all non-empty columns of a row.
pub fn encode_columns(columns: &BTreeMap<String, JsonValue>) -> Vec<Mutation> {
    columns
        .iter()
        .filter(|(_, value)| !is_empty_value(value))
        .map(|(key, value)| encode_column(key, value))
        .collect()
}

/// Returns the qualified names of columns whose value is empty.
pub fn empty_columns(columns: &BTreeMap<String, JsonValue>) -> Vec<String> {
    columns
        .iter()
        .filter(|(_, value)| is_empty_value(value))
        .map(|(key, _)| ColumnName::parse(key).to_string())
        .collect()
}

/// Decodes a counter cell; short or long buffers decode as lossy text.
pub fn decode_counter(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(i64::from_be_bytes(raw))
}

/// Encodes a counter value as stored bytes.
pub fn encode_counter(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Converts a wire row into the caller-facing representation.
pub fn decode_row(row: WireRow, include_families: bool) -> Row {
    let mut columns = BTreeMap::new();
    for (key, cell) in row.columns {
        let (family, qualifier) = split_column(&key);
        let value = if family == COUNTER_FAMILY {
            match decode_counter(&cell.value) {
                Some(counter) => counter.to_string(),
                None => String::from_utf8_lossy(&cell.value).into_owned(),
            }
        } else {
            String::from_utf8_lossy(&cell.value).into_owned()
        };

        let name = if include_families {
            key.clone()
        } else {
            qualifier.to_string()
        };
        columns.insert(name, value);
    }

    Row {
        rowkey: row.row,
        columns,
    }
}

/// Decodes a batch of wire rows, optionally dropping rows left without columns.
pub fn decode_rows(rows: Vec<WireRow>, include_families: bool, drop_empty: bool) -> Vec<Row> {
    rows.into_iter()
        .map(|row| decode_row(row, include_families))
        .filter(|row| !(drop_empty && row.is_empty()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WireCell;
    use serde_json::json;

    fn wire(row: &str, cells: &[(&str, &[u8])]) -> WireRow {
        WireRow {
            row: row.to_string(),
            columns: cells
                .iter()
                .map(|(k, v)| {
                    (
                        k.to_string(),
                        WireCell {
                            value: v.to_vec(),
                            timestamp: 1,
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn encode_skips_empty_and_stringifies() {
        let mut columns = BTreeMap::new();
        columns.insert("foo".to_string(), json!("bar"));
        columns.insert("f:num".to_string(), json!(5));
        columns.insert("obj".to_string(), json!({"a": 1}));
        columns.insert("empty".to_string(), json!(""));
        columns.insert("none".to_string(), JsonValue::Null);
        columns.insert("zero".to_string(), json!(0));

        let mutations = encode_columns(&columns);
        let by_column: BTreeMap<_, _> = mutations
            .iter()
            .map(|m| (m.column.as_str(), m.value.as_slice()))
            .collect();

        assert_eq!(by_column.len(), 4);
        assert_eq!(by_column["d:foo"], b"bar");
        assert_eq!(by_column["f:num"], b"5");
        assert_eq!(by_column["d:obj"], br#"{"a":1}"#);
        assert_eq!(by_column["d:zero"], b"0");
    }

    #[test]
    fn empty_columns_are_qualified() {
        let mut columns = BTreeMap::new();
        columns.insert("foo".to_string(), json!(""));
        columns.insert("f:bar".to_string(), JsonValue::Null);
        columns.insert("baz".to_string(), json!("x"));
        assert_eq!(empty_columns(&columns), vec!["d:foo", "f:bar"]);
    }

    #[test]
    fn decode_strips_families_by_default() {
        let row = decode_row(wire("r1", &[("d:foo", b"bar"), ("f:baz", b"qux")]), false);
        assert_eq!(row.rowkey, "r1");
        assert_eq!(row.get("foo"), Some("bar"));
        assert_eq!(row.get("baz"), Some("qux"));

        let row = decode_row(wire("r1", &[("d:foo", b"bar")]), true);
        assert_eq!(row.get("d:foo"), Some("bar"));
    }

    #[test]
    fn decode_counter_family() {
        let bytes = encode_counter(42);
        let row = decode_row(wire("r1", &[("inc:hits", &bytes)]), false);
        assert_eq!(row.get("hits"), Some("42"));

        let odd = decode_row(wire("r1", &[("inc:hits", b"abc")]), false);
        assert_eq!(odd.get("hits"), Some("abc"));
    }

    #[test]
    fn decode_rows_drops_empty_when_asked() {
        let rows = vec![wire("a", &[("d:x", b"1")]), wire("b", &[])];
        assert_eq!(decode_rows(rows.clone(), false, false).len(), 2);
        let kept = decode_rows(rows, false, true);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].rowkey, "a");
    }
}
