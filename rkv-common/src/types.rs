//! # Row and Column Types
//!
//! Core data types shared by the client, the engine and the wire protocol.
//!
//! ## Design Principles
//!
//! 1. **Wire vs. Logical**: `WireRow` carries raw cell bytes exactly as stored;
//!    `Row` is the caller-facing shape (column name -> string value).
//!
//! 2. **Qualified Names**: Every stored column is `family:qualifier`. A bare
//!    name is shorthand for the default family `d`.
//!
//! 3. **Ordered Maps**: Rows and columns use `BTreeMap` so iteration order is
//!    the store's lexicographic order on both sides of the wire.
//!
//! ## Layout Example
//!
//! ```text
//! WireRow {
//!   row: "ROW|1",
//!   columns: {
//!     "d:foo"   -> WireCell { value: b"bar", timestamp: 7 },
//!     "inc:hits"-> WireCell { value: 42i64.to_be_bytes(), timestamp: 9 },
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Family used when a column name carries no `family:` part.
pub const DEFAULT_FAMILY: &str = "d";

/// Family whose cells hold big-endian `i64` counters.
pub const COUNTER_FAMILY: &str = "inc";

/// Separator between family and qualifier.
pub const FAMILY_SEPARATOR: char = ':';

/// Column name split into family and qualifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnName {
    pub family: String,
    pub qualifier: String,
}

impl ColumnName {
    /// Parses `family:qualifier`, defaulting the family for a bare name.
    ///
    /// Only the first separator splits; the qualifier may itself contain `:`.
    ///
    /// # Examples
    /// ```rust
    /// use rkv_common::ColumnName;
    ///
    /// let col = ColumnName::parse("f:name");
    /// assert_eq!(col.to_string(), "f:name");
    ///
    /// let bare = ColumnName::parse("name");
    /// assert_eq!(bare.to_string(), "d:name");
    /// ```
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(FAMILY_SEPARATOR) {
            Some((family, qualifier)) if !family.is_empty() => ColumnName {
                family: family.to_string(),
                qualifier: qualifier.to_string(),
            },
            Some((_, qualifier)) => ColumnName {
                family: DEFAULT_FAMILY.to_string(),
                qualifier: qualifier.to_string(),
            },
            None => ColumnName {
                family: DEFAULT_FAMILY.to_string(),
                qualifier: raw.to_string(),
            },
        }
    }

    /// Returns true for counter cells.
    #[inline]
    pub fn is_counter(&self) -> bool {
        self.family == COUNTER_FAMILY
    }
}

impl fmt::Display for ColumnName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.family, FAMILY_SEPARATOR, self.qualifier)
    }
}

/// Splits a stored column key into `(family, qualifier)` without allocating.
///
/// Keys without a separator are treated as a whole family.
pub fn split_column(key: &str) -> (&str, &str) {
    key.split_once(FAMILY_SEPARATOR).unwrap_or((key, ""))
}

/// One stored cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCell {
    /// Raw value bytes.
    pub value: Vec<u8>,
    /// Write timestamp assigned by the backend.
    pub timestamp: i64,
}

/// Row as transferred on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRow {
    /// Row key.
    pub row: String,
    /// Cells keyed by `family:qualifier`.
    pub columns: BTreeMap<String, WireCell>,
}

/// Single column write or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Target column (`family:qualifier`).
    pub column: String,
    /// Value to store; ignored for deletes.
    #[serde(default)]
    pub value: Vec<u8>,
    /// Deletes the column instead of writing it.
    #[serde(default)]
    pub is_delete: bool,
}

impl Mutation {
    pub fn put(column: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Mutation {
            column: column.into(),
            value: value.into(),
            is_delete: false,
        }
    }

    pub fn delete(column: impl Into<String>) -> Self {
        Mutation {
            column: column.into(),
            value: Vec::new(),
            is_delete: true,
        }
    }
}

/// Mutations for one row inside a multi-row write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMutation {
    pub row: String,
    pub mutations: Vec<Mutation>,
}

/// Caller-facing row: key plus decoded column values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub rowkey: String,
    pub columns: BTreeMap<String, String>,
}

impl Row {
    /// Returns the value of a decoded column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.get(column).map(String::as_str)
    }

    /// Returns true if no columns survived decoding/filtering.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_qualified_column() {
        let col = ColumnName::parse("f:baz");
        assert_eq!(col.family, "f");
        assert_eq!(col.qualifier, "baz");
        assert!(!col.is_counter());
    }

    #[test]
    fn parse_defaults_family() {
        let col = ColumnName::parse("baz");
        assert_eq!(col.family, DEFAULT_FAMILY);
        assert_eq!(col.qualifier, "baz");

        let empty_family = ColumnName::parse(":baz");
        assert_eq!(empty_family.to_string(), "d:baz");
    }

    #[test]
    fn parse_keeps_extra_separators_in_qualifier() {
        let col = ColumnName::parse("d:a:b");
        assert_eq!(col.qualifier, "a:b");
    }

    #[test]
    fn split_column_without_separator() {
        assert_eq!(split_column("d:foo"), ("d", "foo"));
        assert_eq!(split_column("d"), ("d", ""));
    }

    #[test]
    fn counter_family_detected() {
        assert!(ColumnName::parse("inc:hits").is_counter());
    }
}
