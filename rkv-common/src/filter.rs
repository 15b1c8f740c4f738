//! # Filter Descriptors and Expression Grammar
//!
//! Purpose: Describe server-side row predicates, render them into a single
//! filter expression for the wire, and parse that expression back on the
//! backend.
//!
//! ## Grammar
//!
//! ```text
//! expr   := filter ( "AND" filter )*
//! filter := NAME "(" [ arg ( "," arg )* ] ")"
//! arg    := 'quoted text' | bare-token
//! ```
//!
//! Quotes inside quoted text are doubled (`'it''s'`).
//!
//! ## Supported filters
//!
//! | name                      | arguments |
//! |---------------------------|-----------|
//! | `SingleColumnValueFilter` | family, qualifier, comparator, `'binary:<value>'`, filter_if_missing, latest_version_only |
//! | `FirstKeyOnlyFilter`      | none |
//! | `KeyOnlyFilter`           | none |
//! | `DependentColumnFilter`   | family, qualifier |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::types::DEFAULT_FAMILY;

const BINARY_PREFIX: &str = "binary:";

/// Errors raised while building or parsing filters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("unknown filter type: {0}")]
    UnknownFilter(String),
    #[error("filter descriptor is missing a type")]
    MissingType,
    #[error("invalid arguments for {filter}: {reason}")]
    BadArguments { filter: String, reason: String },
    #[error("unexpected token in filter expression: {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of filter expression")]
    UnexpectedEnd,
    #[error("unterminated quoted string in filter expression")]
    UnterminatedQuote,
}

/// Binary comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Comparator {
    #[default]
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
}

impl Comparator {
    pub fn as_str(self) -> &'static str {
        match self {
            Comparator::Equal => "=",
            Comparator::NotEqual => "!=",
            Comparator::Less => "<",
            Comparator::LessOrEqual => "<=",
            Comparator::Greater => ">",
            Comparator::GreaterOrEqual => ">=",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "=" => Some(Comparator::Equal),
            "!=" => Some(Comparator::NotEqual),
            "<" => Some(Comparator::Less),
            "<=" => Some(Comparator::LessOrEqual),
            ">" => Some(Comparator::Greater),
            ">=" => Some(Comparator::GreaterOrEqual),
            _ => None,
        }
    }

    /// Evaluates `cell <op> operand` using byte-wise ordering.
    pub fn matches(self, cell: &[u8], operand: &[u8]) -> bool {
        let ord = cell.cmp(operand);
        match self {
            Comparator::Equal => ord.is_eq(),
            Comparator::NotEqual => ord.is_ne(),
            Comparator::Less => ord.is_lt(),
            Comparator::LessOrEqual => ord.is_le(),
            Comparator::Greater => ord.is_gt(),
            Comparator::GreaterOrEqual => ord.is_ge(),
        }
    }
}

fn default_family() -> String {
    DEFAULT_FAMILY.to_string()
}

fn default_true() -> bool {
    true
}

/// Server-side row predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FilterSpec {
    /// Keeps rows whose column compares true against `value`.
    SingleColumnValueFilter {
        #[serde(default = "default_family")]
        family: String,
        qualifier: String,
        #[serde(default)]
        comparator: Comparator,
        value: String,
        /// Drop rows that lack the column entirely.
        #[serde(default = "default_true", alias = "filterMissing")]
        filter_if_missing: bool,
        #[serde(default = "default_true", alias = "latest")]
        latest_version_only: bool,
    },
    /// Returns only the first cell of every row.
    FirstKeyOnlyFilter,
    /// Returns cells with empty values.
    KeyOnlyFilter,
    /// Keeps rows containing the column and only the cells written with it.
    DependentColumnFilter {
        #[serde(default = "default_family")]
        family: String,
        qualifier: String,
    },
}

impl FilterSpec {
    /// Equality filter on `family:qualifier` with default flags.
    pub fn column_equals(
        family: impl Into<String>,
        qualifier: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        FilterSpec::SingleColumnValueFilter {
            family: family.into(),
            qualifier: qualifier.into(),
            comparator: Comparator::Equal,
            value: value.into(),
            filter_if_missing: true,
            latest_version_only: true,
        }
    }

    /// Returns the filter name used in expressions.
    pub fn name(&self) -> &'static str {
        match self {
            FilterSpec::SingleColumnValueFilter { .. } => "SingleColumnValueFilter",
            FilterSpec::FirstKeyOnlyFilter => "FirstKeyOnlyFilter",
            FilterSpec::KeyOnlyFilter => "KeyOnlyFilter",
            FilterSpec::DependentColumnFilter { .. } => "DependentColumnFilter",
        }
    }

    /// Builds a descriptor from loosely-typed JSON.
    ///
    /// A descriptor without `type` but with `qualifier` and `value` is read as
    /// a `SingleColumnValueFilter`. Any other unknown type is rejected.
    pub fn from_json(value: JsonValue) -> Result<Self, FilterError> {
        let kind = match value.get("type") {
            Some(JsonValue::String(kind)) => kind.clone(),
            Some(other) => return Err(FilterError::UnknownFilter(other.to_string())),
            None => {
                if value.get("qualifier").is_some() && value.get("value").is_some() {
                    "SingleColumnValueFilter".to_string()
                } else {
                    return Err(FilterError::MissingType);
                }
            }
        };

        let mut value = value;
        if let JsonValue::Object(map) = &mut value {
            map.insert("type".to_string(), JsonValue::String(kind.clone()));
        }

        match kind.as_str() {
            "SingleColumnValueFilter"
            | "FirstKeyOnlyFilter"
            | "KeyOnlyFilter"
            | "DependentColumnFilter" => {
                serde_json::from_value(value).map_err(|err| FilterError::BadArguments {
                    filter: kind,
                    reason: err.to_string(),
                })
            }
            _ => Err(FilterError::UnknownFilter(kind)),
        }
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterSpec::SingleColumnValueFilter {
                family,
                qualifier,
                comparator,
                value,
                filter_if_missing,
                latest_version_only,
            } => write!(
                f,
                "SingleColumnValueFilter ({}, {}, {}, {}, {}, {})",
                quote(family),
                quote(qualifier),
                comparator.as_str(),
                quote(&format!("{BINARY_PREFIX}{value}")),
                filter_if_missing,
                latest_version_only
            ),
            FilterSpec::FirstKeyOnlyFilter => f.write_str("FirstKeyOnlyFilter ()"),
            FilterSpec::KeyOnlyFilter => f.write_str("KeyOnlyFilter ()"),
            FilterSpec::DependentColumnFilter { family, qualifier } => write!(
                f,
                "DependentColumnFilter ({}, {})",
                quote(family),
                quote(qualifier)
            ),
        }
    }
}

fn quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

/// Joins filters into one expression. Returns `None` for an empty list.
pub fn compose(filters: &[FilterSpec]) -> Option<String> {
    if filters.is_empty() {
        return None;
    }
    let parts: Vec<String> = filters.iter().map(ToString::to_string).collect();
    Some(parts.join(" AND "))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Quoted(String),
    Open,
    Close,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                text.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(other) => text.push(other),
                        None => return Err(FilterError::UnterminatedQuote),
                    }
                }
                tokens.push(Token::Quoted(text));
            }
            _ => {
                let mut word = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '(' | ')' | ',' | '\'') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(Token::Ident(word));
            }
        }
    }

    Ok(tokens)
}

/// Parses a filter expression produced by [`compose`].
pub fn parse(expression: &str) -> Result<Vec<FilterSpec>, FilterError> {
    let tokens = tokenize(expression)?;
    let mut iter = tokens.into_iter().peekable();
    let mut filters = Vec::new();

    if iter.peek().is_none() {
        return Ok(filters);
    }

    loop {
        let name = match iter.next() {
            Some(Token::Ident(name)) => name,
            Some(other) => return Err(FilterError::UnexpectedToken(format!("{other:?}"))),
            None => return Err(FilterError::UnexpectedEnd),
        };

        match iter.next() {
            Some(Token::Open) => {}
            Some(other) => return Err(FilterError::UnexpectedToken(format!("{other:?}"))),
            None => return Err(FilterError::UnexpectedEnd),
        }

        let mut args = Vec::new();
        loop {
            match iter.next() {
                Some(Token::Close) => break,
                Some(Token::Comma) if !args.is_empty() => {}
                Some(Token::Quoted(text)) | Some(Token::Ident(text)) => args.push(text),
                Some(other) => return Err(FilterError::UnexpectedToken(format!("{other:?}"))),
                None => return Err(FilterError::UnexpectedEnd),
            }
        }

        filters.push(build(&name, args)?);

        match iter.next() {
            None => break,
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("AND") => {}
            Some(other) => return Err(FilterError::UnexpectedToken(format!("{other:?}"))),
        }
    }

    Ok(filters)
}

fn bad(filter: &str, reason: impl Into<String>) -> FilterError {
    FilterError::BadArguments {
        filter: filter.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(filter: &str, raw: &str) -> Result<bool, FilterError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(bad(filter, format!("expected boolean, got {raw}"))),
    }
}

fn build(name: &str, args: Vec<String>) -> Result<FilterSpec, FilterError> {
    match name {
        "SingleColumnValueFilter" => {
            if args.len() != 4 && args.len() != 6 {
                return Err(bad(name, format!("expected 4 or 6 arguments, got {}", args.len())));
            }
            let comparator =
                Comparator::parse(&args[2]).ok_or_else(|| bad(name, format!("bad comparator {}", args[2])))?;
            let value = args[3]
                .strip_prefix(BINARY_PREFIX)
                .ok_or_else(|| bad(name, "only binary comparators are supported"))?
                .to_string();
            let (filter_if_missing, latest_version_only) = if args.len() == 6 {
                (parse_bool(name, &args[4])?, parse_bool(name, &args[5])?)
            } else {
                (false, true)
            };
            Ok(FilterSpec::SingleColumnValueFilter {
                family: args[0].clone(),
                qualifier: args[1].clone(),
                comparator,
                value,
                filter_if_missing,
                latest_version_only,
            })
        }
        "FirstKeyOnlyFilter" | "KeyOnlyFilter" => {
            if !args.is_empty() {
                return Err(bad(name, "takes no arguments"));
            }
            Ok(if name == "KeyOnlyFilter" {
                FilterSpec::KeyOnlyFilter
            } else {
                FilterSpec::FirstKeyOnlyFilter
            })
        }
        "DependentColumnFilter" => {
            if args.len() != 2 {
                return Err(bad(name, format!("expected 2 arguments, got {}", args.len())));
            }
            let mut args = args.into_iter();
            let family = args.next().unwrap_or_default();
            let qualifier = args.next().unwrap_or_default();
            Ok(FilterSpec::DependentColumnFilter { family, qualifier })
        }
        other => Err(FilterError::UnknownFilter(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_single_column_value_filter() {
        let filter = FilterSpec::column_equals("d", "foo", "bar");
        assert_eq!(
            filter.to_string(),
            "SingleColumnValueFilter ('d', 'foo', =, 'binary:bar', true, true)"
        );
    }

    #[test]
    fn compose_joins_with_and() {
        let expr = compose(&[FilterSpec::FirstKeyOnlyFilter, FilterSpec::KeyOnlyFilter]).unwrap();
        assert_eq!(expr, "FirstKeyOnlyFilter () AND KeyOnlyFilter ()");
        assert_eq!(compose(&[]), None);
    }

    #[test]
    fn parse_reverses_compose() {
        let filters = vec![
            FilterSpec::column_equals("d", "it's", "a 'quoted' value"),
            FilterSpec::FirstKeyOnlyFilter,
            FilterSpec::DependentColumnFilter {
                family: "d".into(),
                qualifier: "column5".into(),
            },
        ];
        let expr = compose(&filters).unwrap();
        assert_eq!(parse(&expr).unwrap(), filters);
    }

    #[test]
    fn parse_short_single_column_form() {
        let parsed = parse("SingleColumnValueFilter('d','foo',>=,'binary:b')").unwrap();
        assert_eq!(
            parsed,
            vec![FilterSpec::SingleColumnValueFilter {
                family: "d".into(),
                qualifier: "foo".into(),
                comparator: Comparator::GreaterOrEqual,
                value: "b".into(),
                filter_if_missing: false,
                latest_version_only: true,
            }]
        );
    }

    #[test]
    fn parse_rejects_unknown_and_malformed() {
        assert_eq!(
            parse("PrefixFilter ('ROW')"),
            Err(FilterError::UnknownFilter("PrefixFilter".into()))
        );
        assert_eq!(parse("KeyOnlyFilter ("), Err(FilterError::UnexpectedEnd));
        assert_eq!(parse("KeyOnlyFilter ('x"), Err(FilterError::UnterminatedQuote));
        assert!(matches!(
            parse("KeyOnlyFilter () OR FirstKeyOnlyFilter ()"),
            Err(FilterError::UnexpectedToken(_))
        ));
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn from_json_accepts_known_types() {
        let filter = FilterSpec::from_json(json!({"type": "KeyOnlyFilter"})).unwrap();
        assert_eq!(filter, FilterSpec::KeyOnlyFilter);

        let filter = FilterSpec::from_json(json!({
            "type": "DependentColumnFilter",
            "family": "d",
            "qualifier": "column5"
        }))
        .unwrap();
        assert_eq!(filter.name(), "DependentColumnFilter");
    }

    #[test]
    fn from_json_infers_single_column_value() {
        let filter = FilterSpec::from_json(json!({
            "family": "d",
            "qualifier": "foo",
            "comparator": "=",
            "value": "bar",
            "filterMissing": false
        }))
        .unwrap();
        match filter {
            FilterSpec::SingleColumnValueFilter {
                filter_if_missing,
                latest_version_only,
                ..
            } => {
                assert!(!filter_if_missing);
                assert!(latest_version_only);
            }
            other => panic!("unexpected filter {other:?}"),
        }
    }

    #[test]
    fn from_json_rejects_unknown_type() {
        let err = FilterSpec::from_json(json!({"type": "ColumnCountGetFilter"})).unwrap_err();
        assert_eq!(err, FilterError::UnknownFilter("ColumnCountGetFilter".into()));
        assert_eq!(
            FilterSpec::from_json(json!({"family": "d"})).unwrap_err(),
            FilterError::MissingType
        );
    }

    #[test]
    fn comparator_matches_bytes() {
        assert!(Comparator::Equal.matches(b"bar", b"bar"));
        assert!(Comparator::Less.matches(b"a", b"b"));
        assert!(Comparator::GreaterOrEqual.matches(b"b", b"b"));
        assert!(!Comparator::NotEqual.matches(b"b", b"b"));
    }
}
