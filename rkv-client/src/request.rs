//! Request descriptions for the public operations.
//!
//! Every request names a table and may carry its own table prefix, which
//! overrides the client-wide one. Required fields are checked before any
//! connection is acquired.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use rkv_common::filter::compose;
use rkv_common::FilterSpec;

use crate::error::{ClientError, ClientResult};
use crate::scan::{normalize_range, ScanPlan};

/// Caller column values keyed by `family:qualifier` or a bare qualifier.
pub type Columns = BTreeMap<String, JsonValue>;

macro_rules! with_prefix {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                /// Overrides the client-wide table prefix for this request.
                pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
                    self.prefix = Some(prefix.into());
                    self
                }
            }
        )*
    };
}

with_prefix!(
    GetRow,
    GetRows,
    PutRow,
    PutRows,
    DeleteRow,
    DeleteRows,
    DeleteColumn,
    DeleteColumns,
    Increment,
    ScanRequest,
);

pub(crate) fn require(field: &str, value: &str) -> ClientResult<()> {
    if value.is_empty() {
        return Err(ClientError::config(format!("missing required parameter: {field}")));
    }
    Ok(())
}

/// Applies the request prefix, or the client prefix when the request has none.
pub(crate) fn qualify_table(prefix: Option<&str>, default_prefix: &str, table: &str) -> String {
    let prefix = prefix.filter(|p| !p.is_empty()).unwrap_or(default_prefix);
    format!("{prefix}{table}")
}

/// Reads one row.
#[derive(Debug, Clone, Default)]
pub struct GetRow {
    pub table: String,
    pub rowkey: String,
    pub prefix: Option<String>,
    /// Column restriction; `family:qualifier` selects one column, a bare
    /// family selects the whole family.
    pub columns: Vec<String>,
    pub include_families: bool,
}

impl GetRow {
    pub fn new(table: impl Into<String>, rowkey: impl Into<String>) -> Self {
        GetRow {
            table: table.into(),
            rowkey: rowkey.into(),
            ..Default::default()
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn include_families(mut self, include: bool) -> Self {
        self.include_families = include;
        self
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        require("table", &self.table)?;
        require("rowkey", &self.rowkey)
    }
}

/// Reads several rows in one call.
#[derive(Debug, Clone, Default)]
pub struct GetRows {
    pub table: String,
    pub rowkeys: Vec<String>,
    pub prefix: Option<String>,
    pub columns: Vec<String>,
    pub include_families: bool,
}

impl GetRows {
    pub fn new<I, S>(table: impl Into<String>, rowkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GetRows {
            table: table.into(),
            rowkeys: rowkeys.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn include_families(mut self, include: bool) -> Self {
        self.include_families = include;
        self
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        require("table", &self.table)?;
        self.rowkeys.iter().try_for_each(|key| require("rowkey", key))
    }
}

/// Writes the columns of one row.
#[derive(Debug, Clone, Default)]
pub struct PutRow {
    pub table: String,
    pub rowkey: String,
    pub prefix: Option<String>,
    pub columns: Columns,
    /// Delete columns whose value is empty before saving.
    pub remove_empty_columns: bool,
}

impl PutRow {
    pub fn new(table: impl Into<String>, rowkey: impl Into<String>) -> Self {
        PutRow {
            table: table.into(),
            rowkey: rowkey.into(),
            ..Default::default()
        }
    }

    pub fn column(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.columns.insert(name.into(), value.into());
        self
    }

    pub fn columns(mut self, columns: Columns) -> Self {
        self.columns = columns;
        self
    }

    pub fn remove_empty_columns(mut self, remove: bool) -> Self {
        self.remove_empty_columns = remove;
        self
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        require("table", &self.table)?;
        require("rowkey", &self.rowkey)
    }
}

/// Writes many rows of one table.
#[derive(Debug, Clone, Default)]
pub struct PutRows {
    pub table: String,
    pub prefix: Option<String>,
    pub rows: BTreeMap<String, Columns>,
    pub remove_empty_columns: bool,
}

impl PutRows {
    pub fn new(table: impl Into<String>) -> Self {
        PutRows {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn row(mut self, rowkey: impl Into<String>, columns: Columns) -> Self {
        self.rows.insert(rowkey.into(), columns);
        self
    }

    pub fn remove_empty_columns(mut self, remove: bool) -> Self {
        self.remove_empty_columns = remove;
        self
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        require("table", &self.table)?;
        self.rows.keys().try_for_each(|key| require("rowkey", key))
    }
}

/// Deletes a whole row.
#[derive(Debug, Clone, Default)]
pub struct DeleteRow {
    pub table: String,
    pub rowkey: String,
    pub prefix: Option<String>,
}

impl DeleteRow {
    pub fn new(table: impl Into<String>, rowkey: impl Into<String>) -> Self {
        DeleteRow {
            table: table.into(),
            rowkey: rowkey.into(),
            prefix: None,
        }
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        require("table", &self.table)?;
        require("rowkey", &self.rowkey)
    }
}

/// Deletes several rows.
#[derive(Debug, Clone, Default)]
pub struct DeleteRows {
    pub table: String,
    pub rowkeys: Vec<String>,
    pub prefix: Option<String>,
}

impl DeleteRows {
    pub fn new<I, S>(table: impl Into<String>, rowkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DeleteRows {
            table: table.into(),
            rowkeys: rowkeys.into_iter().map(Into::into).collect(),
            prefix: None,
        }
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        require("table", &self.table)?;
        self.rowkeys.iter().try_for_each(|key| require("rowkey", key))
    }
}

/// Deletes one column of a row.
#[derive(Debug, Clone, Default)]
pub struct DeleteColumn {
    pub table: String,
    pub rowkey: String,
    pub column: String,
    pub prefix: Option<String>,
}

impl DeleteColumn {
    pub fn new(table: impl Into<String>, rowkey: impl Into<String>, column: impl Into<String>) -> Self {
        DeleteColumn {
            table: table.into(),
            rowkey: rowkey.into(),
            column: column.into(),
            prefix: None,
        }
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        require("table", &self.table)?;
        require("rowkey", &self.rowkey)?;
        require("column", &self.column)
    }
}

/// Deletes several columns of one row.
#[derive(Debug, Clone, Default)]
pub struct DeleteColumns {
    pub table: String,
    pub rowkey: String,
    pub columns: Vec<String>,
    pub prefix: Option<String>,
}

impl DeleteColumns {
    pub fn new<I, S>(table: impl Into<String>, rowkey: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DeleteColumns {
            table: table.into(),
            rowkey: rowkey.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            prefix: None,
        }
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        require("table", &self.table)?;
        require("rowkey", &self.rowkey)
    }
}

/// Atomically adds to a counter in the `inc` family.
#[derive(Debug, Clone, Default)]
pub struct Increment {
    pub table: String,
    pub rowkey: String,
    /// Counter qualifier; any family given is replaced by `inc`.
    pub column: String,
    pub amount: i64,
    pub prefix: Option<String>,
}

impl Increment {
    pub fn new(
        table: impl Into<String>,
        rowkey: impl Into<String>,
        column: impl Into<String>,
        amount: i64,
    ) -> Self {
        Increment {
            table: table.into(),
            rowkey: rowkey.into(),
            column: column.into(),
            amount,
            prefix: None,
        }
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        require("table", &self.table)?;
        require("rowkey", &self.rowkey)?;
        require("column", &self.column)
    }
}

/// A filter given either as a typed descriptor or as loose JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanFilter {
    Typed(FilterSpec),
    Json(JsonValue),
}

impl From<FilterSpec> for ScanFilter {
    fn from(spec: FilterSpec) -> Self {
        ScanFilter::Typed(spec)
    }
}

impl From<JsonValue> for ScanFilter {
    fn from(value: JsonValue) -> Self {
        ScanFilter::Json(value)
    }
}

/// Range scan over one table.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub table: String,
    pub prefix: Option<String>,
    pub start_row: Option<String>,
    pub stop_row: Option<String>,
    /// Resume point returned by a previous page.
    pub marker: Option<String>,
    /// Maximum rows per page; 0 is unlimited.
    pub limit: usize,
    pub exclude_marker: bool,
    pub descending: bool,
    pub columns: Vec<String>,
    pub filters: Vec<ScanFilter>,
    pub include_families: bool,
}

impl ScanRequest {
    pub fn new(table: impl Into<String>) -> Self {
        ScanRequest {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn start_row(mut self, row: impl Into<String>) -> Self {
        self.start_row = Some(row.into());
        self
    }

    pub fn stop_row(mut self, row: impl Into<String>) -> Self {
        self.stop_row = Some(row.into());
        self
    }

    pub fn marker(mut self, marker: Option<String>) -> Self {
        self.marker = marker;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn exclude_marker(mut self, exclude: bool) -> Self {
        self.exclude_marker = exclude;
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: impl Into<ScanFilter>) -> Self {
        self.filters.push(filter.into());
        self
    }

    pub fn include_families(mut self, include: bool) -> Self {
        self.include_families = include;
        self
    }

    /// Composes all filters into one expression.
    pub fn filter_expression(&self) -> ClientResult<Option<String>> {
        let specs = self
            .filters
            .iter()
            .map(|filter| match filter {
                ScanFilter::Typed(spec) => Ok(spec.clone()),
                ScanFilter::Json(value) => FilterSpec::from_json(value.clone())
                    .map_err(|err| ClientError::config(err.to_string())),
            })
            .collect::<ClientResult<Vec<_>>>()?;
        Ok(compose(&specs))
    }

    /// Validates the request and resolves it against the client prefix.
    pub(crate) fn plan(&self, default_prefix: &str) -> ClientResult<ScanPlan> {
        require("table", &self.table)?;
        let filter = self.filter_expression()?;
        Ok(ScanPlan {
            table: qualify_table(self.prefix.as_deref(), default_prefix, &self.table),
            range: normalize_range(
                self.start_row.as_deref(),
                self.stop_row.as_deref(),
                self.marker.as_deref(),
                self.descending,
            ),
            columns: self.columns.clone(),
            filter,
            limit: self.limit,
            exclude_marker: self.exclude_marker,
            include_families: self.include_families,
        })
    }
}
