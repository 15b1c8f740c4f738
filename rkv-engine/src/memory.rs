//! # In-Memory Row Store
//!
//! Provide the reference backend: named tables of sorted rows, column
//! families, counters and server-side scanner cursors.
//!
//! ## Usage
//!
//! - Use `MemoryEngine::new()` and `create_table` to declare tables.
//! - Use `MemoryEngine::with_tables` to start with tables already declared.
//!
//! ## Design Principles
//!
//! 1. **Sorted Rows**: Rows live in a `BTreeMap`, so scans are ordered range
//!    walks in either direction.
//! 2. **Logical Clock**: Every mutation batch takes one timestamp from an
//!    atomic counter; cells written together share it.
//! 3. **Stateless Cursors**: A scanner remembers only its bounds and the last
//!    row it visited, and re-enters the range on every fetch. Writes between
//!    fetches are visible.
//! 4. **Strategy Pattern**: Implements `RowEngine` to keep the server decoupled.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryEngine
//!   ├── tables: RwLock<HashMap<String, Table>>
//!   │     └── Table { families, enabled, rows: BTreeMap<row, Cells> }
//!   └── scanners: Mutex<HashMap<u64, Scanner>>
//!         └── Scanner { table, start, stop, reversed, columns, filters, last }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use rkv_common::codec::{decode_counter, encode_counter};
use rkv_common::filter::parse as parse_filter;
use rkv_common::{
    AppError, AppErrorKind, AppResult, BatchMutation, ColumnName, FilterSpec, Mutation, ScanSpec,
    WireCell, WireRow,
};

use crate::engine::RowEngine;
use crate::filter::{apply_filters, restrict_columns, Cells};

#[derive(Debug)]
struct Table {
    families: BTreeSet<String>,
    enabled: bool,
    rows: BTreeMap<String, Cells>,
}

impl Table {
    fn check_family(&self, column: &str) -> AppResult<()> {
        let family = column.split_once(':').map_or(column, |(family, _)| family);
        if self.families.contains(family) {
            Ok(())
        } else {
            Err(AppError::new(AppErrorKind::NoSuchFamily, family))
        }
    }

    /// Applies filters and the column restriction to one stored row.
    fn project(&self, row: &str, cells: &Cells, columns: &[String], filters: &[FilterSpec]) -> Option<WireRow> {
        let cells = apply_filters(filters, cells.clone())?;
        Some(WireRow {
            row: row.to_string(),
            columns: restrict_columns(columns, cells),
        })
    }
}

#[derive(Debug, Clone)]
struct Scanner {
    table: String,
    start: Option<String>,
    stop: Option<String>,
    reversed: bool,
    columns: Vec<String>,
    filters: Vec<FilterSpec>,
    /// Last row visited; the next fetch resumes after it.
    last: Option<String>,
}

impl Scanner {
    /// Range still to be visited, as `(low, high)` bounds.
    fn remaining(&self) -> (Bound<&str>, Bound<&str>) {
        if self.reversed {
            let high = match (&self.last, &self.start) {
                (Some(last), _) => Bound::Excluded(last.as_str()),
                (None, Some(start)) => Bound::Included(start.as_str()),
                (None, None) => Bound::Unbounded,
            };
            let low = match &self.stop {
                Some(stop) => Bound::Excluded(stop.as_str()),
                None => Bound::Unbounded,
            };
            (low, high)
        } else {
            let low = match (&self.last, &self.start) {
                (Some(last), _) => Bound::Excluded(last.as_str()),
                (None, Some(start)) => Bound::Included(start.as_str()),
                (None, None) => Bound::Unbounded,
            };
            let high = match &self.stop {
                Some(stop) => Bound::Excluded(stop.as_str()),
                None => Bound::Unbounded,
            };
            (low, high)
        }
    }
}

/// `BTreeMap::range` panics on inverted bounds; those ranges are empty.
fn range_is_empty(low: Bound<&str>, high: Bound<&str>) -> bool {
    match (low, high) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b))
        | (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
    }
}

/// In-memory implementation of [`RowEngine`].
#[derive(Debug)]
pub struct MemoryEngine {
    tables: RwLock<HashMap<String, Table>>,
    scanners: Mutex<HashMap<u64, Scanner>>,
    clock: AtomicI64,
    next_scanner: AtomicU64,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates an engine without tables.
    pub fn new() -> Self {
        MemoryEngine {
            tables: RwLock::new(HashMap::new()),
            scanners: Mutex::new(HashMap::new()),
            clock: AtomicI64::new(0),
            next_scanner: AtomicU64::new(1),
        }
    }

    /// Creates an engine with `(table, families)` pairs already declared.
    pub fn with_tables<I, S>(tables: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: AsRef<str>,
    {
        let engine = Self::new();
        for (table, families) in tables {
            engine.create_table(table.as_ref(), &families)?;
        }
        Ok(engine)
    }

    /// Number of open scanners.
    pub fn open_scanners(&self) -> usize {
        self.scanners.lock().len()
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn read_table<T>(&self, table: &str, f: impl FnOnce(&Table) -> AppResult<T>) -> AppResult<T> {
        let tables = self.tables.read();
        let entry = tables
            .get(table)
            .ok_or_else(|| AppError::table_not_found(table))?;
        if !entry.enabled {
            return Err(AppError::table_not_enabled(table));
        }
        f(entry)
    }

    fn write_table<T>(&self, table: &str, f: impl FnOnce(&mut Table) -> AppResult<T>) -> AppResult<T> {
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| AppError::table_not_found(table))?;
        if !entry.enabled {
            return Err(AppError::table_not_enabled(table));
        }
        f(entry)
    }

    fn apply_mutations(table: &mut Table, row: &str, mutations: &[Mutation], timestamp: i64) -> AppResult<()> {
        for mutation in mutations {
            table.check_family(&mutation.column)?;
        }

        let cells = table.rows.entry(row.to_string()).or_default();
        for mutation in mutations {
            if mutation.is_delete {
                cells.remove(&mutation.column);
            } else {
                cells.insert(
                    mutation.column.clone(),
                    WireCell {
                        value: mutation.value.clone(),
                        timestamp,
                    },
                );
            }
        }
        if cells.is_empty() {
            table.rows.remove(row);
        }
        Ok(())
    }

    fn check_columns(table: &Table, columns: &[String]) -> AppResult<()> {
        columns.iter().try_for_each(|column| table.check_family(column))
    }
}

impl RowEngine for MemoryEngine {
    fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn create_table(&self, table: &str, families: &[String]) -> AppResult<()> {
        if table.is_empty() {
            return Err(AppError::illegal_argument("empty table name"));
        }
        if families.is_empty() {
            return Err(AppError::illegal_argument("a table needs at least one column family"));
        }

        let mut tables = self.tables.write();
        if tables.contains_key(table) {
            return Err(AppError::new(AppErrorKind::TableExists, table));
        }
        tables.insert(
            table.to_string(),
            Table {
                families: families
                    .iter()
                    .map(|family| family.trim_end_matches(':').to_string())
                    .collect(),
                enabled: true,
                rows: BTreeMap::new(),
            },
        );
        debug!(table, families = families.len(), "table created");
        Ok(())
    }

    fn enable_table(&self, table: &str) -> AppResult<()> {
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| AppError::table_not_found(table))?;
        if entry.enabled {
            return Err(AppError::new(AppErrorKind::TableNotDisabled, table));
        }
        entry.enabled = true;
        Ok(())
    }

    fn disable_table(&self, table: &str) -> AppResult<()> {
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| AppError::table_not_found(table))?;
        if !entry.enabled {
            return Err(AppError::table_not_enabled(table));
        }
        entry.enabled = false;
        Ok(())
    }

    fn delete_table(&self, table: &str) -> AppResult<()> {
        let mut tables = self.tables.write();
        match tables.get(table) {
            None => return Err(AppError::table_not_found(table)),
            Some(entry) if entry.enabled => {
                return Err(AppError::new(AppErrorKind::TableNotDisabled, table));
            }
            Some(_) => {}
        }
        tables.remove(table);
        debug!(table, "table deleted");
        Ok(())
    }

    fn get_row(&self, table: &str, row: &str, columns: &[String]) -> AppResult<Vec<WireRow>> {
        self.get_rows(table, std::slice::from_ref(&row.to_string()), columns)
    }

    fn get_rows(&self, table: &str, rows: &[String], columns: &[String]) -> AppResult<Vec<WireRow>> {
        self.read_table(table, |entry| {
            Self::check_columns(entry, columns)?;
            Ok(rows
                .iter()
                .filter_map(|row| {
                    let cells = entry.rows.get(row)?;
                    entry.project(row, cells, columns, &[])
                })
                .collect())
        })
    }

    fn mutate_row(&self, table: &str, row: &str, mutations: &[Mutation]) -> AppResult<()> {
        let timestamp = self.tick();
        self.write_table(table, |entry| Self::apply_mutations(entry, row, mutations, timestamp))
    }

    fn mutate_rows(&self, table: &str, batches: &[BatchMutation]) -> AppResult<()> {
        let timestamp = self.tick();
        self.write_table(table, |entry| {
            for batch in batches {
                for mutation in &batch.mutations {
                    entry.check_family(&mutation.column)?;
                }
            }
            for batch in batches {
                Self::apply_mutations(entry, &batch.row, &batch.mutations, timestamp)?;
            }
            Ok(())
        })
    }

    fn delete_column(&self, table: &str, row: &str, column: &str) -> AppResult<()> {
        self.write_table(table, |entry| {
            entry.check_family(column)?;
            if let Some(cells) = entry.rows.get_mut(row) {
                cells.remove(column);
                if cells.is_empty() {
                    entry.rows.remove(row);
                }
            }
            Ok(())
        })
    }

    fn delete_row(&self, table: &str, row: &str) -> AppResult<()> {
        self.write_table(table, |entry| {
            entry.rows.remove(row);
            Ok(())
        })
    }

    fn increment(&self, table: &str, row: &str, column: &str, amount: i64) -> AppResult<i64> {
        let timestamp = self.tick();
        let column = ColumnName::parse(column).to_string();
        self.write_table(table, |entry| {
            entry.check_family(&column)?;
            let cells = entry.rows.entry(row.to_string()).or_default();
            let current = match cells.get(&column) {
                Some(cell) => decode_counter(&cell.value).ok_or_else(|| {
                    AppError::illegal_argument(format!("{column} does not hold a counter"))
                })?,
                None => 0,
            };
            let next = current.wrapping_add(amount);
            cells.insert(
                column,
                WireCell {
                    value: encode_counter(next),
                    timestamp,
                },
            );
            Ok(next)
        })
    }

    fn open_scanner(&self, table: &str, scan: ScanSpec) -> AppResult<u64> {
        let filters = match scan.filter.as_deref() {
            Some(expr) => parse_filter(expr).map_err(|err| AppError::illegal_argument(err.to_string()))?,
            None => Vec::new(),
        };
        self.read_table(table, |entry| Self::check_columns(entry, &scan.columns))?;

        let id = self.next_scanner.fetch_add(1, Ordering::Relaxed);
        self.scanners.lock().insert(
            id,
            Scanner {
                table: table.to_string(),
                start: scan.start_row,
                stop: scan.stop_row,
                reversed: scan.reversed,
                columns: scan.columns,
                filters,
                last: None,
            },
        );
        debug!(table, scanner = id, reversed = scan.reversed, "scanner opened");
        Ok(id)
    }

    fn scanner_next(&self, id: u64, count: usize) -> AppResult<Vec<WireRow>> {
        // The registry lock is not held during the range walk.
        let scanner = self
            .scanners
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::new(AppErrorKind::ScannerNotFound, id.to_string()))?;

        let (out, visited) = self.read_table(&scanner.table, |entry| {
            let (low, high) = scanner.remaining();
            let mut out = Vec::new();
            let mut visited: Option<String> = None;
            if count > 0 && !range_is_empty(low, high) {
                let range = entry.rows.range::<str, _>((low, high));
                let iter: Box<dyn Iterator<Item = (&String, &Cells)>> = if scanner.reversed {
                    Box::new(range.rev())
                } else {
                    Box::new(range)
                };
                for (row, cells) in iter {
                    visited = Some(row.clone());
                    if let Some(projected) = entry.project(row, cells, &scanner.columns, &scanner.filters) {
                        out.push(projected);
                        if out.len() == count {
                            break;
                        }
                    }
                }
            }
            Ok((out, visited))
        })?;

        if let Some(visited) = visited {
            // A scanner closed meanwhile stays closed.
            if let Some(open) = self.scanners.lock().get_mut(&id) {
                open.last = Some(visited);
            }
        }
        Ok(out)
    }

    fn close_scanner(&self, id: u64) -> AppResult<()> {
        match self.scanners.lock().remove(&id) {
            Some(_) => Ok(()),
            None => Err(AppError::new(AppErrorKind::ScannerNotFound, id.to_string())),
        }
    }
}
