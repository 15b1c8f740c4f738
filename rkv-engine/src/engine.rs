//! # Row Engine Interface
//!
//! Purpose: Decouple the protocol layer from the concrete row store.
//!
//! Every method is synchronous and returns `AppResult`; callers translate the
//! result into a reply frame. Implementations must be safe to share across
//! connection tasks.

use rkv_common::{AppResult, BatchMutation, Mutation, ScanSpec, WireRow};

/// Storage backend used by the server.
pub trait RowEngine: Send + Sync {
    /// Lists table names in sorted order.
    fn table_names(&self) -> Vec<String>;

    /// Creates an enabled table with the given column families.
    fn create_table(&self, table: &str, families: &[String]) -> AppResult<()>;

    fn enable_table(&self, table: &str) -> AppResult<()>;

    fn disable_table(&self, table: &str) -> AppResult<()>;

    /// Drops a disabled table and all of its rows.
    fn delete_table(&self, table: &str) -> AppResult<()>;

    /// Returns the row as a one-element list, or an empty list if absent.
    fn get_row(&self, table: &str, row: &str, columns: &[String]) -> AppResult<Vec<WireRow>>;

    /// Returns present rows in request order; missing keys are skipped.
    fn get_rows(&self, table: &str, rows: &[String], columns: &[String]) -> AppResult<Vec<WireRow>>;

    /// Applies puts and deletes to one row with a single timestamp.
    fn mutate_row(&self, table: &str, row: &str, mutations: &[Mutation]) -> AppResult<()>;

    fn mutate_rows(&self, table: &str, batches: &[BatchMutation]) -> AppResult<()>;

    fn delete_column(&self, table: &str, row: &str, column: &str) -> AppResult<()>;

    fn delete_row(&self, table: &str, row: &str) -> AppResult<()>;

    /// Adds `amount` to a counter cell and returns the new value.
    fn increment(&self, table: &str, row: &str, column: &str, amount: i64) -> AppResult<i64>;

    /// Opens a server-side cursor and returns its id.
    fn open_scanner(&self, table: &str, scan: ScanSpec) -> AppResult<u64>;

    /// Returns up to `count` further rows; an empty list means exhausted.
    fn scanner_next(&self, id: u64, count: usize) -> AppResult<Vec<WireRow>>;

    fn close_scanner(&self, id: u64) -> AppResult<()>;
}
