//! # Cursor-Based Range Scans
//!
//! Purpose: Turn one logical range scan into a sequence of batched scanner
//! fetches with resumable pagination.
//!
//! ## Design Principles
//! 1. **Normalize First**: Bounds are ordered so `low <= high`; direction is
//!    an explicit flag. Ascending iterates `[low, high)`, descending iterates
//!    from `high` (inclusive) down to `low` (exclusive).
//! 2. **Markers Are Inclusive**: A marker is the first row of the next page;
//!    resuming from it replaces the iteration-start bound.
//! 3. **Exclusive Lease**: A scan owns its connection for its whole lifetime
//!    and batches are strictly sequential.
//! 4. **Best-Effort Close**: Scanner close failures are logged, never
//!    returned. A scan abandoned mid-flight closes its scanner in the
//!    background and only then releases the lease.
//!
//! ## Paging Example
//!
//! ```text
//! rows ROW|1..ROW|6, descending, limit 2
//!   page 1: fetch 3 -> [6, 5, 4]  -> rows [6, 5], marker ROW|4
//!   page 2: start at ROW|4        -> rows [4, 3], marker ROW|2
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use rkv_common::codec::decode_rows;
use rkv_common::{Request, Row, ScanSpec, WireRow};

use crate::dispatch::{expect_rows, expect_scanner, expect_unit};
use crate::error::ClientResult;
use crate::pool::{ConnectionPool, Lease};

/// Scanner bounds as sent to the backend.
///
/// `start` is where iteration begins (inclusive), `stop` where it ends
/// (exclusive), in the scan's direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRange {
    pub start: Option<String>,
    pub stop: Option<String>,
    pub reversed: bool,
}

/// Normalizes caller bounds, marker and direction into scanner bounds.
///
/// With both bounds present they are ordered first. With a single bound,
/// `start_row` is where iteration begins and `stop_row` where it ends. A
/// marker always replaces the iteration start.
pub fn normalize_range(
    start_row: Option<&str>,
    stop_row: Option<&str>,
    marker: Option<&str>,
    descending: bool,
) -> ScanRange {
    let (start, stop) = match (start_row, stop_row) {
        (Some(a), Some(b)) => {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            if descending {
                (Some(high), Some(low))
            } else {
                (Some(low), Some(high))
            }
        }
        (start, stop) => (start, stop),
    };

    ScanRange {
        start: marker.or(start).map(str::to_string),
        stop: stop.map(str::to_string),
        reversed: descending,
    }
}

/// Rows to request from the backend for a caller limit.
///
/// `None` means unlimited. One extra row is fetched to find the marker.
pub fn fetch_limit(limit: usize, exclude_marker: bool) -> Option<usize> {
    match limit {
        0 => None,
        n if exclude_marker => Some(n),
        n => Some(n.saturating_add(1)),
    }
}

/// Batch size as sent on the wire; the scanner count field is a `u32`.
fn batch_limit(batch_size: usize) -> usize {
    batch_size.clamp(1, u32::MAX as usize)
}

/// Fully resolved scan.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    /// Fully qualified table name.
    pub table: String,
    pub range: ScanRange,
    /// Qualified column restriction; empty means all columns.
    pub columns: Vec<String>,
    pub filter: Option<String>,
    /// 0 means unlimited.
    pub limit: usize,
    pub exclude_marker: bool,
    pub include_families: bool,
}

/// One page of scan results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub rows: Vec<Row>,
    /// First row of the next page, if more rows remain.
    pub marker: Option<String>,
}

/// Runs scans over exclusively leased connections.
#[derive(Clone)]
pub struct ScanEngine {
    pool: ConnectionPool,
    batch_size: usize,
}

impl ScanEngine {
    pub fn new(pool: ConnectionPool, batch_size: usize) -> Self {
        ScanEngine {
            pool,
            batch_size: batch_limit(batch_size),
        }
    }

    /// Executes a scan plan and returns one page.
    pub async fn run(&self, plan: ScanPlan) -> ClientResult<ScanPage> {
        let started = Instant::now();
        let limit = fetch_limit(plan.limit, plan.exclude_marker);

        let lease = Arc::new(self.pool.acquire_exclusive().await?);
        let scan = ScanSpec {
            start_row: plan.range.start.clone(),
            stop_row: plan.range.stop.clone(),
            columns: plan.columns.clone(),
            filter: plan.filter.clone(),
            reversed: plan.range.reversed,
            caching: wire_count(self.batch_size),
        };
        let scanner = expect_scanner(
            lease
                .call(Request::ScannerOpen {
                    table: plan.table.clone(),
                    scan,
                })
                .await?,
        )?;

        let guard = ScannerGuard {
            lease: Arc::clone(&lease),
            scanner,
            open: true,
        };
        let fetched = self.fetch(&lease, scanner, limit).await;
        guard.close().await;
        drop(lease);

        let mut rows = fetched?;
        let mut marker = None;
        if !plan.exclude_marker {
            if let Some(limit) = limit {
                if rows.len() == limit {
                    marker = rows.pop().map(|row| row.row);
                }
            }
        }

        let rows = decode_rows(rows, plan.include_families, !plan.columns.is_empty());
        debug!(
            table = %plan.table,
            rows = rows.len(),
            marker = marker.as_deref().unwrap_or(""),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scan completed"
        );
        Ok(ScanPage { rows, marker })
    }

    async fn fetch(&self, lease: &Lease, scanner: u64, limit: Option<usize>) -> ClientResult<Vec<WireRow>> {
        let mut rows = Vec::new();
        loop {
            let want = match limit {
                Some(limit) => self.batch_size.min(limit - rows.len()),
                None => self.batch_size,
            };
            if want == 0 {
                break;
            }

            let batch = expect_rows(
                lease
                    .call(Request::ScannerGetList {
                        id: scanner,
                        count: wire_count(want),
                    })
                    .await?,
            )?;
            let got = batch.len();
            rows.extend(batch);
            if got < want {
                break;
            }
        }
        Ok(rows)
    }
}

fn wire_count(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Closes an open scanner exactly once, even if the scan is dropped.
struct ScannerGuard {
    lease: Arc<Lease>,
    scanner: u64,
    open: bool,
}

impl ScannerGuard {
    async fn close(mut self) {
        close_scanner(&self.lease, self.scanner).await;
        self.open = false;
    }
}

impl Drop for ScannerGuard {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let lease = Arc::clone(&self.lease);
        let scanner = self.scanner;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            debug!(scanner, connection = lease.connection_id(), "closing abandoned scanner");
            handle.spawn(async move {
                close_scanner(&lease, scanner).await;
            });
        }
    }
}

async fn close_scanner(lease: &Lease, scanner: u64) {
    let result = match lease.call(Request::ScannerClose { id: scanner }).await {
        Ok(reply) => expect_unit(reply),
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        warn!(scanner, connection = lease.connection_id(), error = %err, "failed to close scanner");
    }
}
