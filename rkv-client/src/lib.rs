//! # RowKV Async Client
//!
//! Purpose: Talk to a RowKV server through a pool of multiplexed connections,
//! with point reads/writes, counters, table administration and resumable
//! range scans.
//!
//! ## Design Principles
//! 1. **Ledger Dispatch**: Each connection pipelines requests and routes
//!    responses by request id; one failure fails every pending request.
//! 2. **Least-Loaded Pooling**: Acquire prefers the connection with the
//!    fewest leases and grows the pool only when all are saturated.
//! 3. **Fail Before I/O**: Invalid requests never touch the network.
//! 4. **Pluggable Transport**: Any `AsyncRead + AsyncWrite` stream can carry
//!    the protocol through a `Connector`.
//!
//! ```no_run
//! use rkv_client::{ClientConfig, GetRow, PutRow, RowClient};
//!
//! # async fn run() -> rkv_client::ClientResult<()> {
//! let client = RowClient::connect(ClientConfig::default())?;
//! client.put_row(PutRow::new("users", "u1").column("name", "ada")).await?;
//! let row = client.get_row(GetRow::new("users", "u1")).await?;
//! assert_eq!(row.and_then(|r| r.get("name").map(str::to_string)).as_deref(), Some("ada"));
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod dispatch;
mod error;
mod metrics;
mod pool;
mod request;
mod scan;
mod transport;

pub use client::RowClient;
pub use config::{ClientConfig, DEFAULT_PUT_CHUNK_SIZE, DEFAULT_SCAN_BATCH_SIZE};
pub use connection::{ConnectionId, ConnectionOwner, RpcConnection};
pub use dispatch::Dispatcher;
pub use error::{ClientError, ClientResult, ConnectionFailure};
pub use metrics::{
    LatencyHistogram, LatencySnapshot, MetricsSnapshot, PoolMetrics, PoolObserver, TracingObserver,
    DEFAULT_WAIT_BUCKETS_US,
};
pub use pool::{ConnectionPool, Lease, PoolConfig, PoolStats};
pub use request::{
    Columns, DeleteColumn, DeleteColumns, DeleteRow, DeleteRows, GetRow, GetRows, Increment,
    PutRow, PutRows, ScanFilter, ScanRequest,
};
pub use rkv_common::{AppError, AppErrorKind, Comparator, FilterSpec, Row};
pub use scan::{fetch_limit, normalize_range, ScanEngine, ScanPage, ScanPlan, ScanRange};
pub use transport::{AsyncStream, BoxedStream, Connector, Endpoint, TcpConnector};
