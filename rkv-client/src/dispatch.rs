//! Request dispatch: one RPC per pooled lease.
//!
//! The lease is released on every path, including errors, because it is
//! dropped at the end of each attempt.

use std::time::Instant;

use tracing::debug;

use rkv_common::{AppErrorKind, Reply, Request, WireRow};

use crate::error::{ClientError, ClientResult, ConnectionFailure};
use crate::pool::ConnectionPool;

/// Issues point operations against the pool.
#[derive(Clone)]
pub struct Dispatcher {
    pool: ConnectionPool,
    max_retries: usize,
}

impl Dispatcher {
    pub fn new(pool: ConnectionPool, max_retries: usize) -> Self {
        Dispatcher { pool, max_retries }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Sends a request, retrying retryable failures up to `max_retries` times.
    pub async fn call(&self, request: Request) -> ClientResult<Reply> {
        let mut attempt = 0;
        loop {
            let result = if attempt < self.max_retries {
                self.call_once(request.clone()).await
            } else {
                return self.call_once(request).await;
            };

            match result {
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    debug!(op = request.name(), attempt, error = %err, "retrying request");
                }
                other => return other,
            }
        }
    }

    /// Like [`call`](Self::call), but treats the listed backend error kinds
    /// as success and returns `None` for them.
    pub async fn call_absorbing(
        &self,
        request: Request,
        absorb: &[AppErrorKind],
    ) -> ClientResult<Option<Reply>> {
        let op = request.name();
        match self.call(request).await {
            Ok(reply) => Ok(Some(reply)),
            Err(ClientError::Application(err)) if absorb.contains(&err.kind) => {
                debug!(op, error = %err, "ignoring expected backend error");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn call_once(&self, request: Request) -> ClientResult<Reply> {
        let op = request.name();
        let table = request.table().unwrap_or_default().to_string();
        let started = Instant::now();

        let lease = self.pool.acquire().await?;
        let result = lease.call(request).await;
        drop(lease);

        debug!(
            op,
            table = %table,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "request completed"
        );
        result
    }
}

fn unexpected(expected: &str, reply: &Reply) -> ClientError {
    ClientError::Connection(ConnectionFailure::Protocol(format!(
        "expected {expected} reply, got {reply:?}"
    )))
}

pub(crate) fn expect_unit(reply: Reply) -> ClientResult<()> {
    match reply {
        Reply::Unit => Ok(()),
        other => Err(unexpected("unit", &other)),
    }
}

pub(crate) fn expect_rows(reply: Reply) -> ClientResult<Vec<WireRow>> {
    match reply {
        Reply::Rows(rows) => Ok(rows),
        other => Err(unexpected("rows", &other)),
    }
}

pub(crate) fn expect_tables(reply: Reply) -> ClientResult<Vec<String>> {
    match reply {
        Reply::Tables(tables) => Ok(tables),
        other => Err(unexpected("tables", &other)),
    }
}

pub(crate) fn expect_scanner(reply: Reply) -> ClientResult<u64> {
    match reply {
        Reply::Scanner(id) => Ok(id),
        other => Err(unexpected("scanner", &other)),
    }
}

pub(crate) fn expect_counter(reply: Reply) -> ClientResult<i64> {
    match reply {
        Reply::Counter(value) => Ok(value),
        other => Err(unexpected("counter", &other)),
    }
}
