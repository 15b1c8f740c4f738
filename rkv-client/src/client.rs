//! # Async Row Client
//!
//! Purpose: Expose row reads, writes, deletes, counters, table administration
//! and paginated scans over a pooled, multiplexed RPC transport.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `RowClient` hides pooling, dispatch and codecs.
//! 2. **Validate Before I/O**: Missing tables or rowkeys and bad filters fail
//!    with `ClientError::Config` before any connection is acquired.
//! 3. **All-Or-Error Batches**: Multi-row operations run their parts
//!    concurrently, wait for every part and report the first failure.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, info};

use rkv_common::codec::{decode_row, decode_rows, empty_columns, encode_columns};
use rkv_common::{AppErrorKind, BatchMutation, ColumnName, Request, Row, COUNTER_FAMILY};

use crate::config::ClientConfig;
use crate::dispatch::{expect_counter, expect_rows, expect_tables, expect_unit, Dispatcher};
use crate::error::{ClientError, ClientResult};
use crate::metrics::PoolObserver;
use crate::pool::{ConnectionPool, PoolStats};
use crate::request::{
    qualify_table, require, DeleteColumn, DeleteColumns, DeleteRow, DeleteRows, GetRow, GetRows,
    Increment, PutRow, PutRows, ScanRequest,
};
use crate::scan::{ScanEngine, ScanPage};
use crate::transport::{Connector, TcpConnector};

/// Async client over a pool of multiplexed connections.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct RowClient {
    dispatcher: Dispatcher,
    scans: ScanEngine,
    prefix: Arc<str>,
    put_chunk_size: usize,
}

impl RowClient {
    /// Connects to the configured servers over TCP.
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        Self::with_connector(config, Arc::new(TcpConnector), None)
    }

    /// Builds a client over a custom transport, optionally reporting pool
    /// events to `observer`.
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        observer: Option<Arc<dyn PoolObserver>>,
    ) -> ClientResult<Self> {
        config.validate()?;
        let pool = ConnectionPool::with_observer(config.pool_config()?, connector, observer)?;
        Ok(RowClient {
            dispatcher: Dispatcher::new(pool.clone(), config.max_retries),
            scans: ScanEngine::new(pool, config.scan_batch_size),
            prefix: Arc::from(config.table_prefix.as_str()),
            put_chunk_size: config.put_chunk_size,
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.dispatcher.pool()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool().stats()
    }

    /// Closes the pool; in-flight requests fail with a shutdown error.
    pub fn close(&self) {
        self.pool().close();
    }

    fn table(&self, prefix: Option<&str>, table: &str) -> String {
        qualify_table(prefix, &self.prefix, table)
    }

    /// Reads one row. Returns `Ok(None)` when the row does not exist or holds
    /// none of the requested columns.
    pub async fn get_row(&self, request: GetRow) -> ClientResult<Option<Row>> {
        request.validate()?;
        let restricted = !request.columns.is_empty();
        let reply = self
            .dispatcher
            .call(Request::GetRow {
                table: self.table(request.prefix.as_deref(), &request.table),
                row: request.rowkey,
                columns: request.columns,
            })
            .await?;
        let row = expect_rows(reply)?
            .into_iter()
            .next()
            .map(|row| decode_row(row, request.include_families));
        Ok(row.filter(|row| !(restricted && row.is_empty())))
    }

    /// Reads several rows; missing rows are absent from the result.
    ///
    /// With a column restriction, rows holding none of the columns are
    /// dropped.
    pub async fn get_rows(&self, request: GetRows) -> ClientResult<Vec<Row>> {
        request.validate()?;
        if request.rowkeys.is_empty() {
            return Ok(Vec::new());
        }
        let restricted = !request.columns.is_empty();
        let reply = self
            .dispatcher
            .call(Request::GetRows {
                table: self.table(request.prefix.as_deref(), &request.table),
                rows: request.rowkeys,
                columns: request.columns,
            })
            .await?;
        Ok(decode_rows(expect_rows(reply)?, request.include_families, restricted))
    }

    /// Saves the non-empty columns of one row.
    ///
    /// With `remove_empty_columns`, columns given an empty value are deleted
    /// first. A row with nothing to save sends no write.
    pub async fn put_row(&self, request: PutRow) -> ClientResult<()> {
        request.validate()?;
        let table = self.table(request.prefix.as_deref(), &request.table);

        if request.remove_empty_columns {
            let removed = empty_columns(&request.columns);
            self.remove_columns(&table, &request.rowkey, removed).await?;
        }

        let mutations = encode_columns(&request.columns);
        if mutations.is_empty() {
            debug!(table = %table, row = %request.rowkey, "nothing to save");
            return Ok(());
        }
        let reply = self
            .dispatcher
            .call(Request::MutateRow {
                table,
                row: request.rowkey,
                mutations,
            })
            .await?;
        expect_unit(reply)
    }

    /// Saves many rows in chunks sent concurrently.
    ///
    /// Rows without a non-empty column are skipped. Returns the number of rows
    /// written.
    pub async fn put_rows(&self, request: PutRows) -> ClientResult<usize> {
        request.validate()?;
        let table = self.table(request.prefix.as_deref(), &request.table);

        if request.remove_empty_columns {
            let removals = request.rows.iter().map(|(rowkey, columns)| {
                self.remove_columns(&table, rowkey, empty_columns(columns))
            });
            first_error(join_all(removals).await)?;
        }

        let batches: Vec<BatchMutation> = request
            .rows
            .iter()
            .filter_map(|(rowkey, columns)| {
                let mutations = encode_columns(columns);
                (!mutations.is_empty()).then(|| BatchMutation {
                    row: rowkey.clone(),
                    mutations,
                })
            })
            .collect();
        if batches.is_empty() {
            return Ok(0);
        }

        let total = batches.len();
        let writes = batches.chunks(self.put_chunk_size).map(|chunk| {
            info!(table = %table, rows = chunk.len(), "saving rows");
            let request = Request::MutateRows {
                table: table.clone(),
                batches: chunk.to_vec(),
            };
            async move { expect_unit(self.dispatcher.call(request).await?) }
        });
        first_error(join_all(writes).await)?;
        Ok(total)
    }

    pub async fn delete_row(&self, request: DeleteRow) -> ClientResult<()> {
        request.validate()?;
        let reply = self
            .dispatcher
            .call(Request::DeleteAllRow {
                table: self.table(request.prefix.as_deref(), &request.table),
                row: request.rowkey,
            })
            .await?;
        expect_unit(reply)
    }

    /// Deletes several rows concurrently and returns how many were requested.
    pub async fn delete_rows(&self, request: DeleteRows) -> ClientResult<usize> {
        request.validate()?;
        let table = self.table(request.prefix.as_deref(), &request.table);
        let deletes = request.rowkeys.iter().map(|rowkey| {
            let request = Request::DeleteAllRow {
                table: table.clone(),
                row: rowkey.clone(),
            };
            async move { expect_unit(self.dispatcher.call(request).await?) }
        });
        first_error(join_all(deletes).await)?;
        info!(table = %table, rows = request.rowkeys.len(), "rows removed");
        Ok(request.rowkeys.len())
    }

    pub async fn delete_column(&self, request: DeleteColumn) -> ClientResult<()> {
        request.validate()?;
        let reply = self
            .dispatcher
            .call(Request::DeleteAll {
                table: self.table(request.prefix.as_deref(), &request.table),
                row: request.rowkey,
                column: ColumnName::parse(&request.column).to_string(),
            })
            .await?;
        expect_unit(reply)
    }

    pub async fn delete_columns(&self, request: DeleteColumns) -> ClientResult<()> {
        request.validate()?;
        let table = self.table(request.prefix.as_deref(), &request.table);
        let columns = request
            .columns
            .iter()
            .map(|column| ColumnName::parse(column).to_string())
            .collect();
        self.remove_columns(&table, &request.rowkey, columns).await
    }

    async fn remove_columns(&self, table: &str, rowkey: &str, columns: Vec<String>) -> ClientResult<()> {
        let deletes = columns.into_iter().map(|column| {
            let request = Request::DeleteAll {
                table: table.to_string(),
                row: rowkey.to_string(),
                column,
            };
            async move { expect_unit(self.dispatcher.call(request).await?) }
        });
        first_error(join_all(deletes).await)
    }

    /// Adds `amount` to a counter and returns the new value.
    pub async fn increment(&self, request: Increment) -> ClientResult<i64> {
        request.validate()?;
        let column = ColumnName {
            family: COUNTER_FAMILY.to_string(),
            qualifier: ColumnName::parse(&request.column).qualifier,
        };
        let reply = self
            .dispatcher
            .call(Request::Increment {
                table: self.table(request.prefix.as_deref(), &request.table),
                row: request.rowkey,
                column: column.to_string(),
                amount: request.amount,
            })
            .await?;
        expect_counter(reply)
    }

    /// Scans a row range and returns one page.
    ///
    /// Pass the returned marker back through [`ScanRequest::marker`] to read
    /// the next page.
    pub async fn scan(&self, request: ScanRequest) -> ClientResult<ScanPage> {
        let plan = request.plan(&self.prefix)?;
        self.scans.run(plan).await
    }

    pub async fn table_names(&self) -> ClientResult<Vec<String>> {
        expect_tables(self.dispatcher.call(Request::GetTableNames).await?)
    }

    /// Creates a table with the given column families.
    pub async fn create_table<I, S>(&self, table: &str, families: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        require("table", table)?;
        let reply = self
            .dispatcher
            .call(Request::CreateTable {
                table: self.table(None, table),
                families: families.into_iter().map(Into::into).collect(),
            })
            .await?;
        expect_unit(reply)
    }

    pub async fn enable_table(&self, table: &str) -> ClientResult<()> {
        require("table", table)?;
        let reply = self
            .dispatcher
            .call(Request::EnableTable {
                table: self.table(None, table),
            })
            .await?;
        expect_unit(reply)
    }

    /// Disables a table; an already disabled table is not an error.
    pub async fn disable_table(&self, table: &str) -> ClientResult<()> {
        require("table", table)?;
        let table = self.table(None, table);
        let request = Request::DisableTable { table: table.clone() };
        match self
            .dispatcher
            .call_absorbing(request, &[AppErrorKind::TableNotEnabled])
            .await?
        {
            Some(reply) => expect_unit(reply),
            None => {
                info!(table = %table, "table not enabled");
                Ok(())
            }
        }
    }

    /// Disables and deletes a table; a missing table is not an error.
    pub async fn delete_table(&self, table: &str) -> ClientResult<()> {
        require("table", table)?;
        let table = self.table(None, table);
        let absorb = [AppErrorKind::TableNotEnabled, AppErrorKind::TableNotFound];

        let disable = Request::DisableTable { table: table.clone() };
        if let Some(reply) = self.dispatcher.call_absorbing(disable, &absorb).await? {
            expect_unit(reply)?;
        }

        let delete = Request::DeleteTable { table: table.clone() };
        match self.dispatcher.call_absorbing(delete, &absorb).await? {
            Some(reply) => expect_unit(reply),
            None => {
                info!(table = %table, "table not found");
                Ok(())
            }
        }
    }
}

fn first_error(results: Vec<ClientResult<()>>) -> ClientResult<()> {
    results.into_iter().collect::<ClientResult<Vec<()>>>().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionFailure;

    #[test]
    fn first_error_wins() {
        assert!(first_error(vec![Ok(()), Ok(())]).is_ok());
        let err = first_error(vec![
            Ok(()),
            Err(ClientError::Connection(ConnectionFailure::Timeout)),
            Err(ClientError::PoolClosed),
        ])
        .unwrap_err();
        assert_eq!(err, ClientError::Connection(ConnectionFailure::Timeout));
    }
}
