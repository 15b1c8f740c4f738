//! # TCP Server
//!
//! Accept framed connections, decode requests, and dispatch them to the row
//! engine. Requests on one connection are answered in arrival order; each
//! reply echoes the request id so clients may multiplex freely.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use rkv_common::{decode_frame, encode_frame, Envelope, Reply, Request, Response};
use rkv_engine::RowEngine;

/// Accepts connections until the listener fails.
pub async fn serve(listener: TcpListener, engine: Arc<dyn RowEngine>) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!(%peer, error = %err, "failed to set TCP_NODELAY");
        }
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            debug!(%peer, "connection accepted");
            if let Err(err) = handle_connection(stream, engine).await {
                debug!(%peer, error = %err, "connection ended with error");
            }
        });
    }
}

/// Serves a single client stream until EOF or a framing error.
pub async fn handle_connection<S>(stream: S, engine: Arc<dyn RowEngine>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = BytesMut::with_capacity(8 * 1024);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            match decode_frame::<Request>(&mut buffer) {
                Ok(Some(Envelope { id, body })) => {
                    let response = dispatch_request(engine.as_ref(), body);
                    if let Err(err) = encode_frame(&Envelope::new(id, response), &mut out) {
                        warn!(id, error = %err, "failed to encode response");
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    // Without a decodable id there is nobody to answer.
                    warn!(error = %err, "protocol error, closing connection");
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }

        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
    }

    Ok(())
}

/// Executes one request against the engine.
pub fn dispatch_request(engine: &dyn RowEngine, request: Request) -> Response {
    let result = match request {
        Request::GetTableNames => Ok(Reply::Tables(engine.table_names())),
        Request::CreateTable { table, families } => {
            engine.create_table(&table, &families).map(|_| Reply::Unit)
        }
        Request::EnableTable { table } => engine.enable_table(&table).map(|_| Reply::Unit),
        Request::DisableTable { table } => engine.disable_table(&table).map(|_| Reply::Unit),
        Request::DeleteTable { table } => engine.delete_table(&table).map(|_| Reply::Unit),
        Request::GetRow { table, row, columns } => {
            engine.get_row(&table, &row, &columns).map(Reply::Rows)
        }
        Request::GetRows {
            table,
            rows,
            columns,
        } => engine.get_rows(&table, &rows, &columns).map(Reply::Rows),
        Request::MutateRow {
            table,
            row,
            mutations,
        } => engine.mutate_row(&table, &row, &mutations).map(|_| Reply::Unit),
        Request::MutateRows { table, batches } => {
            engine.mutate_rows(&table, &batches).map(|_| Reply::Unit)
        }
        Request::DeleteAll { table, row, column } => {
            engine.delete_column(&table, &row, &column).map(|_| Reply::Unit)
        }
        Request::DeleteAllRow { table, row } => engine.delete_row(&table, &row).map(|_| Reply::Unit),
        Request::Increment {
            table,
            row,
            column,
            amount,
        } => engine.increment(&table, &row, &column, amount).map(Reply::Counter),
        Request::ScannerOpen { table, scan } => engine.open_scanner(&table, scan).map(Reply::Scanner),
        Request::ScannerGetList { id, count } => {
            engine.scanner_next(id, count as usize).map(Reply::Rows)
        }
        Request::ScannerClose { id } => engine.close_scanner(id).map(|_| Reply::Unit),
    };
    Response::from(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rkv_common::{AppErrorKind, Mutation};
    use rkv_engine::MemoryEngine;

    fn engine() -> MemoryEngine {
        MemoryEngine::with_tables([("t", vec!["d".to_string()])]).unwrap()
    }

    #[test]
    fn dispatch_maps_success_and_errors() {
        let engine = engine();
        let put = dispatch_request(
            &engine,
            Request::MutateRow {
                table: "t".into(),
                row: "r1".into(),
                mutations: vec![Mutation::put("d:foo", b"bar".to_vec())],
            },
        );
        assert_eq!(put, Response::Ok(Reply::Unit));

        match dispatch_request(
            &engine,
            Request::GetRow {
                table: "t".into(),
                row: "r1".into(),
                columns: vec![],
            },
        ) {
            Response::Ok(Reply::Rows(rows)) => assert_eq!(rows.len(), 1),
            other => panic!("unexpected response {other:?}"),
        }

        match dispatch_request(&engine, Request::DisableTable { table: "nope".into() }) {
            Response::Err(err) => assert!(err.is(AppErrorKind::TableNotFound)),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_answers_pipelined_frames() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let engine: Arc<dyn RowEngine> = Arc::new(engine());
        let task = tokio::spawn(handle_connection(server, engine));

        let mut out = BytesMut::new();
        encode_frame(&Envelope::new(1, Request::GetTableNames), &mut out).unwrap();
        encode_frame(&Envelope::new(2, Request::ScannerClose { id: 99 }), &mut out).unwrap();

        let (mut reader, mut writer) = tokio::io::split(client);
        writer.write_all(&out).await.unwrap();

        let mut buf = BytesMut::new();
        let mut replies = Vec::new();
        while replies.len() < 2 {
            reader.read_buf(&mut buf).await.unwrap();
            while let Some(frame) = decode_frame::<Response>(&mut buf).unwrap() {
                replies.push(frame);
            }
        }

        assert_eq!(replies[0].id, 1);
        assert_eq!(replies[0].body, Response::Ok(Reply::Tables(vec!["t".into()])));
        assert_eq!(replies[1].id, 2);
        assert!(matches!(&replies[1].body, Response::Err(err) if err.is(AppErrorKind::ScannerNotFound)));

        drop(writer);
        drop(reader);
        task.await.unwrap().unwrap();
    }
}
