use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::watch;

use rkv_client::{
    AppErrorKind, BoxedStream, ClientConfig, ClientError, Columns, Comparator, Connector,
    DeleteColumns, DeleteRow, DeleteRows, Endpoint, FilterSpec, GetRow, GetRows, Increment,
    PutRow, PutRows, RowClient, ScanPage, ScanRequest,
};
use rkv_common::{decode_frame, encode_frame, Envelope, Request};
use rkv_engine::{MemoryEngine, RowEngine};

/// Serves every connection from one in-process engine.
struct EngineConnector {
    engine: Arc<dyn RowEngine>,
    connects: AtomicUsize,
}

impl Connector for EngineConnector {
    fn connect<'a>(&'a self, _endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(256 * 1024);
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                let _ = rkv_server::handle_connection(server, engine).await;
            });
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

/// Like `EngineConnector`, but scanner fetches wait until the gate opens.
struct GatedScans {
    engine: Arc<MemoryEngine>,
    gate: watch::Receiver<bool>,
    fetches: Arc<AtomicUsize>,
}

impl Connector for GatedScans {
    fn connect<'a>(&'a self, _endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(256 * 1024);
            tokio::spawn(serve_gated(
                server,
                Arc::clone(&self.engine),
                self.gate.clone(),
                Arc::clone(&self.fetches),
            ));
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

async fn serve_gated(
    mut stream: DuplexStream,
    engine: Arc<MemoryEngine>,
    mut gate: watch::Receiver<bool>,
    fetches: Arc<AtomicUsize>,
) {
    let mut buf = BytesMut::new();
    loop {
        while let Some(frame) = decode_frame::<Request>(&mut buf).expect("decode") {
            if let Request::ScannerGetList { .. } = frame.body {
                fetches.fetch_add(1, Ordering::SeqCst);
                if gate.wait_for(|open| *open).await.is_err() {
                    return;
                }
            }
            let body = rkv_server::dispatch_request(&*engine, frame.body);
            let mut out = BytesMut::new();
            encode_frame(&Envelope::new(frame.id, body), &mut out).expect("encode");
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn test_config() -> ClientConfig {
    ClientConfig {
        servers: vec!["memory:1".to_string()],
        min_connections: 0,
        max_connections: 4,
        acquire_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

fn setup_with(config: ClientConfig, tables: &[&str]) -> (RowClient, Arc<EngineConnector>) {
    let engine = MemoryEngine::with_tables(
        tables
            .iter()
            .map(|table| (*table, vec!["d".to_string(), "inc".to_string()])),
    )
    .expect("tables");
    let connector = Arc::new(EngineConnector {
        engine: Arc::new(engine),
        connects: AtomicUsize::new(0),
    });
    let client = RowClient::with_connector(config, connector.clone(), None).expect("client");
    (client, connector)
}

fn setup() -> (RowClient, Arc<EngineConnector>) {
    setup_with(test_config(), &["t"])
}

fn columns(pairs: &[(&str, &str)]) -> Columns {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), json!(value)))
        .collect()
}

async fn seed_rows(client: &RowClient, count: usize) {
    let mut request = PutRows::new("t");
    for i in 1..=count {
        request = request.row(format!("ROW|{i}"), columns(&[("foo", "bar")]));
    }
    assert_eq!(client.put_rows(request).await.unwrap(), count);
}

fn keys(page: &ScanPage) -> Vec<&str> {
    page.rows.iter().map(|row| row.rowkey.as_str()).collect()
}

#[tokio::test]
async fn ascending_pages_resume_from_marker() {
    let (client, _) = setup();
    seed_rows(&client, 6).await;

    let first = client.scan(ScanRequest::new("t").limit(2)).await.unwrap();
    assert_eq!(keys(&first), vec!["ROW|1", "ROW|2"]);
    assert_eq!(first.marker.as_deref(), Some("ROW|3"));

    let second = client
        .scan(ScanRequest::new("t").limit(2).marker(first.marker.clone()))
        .await
        .unwrap();
    assert_eq!(keys(&second), vec!["ROW|3", "ROW|4"]);
    assert_eq!(second.marker.as_deref(), Some("ROW|5"));

    let last = client
        .scan(ScanRequest::new("t").limit(2).marker(second.marker.clone()))
        .await
        .unwrap();
    assert_eq!(keys(&last), vec!["ROW|5", "ROW|6"]);
    assert_eq!(last.marker, None);
}

#[tokio::test]
async fn descending_pages_mirror_ascending() {
    let (client, _) = setup();
    seed_rows(&client, 6).await;

    let first = client
        .scan(ScanRequest::new("t").descending(true).limit(2))
        .await
        .unwrap();
    assert_eq!(keys(&first), vec!["ROW|6", "ROW|5"]);
    assert_eq!(first.marker.as_deref(), Some("ROW|4"));

    let second = client
        .scan(
            ScanRequest::new("t")
                .descending(true)
                .limit(2)
                .marker(first.marker.clone()),
        )
        .await
        .unwrap();
    assert_eq!(keys(&second), vec!["ROW|4", "ROW|3"]);
    assert_eq!(second.marker.as_deref(), Some("ROW|2"));

    let bounded = client
        .scan(
            ScanRequest::new("t")
                .descending(true)
                .start_row("ROW|2")
                .stop_row("ROW|5"),
        )
        .await
        .unwrap();
    assert_eq!(keys(&bounded), vec!["ROW|5", "ROW|4", "ROW|3"]);
}

#[tokio::test]
async fn swapped_bounds_scan_the_same_range() {
    let (client, _) = setup();
    seed_rows(&client, 6).await;

    let forward = client
        .scan(ScanRequest::new("t").start_row("ROW|2").stop_row("ROW|5"))
        .await
        .unwrap();
    let swapped = client
        .scan(ScanRequest::new("t").start_row("ROW|5").stop_row("ROW|2"))
        .await
        .unwrap();
    assert_eq!(keys(&forward), vec!["ROW|2", "ROW|3", "ROW|4"]);
    assert_eq!(forward, swapped);

    let exhausted = client
        .scan(ScanRequest::new("t").start_row("ROW|3").stop_row("ROW|5").limit(5))
        .await
        .unwrap();
    assert_eq!(keys(&exhausted), vec!["ROW|3", "ROW|4"]);
    assert_eq!(exhausted.marker, None);
}

#[tokio::test]
async fn limit_and_exclude_marker() {
    let (client, _) = setup();
    seed_rows(&client, 3).await;

    let exact = client.scan(ScanRequest::new("t").limit(3)).await.unwrap();
    assert_eq!(exact.rows.len(), 3);
    assert_eq!(exact.marker, None);

    let excluded = client
        .scan(ScanRequest::new("t").limit(2).exclude_marker(true))
        .await
        .unwrap();
    assert_eq!(keys(&excluded), vec!["ROW|1", "ROW|2"]);
    assert_eq!(excluded.marker, None);

    let unlimited = client.scan(ScanRequest::new("t")).await.unwrap();
    assert_eq!(unlimited.rows.len(), 3);
}

#[tokio::test]
async fn small_batches_cover_whole_scan() {
    let config = ClientConfig {
        scan_batch_size: 2,
        ..test_config()
    };
    let (client, _) = setup_with(config, &["t"]);
    seed_rows(&client, 7).await;

    let page = client.scan(ScanRequest::new("t").limit(5)).await.unwrap();
    assert_eq!(page.rows.len(), 5);
    assert_eq!(page.marker.as_deref(), Some("ROW|6"));

    let all = client.scan(ScanRequest::new("t")).await.unwrap();
    assert_eq!(all.rows.len(), 7);
    assert_eq!(client.stats().held, 0);
}

#[tokio::test]
async fn column_restriction_drops_empty_rows() {
    let (client, _) = setup();
    seed_rows(&client, 4).await;
    client
        .put_row(PutRow::new("t", "ROW|2").column("extra", "x"))
        .await
        .unwrap();

    let page = client
        .scan(ScanRequest::new("t").columns(["d:extra"]))
        .await
        .unwrap();
    assert_eq!(keys(&page), vec!["ROW|2"]);
    assert_eq!(page.rows[0].get("extra"), Some("x"));
    assert_eq!(page.rows[0].get("foo"), None);
}

#[tokio::test]
async fn restricted_get_rows_drops_rows_without_columns() {
    let (client, _) = setup();
    seed_rows(&client, 4).await;
    for key in ["ROW|1", "ROW|3"] {
        client
            .put_row(PutRow::new("t", key).column("extra", "x"))
            .await
            .unwrap();
    }

    let keys = ["ROW|1", "ROW|2", "ROW|3", "ROW|4"];
    let rows = client
        .get_rows(GetRows::new("t", keys).columns(["d:extra"]))
        .await
        .unwrap();
    let found: Vec<&str> = rows.iter().map(|row| row.rowkey.as_str()).collect();
    assert_eq!(found, vec!["ROW|1", "ROW|3"]);

    let unrestricted = client.get_rows(GetRows::new("t", keys)).await.unwrap();
    assert_eq!(unrestricted.len(), 4);

    let missing_column = client
        .get_row(GetRow::new("t", "ROW|2").columns(["d:extra"]))
        .await
        .unwrap();
    assert!(missing_column.is_none());
}

#[tokio::test]
async fn value_filters_select_rows() {
    let (client, _) = setup();
    seed_rows(&client, 3).await;
    client
        .put_row(PutRow::new("t", "ROW|2").column("foo", "baz"))
        .await
        .unwrap();

    let typed = client
        .scan(ScanRequest::new("t").filter(FilterSpec::column_equals("d", "foo", "bar")))
        .await
        .unwrap();
    assert_eq!(keys(&typed), vec!["ROW|1", "ROW|3"]);

    let loose = client
        .scan(ScanRequest::new("t").filter(json!({
            "family": "d",
            "qualifier": "foo",
            "comparator": "!=",
            "value": "bar",
        })))
        .await
        .unwrap();
    assert_eq!(keys(&loose), vec!["ROW|2"]);

    let keys_only = client
        .scan(ScanRequest::new("t").filter(FilterSpec::KeyOnlyFilter))
        .await
        .unwrap();
    assert_eq!(keys_only.rows.len(), 3);
    assert_eq!(keys_only.rows[0].get("foo"), Some(""));

    let ranged = client
        .scan(ScanRequest::new("t").filter(FilterSpec::SingleColumnValueFilter {
            family: "d".to_string(),
            qualifier: "foo".to_string(),
            comparator: Comparator::Greater,
            value: "bar".to_string(),
            filter_if_missing: true,
            latest_version_only: true,
        }))
        .await
        .unwrap();
    assert_eq!(keys(&ranged), vec!["ROW|2"]);
}

#[tokio::test]
async fn invalid_requests_never_connect() {
    let (client, connector) = setup();

    let bad_filter = client
        .scan(ScanRequest::new("t").filter(json!({"type": "RowRegexFilter"})))
        .await;
    assert!(matches!(bad_filter, Err(ClientError::Config(_))));

    let no_table = client.get_row(GetRow::new("", "r")).await;
    assert!(matches!(no_table, Err(ClientError::Config(_))));

    let no_rowkey = client.put_row(PutRow::new("t", "").column("foo", "bar")).await;
    assert!(matches!(no_rowkey, Err(ClientError::Config(_))));

    let no_rows = client.get_rows(GetRows::new("t", Vec::<String>::new())).await;
    assert_eq!(no_rows.unwrap(), Vec::new());

    assert_eq!(client.put_rows(PutRows::new("t")).await.unwrap(), 0);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn point_reads_and_deletes() {
    let (client, _) = setup();
    seed_rows(&client, 3).await;

    let row = client.get_row(GetRow::new("t", "ROW|1")).await.unwrap().unwrap();
    assert_eq!(row.get("foo"), Some("bar"));
    let qualified = client
        .get_row(GetRow::new("t", "ROW|1").include_families(true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(qualified.get("d:foo"), Some("bar"));
    assert!(client.get_row(GetRow::new("t", "missing")).await.unwrap().is_none());

    let rows = client
        .get_rows(GetRows::new("t", ["ROW|3", "missing", "ROW|1"]))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    client.delete_row(DeleteRow::new("t", "ROW|1")).await.unwrap();
    assert_eq!(
        client
            .delete_rows(DeleteRows::new("t", ["ROW|2", "ROW|3"]))
            .await
            .unwrap(),
        2
    );
    assert!(client.scan(ScanRequest::new("t")).await.unwrap().rows.is_empty());
}

#[tokio::test]
async fn remove_empty_columns_deletes_before_save() {
    let (client, _) = setup();
    client
        .put_row(
            PutRow::new("t", "r1")
                .column("foo", "bar")
                .column("baz", "qux")
                .column("zero", 0),
        )
        .await
        .unwrap();

    client
        .put_row(
            PutRow::new("t", "r1")
                .column("foo", "")
                .column("baz", "new")
                .remove_empty_columns(true),
        )
        .await
        .unwrap();
    let row = client.get_row(GetRow::new("t", "r1")).await.unwrap().unwrap();
    assert_eq!(row.get("foo"), None);
    assert_eq!(row.get("baz"), Some("new"));
    assert_eq!(row.get("zero"), Some("0"));

    // Without the flag an empty value is simply not written.
    client
        .put_row(PutRow::new("t", "r1").column("baz", json!(null)))
        .await
        .unwrap();
    let row = client.get_row(GetRow::new("t", "r1")).await.unwrap().unwrap();
    assert_eq!(row.get("baz"), Some("new"));

    client
        .delete_columns(DeleteColumns::new("t", "r1", ["baz", "d:zero"]))
        .await
        .unwrap();
    assert!(client.get_row(GetRow::new("t", "r1")).await.unwrap().is_none());
}

#[tokio::test]
async fn put_rows_sends_chunks() {
    let config = ClientConfig {
        put_chunk_size: 10,
        ..test_config()
    };
    let (client, _) = setup_with(config, &["t"]);

    let mut request = PutRows::new("t").remove_empty_columns(true);
    for i in 0..35 {
        request = request.row(format!("k{i:03}"), columns(&[("foo", "bar"), ("gone", "")]));
    }
    request = request.row("empty", columns(&[("foo", "")]));
    assert_eq!(client.put_rows(request).await.unwrap(), 35);

    let page = client.scan(ScanRequest::new("t")).await.unwrap();
    assert_eq!(page.rows.len(), 35);
    assert!(page.rows.iter().all(|row| row.get("gone").is_none()));
}

#[tokio::test]
async fn request_prefix_overrides_client_prefix() {
    let config = ClientConfig {
        table_prefix: "app_".to_string(),
        ..test_config()
    };
    let (client, _) = setup_with(config, &["app_t", "other_t"]);

    client
        .put_row(PutRow::new("t", "r1").column("foo", "client"))
        .await
        .unwrap();
    client
        .put_row(PutRow::new("t", "r1").prefix("other_").column("foo", "request"))
        .await
        .unwrap();

    let row = client.get_row(GetRow::new("t", "r1")).await.unwrap().unwrap();
    assert_eq!(row.get("foo"), Some("client"));
    let page = client
        .scan(ScanRequest::new("t").prefix("other_"))
        .await
        .unwrap();
    assert_eq!(page.rows[0].get("foo"), Some("request"));
}

#[tokio::test]
async fn counters_accumulate() {
    let (client, _) = setup();

    assert_eq!(client.increment(Increment::new("t", "r1", "hits", 2)).await.unwrap(), 2);
    assert_eq!(client.increment(Increment::new("t", "r1", "hits", 3)).await.unwrap(), 5);
    assert_eq!(client.increment(Increment::new("t", "r1", "inc:hits", -1)).await.unwrap(), 4);

    let row = client.get_row(GetRow::new("t", "r1")).await.unwrap().unwrap();
    assert_eq!(row.get("hits"), Some("4"));
}

#[tokio::test]
async fn table_administration() {
    let (client, _) = setup();

    client.create_table("events", ["d"]).await.unwrap();
    assert_eq!(client.table_names().await.unwrap(), vec!["events", "t"]);

    let exists = client.create_table("events", ["d"]).await.unwrap_err();
    assert_eq!(exists.app_kind(), Some(AppErrorKind::TableExists));
    let enabled = client.enable_table("events").await.unwrap_err();
    assert_eq!(enabled.app_kind(), Some(AppErrorKind::TableNotDisabled));

    client.disable_table("events").await.unwrap();
    client.disable_table("events").await.unwrap();
    let disabled = client.get_row(GetRow::new("events", "r")).await.unwrap_err();
    assert_eq!(disabled.app_kind(), Some(AppErrorKind::TableNotEnabled));

    client.enable_table("events").await.unwrap();
    client.delete_table("events").await.unwrap();
    client.delete_table("events").await.unwrap();
    assert_eq!(client.table_names().await.unwrap(), vec!["t"]);

    let missing = client.scan(ScanRequest::new("events")).await.unwrap_err();
    assert_eq!(missing.app_kind(), Some(AppErrorKind::TableNotFound));
    assert_eq!(client.stats().leased, 0);
}

#[tokio::test]
async fn closed_client_fails_fast() {
    let (client, _) = setup();
    seed_rows(&client, 1).await;
    client.close();

    let err = client.get_row(GetRow::new("t", "ROW|1")).await.unwrap_err();
    assert_eq!(err, ClientError::PoolClosed);
}

#[tokio::test]
async fn abandoned_scan_closes_its_scanner() {
    let engine = Arc::new(
        MemoryEngine::with_tables([("t", vec!["d".to_string(), "inc".to_string()])]).expect("tables"),
    );
    let (open, gate) = watch::channel(false);
    let fetches = Arc::new(AtomicUsize::new(0));
    let connector = Arc::new(GatedScans {
        engine: Arc::clone(&engine),
        gate,
        fetches: Arc::clone(&fetches),
    });
    let client = RowClient::with_connector(test_config(), connector, None).expect("client");
    seed_rows(&client, 3).await;

    let scan = tokio::spawn({
        let client = client.clone();
        async move { client.scan(ScanRequest::new("t")).await }
    });
    eventually(|| fetches.load(Ordering::SeqCst) == 1).await;
    assert_eq!(engine.open_scanners(), 1);

    scan.abort();
    assert!(scan.await.unwrap_err().is_cancelled());
    // The connection stays held until the scanner is closed.
    assert_eq!(client.stats().held, 1);

    open.send(true).unwrap();
    eventually(|| engine.open_scanners() == 0).await;
    eventually(|| client.stats().held == 0).await;

    let page = client.scan(ScanRequest::new("t")).await.unwrap();
    assert_eq!(keys(&page), vec!["ROW|1", "ROW|2", "ROW|3"]);
    assert_eq!(engine.open_scanners(), 0);
}

#[tokio::test]
async fn tcp_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let engine = MemoryEngine::with_tables([("t", vec!["d".to_string()])]).expect("tables");
    tokio::spawn(rkv_server::serve(listener, Arc::new(engine)));

    let client = RowClient::connect(ClientConfig {
        servers: vec![addr],
        min_connections: 1,
        max_connections: 2,
        ..ClientConfig::default()
    })
    .expect("client");

    seed_rows(&client, 4).await;
    let page = client
        .scan(ScanRequest::new("t").descending(true).limit(3))
        .await
        .unwrap();
    assert_eq!(keys(&page), vec!["ROW|4", "ROW|3", "ROW|2"]);
    assert_eq!(page.marker.as_deref(), Some("ROW|1"));
    client.close();
}
