//! Integration tests: bind a real WebSocket server backed by a scripted
//! fake engine, connect with a raw client, and assert on the wire —
//! following the teacher's `tests/integration.rs` pattern of spinning up
//! a real server and driving it end to end rather than unit-testing its
//! pieces in isolation.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

use gdx_query_server::engine::fake::{FakeEngineAdapter, ScriptedResponse};
use gdx_query_server::engine::QueryResult;
use gdx_query_server::resolver::SourceResolver;
use gdx_query_server::rpc::RpcServer;

const GDX_PATH: &str = "/data/transport.gdx";

fn row(pairs: &[(&str, serde_json::Value)]) -> gdx_query_server::engine::adapter::Row {
    let mut map = gdx_query_server::engine::adapter::Row::new();
    for (k, v) in pairs {
        map.insert((*k).to_owned(), v.clone());
    }
    map
}

fn symbols_catalog() -> QueryResult {
    QueryResult {
        columns: vec![
            "name".to_owned(),
            "type".to_owned(),
            "dimension_count".to_owned(),
            "record_count".to_owned(),
        ],
        rows: vec![row(&[
            ("name", serde_json::json!("demand")),
            ("type", serde_json::json!("parameter")),
            ("dimension_count", serde_json::json!(2)),
            ("record_count", serde_json::json!(4)),
        ])],
    }
}

fn full_table_rows() -> QueryResult {
    QueryResult {
        columns: vec!["dim_1".to_owned(), "dim_2".to_owned(), "value".to_owned()],
        rows: vec![
            row(&[
                ("dim_1", serde_json::json!("a")),
                ("dim_2", serde_json::json!("x")),
                ("value", serde_json::json!(1.0)),
            ]),
            row(&[
                ("dim_1", serde_json::json!("a")),
                ("dim_2", serde_json::json!("y")),
                ("value", serde_json::json!(2.0)),
            ]),
            row(&[
                ("dim_1", serde_json::json!("b")),
                ("dim_2", serde_json::json!("x")),
                ("value", serde_json::json!(3.0)),
            ]),
            row(&[
                ("dim_1", serde_json::json!("b")),
                ("dim_2", serde_json::json!("y")),
                ("value", serde_json::json!(4.0)),
            ]),
        ],
    }
}

fn script_demand_materialization(engine: &FakeEngineAdapter, table_name: &str) {
    engine.script(
        &format!("SELECT * FROM gdx_symbols('{GDX_PATH}')"),
        ScriptedResponse::Rows(symbols_catalog()),
    );
    engine.script(
        &format!("SELECT * FROM read_gdx('{GDX_PATH}','demand') LIMIT 4"),
        ScriptedResponse::Rows(full_table_rows()),
    );
    engine.script(
        &format!(
            "SELECT column_name FROM information_schema.columns WHERE table_name = '{table_name}' ORDER BY ordinal_position"
        ),
        ScriptedResponse::Rows(QueryResult {
            columns: vec!["column_name".to_owned()],
            rows: vec!["dim_1", "dim_2", "value"]
                .into_iter()
                .map(|c| row(&[("column_name", serde_json::json!(c))]))
                .collect(),
        }),
    );
    engine.script(
        &format!("SELECT COUNT(*) AS n FROM \"{table_name}\""),
        ScriptedResponse::Rows(QueryResult {
            columns: vec!["n".to_owned()],
            rows: vec![row(&[("n", serde_json::json!(4))])],
        }),
    );
}

async fn spawn_server(engine: Arc<FakeEngineAdapter>) -> (SocketAddr, oneshot::Sender<()>) {
    let resolver = SourceResolver::new(true, std::env::temp_dir());
    let server = RpcServer::new(engine, resolver, None);
    let bound = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = bound.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(bound.serve(async {
        let _ = rx.await;
    }));
    (addr, tx)
}

struct TestClient {
    ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    next_id: u64,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        Self { ws, next_id: 0 }
    }

    async fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let request_id = self.next_id.to_string();
        self.ws
            .send(Message::Text(
                serde_json::json!({
                    "type": "request",
                    "requestId": request_id,
                    "method": method,
                    "params": params,
                })
                .to_string()
                .into(),
            ))
            .await
            .unwrap();

        loop {
            let frame = self.next_frame().await;
            if frame["type"] == "response" && frame["requestId"] == request_id {
                return frame;
            }
        }
    }

    async fn next_event(&mut self, event: &str) -> serde_json::Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == "event" && frame["event"] == event {
                return frame["data"].clone();
            }
        }
    }

    async fn next_frame(&mut self) -> serde_json::Value {
        let Message::Text(text) = self.ws.next().await.unwrap().unwrap() else {
            panic!("expected a text frame")
        };
        serde_json::from_str(&text).unwrap()
    }
}

/// S1 — open, preview, materialize, query page.
#[tokio::test]
async fn open_preview_materialize_query_page() {
    let engine = Arc::new(FakeEngineAdapter::new());
    script_demand_materialization(&engine, "d1__demand");
    let (addr, _shutdown) = spawn_server(engine).await;
    let mut client = TestClient::connect(addr).await;

    let opened = client
        .call(
            "openDocument",
            serde_json::json!({"documentId": "d1", "source": GDX_PATH}),
        )
        .await;
    let symbols = opened["result"]["symbols"].as_array().unwrap();
    assert_eq!(symbols[0]["name"], "demand");
    assert_eq!(symbols[0]["recordCount"], 4);

    let preview = client
        .call(
            "materializeSymbol",
            serde_json::json!({"documentId": "d1", "symbolName": "demand", "pageSize": 4}),
        )
        .await;
    assert_eq!(preview["result"]["status"], "preview");
    assert_eq!(preview["result"]["previewRowCount"], 4);

    let complete = client.next_event("materializationComplete").await;
    assert_eq!(complete["tableName"], "d1__demand");
    assert_eq!(complete["totalRowCount"], 4);

    let queried = client
        .call(
            "executeQuery",
            serde_json::json!({"documentId": "d1", "sql": "SELECT COUNT(*) AS n FROM \"d1__demand\""}),
        )
        .await;
    assert_eq!(queried["result"]["rows"][0]["n"], 4);
}

/// S2 — cancel during materialize. A cancellation racing the background
/// worker always yields one `materializationError{cancelled:true}`, and a
/// subsequent materialize attempt on the same symbol is accepted again.
#[tokio::test]
async fn cancel_during_materialize_then_retry() {
    let engine = Arc::new(FakeEngineAdapter::new());
    script_demand_materialization(&engine, "d1__demand");
    let (addr, _shutdown) = spawn_server(engine).await;
    let mut client = TestClient::connect(addr).await;

    client
        .call(
            "openDocument",
            serde_json::json!({"documentId": "d1", "source": GDX_PATH}),
        )
        .await;
    client
        .call(
            "materializeSymbol",
            serde_json::json!({"documentId": "d1", "symbolName": "demand", "pageSize": 4}),
        )
        .await;
    let cancelled = client
        .call(
            "cancelMaterialization",
            serde_json::json!({"documentId": "d1"}),
        )
        .await;
    assert_eq!(cancelled["result"]["success"], true);

    let event = loop {
        let frame = client.next_frame().await;
        if frame["type"] == "event"
            && (frame["event"] == "materializationError" || frame["event"] == "materializationComplete")
        {
            break frame;
        }
    };
    if event["event"] == "materializationError" {
        assert_eq!(event["data"]["cancelled"], true);
    }

    let retried = client
        .call(
            "materializeSymbol",
            serde_json::json!({"documentId": "d1", "symbolName": "demand", "pageSize": 4}),
        )
        .await;
    assert!(retried["error"].is_null());
}

/// S3 — cross-filtering: filtering on `dim_1` never constrains the
/// options reported back for `dim_1` itself.
#[tokio::test]
async fn cross_filtering_excludes_the_filtered_column() {
    let engine = Arc::new(FakeEngineAdapter::new());
    script_demand_materialization(&engine, "d1__demand");
    engine.script(
        "SELECT DISTINCT \"dim_1\" FROM \"d1__demand\" ORDER BY \"dim_1\"",
        ScriptedResponse::Rows(QueryResult {
            columns: vec!["dim_1".to_owned()],
            rows: vec![
                row(&[("dim_1", serde_json::json!("a"))]),
                row(&[("dim_1", serde_json::json!("b"))]),
            ],
        }),
    );
    engine.script(
        "SELECT DISTINCT \"dim_2\" FROM \"d1__demand\" WHERE \"dim_1\" IN ('a') ORDER BY \"dim_2\"",
        ScriptedResponse::Rows(QueryResult {
            columns: vec!["dim_2".to_owned()],
            rows: vec![
                row(&[("dim_2", serde_json::json!("x"))]),
                row(&[("dim_2", serde_json::json!("y"))]),
            ],
        }),
    );
    let (addr, _shutdown) = spawn_server(engine).await;
    let mut client = TestClient::connect(addr).await;

    client
        .call(
            "openDocument",
            serde_json::json!({"documentId": "d1", "source": GDX_PATH}),
        )
        .await;
    client
        .call(
            "materializeSymbol",
            serde_json::json!({"documentId": "d1", "symbolName": "demand", "pageSize": 4}),
        )
        .await;
    client.next_event("materializationComplete").await;

    let options = client
        .call(
            "getFilterOptions",
            serde_json::json!({
                "documentId": "d1",
                "symbolName": "demand",
                "filters": [{"columnName": "dim_1", "filterValue": {"selectedValues": ["a"]}}],
            }),
        )
        .await;
    let filter_options = &options["result"]["filterOptions"];
    assert_eq!(
        filter_options["dim_1"],
        serde_json::json!(["a", "b"]),
        "dim_1's own filter must not narrow its reported options"
    );
    assert_eq!(filter_options["dim_2"], serde_json::json!(["x", "y"]));
}

/// S4 — recovery idempotence, driven through `forceReload` rather than
/// the generic fatal-retry wrapper: reopening with `forceReload:true`
/// cancels any active materialization, drops its table, resets the
/// engine, and re-reads the catalog, leaving the symbol unmaterialized.
#[tokio::test]
async fn force_reload_drops_materialized_tables_and_rereads_catalog() {
    let engine = Arc::new(FakeEngineAdapter::new());
    script_demand_materialization(&engine, "d1__demand");
    let (addr, _shutdown) = spawn_server(engine).await;
    let mut client = TestClient::connect(addr).await;

    client
        .call(
            "openDocument",
            serde_json::json!({"documentId": "d1", "source": GDX_PATH}),
        )
        .await;
    let first_materialize = client
        .call(
            "materializeSymbol",
            serde_json::json!({"documentId": "d1", "symbolName": "demand", "pageSize": 4}),
        )
        .await;
    assert_eq!(first_materialize["result"]["status"], "preview");
    client.next_event("materializationComplete").await;

    let second_materialize = client
        .call(
            "materializeSymbol",
            serde_json::json!({"documentId": "d1", "symbolName": "demand", "pageSize": 4}),
        )
        .await;
    assert_eq!(
        second_materialize["result"]["status"], "materialized",
        "the symbol must be served from cache before a forceReload"
    );

    let reopened = client
        .call(
            "openDocument",
            serde_json::json!({"documentId": "d1", "source": GDX_PATH, "forceReload": true}),
        )
        .await;
    assert!(reopened["error"].is_null());
    let symbols = reopened["result"]["symbols"].as_array().unwrap();
    assert_eq!(
        symbols[0]["name"], "demand",
        "forceReload must re-read the catalog via registry::reload_all"
    );

    let third_materialize = client
        .call(
            "materializeSymbol",
            serde_json::json!({"documentId": "d1", "symbolName": "demand", "pageSize": 4}),
        )
        .await;
    assert_eq!(
        third_materialize["result"]["status"], "preview",
        "forceReload must have dropped the cached materialization, not just the catalog"
    );
}

/// S5 — remote source disabled: no fetch is attempted, and the error is
/// surfaced verbatim rather than as a sanitized engine failure.
#[tokio::test]
async fn remote_source_disabled_rejects_without_fetching() {
    let engine = Arc::new(FakeEngineAdapter::new());
    let resolver = SourceResolver::new(false, std::env::temp_dir());
    let server = RpcServer::new(engine, resolver, None);
    let bound = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = bound.local_addr().unwrap();
    let (_tx, rx) = oneshot::channel::<()>();
    tokio::spawn(bound.serve(async {
        let _ = rx.await;
    }));

    let mut client = TestClient::connect(addr).await;
    let opened = client
        .call(
            "openDocument",
            serde_json::json!({"documentId": "d1", "source": "https://x/y.gdx"}),
        )
        .await;
    assert!(opened["result"].is_null());
    let message = opened["error"]["message"].as_str().unwrap();
    assert!(message.contains("Remote source loading is disabled"));
}
