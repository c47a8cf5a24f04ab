//! Integration tests for the client library (C9) against the real
//! supervisor binary (C8): fork it, ping it, shut it down. Exercises
//! readiness reporting and graceful shutdown without depending on a real
//! GDX fixture or the bundled DuckDB extension.

use gdx_query_server::client::ServerProcess;

fn server_binary() -> &'static str {
    env!("CARGO_BIN_EXE_gdx-query-server")
}

#[tokio::test]
async fn forked_server_reports_readiness_and_answers_ping() {
    let storage = tempfile::tempdir().unwrap();
    let options = serde_json::json!({
        "allowRemoteSourceLoading": false,
        "globalStoragePath": storage.path(),
    });

    let server = ServerProcess::spawn(server_binary(), &options)
        .await
        .unwrap_or_else(|err| panic!("server did not become ready: {err}"));

    let result = server.call("ping", serde_json::json!({"seq": 7})).await.unwrap();
    assert_eq!(result["pong"], true);
    assert_eq!(result["seq"], 7);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn forked_server_rejects_an_unknown_method() {
    let storage = tempfile::tempdir().unwrap();
    let options = serde_json::json!({
        "allowRemoteSourceLoading": false,
        "globalStoragePath": storage.path(),
    });

    let server = ServerProcess::spawn(server_binary(), &options)
        .await
        .unwrap_or_else(|err| panic!("server did not become ready: {err}"));

    let err = server.call("notAMethod", serde_json::json!({})).await.unwrap_err();
    match err {
        gdx_query_server::client::ClientError::Server { code, .. } => {
            assert_eq!(code, "InvalidInput");
        }
        other => panic!("expected a server error, got {other:?}"),
    }

    server.shutdown().await.unwrap();
}
