//! WebSocket connection server: the loopback accept loop, per-connection
//! frame handling, and the event sink that pushes materialization
//! progress back to whichever connection currently owns a document.
//!
//! Shaped like the teacher's `GqlServer<B>` builder (bind, then serve with
//! an optional shutdown future), but split into `bind`/`serve` because the
//! supervisor needs the ephemeral port before the shutdown future is
//! known.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::dispatcher::Dispatcher;
use crate::engine::EngineAdapter;
use crate::materializer::{EventSink, MaterializationEvent, MaterializationManager};
use crate::model::DocumentId;
use crate::registry::DocumentRegistry;
use crate::resolver::SourceResolver;
use crate::rpc::frame::{ClientRequest, ServerFrame};

/// `documentId -> websocket` binding (§4.7): an outbound-frame channel per
/// connection, not the raw socket, so the background materializer can push
/// events without touching a connection's read/write halves directly. The
/// most recent request for a given document wins (last-writer-wins
/// rebinding); stale entries for closed connections are left in place —
/// sending into a dropped receiver is a harmless no-op, and the registry
/// doesn't clean up after disconnects either (clients may reconnect).
type Bindings = Arc<RwLock<HashMap<DocumentId, mpsc::UnboundedSender<Message>>>>;

struct WsEventSink {
    bindings: Bindings,
}

#[async_trait::async_trait]
impl EventSink for WsEventSink {
    async fn emit(&self, document_id: &DocumentId, event: MaterializationEvent) {
        let Some(sender) = self.bindings.read().await.get(document_id).cloned() else {
            return;
        };
        let frame = event_frame(event);
        let Ok(text) = serde_json::to_string(&frame) else {
            return;
        };
        let _ = sender.send(Message::Text(text.into()));
    }
}

fn event_frame(event: MaterializationEvent) -> ServerFrame {
    match event {
        MaterializationEvent::Progress {
            document_id,
            symbol_name,
            percentage,
            rows_processed,
            total_rows,
        } => ServerFrame::event(
            "materializationProgress",
            serde_json::json!({
                "documentId": document_id,
                "symbolName": symbol_name,
                "percentage": percentage,
                "rowsProcessed": rows_processed,
                "totalRows": total_rows,
            }),
        ),
        MaterializationEvent::Complete {
            document_id,
            symbol_name,
            table_name,
            columns,
            total_row_count,
        } => ServerFrame::event(
            "materializationComplete",
            serde_json::json!({
                "documentId": document_id,
                "symbolName": symbol_name,
                "tableName": table_name,
                "columns": columns,
                "totalRowCount": total_row_count,
            }),
        ),
        MaterializationEvent::Error {
            document_id,
            symbol_name,
            cancelled,
            error,
        } => ServerFrame::event(
            "materializationError",
            serde_json::json!({
                "documentId": document_id,
                "symbolName": symbol_name,
                "cancelled": cancelled,
                "error": error,
            }),
        ),
    }
}

/// Builder for the WebSocket RPC server.
pub struct RpcServer {
    dispatcher: Dispatcher,
    bindings: Bindings,
}

impl RpcServer {
    /// Wire up a dispatcher over `engine`, backed by a fresh registry and
    /// materialization manager, with a [`WsEventSink`] as its event
    /// destination.
    #[must_use]
    pub fn new(
        engine: Arc<dyn EngineAdapter>,
        resolver: SourceResolver,
        db_path: Option<PathBuf>,
    ) -> Self {
        let bindings: Bindings = Arc::new(RwLock::new(HashMap::new()));
        let registry = DocumentRegistry::new(resolver);
        let materializer = MaterializationManager::new(registry.clone());
        let sink = Arc::new(WsEventSink {
            bindings: bindings.clone(),
        });
        let dispatcher = Dispatcher::spawn(engine, registry, materializer, sink, db_path);
        Self { dispatcher, bindings }
    }

    /// Bind the loopback listener. Returns a [`BoundRpcServer`] exposing
    /// the (possibly ephemeral) port actually bound, so a caller can report
    /// readiness before calling [`BoundRpcServer::serve`].
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(self, addr: SocketAddr) -> std::io::Result<BoundRpcServer> {
        let listener = TcpListener::bind(addr).await?;
        Ok(BoundRpcServer {
            listener,
            dispatcher: self.dispatcher,
            bindings: self.bindings,
        })
    }
}

/// A server with its listener already bound, ready to accept connections.
pub struct BoundRpcServer {
    listener: TcpListener,
    dispatcher: Dispatcher,
    bindings: Bindings,
}

impl BoundRpcServer {
    /// The address actually bound (port resolved if `:0` was requested).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying socket's local address cannot be
    /// queried.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` completes, then stop accepting
    /// new ones. In-flight connection tasks are not forcibly aborted; each
    /// finishes its current read/respond cycle and exits when its peer
    /// disconnects.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) {
        let addr = self.listener.local_addr().ok();
        tracing::info!(?addr, "gdx query server listening");

        let shutdown: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(shutdown);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let dispatcher = self.dispatcher.clone();
                            let bindings = self.bindings.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, dispatcher, bindings).await {
                                    tracing::debug!(%peer, %err, "connection ended");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::warn!(%err, "failed to accept connection");
                        }
                    }
                }
                () = &mut shutdown => {
                    tracing::info!("shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    dispatcher: Dispatcher,
    bindings: Bindings,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = read.next().await {
        let message = message?;
        match message {
            Message::Text(text) => {
                let response = handle_request(&text, &dispatcher, &bindings, &outbound_tx).await;
                if let Some(response) = response {
                    if outbound_tx.send(response).is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(payload) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            _ => {}
        }
    }

    drop(outbound_tx);
    let _ = writer.await;
    Ok(())
}

/// Parse and dispatch one inbound request frame, returning the response
/// frame to write back (or `None` for an unparseable frame, which is
/// dropped rather than answered since we have no `requestId` to reply
/// with).
async fn handle_request(
    text: &str,
    dispatcher: &Dispatcher,
    bindings: &Bindings,
    outbound_tx: &mpsc::UnboundedSender<Message>,
) -> Option<Message> {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%err, "failed to parse request frame");
            return None;
        }
    };

    if let Some(document_id) = request
        .params
        .get("documentId")
        .and_then(serde_json::Value::as_str)
    {
        bindings
            .write()
            .await
            .insert(DocumentId(document_id.to_owned()), outbound_tx.clone());
    }

    let frame = match dispatcher.dispatch(&request.method, request.params).await {
        Ok(result) => ServerFrame::ok(request.request_id, result),
        Err(err) => ServerFrame::err(request.request_id, err.to_response_error()),
    };

    serde_json::to_string(&frame).ok().map(|s| Message::Text(s.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeEngineAdapter, ScriptedResponse};
    use crate::engine::QueryResult;
    use futures_util::{SinkExt as _, StreamExt as _};
    use std::net::SocketAddr;
    use tokio::sync::oneshot;

    async fn spawn_test_server() -> (SocketAddr, oneshot::Sender<()>) {
        let engine = Arc::new(FakeEngineAdapter::new());
        engine.script(
            "SELECT * FROM gdx_symbols('/data/t.gdx')",
            ScriptedResponse::Rows(QueryResult::default()),
        );
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

    #[tokio::test]
    async fn ping_round_trips_over_the_socket() {
        let (addr, _shutdown) = spawn_test_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws.send(Message::Text(
            serde_json::json!({"requestId": "1", "method": "ping", "params": {}})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = reply else {
            panic!("expected text frame")
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["result"]["pong"], true);
    }

    #[tokio::test]
    async fn open_document_binds_document_id_to_connection() {
        let (addr, _shutdown) = spawn_test_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws.send(Message::Text(
            serde_json::json!({
                "requestId": "1",
                "method": "openDocument",
                "params": {"documentId": "doc1", "source": "/data/t.gdx"}
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = reply else {
            panic!("expected text frame")
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value["result"]["symbols"].is_array());
    }
}
