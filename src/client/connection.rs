//! Process + WebSocket plumbing for the client library (C9).
//!
//! Mirrors the teacher's `GqlConnection` (own the transport, hand out
//! typed sessions) except the transport here is a forked child process
//! plus a WebSocket rather than a tonic channel, since there is no
//! standalone server process to dial in the gRPC case.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

use crate::error::ResponseError;

/// Diagnostic stdio capture bound, per process (§4.8).
const STDIO_BUFFER_CAP: usize = 8 * 1024;

/// How long to wait for the `{"type":"ready",...}` line on startup.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Errors raised by the client-side transport.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server process could not be spawned or exited unexpectedly.
    #[error("process error: {0}")]
    Process(#[from] std::io::Error),
    /// No readiness message arrived within [`READY_TIMEOUT`].
    #[error("server did not become ready in time")]
    ReadyTimeout,
    /// The readiness line could not be parsed as JSON.
    #[error("malformed readiness message: {0}")]
    MalformedReady(String),
    /// The WebSocket handshake or a subsequent frame failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// A response frame's `result`/`error` could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
    /// The server answered with an `error` field.
    #[error("server error {code}: {message}")]
    Server {
        /// The `ResponseError.code` reported by the server.
        code: String,
        /// The sanitized `ResponseError.message` reported by the server.
        message: String,
    },
    /// The connection was dropped before a response arrived.
    #[error("connection closed while awaiting a response")]
    ConnectionClosed,
}

impl From<ResponseError> for ClientError {
    fn from(err: ResponseError) -> Self {
        Self::Server {
            code: err.code,
            message: err.message,
        }
    }
}

/// A bounded byte ring used to retain the tail of a child process's
/// stdout/stderr for postmortem diagnostics (§4.8).
#[derive(Default)]
struct RollingBuffer {
    data: Vec<u8>,
}

impl RollingBuffer {
    fn push_line(&mut self, line: &str) {
        self.data.extend_from_slice(line.as_bytes());
        self.data.push(b'\n');
        if self.data.len() > STDIO_BUFFER_CAP {
            let overflow = self.data.len() - STDIO_BUFFER_CAP;
            self.data.drain(0..overflow);
        }
    }

    fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// A forked query-server process plus its WebSocket connection.
///
/// Demultiplexes responses to their original caller by `requestId` and
/// forwards `event` frames to a channel the caller drains independently.
pub struct ServerProcess {
    child: Child,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, ClientError>>>>>,
    events: Mutex<mpsc::UnboundedReceiver<(String, serde_json::Value)>>,
    next_request_id: Mutex<u64>,
    stdout: Arc<Mutex<RollingBuffer>>,
    stderr: Arc<Mutex<RollingBuffer>>,
}

impl ServerProcess {
    /// Fork `program` with the (single-argument, modern) JSON startup
    /// options, wait for its readiness message, and connect the
    /// WebSocket it reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned, does not
    /// signal readiness within 30 seconds, or the WebSocket handshake
    /// fails.
    pub async fn spawn(
        program: &str,
        options: &serde_json::Value,
    ) -> Result<Self, ClientError> {
        let mut child = Command::new(program)
            .arg(options.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = Arc::new(Mutex::new(RollingBuffer::default()));
        let stderr = Arc::new(Mutex::new(RollingBuffer::default()));

        let child_stderr = child.stderr.take().expect("stderr was piped");
        let stderr_buf = stderr.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(child_stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_buf.lock().unwrap().push_line(&line);
            }
        });

        let child_stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(child_stdout).lines();

        let port = tokio::time::timeout(READY_TIMEOUT, async {
            loop {
                let Some(line) = lines.next_line().await? else {
                    return Err(ClientError::ReadyTimeout);
                };
                stdout.lock().unwrap().push_line(&line);
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                    continue;
                };
                if value.get("type").and_then(serde_json::Value::as_str) == Some("ready") {
                    let port = value
                        .get("port")
                        .and_then(serde_json::Value::as_u64)
                        .ok_or_else(|| ClientError::MalformedReady(line.clone()))?;
                    return Ok(port as u16);
                }
            }
        })
        .await
        .map_err(|_| ClientError::ReadyTimeout)??;

        let stdout_buf = stdout.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                stdout_buf.lock().unwrap().push_line(&line);
            }
        });

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashMap::new()));

        spawn_io_tasks(ws, outbound_rx, pending.clone(), event_tx);

        Ok(Self {
            child,
            outbound: outbound_tx,
            pending,
            events: Mutex::new(event_rx),
            next_request_id: Mutex::new(0),
            stdout,
            stderr,
        })
    }

    /// Send `{type:"request", method, params}` and await the matching
    /// response frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Server`] if the server reports an error,
    /// or a transport error if the connection drops first.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let request_id = {
            let mut next = self.next_request_id.lock().unwrap();
            *next += 1;
            next.to_string()
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id.clone(), tx);

        let frame = serde_json::json!({
            "type": "request",
            "requestId": request_id,
            "method": method,
            "params": params,
        });
        self.outbound
            .send(Message::Text(frame.to_string().into()))
            .map_err(|_| ClientError::ConnectionClosed)?;

        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Receive the next `event` frame as `(event, data)`, or `None` if
    /// the connection closed.
    pub async fn next_event(&self) -> Option<(String, serde_json::Value)> {
        self.events.lock().unwrap().recv().await
    }

    /// The tail of the child process's stdout, for diagnostics.
    #[must_use]
    pub fn stdout_tail(&self) -> String {
        self.stdout.lock().unwrap().snapshot()
    }

    /// The tail of the child process's stderr, for diagnostics.
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        self.stderr.lock().unwrap().snapshot()
    }

    /// Tear down: signal the child process and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        send_terminate(&self.child)?;
        let _ = self.child.wait().await;
        Ok(())
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) -> Result<(), ClientError> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) -> Result<(), ClientError> {
    Ok(())
}

fn spawn_io_tasks(
    ws: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, ClientError>>>>>,
    event_tx: mpsc::UnboundedSender<(String, serde_json::Value)>,
) {
    let (mut write, mut read) = ws.split();

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(Ok(Message::Text(text))) = read.next().await {
            let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };
            match frame.get("type").and_then(serde_json::Value::as_str) {
                Some("response") => dispatch_response(&frame, &pending),
                Some("event") => {
                    let event = frame
                        .get("event")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    let data = frame.get("data").cloned().unwrap_or(serde_json::Value::Null);
                    let _ = event_tx.send((event, data));
                }
                _ => {}
            }
        }
        // Connection closed: wake any still-pending callers with an error
        // rather than leaving them hanging forever.
        for (_, sender) in pending.lock().unwrap().drain() {
            let _ = sender.send(Err(ClientError::ConnectionClosed));
        }
    });
}

fn dispatch_response(
    frame: &serde_json::Value,
    pending: &Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, ClientError>>>>>,
) {
    let Some(request_id) = frame.get("requestId").and_then(serde_json::Value::as_str) else {
        return;
    };
    let Some(sender) = pending.lock().unwrap().remove(request_id) else {
        return;
    };

    let result = if let Some(error) = frame.get("error") {
        let code = error
            .get("code")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("Unknown")
            .to_owned();
        let message = error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Err(ClientError::Server { code, message })
    } else {
        Ok(frame.get("result").cloned().unwrap_or(serde_json::Value::Null))
    };
    let _ = sender.send(result);
}
