//! Materialization Manager (C4): the two-phase preview/full-materialize
//! protocol for a single symbol.
//!
//! The background worker is a `tokio::spawn`ed task holding an
//! `Arc<AtomicBool>` cancellation flag (checked at every await point) plus
//! a `tokio_util::sync::CancellationToken` to wake the progress-poll sleep
//! immediately on cancellation — the same pattern the teacher's
//! `rpc::server` builder uses for its idle-session reaper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::adapter::Row;
use crate::engine::{EngineAdapter, EngineConnection, Progress};
use crate::error::{QueryError, ResponseError};
use crate::model::{DocumentId, MaterializedSymbol, Symbol};
use crate::registry::DocumentRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The synchronous result of phase 1 (§4.4).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    pub status: &'static str,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub total_row_count: u64,
}

/// One of the three materialization events (§4.4, §6). The RPC layer
/// serializes these into `event` frames.
#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum MaterializationEvent {
    Progress {
        document_id: DocumentId,
        symbol_name: String,
        percentage: f64,
        rows_processed: u64,
        total_rows: u64,
    },
    Complete {
        document_id: DocumentId,
        symbol_name: String,
        table_name: String,
        columns: Vec<String>,
        total_row_count: u64,
    },
    Error {
        document_id: DocumentId,
        symbol_name: String,
        cancelled: bool,
        error: Option<ResponseError>,
    },
}

/// Delivers materialization events to whatever currently holds the
/// document's WebSocket. Implemented by the RPC layer (§4.7).
#[async_trait::async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn emit(&self, document_id: &DocumentId, event: MaterializationEvent);
}

struct ActiveMaterialization {
    symbol_name: String,
    generation: u64,
    cancelled: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    conn: Arc<dyn EngineConnection>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// Owns at most one in-flight background materialization per document.
#[derive(Clone)]
pub struct MaterializationManager {
    registry: DocumentRegistry,
    active: Arc<Mutex<HashMap<DocumentId, ActiveMaterialization>>>,
    next_generation: Arc<AtomicU64>,
}

impl MaterializationManager {
    #[must_use]
    pub fn new(registry: DocumentRegistry) -> Self {
        Self {
            registry,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Phase 1: run the bounded preview query on the main connection. No
    /// table exists yet.
    pub async fn preview(
        &self,
        engine: &dyn EngineAdapter,
        local_path: &str,
        symbol: &Symbol,
        page_size: u64,
    ) -> Result<PreviewResult, QueryError> {
        let sql = format!(
            "SELECT * FROM read_gdx('{}','{}') LIMIT {page_size}",
            escape_literal(local_path),
            escape_literal(&symbol.name)
        );
        let result = engine.query(&sql).await?;
        Ok(PreviewResult {
            status: "preview",
            columns: result.columns,
            rows: result.rows,
            total_row_count: symbol.record_count,
        })
    }

    /// Phase 2: cancel any materialization already active for this
    /// document, then start a new background worker.
    pub async fn materialize(
        &self,
        engine: &dyn EngineAdapter,
        sink: Arc<dyn EventSink>,
        document_id: DocumentId,
        local_path: String,
        symbol: Symbol,
    ) -> Result<(), QueryError> {
        self.cancel(&document_id).await;

        let conn: Arc<dyn EngineConnection> = Arc::from(engine.background_connection().await?);
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_token = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let worker_conn = conn.clone();
        let worker_cancelled = cancelled.clone();
        let worker_token = cancel_token.clone();
        let worker_registry = self.registry.clone();
        let worker_sink = sink;
        let worker_document_id = document_id.clone();
        let worker_symbol = symbol.clone();
        let worker_local_path = local_path;
        let worker_active = self.active.clone();

        let task = tokio::spawn(async move {
            run_materialization(
                worker_conn,
                worker_registry,
                worker_sink,
                worker_document_id.clone(),
                worker_local_path,
                worker_symbol,
                worker_cancelled,
                worker_token,
            )
            .await;

            let mut active = worker_active.lock().await;
            if active
                .get(&worker_document_id)
                .is_some_and(|a| a.generation == generation)
            {
                active.remove(&worker_document_id);
            }
        });

        self.active.lock().await.insert(
            document_id,
            ActiveMaterialization {
                symbol_name: symbol.name,
                generation,
                cancelled,
                cancel_token,
                conn,
                task,
            },
        );
        Ok(())
    }

    /// Cancel the materialization active for `document_id`, if any.
    /// Returns whether one was active.
    pub async fn cancel(&self, document_id: &DocumentId) -> bool {
        let Some(active) = self.active.lock().await.remove(document_id) else {
            return false;
        };
        active.cancelled.store(true, Ordering::SeqCst);
        active.cancel_token.cancel();
        active.conn.interrupt();
        true
    }

    /// The symbol name currently materializing for `document_id`, if any.
    pub async fn active_symbol(&self, document_id: &DocumentId) -> Option<String> {
        self.active
            .lock()
            .await
            .get(document_id)
            .map(|a| a.symbol_name.clone())
    }

    /// Test-only: poll until no materialization is active for `document_id`.
    #[cfg(test)]
    async fn wait_for_idle(&self, document_id: &DocumentId) {
        for _ in 0..200 {
            if self.active_symbol(document_id).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("materialization did not finish in time");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_materialization(
    conn: Arc<dyn EngineConnection>,
    registry: DocumentRegistry,
    sink: Arc<dyn EventSink>,
    document_id: DocumentId,
    local_path: String,
    symbol: Symbol,
    cancelled: Arc<AtomicBool>,
    cancel_token: CancellationToken,
) {
    let table_name = table_name_for(&document_id, &symbol.name);
    let total_rows = symbol.record_count;

    let poller = spawn_progress_poller(
        conn.clone(),
        sink.clone(),
        document_id.clone(),
        symbol.name.clone(),
        total_rows,
        cancel_token.clone(),
    );

    let create_sql = format!(
        "CREATE OR REPLACE TABLE {} AS SELECT * FROM read_gdx('{}','{}')",
        quote_ident(&table_name),
        escape_literal(&local_path),
        escape_literal(&symbol.name)
    );
    let create_result = conn.run(&create_sql).await;

    cancel_token.cancel();
    let _ = poller.await;

    if cancelled.load(Ordering::SeqCst) {
        emit_cancelled(&sink, &document_id, &symbol.name).await;
        return;
    }

    if let Err(err) = create_result {
        emit_error(&sink, &document_id, &symbol.name, &err).await;
        return;
    }

    // A client progress bar left short of 100% due to rounding reads as
    // a bug; emit one final 100% tick before completion.
    sink.emit(
        &document_id,
        MaterializationEvent::Progress {
            document_id: document_id.clone(),
            symbol_name: symbol.name.clone(),
            percentage: 100.0,
            rows_processed: total_rows,
            total_rows,
        },
    )
    .await;

    if cancelled.load(Ordering::SeqCst) {
        emit_cancelled(&sink, &document_id, &symbol.name).await;
        return;
    }

    let columns = match read_columns(conn.as_ref(), &table_name).await {
        Ok(columns) => columns,
        Err(err) => {
            emit_error(&sink, &document_id, &symbol.name, &err).await;
            return;
        }
    };

    if cancelled.load(Ordering::SeqCst) {
        emit_cancelled(&sink, &document_id, &symbol.name).await;
        return;
    }

    let total_row_count = match read_row_count(conn.as_ref(), &table_name).await {
        Ok(count) => count,
        Err(err) => {
            emit_error(&sink, &document_id, &symbol.name, &err).await;
            return;
        }
    };

    if cancelled.load(Ordering::SeqCst) {
        emit_cancelled(&sink, &document_id, &symbol.name).await;
        return;
    }

    let materialized = MaterializedSymbol {
        table_name: table_name.clone(),
        columns: columns.clone(),
        total_row_count,
    };
    registry
        .record_materialized(&document_id, &symbol.name, materialized)
        .await;

    sink.emit(
        &document_id,
        MaterializationEvent::Complete {
            document_id,
            symbol_name: symbol.name,
            table_name,
            columns,
            total_row_count,
        },
    )
    .await;
}

fn spawn_progress_poller(
    conn: Arc<dyn EngineConnection>,
    sink: Arc<dyn EventSink>,
    document_id: DocumentId,
    symbol_name: String,
    total_rows: u64,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let progress = conn.progress().await;
                    let percentage = compute_percentage(progress, total_rows);
                    sink.emit(
                        &document_id,
                        MaterializationEvent::Progress {
                            document_id: document_id.clone(),
                            symbol_name: symbol_name.clone(),
                            percentage,
                            rows_processed: progress.rows_processed,
                            total_rows,
                        },
                    )
                    .await;
                }
                () = token.cancelled() => break,
            }
        }
    })
}

fn compute_percentage(progress: Progress, total_rows: u64) -> f64 {
    if total_rows > 0 {
        (progress.rows_processed as f64 / total_rows as f64 * 100.0).min(100.0)
    } else if let Some(percentage) = progress.percentage {
        percentage.min(100.0)
    } else {
        0.0
    }
}

async fn read_columns(conn: &dyn EngineConnection, table_name: &str) -> Result<Vec<String>, QueryError> {
    let sql = format!(
        "SELECT column_name FROM information_schema.columns WHERE table_name = '{}' ORDER BY ordinal_position",
        escape_literal(table_name)
    );
    let result = conn.query(&sql).await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| row.get("column_name").and_then(serde_json::Value::as_str))
        .map(str::to_owned)
        .collect())
}

async fn read_row_count(conn: &dyn EngineConnection, table_name: &str) -> Result<u64, QueryError> {
    let sql = format!("SELECT COUNT(*) AS n FROM {}", quote_ident(table_name));
    let result = conn.query(&sql).await?;
    Ok(result
        .rows
        .first()
        .and_then(|row| row.get("n"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0))
}

async fn emit_cancelled(sink: &Arc<dyn EventSink>, document_id: &DocumentId, symbol_name: &str) {
    sink.emit(
        document_id,
        MaterializationEvent::Error {
            document_id: document_id.clone(),
            symbol_name: symbol_name.to_owned(),
            cancelled: true,
            error: None,
        },
    )
    .await;
}

async fn emit_error(
    sink: &Arc<dyn EventSink>,
    document_id: &DocumentId,
    symbol_name: &str,
    err: &QueryError,
) {
    sink.emit(
        document_id,
        MaterializationEvent::Error {
            document_id: document_id.clone(),
            symbol_name: symbol_name.to_owned(),
            cancelled: false,
            error: Some(err.to_response_error()),
        },
    )
    .await;
}

/// `sanitized(documentId) + "__" + symbol.name` (§4.4). Only the document
/// id half is character-sanitized; the symbol half is taken verbatim and
/// relies on [`quote_ident`] for safe embedding in SQL.
#[must_use]
pub fn table_name_for(document_id: &DocumentId, symbol_name: &str) -> String {
    let sanitized: String = document_id
        .0
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{sanitized}__{symbol_name}")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}
