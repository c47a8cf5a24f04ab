//! The pluggable backend trait for the embedded analytics engine (C1).
//!
//! Any SQL engine hosting the GDX table-valued functions (`gdx_symbols`,
//! `read_gdx`, `gdx_domain_values`) implements [`EngineAdapter`] to plug
//! into the dispatcher. The trait covers initialization, synchronous
//! statement execution, an interruptible background connection for
//! materialization, and blob registration for remote sources.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::QueryError;

/// One row of a [`QueryResult`], preserving column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// The result of `query()`: ordered column names plus ordered rows keyed
/// by column name.
///
/// 64-bit integers are coerced through [`serde_json::Number`], which
/// loses precision above 2^53 — documented parity with the wire format,
/// not a defect (§4.1).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// A snapshot of a background connection's in-flight statement progress.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    pub rows_processed: u64,
    pub percentage: Option<f64>,
}

/// An independent engine connection whose statement may be interrupted
/// mid-flight, obtained from [`EngineAdapter::background_connection`].
#[async_trait::async_trait]
pub trait EngineConnection: Send + Sync {
    /// Execute a statement without materializing rows.
    async fn run(&self, sql: &str) -> Result<(), QueryError>;

    /// Execute a statement and materialize its rows.
    async fn query(&self, sql: &str) -> Result<QueryResult, QueryError>;

    /// Abort the statement currently running on this connection, if any.
    /// Safe to call from any task; does not block.
    fn interrupt(&self);

    /// Read the progress of the statement currently running on this
    /// connection.
    async fn progress(&self) -> Progress;
}

/// The pluggable backend trait for the embedded analytics engine.
///
/// Implement this trait to connect any engine exposing the GDX reader
/// functions. The dispatcher handles document/materialization bookkeeping;
/// the Adapter focuses on running SQL and managing the engine's lifecycle.
#[async_trait::async_trait]
pub trait EngineAdapter: Send + Sync + 'static {
    /// Open a database (persistent file when `db_path` is given, else
    /// in-memory), install and load required extensions, run a warmup
    /// statement.
    async fn initialize(&self, db_path: Option<&str>) -> Result<(), QueryError>;

    /// Execute a statement on the main connection without materializing
    /// rows.
    async fn run(&self, sql: &str) -> Result<(), QueryError>;

    /// Execute a statement on the main connection and materialize its
    /// rows.
    async fn query(&self, sql: &str) -> Result<QueryResult, QueryError>;

    /// Obtain an independent connection to the same database, for use by
    /// the materializer.
    async fn background_connection(&self) -> Result<Box<dyn EngineConnection>, QueryError>;

    /// Stage `bytes` as a file the engine can read, returning its local
    /// path. Used for HTTP-sourced documents.
    async fn register_blob(&self, name: &str, bytes: Vec<u8>) -> Result<String, QueryError>;

    /// Close all connections and delete any persistent database files,
    /// including write-ahead logs.
    async fn dispose(&self) -> Result<(), QueryError>;
}

/// A DuckDB-backed [`EngineAdapter`].
///
/// The underlying `duckdb::Connection` is synchronous; every call is
/// wrapped in `tokio::task::spawn_blocking` so it composes with the rest
/// of the server without blocking the executor.
pub struct DuckDbAdapter {
    inner: Mutex<Option<Arc<Mutex<duckdb::Connection>>>>,
    db_path: Mutex<Option<PathBuf>>,
    blob_dir: PathBuf,
}

impl DuckDbAdapter {
    /// Create an adapter that stages registered blobs under `blob_dir`.
    #[must_use]
    pub fn new(blob_dir: PathBuf) -> Self {
        Self {
            inner: Mutex::new(None),
            db_path: Mutex::new(None),
            blob_dir,
        }
    }

    fn connection(&self) -> Result<Arc<Mutex<duckdb::Connection>>, QueryError> {
        self.inner
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| QueryError::TransientEngine("engine not initialized".to_owned()))
    }

    fn load_extensions(conn: &duckdb::Connection) -> Result<(), QueryError> {
        conn.execute_batch("INSTALL excel; LOAD excel;")
            .map_err(|e| QueryError::classify_engine_error(e.to_string()))
    }
}

#[async_trait::async_trait]
impl EngineAdapter for DuckDbAdapter {
    async fn initialize(&self, db_path: Option<&str>) -> Result<(), QueryError> {
        let path = db_path.map(str::to_owned);
        let conn = tokio::task::spawn_blocking({
            let path = path.clone();
            move || -> Result<duckdb::Connection, duckdb::Error> {
                match &path {
                    Some(p) => duckdb::Connection::open(p),
                    None => duckdb::Connection::open_in_memory(),
                }
            }
        })
        .await
        .map_err(|e| QueryError::TransientEngine(e.to_string()))?
        .map_err(|e| QueryError::classify_engine_error(e.to_string()))?;

        Self::load_extensions(&conn)?;
        conn.execute_batch("SELECT 1;")
            .map_err(|e| QueryError::classify_engine_error(e.to_string()))?;

        *self.inner.lock().unwrap() = Some(Arc::new(Mutex::new(conn)));
        *self.db_path.lock().unwrap() = path.map(PathBuf::from);
        Ok(())
    }

    async fn run(&self, sql: &str) -> Result<(), QueryError> {
        let conn = self.connection()?;
        let sql = sql.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute_batch(&sql)
        })
        .await
        .map_err(|e| QueryError::TransientEngine(e.to_string()))?
        .map_err(|e| QueryError::classify_engine_error(e.to_string()))
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, QueryError> {
        let conn = self.connection()?;
        let sql = sql.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            run_query(&conn, &sql)
        })
        .await
        .map_err(|e| QueryError::TransientEngine(e.to_string()))?
    }

    async fn background_connection(&self) -> Result<Box<dyn EngineConnection>, QueryError> {
        let conn = self.connection()?;
        let cloned = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.try_clone()
        })
        .await
        .map_err(|e| QueryError::TransientEngine(e.to_string()))?
        .map_err(|e| QueryError::classify_engine_error(e.to_string()))?;

        Self::load_extensions(&cloned)?;
        Ok(Box::new(DuckDbConnection {
            conn: Arc::new(Mutex::new(cloned)),
            interrupted: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn register_blob(&self, name: &str, bytes: Vec<u8>) -> Result<String, QueryError> {
        let safe_name = sanitize_blob_name(name);
        let path = self
            .blob_dir
            .join(format!("{}-{safe_name}", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn dispose(&self) -> Result<(), QueryError> {
        let conn = self.inner.lock().unwrap().take();
        let db_path = self.db_path.lock().unwrap().take();

        if let Some(conn) = conn {
            tokio::task::spawn_blocking(move || drop(conn))
                .await
                .map_err(|e| QueryError::TransientEngine(e.to_string()))?;
        }

        if let Some(path) = db_path {
            remove_database_files(&path).await;
        }
        Ok(())
    }
}

async fn remove_database_files(path: &Path) {
    for candidate in [
        path.to_path_buf(),
        append_suffix(path, ".wal"),
        append_suffix(path, ".tmp"),
    ] {
        if let Err(err) = tokio::fs::remove_file(&candidate).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %candidate.display(), %err, "failed to remove database file");
            }
        }
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn sanitize_blob_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '_' })
        .collect()
}

/// A background [`EngineConnection`] backed by its own `duckdb::Connection`.
struct DuckDbConnection {
    conn: Arc<Mutex<duckdb::Connection>>,
    interrupted: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl EngineConnection for DuckDbConnection {
    async fn run(&self, sql: &str) -> Result<(), QueryError> {
        self.interrupted.store(false, Ordering::SeqCst);
        let conn = self.conn.clone();
        let sql = sql.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute_batch(&sql)
        })
        .await
        .map_err(|e| QueryError::TransientEngine(e.to_string()))?
        .map_err(|e| QueryError::classify_engine_error(e.to_string()))
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, QueryError> {
        self.interrupted.store(false, Ordering::SeqCst);
        let conn = self.conn.clone();
        let sql = sql.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            run_query(&conn, &sql)
        })
        .await
        .map_err(|e| QueryError::TransientEngine(e.to_string()))?
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Ok(conn) = self.conn.lock() {
            conn.interrupt();
        }
    }

    async fn progress(&self) -> Progress {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_progress()
                .map(|p| Progress {
                    rows_processed: p.rows_processed,
                    percentage: Some(p.percentage),
                })
                .unwrap_or_default()
        })
        .await
        .unwrap_or_default()
    }
}

/// Run `sql` on `conn` and collect rows as ordered column-name maps.
fn run_query(conn: &duckdb::Connection, sql: &str) -> Result<QueryResult, QueryError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| QueryError::classify_engine_error(e.to_string()))?;

    let columns: Vec<String> = stmt.column_names();

    let rows = stmt
        .query_map([], |row| {
            let mut map = Row::new();
            for (idx, name) in columns.iter().enumerate() {
                let value: duckdb::types::Value = row.get(idx)?;
                map.insert(name.clone(), duckdb_value_to_json(&value));
            }
            Ok(map)
        })
        .map_err(|e| QueryError::classify_engine_error(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| QueryError::classify_engine_error(e.to_string()))?;

    Ok(QueryResult { columns, rows })
}

/// Coerce a DuckDB value into JSON. Integers wider than 2^53 lose
/// precision, mirroring the wire format's own f64-based number type
/// (§4.1) — intentional, not a bug to fix with i128/string encoding.
fn duckdb_value_to_json(value: &duckdb::types::Value) -> serde_json::Value {
    use duckdb::types::Value as V;
    match value {
        V::Null => serde_json::Value::Null,
        V::Boolean(b) => serde_json::Value::Bool(*b),
        V::TinyInt(n) => serde_json::Value::from(*n),
        V::SmallInt(n) => serde_json::Value::from(*n),
        V::Int(n) => serde_json::Value::from(*n),
        V::BigInt(n) => json_number_from_f64(*n as f64),
        V::HugeInt(n) => json_number_from_f64(*n as f64),
        V::UTinyInt(n) => serde_json::Value::from(*n),
        V::USmallInt(n) => serde_json::Value::from(*n),
        V::UInt(n) => serde_json::Value::from(*n),
        V::UBigInt(n) => json_number_from_f64(*n as f64),
        V::Float(n) => json_number_from_f64(f64::from(*n)),
        V::Double(n) => json_number_from_f64(*n),
        V::Decimal(n) => json_number_from_f64(n.to_string().parse().unwrap_or(0.0)),
        V::Text(s) => serde_json::Value::String(s.clone()),
        V::Blob(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

fn json_number_from_f64(n: f64) -> serde_json::Value {
    serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
}
